//! Emulator facade: the machine state, the run loop and the host boundary.
//!
//! A `Gba` lives on a single dedicated emulator thread. The host talks to it
//! through the message channel and observes it through the shared data; no
//! core method is ever called from the host thread while `run` is active.

use std::sync::Arc;

use log::info;

use crate::apu::Apu;
use crate::audio_queue::{audio_queue, AudioConsumer, AudioProducer};
use crate::backup::{BackupStorage, BackupType};
use crate::channel::{Key, Message, MessageChannel};
use crate::cpu::Core;
use crate::gpio::{Gpio, GpioDevice};
use crate::io::{Io, IRQ_KEYPAD};
use crate::memory::{Memory, Rom};
use crate::ppu::{Ppu, CYCLES_PER_FRAME};
use crate::scheduler::{Event, EventKind, Scheduler};
use crate::shared::SharedData;

/// ARM7TDMI master clock rate: 2^24 ticks per second.
pub const CYCLES_PER_SECOND: u64 = 1 << 24;

/// Audio frames buffered between the core and the host audio thread.
const AUDIO_QUEUE_CAPACITY: usize = 8192;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Master switch for the cartridge prefetch buffer; WAITCNT still has to
    /// enable it.
    pub prefetch_buffer: bool,
    pub enable_frame_skipping: bool,
    pub frame_skip_counter: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            prefetch_buffer: true,
            enable_frame_skipping: false,
            frame_skip_counter: 0,
        }
    }
}

pub struct LaunchConfig {
    pub rom: Vec<u8>,
    pub bios: Vec<u8>,
    pub skip_bios: bool,
    /// Sample rate for the host audio ring; 0 disables resampling.
    pub audio_frequency: u32,
    pub backup_type: BackupType,
    pub gpio_device: GpioDevice,
    pub settings: Settings,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            rom: Vec::new(),
            bios: Vec::new(),
            skip_bios: true,
            audio_frequency: 0,
            backup_type: BackupType::None,
            gpio_device: GpioDevice::None,
            settings: Settings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Paused,
    Running,
    Exiting,
}

pub struct Gba {
    pub scheduler: Scheduler,
    pub core: Core,
    pub memory: Memory,
    pub io: Io,
    pub ppu: Ppu,
    pub apu: Apu,
    pub gpio: Gpio,
    pub backup: BackupStorage,
    pub settings: Settings,

    pub(crate) shared: Arc<SharedData>,
    channel: Arc<MessageChannel>,
    pub(crate) audio_producer: Option<AudioProducer>,
    audio_consumer: Option<AudioConsumer>,
    /// Optional per-scanline hook, called with no locks held.
    pub(crate) scanline_sink: Option<Box<dyn FnMut(u32, &[u32]) + Send>>,

    state: RunState,
    exit_requested: bool,
    /// An `IrqLine` recheck event is already queued.
    irq_event_pending: bool,
}

impl Gba {
    pub fn new() -> Self {
        Self {
            scheduler: Scheduler::new(),
            core: Core::new(),
            memory: Memory::new(),
            io: Io::new(),
            ppu: Ppu::new(),
            apu: Apu::default(),
            gpio: Gpio::default(),
            backup: BackupStorage::default(),
            settings: Settings::default(),
            shared: Arc::new(SharedData::new()),
            channel: Arc::new(MessageChannel::new()),
            audio_producer: None,
            audio_consumer: None,
            scanline_sink: None,
            state: RunState::Paused,
            exit_requested: false,
            irq_event_pending: false,
        }
    }

    /// Handle for pushing messages; clone it into the host side.
    pub fn channel(&self) -> Arc<MessageChannel> {
        Arc::clone(&self.channel)
    }

    /// Handle for the framebuffer/backup shared state.
    pub fn shared(&self) -> Arc<SharedData> {
        Arc::clone(&self.shared)
    }

    /// Consumer side of the audio ring, once a reset configured one.
    pub fn audio_consumer(&self) -> Option<AudioConsumer> {
        self.audio_consumer.clone()
    }

    pub fn set_scanline_sink(&mut self, sink: Option<Box<dyn FnMut(u32, &[u32]) + Send>>) {
        self.scanline_sink = sink;
    }

    /// Rebuild the machine from a launch configuration.
    pub fn reset(&mut self, config: LaunchConfig) {
        info!(
            target: "gba",
            "reset: rom {} bytes, backup {:?}, gpio {:?}, skip_bios {}",
            config.rom.len(),
            config.backup_type,
            config.gpio_device,
            config.skip_bios,
        );

        self.scheduler = Scheduler::new();
        self.core = Core::new();
        self.memory = Memory::new();
        self.io = Io::new();
        self.ppu = Ppu::new();
        self.apu = Apu::default();
        self.gpio = Gpio::default();
        self.exit_requested = false;
        self.irq_event_pending = false;

        self.settings = config.settings;
        self.memory.load_bios(&config.bios);
        let rom_len = config.rom.len();
        self.memory.rom = Rom::new(config.rom);

        self.gpio.device = config.gpio_device;
        self.backup.init(config.backup_type, rom_len);
        self.backup_reset_storage();

        self.core.reset(config.skip_bios);
        self.io.postflg = config.skip_bios as u8;

        self.update_waitstates();
        self.ppu_schedule();

        if config.audio_frequency > 0 {
            let (producer, consumer) = audio_queue(AUDIO_QUEUE_CAPACITY);
            self.audio_producer = Some(producer);
            self.audio_consumer = Some(consumer);
            let period = CYCLES_PER_SECOND / config.audio_frequency as u64;
            self.scheduler
                .add(Event::repeating(EventKind::ApuSample, period, period));
        } else {
            self.audio_producer = None;
            self.audio_consumer = None;
        }
    }

    fn fire_event(&mut self, event: Event) {
        match event.kind {
            EventKind::HDraw => self.ppu_hdraw(),
            EventKind::HBlank => self.ppu_hblank(),
            EventKind::TimerOverflow => self.timer_overflow(event.arg as usize),
            EventKind::DmaFire => self.dma_fire(event.arg as usize),
            EventKind::ApuSample => self.apu_sample(),
            EventKind::ApuFifoRefill => self.apu_fifo_refill(event.arg as usize),
            EventKind::IrqLine => self.irq_line_update(),
            EventKind::Quit => {
                self.exit_requested = true;
                self.state = RunState::Exiting;
            }
        }
    }

    /// Advance emulated time by up to `budget` cycles, firing every event
    /// that falls inside the budget.
    pub fn run_until(&mut self, budget: u64) {
        let target = self.scheduler.cycles() + budget;
        while !self.exit_requested {
            let Some(event) = self.scheduler.take_next(target) else {
                break;
            };
            self.fire_event(event);
        }
        if !self.exit_requested {
            self.scheduler.advance_to(target);
        }
    }

    /// Charge one idle cycle to the CPU.
    pub fn idle(&mut self) {
        self.idle_for(1);
    }

    /// Charge `cycles` idle cycles to the CPU. While the cartridge bus is
    /// free, the prefetch buffer fetches ahead during this time.
    pub fn idle_for(&mut self, cycles: u32) {
        if self.memory.pbuffer.enabled && !self.memory.gamepak_bus_in_use {
            self.memory.pbuffer.step(cycles);
        }
        self.run_until(cycles as u64);
    }

    /// Queue the quit sentinel; the next `run_until` that reaches it stops
    /// without consuming the rest of its budget.
    pub fn schedule_stop(&mut self, at: u64) {
        self.scheduler.add(Event::once(EventKind::Quit, at));
    }

    pub(crate) fn raise_irq(&mut self, line: u16) {
        self.io.irq_flags |= line;
        self.schedule_irq_check();
    }

    /// Re-evaluate the CPU interrupt line shortly after an IE/IF/IME change,
    /// mirroring the hardware's synchronisation delay.
    pub(crate) fn schedule_irq_check(&mut self) {
        if self.irq_event_pending {
            return;
        }
        self.irq_event_pending = true;
        let at = self.scheduler.cycles() + 2;
        self.scheduler.add(Event::once(EventKind::IrqLine, at));
    }

    /// Rebuild the non-serialized scheduling flags from a restored event
    /// store, so a loaded machine schedules exactly like the saved one.
    pub(crate) fn rebuild_event_bookkeeping(&mut self) {
        self.irq_event_pending = self
            .scheduler
            .events()
            .iter()
            .any(|event| event.active && event.kind == EventKind::IrqLine);
    }

    /// `IrqLine` event handler.
    pub(crate) fn irq_line_update(&mut self) {
        self.irq_event_pending = false;
        let pending = self.io.ie & self.io.irq_flags;
        if pending != 0 {
            // A pending, enabled interrupt wakes a halted CPU even with IME
            // off.
            self.core.halted = false;
        }
        self.core.irq_line = self.io.ime && pending != 0;
    }

    fn set_key(&mut self, key: Key, pressed: bool) {
        // KEYINPUT is active-low.
        if pressed {
            self.io.keyinput &= !key.bit();
        } else {
            self.io.keyinput |= key.bit();
        }

        // Keypad IRQ per KEYCNT: bit 14 enables, bit 15 selects AND mode.
        if self.io.keycnt & (1 << 14) != 0 {
            let mask = self.io.keycnt & 0x03FF;
            let held = !self.io.keyinput & 0x03FF;
            let hit = if self.io.keycnt & (1 << 15) != 0 {
                mask != 0 && held & mask == mask
            } else {
                held & mask != 0
            };
            if hit {
                self.raise_irq(IRQ_KEYPAD);
            }
        }
    }

    fn handle_message(&mut self, message: Message) {
        match message {
            Message::Reset(config) => self.reset(*config),
            Message::Run => {
                if self.state == RunState::Paused {
                    self.state = RunState::Running;
                }
            }
            Message::Pause => {
                if self.state == RunState::Running {
                    self.state = RunState::Paused;
                }
            }
            Message::Key { key, pressed } => self.set_key(key, pressed),
            Message::Quicksave(reply) => {
                let _ = reply.send(self.quicksave());
            }
            Message::Quickload(data, reply) => {
                let _ = reply.send(self.quickload(&data));
            }
            Message::Exit => {
                self.state = RunState::Exiting;
            }
        }
    }

    /// Emulator thread body: drain messages at safe points and advance the
    /// machine one frame slice at a time until told to exit.
    pub fn run(&mut self) {
        let channel = self.channel();
        loop {
            match self.state {
                RunState::Exiting => break,
                RunState::Paused => {
                    let message = channel.wait_pop();
                    self.handle_message(message);
                }
                RunState::Running => {
                    while let Some(message) = channel.try_pop() {
                        self.handle_message(message);
                        if self.state != RunState::Running {
                            break;
                        }
                    }
                    if self.state == RunState::Running {
                        self.run_until(CYCLES_PER_FRAME);
                    }
                }
            }
        }
        info!(target: "gba", "emulator thread exiting at cycle {}", self.scheduler.cycles());
    }
}

impl Default for Gba {
    fn default() -> Self {
        Self::new()
    }
}
