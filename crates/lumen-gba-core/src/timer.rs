//! Timer unit.
//!
//! Timers never tick per-cycle: a running timer's counter is derived from the
//! scheduler's cycle counter, and overflows are scheduler events placed at
//! the exact cycle they occur. Cascade (count-up) timers carry no event of
//! their own; they advance when the timer below them overflows.

use crate::gba::Gba;
use crate::io::IRQ_TIMER0;
use crate::scheduler::{Event, EventKind, EVENT_HANDLE_NONE};

const CTL_CASCADE: u16 = 1 << 2;
const CTL_IRQ: u16 = 1 << 6;
const CTL_ENABLE: u16 = 1 << 7;

/// Cycles a freshly enabled timer waits before it starts counting.
const START_DELAY: u64 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timer {
    pub reload: u16,
    pub control: u16,
    /// Counter value at `started_at` (while counting) or the frozen value
    /// (while stopped).
    pub counter: u16,
    pub started_at: u64,
    pub handle: u32,
    pub is_counting: bool,
}

impl Default for Timer {
    fn default() -> Self {
        Self {
            reload: 0,
            control: 0,
            counter: 0,
            started_at: 0,
            handle: EVENT_HANDLE_NONE,
            is_counting: false,
        }
    }
}

impl Timer {
    #[inline]
    pub fn enabled(&self) -> bool {
        self.control & CTL_ENABLE != 0
    }

    #[inline]
    pub fn cascade(&self) -> bool {
        self.control & CTL_CASCADE != 0
    }

    /// log2 of the prescaler divider: 1, 64, 256 or 1024 cycles per tick.
    #[inline]
    fn shift(&self) -> u32 {
        match self.control & 0x3 {
            0 => 0,
            1 => 6,
            2 => 8,
            _ => 10,
        }
    }

    fn ticks_until_overflow(&self) -> u64 {
        0x1_0000 - self.counter as u64
    }
}

impl Gba {
    /// The value a CNT_L read observes right now.
    pub(crate) fn timer_counter(&self, idx: usize) -> u16 {
        let timer = &self.io.timers[idx];
        if timer.is_counting && !timer.cascade() {
            let elapsed = self.scheduler.cycles().saturating_sub(timer.started_at);
            timer.counter.wrapping_add((elapsed >> timer.shift()) as u16)
        } else {
            timer.counter
        }
    }

    pub(crate) fn timer_control_write(&mut self, idx: usize, val: u8) {
        let now = self.scheduler.cycles();

        // Freeze the live counter before the control change takes effect.
        let frozen = self.timer_counter(idx);
        let timer = &mut self.io.timers[idx];
        timer.counter = frozen;

        let was_enabled = timer.enabled();
        timer.control = (val as u16) & 0xC7;

        let handle = timer.handle;
        if handle != EVENT_HANDLE_NONE {
            self.scheduler.cancel(handle);
            self.io.timers[idx].handle = EVENT_HANDLE_NONE;
        }

        let timer = &mut self.io.timers[idx];
        if !timer.enabled() {
            timer.is_counting = false;
            return;
        }

        if !was_enabled {
            timer.counter = timer.reload;
            timer.started_at = now + START_DELAY;
        } else {
            timer.started_at = now;
        }
        timer.is_counting = true;

        if !timer.cascade() {
            let at = timer.started_at + (timer.ticks_until_overflow() << timer.shift());
            let handle = self
                .scheduler
                .add(Event::once(EventKind::TimerOverflow, at).with_arg(idx as u32));
            self.io.timers[idx].handle = handle;
        }
    }

    /// `TimerOverflow` event handler.
    pub(crate) fn timer_overflow(&mut self, idx: usize) {
        let now = self.scheduler.cycles();
        let timer = &mut self.io.timers[idx];
        timer.counter = timer.reload;
        timer.started_at = now;

        // One-shot per overflow so a mid-run reload write shortens or
        // lengthens the next period.
        let at = now + (timer.ticks_until_overflow() << timer.shift());
        let handle = self
            .scheduler
            .add(Event::once(EventKind::TimerOverflow, at).with_arg(idx as u32));
        self.io.timers[idx].handle = handle;

        self.timer_overflow_effects(idx);
    }

    fn timer_overflow_effects(&mut self, idx: usize) {
        if self.io.timers[idx].control & CTL_IRQ != 0 {
            self.raise_irq(IRQ_TIMER0 << idx);
        }

        // Timers 0 and 1 clock the direct-sound FIFOs.
        if idx < 2 {
            self.apu_on_timer_overflow(idx);
        }

        if idx < 3 {
            let next = &self.io.timers[idx + 1];
            if next.enabled() && next.cascade() {
                self.timer_cascade_tick(idx + 1);
            }
        }
    }

    fn timer_cascade_tick(&mut self, idx: usize) {
        let timer = &mut self.io.timers[idx];
        timer.counter = timer.counter.wrapping_add(1);
        if timer.counter == 0 {
            timer.counter = timer.reload;
            self.timer_overflow_effects(idx);
        }
    }
}
