//! DMA engine.
//!
//! Transfers run to completion inside a `DmaFire` scheduler event, moving
//! data through the arbitrated bus so every unit is billed at the regular
//! access cost. While a transfer runs the prefetch buffer is bypassed (but
//! not reset) and the DMA open-bus latch shadows the last unit moved.

use crate::bus::Access;
use crate::gba::Gba;
use crate::io::IRQ_DMA0;
use crate::scheduler::{Event, EventKind};

/// Value of the CNT_H timing field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaTiming {
    Immediate,
    VBlank,
    HBlank,
    Special,
}

impl DmaTiming {
    fn from_control(control: u16) -> Self {
        match (control >> 12) & 0x3 {
            0 => Self::Immediate,
            1 => Self::VBlank,
            2 => Self::HBlank,
            _ => Self::Special,
        }
    }
}

const CTL_REPEAT: u16 = 1 << 9;
const CTL_WORD: u16 = 1 << 10;
const CTL_IRQ: u16 = 1 << 14;
const CTL_ENABLE: u16 = 1 << 15;

/// Cycles between a trigger and the transfer starting.
const DMA_START_DELAY: u64 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DmaChannel {
    pub src: u32,
    pub dst: u32,
    pub count: u16,
    pub control: u16,
    pub internal_src: u32,
    pub internal_dst: u32,
    pub internal_count: u32,
    /// A `DmaFire` event for this channel is already queued.
    pub pending: bool,
}

impl DmaChannel {
    #[inline]
    pub fn enabled(&self) -> bool {
        self.control & CTL_ENABLE != 0
    }

    #[inline]
    pub fn timing(&self) -> DmaTiming {
        DmaTiming::from_control(self.control)
    }

    fn latched_count(&self, ch: usize) -> u32 {
        let max = if ch == 3 { 0x1_0000 } else { 0x4000 };
        match self.count as u32 {
            0 => max,
            n => n.min(max),
        }
    }

    fn src_mask(ch: usize) -> u32 {
        if ch == 0 {
            0x07FF_FFFF
        } else {
            0x0FFF_FFFF
        }
    }

    fn dst_mask(ch: usize) -> u32 {
        if ch == 3 {
            0x0FFF_FFFF
        } else {
            0x07FF_FFFF
        }
    }
}

/// Pointer stepping selected by the source/destination control fields.
fn step_for(ctl: u16, unit: u32) -> i64 {
    match ctl {
        0 => unit as i64,    // increment
        1 => -(unit as i64), // decrement
        2 => 0,              // fixed
        _ => unit as i64,    // increment (+reload for destinations)
    }
}

impl Gba {
    /// Write to the high byte of a channel's CNT_H register.
    pub(crate) fn dma_control_write_hi(&mut self, ch: usize, val: u8) {
        let was_enabled = self.io.dma[ch].enabled();
        let dma = &mut self.io.dma[ch];
        dma.control = (dma.control & 0x00FF) | ((val as u16) << 8);

        if !dma.enabled() {
            return;
        }

        if !was_enabled {
            dma.internal_src = dma.src & DmaChannel::src_mask(ch);
            dma.internal_dst = dma.dst & DmaChannel::dst_mask(ch);
            dma.internal_count = dma.latched_count(ch);

            if dma.timing() == DmaTiming::Immediate {
                self.dma_schedule_channel(ch);
            }
        }
    }

    /// Queue every enabled channel waiting on `timing`.
    pub(crate) fn dma_schedule_transfers(&mut self, timing: DmaTiming) {
        for ch in 0..4 {
            let dma = &self.io.dma[ch];
            if dma.enabled() && dma.timing() == timing {
                self.dma_schedule_channel(ch);
            }
        }
    }

    /// Queue the special-timing FIFO channels whose destination is the given
    /// FIFO data register.
    pub(crate) fn dma_schedule_fifo_refill(&mut self, fifo_addr: u32) {
        for ch in 1..3 {
            let dma = &self.io.dma[ch];
            if dma.enabled() && dma.timing() == DmaTiming::Special && dma.internal_dst == fifo_addr
            {
                self.dma_schedule_channel(ch);
            }
        }
    }

    /// Queue channel 3 when it is armed for special (video capture) timing.
    pub(crate) fn dma_schedule_video_capture(&mut self) {
        let dma = &self.io.dma[3];
        if dma.enabled() && dma.timing() == DmaTiming::Special {
            self.dma_schedule_channel(3);
        }
    }

    fn dma_schedule_channel(&mut self, ch: usize) {
        if self.io.dma[ch].pending {
            return;
        }
        self.io.dma[ch].pending = true;
        let at = self.scheduler.cycles() + DMA_START_DELAY;
        self.scheduler
            .add(Event::once(EventKind::DmaFire, at).with_arg(ch as u32));
    }

    /// `DmaFire` event handler: run the channel's whole transfer.
    pub(crate) fn dma_fire(&mut self, ch: usize) {
        self.io.dma[ch].pending = false;
        if !self.io.dma[ch].enabled() {
            return;
        }

        let control = self.io.dma[ch].control;
        let timing = DmaTiming::from_control(control);
        // Sound FIFO DMA ignores the programmed geometry: four words to a
        // fixed destination.
        let fifo_mode = timing == DmaTiming::Special && (ch == 1 || ch == 2);

        let word = fifo_mode || control & CTL_WORD != 0;
        let unit: u32 = if word { 4 } else { 2 };
        let count = if fifo_mode {
            4
        } else {
            self.io.dma[ch].internal_count
        };
        let src_step = step_for((control >> 7) & 0x3, unit);
        let dst_step = if fifo_mode {
            0
        } else {
            step_for((control >> 5) & 0x3, unit)
        };

        self.core.is_dma_running = true;
        for i in 0..count {
            let access = if i == 0 {
                Access::NonSequential
            } else {
                Access::Sequential
            };
            let src = self.io.dma[ch].internal_src;
            let dst = self.io.dma[ch].internal_dst;

            if word {
                let val = self.read32(src, access);
                self.write32(dst, val, access);
                self.memory.dma_bus = val;
            } else {
                let val = self.read16(src, access);
                self.write16(dst, val, access);
                self.memory.dma_bus = (val as u32) << 16 | val as u32;
            }
            self.memory.was_last_access_from_dma = true;

            let dma = &mut self.io.dma[ch];
            dma.internal_src = dma.internal_src.wrapping_add_signed(src_step as i32);
            dma.internal_dst = dma.internal_dst.wrapping_add_signed(dst_step as i32);
        }
        self.core.is_dma_running = false;

        let dma = &mut self.io.dma[ch];
        if dma.control & CTL_REPEAT != 0 && timing != DmaTiming::Immediate {
            dma.internal_count = dma.latched_count(ch);
            // Destination control 3: increment during the transfer, reload
            // when it completes.
            if (dma.control >> 5) & 0x3 == 3 {
                dma.internal_dst = dma.dst & DmaChannel::dst_mask(ch);
            }
        } else {
            dma.control &= !CTL_ENABLE;
        }

        if control & CTL_IRQ != 0 {
            self.raise_irq(IRQ_DMA0 << ch);
        }
    }
}
