//! APU direct-sound state.
//!
//! Channel synthesis is outside the core; what lives here is the pair of
//! direct-sound FIFOs the CPU and DMA engine feed, the per-channel sample
//! latch the timers clock, and the resampling event that publishes frames
//! into the host audio ring.

use crate::gba::Gba;
use crate::scheduler::{Event, EventKind};

/// Bus address of the FIFO data registers, used to match DMA destinations.
pub const FIFO_A_ADDR: u32 = 0x0400_00A0;
pub const FIFO_B_ADDR: u32 = 0x0400_00A4;

pub const FIFO_CAPACITY: usize = 32;

/// Refill DMA is requested once a FIFO drains to half capacity.
const FIFO_REFILL_THRESHOLD: u8 = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fifo {
    pub data: [u8; FIFO_CAPACITY],
    pub read_idx: u8,
    pub size: u8,
}

impl Default for Fifo {
    fn default() -> Self {
        Self {
            data: [0; FIFO_CAPACITY],
            read_idx: 0,
            size: 0,
        }
    }
}

impl Fifo {
    pub fn push(&mut self, val: u8) {
        if (self.size as usize) >= FIFO_CAPACITY {
            // Overflowing the FIFO resets it.
            self.clear();
            return;
        }
        let write_idx = (self.read_idx as usize + self.size as usize) % FIFO_CAPACITY;
        self.data[write_idx] = val;
        self.size += 1;
    }

    pub fn pop(&mut self) -> u8 {
        if self.size == 0 {
            return 0;
        }
        let val = self.data[self.read_idx as usize];
        self.read_idx = (self.read_idx + 1) % FIFO_CAPACITY as u8;
        self.size -= 1;
        val
    }

    pub fn clear(&mut self) {
        self.read_idx = 0;
        self.size = 0;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Apu {
    pub fifos: [Fifo; 2],
    /// Current direct-sound sample per FIFO, as last clocked out by a timer.
    pub latch: [i8; 2],
}

impl Gba {
    /// Hook called when timer 0 or 1 overflows: clock the FIFOs that selected
    /// that timer and request refill DMA for any that ran low.
    pub(crate) fn apu_on_timer_overflow(&mut self, timer_idx: usize) {
        for fifo_idx in 0..2 {
            // SOUNDCNT_H bits 10/14 select the clocking timer per FIFO.
            let select = (self.io.soundcnt_h >> (10 + fifo_idx * 4)) & 1;
            if select as usize != timer_idx {
                continue;
            }

            let sample = self.apu.fifos[fifo_idx].pop() as i8;
            self.apu.latch[fifo_idx] = sample;

            if self.apu.fifos[fifo_idx].size <= FIFO_REFILL_THRESHOLD {
                let at = self.scheduler.cycles() + 1;
                self.scheduler
                    .add(Event::once(EventKind::ApuFifoRefill, at).with_arg(fifo_idx as u32));
            }
        }
    }

    /// `ApuFifoRefill` event handler.
    pub(crate) fn apu_fifo_refill(&mut self, fifo_idx: usize) {
        let addr = if fifo_idx == 0 { FIFO_A_ADDR } else { FIFO_B_ADDR };
        self.dma_schedule_fifo_refill(addr);
    }

    /// `ApuSample` event handler: resample the current latches into the host
    /// audio ring. The event re-arms itself at the configured sample rate.
    pub(crate) fn apu_sample(&mut self) {
        let Some(producer) = self.audio_producer.as_ref() else {
            return;
        };

        // Master enable gate; both FIFO channels mixed at equal weight. The
        // sum of two scaled 8-bit samples stays well inside i16.
        let frame = if self.io.soundcnt_x & 0x80 != 0 {
            let a = self.apu.latch[0] as i16 * 64;
            let b = self.apu.latch[1] as i16 * 64;
            [a + b, a + b]
        } else {
            [0, 0]
        };
        producer.push(frame);
    }
}
