//! PPU timing skeleton.
//!
//! Layer rendering lives outside this crate; what the core owns is the
//! horizontal/vertical counting that everything else synchronises against:
//! the repeating hdraw/hblank events, DISPSTAT/VCOUNT upkeep, the VBlank and
//! HBlank IRQ/DMA triggers, and publication of finished frames into the
//! host-visible shared framebuffer.

use crate::dma::DmaTiming;
use crate::gba::Gba;
use crate::io::{IRQ_HBLANK, IRQ_VBLANK, IRQ_VCOUNTER};
use crate::scheduler::{Event, EventKind};

pub const SCREEN_WIDTH: usize = 240;
pub const SCREEN_HEIGHT: usize = 160;
/// Visible scanlines plus VBlank lines.
pub const SCREEN_REAL_HEIGHT: usize = 228;
pub const FRAMEBUFFER_PIXELS: usize = SCREEN_WIDTH * SCREEN_HEIGHT;

pub const CYCLES_PER_SCANLINE: u64 = 1232;
/// Cycle within a scanline at which the HBlank flag rises.
pub const HBLANK_START: u64 = 1006;
pub const CYCLES_PER_FRAME: u64 = CYCLES_PER_SCANLINE * SCREEN_REAL_HEIGHT as u64;

const DISPSTAT_VBLANK: u16 = 1 << 0;
const DISPSTAT_HBLANK: u16 = 1 << 1;
const DISPSTAT_VCOUNT_EQ: u16 = 1 << 2;
const DISPSTAT_VBLANK_IRQ: u16 = 1 << 3;
const DISPSTAT_HBLANK_IRQ: u16 = 1 << 4;
const DISPSTAT_VCOUNT_IRQ: u16 = 1 << 5;

pub struct Ppu {
    /// Scanline compose target, copied to the shared framebuffer once per
    /// frame at the top of VBlank.
    pub framebuffer: Box<[u32]>,
    pub skip_current_frame: bool,
    pub current_frame_skip_counter: u32,
    /// Latched once per frame: whether DMA 3 is set up for video capture.
    pub video_capture_enabled: bool,
}

impl Ppu {
    pub fn new() -> Self {
        Self {
            framebuffer: vec![0u32; FRAMEBUFFER_PIXELS].into_boxed_slice(),
            skip_current_frame: false,
            current_frame_skip_counter: 0,
            video_capture_enabled: false,
        }
    }
}

impl Default for Ppu {
    fn default() -> Self {
        Self::new()
    }
}

/// Expand a BGR555 colour to the 0xAABBGGRR framebuffer format.
#[inline]
fn expand_color(raw: u16) -> u32 {
    let r = (raw & 0x1F) as u32;
    let g = ((raw >> 5) & 0x1F) as u32;
    let b = ((raw >> 10) & 0x1F) as u32;
    0xFF00_0000 | ((r << 3) | (r >> 2)) | (((g << 3) | (g >> 2)) << 8) | (((b << 3) | (b >> 2)) << 16)
}

impl Gba {
    /// Schedule the repeating scanline events; called once per reset.
    pub(crate) fn ppu_schedule(&mut self) {
        self.scheduler.add(Event::repeating(
            EventKind::HBlank,
            HBLANK_START,
            CYCLES_PER_SCANLINE,
        ));
        self.scheduler.add(Event::repeating(
            EventKind::HDraw,
            CYCLES_PER_SCANLINE,
            CYCLES_PER_SCANLINE,
        ));
    }

    /// `HDraw` event handler: the PPU starts a new scanline.
    pub(crate) fn ppu_hdraw(&mut self) {
        self.io.vcount += 1;

        if self.io.vcount as usize >= SCREEN_REAL_HEIGHT {
            self.io.vcount = 0;
            self.shared.bump_frame_counter();

            let settings = &self.settings;
            if settings.enable_frame_skipping && settings.frame_skip_counter > 0 {
                self.ppu.current_frame_skip_counter =
                    (self.ppu.current_frame_skip_counter + 1) % settings.frame_skip_counter;
                self.ppu.skip_current_frame = self.ppu.current_frame_skip_counter != 0;
            } else {
                self.ppu.skip_current_frame = false;
            }
        } else if self.io.vcount as usize == SCREEN_HEIGHT {
            // The frame is complete; publishing it at the top of VBlank
            // avoids tearing on the host side.
            self.shared.publish_frame(&self.ppu.framebuffer);
        }

        let vcount = self.io.vcount;
        let vcount_setting = self.io.dispstat >> 8;
        let mut stat = self.io.dispstat & !(DISPSTAT_VBLANK | DISPSTAT_HBLANK | DISPSTAT_VCOUNT_EQ);
        if vcount == vcount_setting {
            stat |= DISPSTAT_VCOUNT_EQ;
        }
        if (SCREEN_HEIGHT as u16..SCREEN_REAL_HEIGHT as u16 - 1).contains(&vcount) {
            stat |= DISPSTAT_VBLANK;
        }
        self.io.dispstat = stat;

        if vcount as usize == SCREEN_HEIGHT {
            if stat & DISPSTAT_VBLANK_IRQ != 0 {
                self.raise_irq(IRQ_VBLANK);
            }
            self.dma_schedule_transfers(DmaTiming::VBlank);
        }

        if stat & DISPSTAT_VCOUNT_EQ != 0 && stat & DISPSTAT_VCOUNT_IRQ != 0 {
            self.raise_irq(IRQ_VCOUNTER);
        }
    }

    /// `HBlank` event handler: the visible part of the scanline is over.
    pub(crate) fn ppu_hblank(&mut self) {
        let line = self.io.vcount as usize;

        if line < SCREEN_HEIGHT && !self.ppu.skip_current_frame {
            // Compose the backdrop; the layer renderers that would draw on
            // top of it are external to the core.
            let raw = if self.io.forced_blank() {
                0x7FFF
            } else {
                self.memory.palram.read16(0)
            };
            let color = expand_color(raw);
            let row = &mut self.ppu.framebuffer[line * SCREEN_WIDTH..(line + 1) * SCREEN_WIDTH];
            row.fill(color);

            if let Some(sink) = self.scanline_sink.as_mut() {
                // Called with no locks held; must not block.
                sink(line as u32, &self.ppu.framebuffer[line * SCREEN_WIDTH..(line + 1) * SCREEN_WIDTH]);
            }
        }

        self.io.dispstat |= DISPSTAT_HBLANK;

        if self.io.dispstat & DISPSTAT_HBLANK_IRQ != 0 {
            self.raise_irq(IRQ_HBLANK);
        }

        if line < SCREEN_HEIGHT {
            self.dma_schedule_transfers(DmaTiming::HBlank);
        }

        // Video capture DMA runs on channel 3 only, lines 2..161.
        if self.ppu.video_capture_enabled && (2..SCREEN_HEIGHT + 2).contains(&line) {
            self.dma_schedule_video_capture();
        }

        // Whether DMA 3 captures video is evaluated once per frame and can't
        // change mid-frame.
        if line == SCREEN_HEIGHT + 2 {
            self.ppu.video_capture_enabled =
                self.io.dma[3].enabled() && self.io.dma[3].timing() == DmaTiming::Special;
        }
    }
}
