//! State shared between the emulator thread and the host.
//!
//! The emulator thread owns the write side exclusively. The host polls the
//! two atomic counters lock-free and takes the framebuffer mutex only when
//! the version tells it a new frame exists; the backup buffer follows the
//! dirty-flag protocol.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::ppu::FRAMEBUFFER_PIXELS;

pub struct Framebuffer {
    pub data: Mutex<Box<[u32]>>,
    version: AtomicU64,
}

pub struct SharedBackup {
    pub data: Mutex<Vec<u8>>,
    dirty: AtomicBool,
}

pub struct SharedData {
    pub framebuffer: Framebuffer,
    frame_counter: AtomicU32,
    pub backup_storage: SharedBackup,
}

impl SharedData {
    pub fn new() -> Self {
        Self {
            framebuffer: Framebuffer {
                data: Mutex::new(vec![0u32; FRAMEBUFFER_PIXELS].into_boxed_slice()),
                version: AtomicU64::new(0),
            },
            frame_counter: AtomicU32::new(0),
            backup_storage: SharedBackup {
                data: Mutex::new(Vec::new()),
                dirty: AtomicBool::new(false),
            },
        }
    }

    /// Copy a finished frame out and advance the version counter. A host
    /// that reads the version with acquire semantics and then takes the
    /// mutex is guaranteed a consistent image.
    pub(crate) fn publish_frame(&self, pixels: &[u32]) {
        {
            let mut frame = self.framebuffer.data.lock().unwrap();
            frame.copy_from_slice(pixels);
        }
        self.framebuffer.version.fetch_add(1, Ordering::Release);
    }

    pub fn framebuffer_version(&self) -> u64 {
        self.framebuffer.version.load(Ordering::Acquire)
    }

    /// Copy the latest published frame into `out`; returns its version.
    pub fn copy_frame(&self, out: &mut [u32]) -> u64 {
        let frame = self.framebuffer.data.lock().unwrap();
        out.copy_from_slice(&frame);
        drop(frame);
        self.framebuffer_version()
    }

    pub(crate) fn bump_frame_counter(&self) {
        self.frame_counter.fetch_add(1, Ordering::Release);
    }

    /// Frames completed since the last call; host-side statistics.
    pub fn take_frame_counter(&self) -> u32 {
        self.frame_counter.swap(0, Ordering::AcqRel)
    }

    pub fn backup_dirty(&self) -> bool {
        self.backup_storage.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn set_backup_dirty(&self, dirty: bool) {
        self.backup_storage.dirty.store(dirty, Ordering::Release);
    }

    /// Clear the dirty flag, returning whether it was set. The host calls
    /// this before persisting the backup buffer.
    pub fn take_backup_dirty(&self) -> bool {
        self.backup_storage.dirty.swap(false, Ordering::AcqRel)
    }
}

impl Default for SharedData {
    fn default() -> Self {
        Self::new()
    }
}
