use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One resampled output frame: left and right PCM samples.
pub type StereoFrame = [i16; 2];

/// Single-producer / single-consumer ring of stereo frames.
///
/// The emulator thread pushes from the `ApuSample` event; the host's audio
/// thread pops. Positions are free-running counters masked into a
/// power-of-two buffer, so the ring is lock-free and wait-free on both ends.
/// When the consumer falls behind, new frames are dropped.
struct Ring {
    slots: Box<[UnsafeCell<MaybeUninit<StereoFrame>>]>,
    mask: usize,
    /// Next position the producer will write.
    write_pos: AtomicUsize,
    /// Next position the consumer will read.
    read_pos: AtomicUsize,
}

// Coordination happens entirely through the two atomics: the producer only
// writes slots in [read_pos, write_pos + 1) and the consumer only reads
// slots in [read_pos, write_pos).
unsafe impl Sync for Ring {}

impl Ring {
    fn len(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }
}

pub struct AudioProducer {
    ring: Arc<Ring>,
}

#[derive(Clone)]
pub struct AudioConsumer {
    ring: Arc<Ring>,
}

/// Build a queue holding at least `capacity_frames` frames.
pub fn audio_queue(capacity_frames: usize) -> (AudioProducer, AudioConsumer) {
    let cap = capacity_frames.max(2).next_power_of_two();
    let slots = std::iter::repeat_with(|| UnsafeCell::new(MaybeUninit::uninit()))
        .take(cap)
        .collect();

    let ring = Arc::new(Ring {
        slots,
        mask: cap - 1,
        write_pos: AtomicUsize::new(0),
        read_pos: AtomicUsize::new(0),
    });

    (
        AudioProducer {
            ring: Arc::clone(&ring),
        },
        AudioConsumer { ring },
    )
}

impl AudioProducer {
    /// Push one frame; returns false (dropping the frame) when full.
    #[inline]
    pub fn push(&self, frame: StereoFrame) -> bool {
        let write = self.ring.write_pos.load(Ordering::Relaxed);
        let read = self.ring.read_pos.load(Ordering::Acquire);
        if write.wrapping_sub(read) > self.ring.mask {
            return false;
        }

        unsafe {
            (*self.ring.slots[write & self.ring.mask].get()).write(frame);
        }
        self.ring
            .write_pos
            .store(write.wrapping_add(1), Ordering::Release);
        true
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AudioConsumer {
    #[inline]
    pub fn pop(&self) -> Option<StereoFrame> {
        let read = self.ring.read_pos.load(Ordering::Relaxed);
        let write = self.ring.write_pos.load(Ordering::Acquire);
        if read == write {
            return None;
        }

        let frame = unsafe { (*self.ring.slots[read & self.ring.mask].get()).assume_init_read() };
        self.ring
            .read_pos
            .store(read.wrapping_add(1), Ordering::Release);
        Some(frame)
    }

    /// Pop up to `out.len()` frames, returning how many were filled.
    pub fn drain_into(&self, out: &mut [StereoFrame]) -> usize {
        let mut filled = 0;
        while filled < out.len() {
            match self.pop() {
                Some(frame) => {
                    out[filled] = frame;
                    filled += 1;
                }
                None => break,
            }
        }
        filled
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_come_out_in_push_order() {
        let (tx, rx) = audio_queue(8);
        assert!(tx.push([1, -1]));
        assert!(tx.push([2, -2]));
        assert_eq!(rx.pop(), Some([1, -1]));
        assert_eq!(rx.pop(), Some([2, -2]));
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn overflow_drops_the_newest_frame() {
        let (tx, rx) = audio_queue(2);
        assert!(tx.push([1, 1]));
        assert!(tx.push([2, 2]));
        assert!(!tx.push([3, 3]));
        assert_eq!(rx.pop(), Some([1, 1]));
    }
}
