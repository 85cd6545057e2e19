//! Lock-free ring buffer between a theme's decode thread and the render callback.
//!
//! Single producer (the stream worker) and single consumer (the session's render pass).
//! Samples are interleaved stereo and stored as `f32` bit patterns in atomics, so neither
//! side ever locks and no unsafe code is needed. Reads and writes move whole frames only.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Interleaved channel count carried by the ring.
pub const RING_CHANNELS: usize = 2;

/// Single-producer, single-consumer stereo sample ring.
pub struct StreamRing {
    /// Sample storage as `f32::to_bits`.
    slots: Box<[AtomicU32]>,
    /// Total samples ever read.
    read_pos: AtomicUsize,
    /// Total samples ever written.
    write_pos: AtomicUsize,
    /// Capacity in samples (power of 2 for efficient modulo).
    capacity: usize,
    mask: usize,
    /// Render passes that wanted more frames than were buffered.
    underruns: AtomicU64,
}

impl StreamRing {
    /// Create a ring holding at least `frames` stereo frames.
    pub fn with_frames(frames: usize) -> Self {
        let capacity = (frames.max(1) * RING_CHANNELS).next_power_of_two();
        let slots = (0..capacity)
            .map(|_| AtomicU32::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            read_pos: AtomicUsize::new(0),
            write_pos: AtomicUsize::new(0),
            capacity,
            mask: capacity - 1,
            underruns: AtomicU64::new(0),
        }
    }

    /// Capacity in samples.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples available for reading.
    pub fn available(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    /// Whole frames available for reading.
    pub fn available_frames(&self) -> usize {
        self.available() / RING_CHANNELS
    }

    /// Free sample slots.
    pub fn free(&self) -> usize {
        self.capacity - self.available()
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    /// Write as many whole frames from `samples` as fit. Returns samples written.
    ///
    /// Producer side only.
    pub fn write(&self, samples: &[f32]) -> usize {
        let write_pos = self.write_pos.load(Ordering::Relaxed);
        let read_pos = self.read_pos.load(Ordering::Acquire);

        let space = self.capacity - write_pos.wrapping_sub(read_pos);
        let to_write = samples.len().min(space) / RING_CHANNELS * RING_CHANNELS;

        for (offset, sample) in samples[..to_write].iter().enumerate() {
            let slot = write_pos.wrapping_add(offset) & self.mask;
            self.slots[slot].store(sample.to_bits(), Ordering::Relaxed);
        }

        self.write_pos
            .store(write_pos.wrapping_add(to_write), Ordering::Release);
        to_write
    }

    /// Read whole frames into `output`. Returns samples read.
    ///
    /// Consumer side only.
    pub fn read(&self, output: &mut [f32]) -> usize {
        let read_pos = self.read_pos.load(Ordering::Relaxed);
        let write_pos = self.write_pos.load(Ordering::Acquire);

        let available = write_pos.wrapping_sub(read_pos);
        let to_read = output.len().min(available) / RING_CHANNELS * RING_CHANNELS;

        for (offset, out) in output[..to_read].iter_mut().enumerate() {
            let slot = read_pos.wrapping_add(offset) & self.mask;
            *out = f32::from_bits(self.slots[slot].load(Ordering::Relaxed));
        }

        self.read_pos
            .store(read_pos.wrapping_add(to_read), Ordering::Release);
        to_read
    }

    /// Drop everything buffered. Consumer side only.
    pub fn clear(&self) {
        let write_pos = self.write_pos.load(Ordering::Acquire);
        self.read_pos.store(write_pos, Ordering::Release);
    }

    pub fn record_underrun(&self) {
        self.underruns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }
}

/// Thread-safe reference to a stream ring.
pub type SharedStreamRing = Arc<StreamRing>;

/// Create a shared ring holding at least `frames` stereo frames.
pub fn shared_stream_ring(frames: usize) -> SharedStreamRing {
    Arc::new(StreamRing::with_frames(frames))
}
