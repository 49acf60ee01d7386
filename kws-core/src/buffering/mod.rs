//! Fixed-capacity audio history for the classification window.
//!
//! Backed by `ringbuf::HeapRb<i16>` kept permanently full: every append
//! overwrites the oldest samples, so a snapshot always yields exactly
//! [`AUDIO_CAPACITY`] samples in chronological order. There is no
//! backpressure towards the audio source; freshness wins over completeness.

pub mod chunk;

use std::sync::Arc;

use parking_lot::Mutex;
use ringbuf::{
    traits::{Consumer, Observer, RingBuffer},
    HeapRb,
};

use crate::constants::{AudioWindow, AUDIO_CAPACITY};

/// Circular store of the most recent second of PCM audio.
pub struct AudioRing {
    rb: HeapRb<i16>,
    /// Samples appended since the last reset. The write cursor is this value
    /// modulo capacity.
    total_written: u64,
}

impl AudioRing {
    /// Create a ring of [`AUDIO_CAPACITY`] zeroed samples.
    pub fn new() -> Self {
        Self::with_capacity(AUDIO_CAPACITY)
    }

    /// Create a ring with a custom capacity. Only the engine's fixed window
    /// size is used by the pipeline; other sizes exist for tests.
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut rb = HeapRb::<i16>::new(capacity);
        rb.push_iter_overwrite(std::iter::repeat(0i16).take(capacity));
        Self {
            rb,
            total_written: 0,
        }
    }

    /// Append samples, overwriting the oldest ones once the ring is full.
    pub fn append(&mut self, samples: &[i16]) {
        let cap = self.capacity();
        // Anything older than the last `cap` samples would be overwritten
        // within this same call anyway.
        let tail = if samples.len() > cap {
            &samples[samples.len() - cap..]
        } else {
            samples
        };
        self.rb.push_slice_overwrite(tail);
        self.total_written = self.total_written.wrapping_add(samples.len() as u64);
    }

    /// Zero every slot and rewind the write cursor.
    pub fn reset(&mut self) {
        let cap = self.capacity();
        self.rb.push_iter_overwrite(std::iter::repeat(0i16).take(cap));
        self.total_written = 0;
    }

    /// Copy the full contents, oldest first, into `out`.
    ///
    /// `out` must be exactly `capacity()` long.
    pub fn snapshot_into(&self, out: &mut [i16]) {
        debug_assert_eq!(out.len(), self.capacity());
        let (head, tail) = self.rb.as_slices();
        out[..head.len()].copy_from_slice(head);
        out[head.len()..head.len() + tail.len()].copy_from_slice(tail);
    }

    /// Allocating snapshot, for diagnostics and tests.
    pub fn snapshot(&self) -> Vec<i16> {
        let mut out = vec![0i16; self.capacity()];
        self.snapshot_into(&mut out);
        out
    }

    pub fn capacity(&self) -> usize {
        self.rb.capacity().get()
    }

    /// Index of the next slot to be overwritten.
    pub fn write_cursor(&self) -> usize {
        (self.total_written % self.capacity() as u64) as usize
    }

    pub fn total_written(&self) -> u64 {
        self.total_written
    }
}

impl Default for AudioRing {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AudioRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioRing")
            .field("capacity", &self.capacity())
            .field("total_written", &self.total_written)
            .finish()
    }
}

/// Shared handle used when audio delivery and classification run on
/// different threads. Every append and snapshot takes the lock.
///
/// `parking_lot::Mutex` keeps a panicking producer from poisoning the ring.
#[derive(Clone, Debug)]
pub struct AudioRingHandle(Arc<Mutex<AudioRing>>);

impl AudioRingHandle {
    pub fn new(ring: AudioRing) -> Self {
        Self(Arc::new(Mutex::new(ring)))
    }

    pub fn append(&self, samples: &[i16]) {
        self.0.lock().append(samples);
    }

    pub fn reset(&self) {
        self.0.lock().reset();
    }

    /// Copy the current window into `out` under the lock.
    pub fn snapshot_into(&self, out: &mut AudioWindow) {
        self.0.lock().snapshot_into(out);
    }

    pub fn total_written(&self) -> u64 {
        self.0.lock().total_written()
    }
}

impl Default for AudioRingHandle {
    fn default() -> Self {
        Self::new(AudioRing::new())
    }
}
