//! Fixed-capacity circular sample store with overwrite-on-overflow semantics.
//!
//! The producer side writes bursts of arbitrary length; the consumer side reads exact counts.
//! Read and write cursors may coincide both when the buffer is empty and when it is full, so an
//! explicit `is_full` flag disambiguates the two.
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// Ring buffer handle shared between the producer context and the output callback.
pub type SharedRing = Arc<Mutex<RingBuffer>>;

/// Error returned by [`RingBuffer::read`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// More samples were requested than are currently unread.
    #[error("ring underflow: requested {requested}, available {available}")]
    Underflow {
        /// Number of samples asked for.
        requested: usize,
        /// Number of unread samples at the time of the call.
        available: usize,
    },
}

/// Circular FIFO of `f32` samples.
pub struct RingBuffer {
    data: Vec<f32>,
    write_index: usize,
    read_index: usize,
    is_full: bool,
    overrun_samples: u64,
}

impl RingBuffer {
    /// Create a zero-filled buffer holding `capacity` samples.
    ///
    /// Returns `None` when `capacity` is zero.
    pub fn new(capacity: usize) -> Option<Self> {
        if capacity == 0 {
            return None;
        }
        Some(Self {
            data: vec![0.0; capacity],
            write_index: 0,
            read_index: 0,
            is_full: false,
            overrun_samples: 0,
        })
    }

    /// Create a buffer already wrapped for sharing across execution contexts.
    pub fn shared(capacity: usize) -> Option<SharedRing> {
        Self::new(capacity).map(|ring| Arc::new(Mutex::new(ring)))
    }

    /// Total capacity in samples.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Whether the unread count equals the capacity.
    pub fn is_full(&self) -> bool {
        self.is_full
    }

    /// Number of unread samples.
    pub fn available(&self) -> usize {
        let capacity = self.capacity();
        let diff = (self.write_index + capacity - self.read_index) % capacity;
        if diff == 0 {
            if self.is_full { capacity } else { 0 }
        } else {
            diff
        }
    }

    /// Cumulative count of unread samples lost to overwrites.
    pub fn overrun_samples(&self) -> u64 {
        self.overrun_samples
    }

    /// Append samples, wrapping at the end of the storage.
    ///
    /// Writing `capacity` or more samples keeps only the newest `capacity` values and moves the
    /// read cursor onto them. Shorter writes that run past unread data overwrite it in place and
    /// leave the read cursor where it was.
    ///
    /// Returns how many samples, previously unread or just written, can no longer be read.
    pub fn write(&mut self, samples: &[f32]) -> usize {
        let n = samples.len();
        if n == 0 {
            return 0;
        }
        let capacity = self.capacity();
        let available = self.available();

        if n >= capacity {
            // Only the tail survives; it lands where a sample-by-sample write would put it.
            let tail = &samples[n - capacity..];
            let start = (self.write_index + n - capacity) % capacity;
            self.copy_in(start, tail);
            self.write_index = (self.write_index + n) % capacity;
            self.read_index = self.write_index;
        } else {
            self.copy_in(self.write_index, samples);
            self.write_index = (self.write_index + n) % capacity;
        }
        self.is_full = self.write_index == self.read_index;

        let lost = (available + n).saturating_sub(self.available());
        self.overrun_samples += lost as u64;
        lost
    }

    /// Remove and return exactly `size` samples in FIFO order.
    ///
    /// Fails without touching the cursors when fewer than `size` samples are unread.
    pub fn read(&mut self, size: usize) -> Result<Vec<f32>, RingError> {
        let mut out = Vec::with_capacity(size);
        self.read_into(&mut out, size)?;
        Ok(out)
    }

    /// Like [`read`](Self::read) but appends to `out`, which must have room for `size` more
    /// samples to stay allocation-free.
    pub fn read_into(&mut self, out: &mut Vec<f32>, size: usize) -> Result<(), RingError> {
        if size == 0 {
            return Ok(());
        }
        let available = self.available();
        if size > available {
            return Err(RingError::Underflow {
                requested: size,
                available,
            });
        }

        let capacity = self.capacity();
        let start = self.read_index;
        let first = (capacity - start).min(size);
        out.extend_from_slice(&self.data[start..start + first]);
        if size > first {
            out.extend_from_slice(&self.data[..size - first]);
        }

        self.read_index = (start + size) % capacity;
        if self.read_index == self.write_index {
            self.is_full = false;
        }
        Ok(())
    }

    /// Drain every unread sample into `out`, returning how many were moved.
    pub fn drain_into(&mut self, out: &mut Vec<f32>) -> usize {
        let available = self.available();
        match self.read_into(out, available) {
            Ok(()) => available,
            Err(_) => 0,
        }
    }

    fn copy_in(&mut self, start: usize, samples: &[f32]) {
        let capacity = self.capacity();
        let first = (capacity - start).min(samples.len());
        self.data[start..start + first].copy_from_slice(&samples[..first]);
        if samples.len() > first {
            let rest = samples.len() - first;
            self.data[..rest].copy_from_slice(&samples[first..]);
        }
    }
}

/// Monotonic timestamp in nanoseconds since the first call in this process.
pub fn monotonic_timestamp_ns() -> u64 {
    static START: Lazy<std::time::Instant> = Lazy::new(std::time::Instant::now);
    let elapsed = START.elapsed();
    (elapsed.as_secs() * 1_000_000_000) + elapsed.subsec_nanos() as u64
}
