//! Lock-free buffers on the audio paths
//!
//! `SampleRing` is a single-producer single-consumer ring of interleaved
//! i16 samples between the real-time device callback and a blocking
//! pipeline thread. `JitterBuffer` is the bounded FIFO of encoded payloads
//! between the receiver's ingest and decode threads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam::queue::ArrayQueue;

/// Lock-free ring of interleaved PCM samples
pub struct SampleRing {
    queue: ArrayQueue<i16>,
    overflow_count: AtomicUsize,
    underrun_count: AtomicUsize,
}

impl SampleRing {
    /// Create a new ring with the given capacity in samples
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            overflow_count: AtomicUsize::new(0),
            underrun_count: AtomicUsize::new(0),
        }
    }

    /// Push a slice of samples, dropping what does not fit.
    /// Returns the number of samples accepted.
    pub fn push_slice(&self, samples: &[i16]) -> usize {
        let accepted = self.try_push_slice(samples);
        if accepted < samples.len() {
            self.overflow_count
                .fetch_add(samples.len() - accepted, Ordering::Relaxed);
        }
        accepted
    }

    /// Push without counting a short write as overflow; for callers that
    /// retry until everything fits.
    pub fn try_push_slice(&self, samples: &[i16]) -> usize {
        let mut accepted = 0;
        for &sample in samples {
            if self.queue.push(sample).is_err() {
                break;
            }
            accepted += 1;
        }
        accepted
    }

    /// Pop up to `buf.len()` samples. Returns the number written.
    pub fn pop_slice(&self, buf: &mut [i16]) -> usize {
        let mut filled = 0;
        while filled < buf.len() {
            match self.queue.pop() {
                Some(sample) => {
                    buf[filled] = sample;
                    filled += 1;
                }
                None => {
                    if filled == 0 {
                        self.underrun_count.fetch_add(1, Ordering::Relaxed);
                    }
                    break;
                }
            }
        }
        filled
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Samples dropped because the ring was full
    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }

    /// Reads that found the ring empty
    pub fn underrun_count(&self) -> usize {
        self.underrun_count.load(Ordering::Relaxed)
    }

    /// Fill level as a fraction of capacity
    pub fn fill_level(&self) -> f32 {
        self.len() as f32 / self.capacity() as f32
    }
}

/// Thread-safe handle to a sample ring
pub type SharedSampleRing = Arc<SampleRing>;

/// Create a new shared sample ring
pub fn create_shared_ring(capacity: usize) -> SharedSampleRing {
    Arc::new(SampleRing::new(capacity))
}

/// Bounded FIFO of encoded frames between ingest and decode.
///
/// When full, pushing evicts the oldest frame so playback tracks the live
/// stream instead of accumulating delay. No reordering: frames come out in
/// arrival order.
pub struct JitterBuffer {
    queue: ArrayQueue<Bytes>,
    arrived: AtomicUsize,
    evicted: AtomicUsize,
}

impl JitterBuffer {
    /// Create a jitter buffer holding up to `capacity` frames
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            arrived: AtomicUsize::new(0),
            evicted: AtomicUsize::new(0),
        }
    }

    /// Push a frame, evicting the oldest when full.
    /// Returns the evicted frame, if any.
    pub fn push(&self, frame: Bytes) -> Option<Bytes> {
        self.arrived.fetch_add(1, Ordering::Relaxed);
        let displaced = self.queue.force_push(frame);
        if displaced.is_some() {
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        displaced
    }

    /// Pop the oldest frame
    pub fn pop(&self) -> Option<Bytes> {
        self.queue.pop()
    }

    /// Discard everything buffered
    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Get statistics
    pub fn stats(&self) -> JitterBufferStats {
        JitterBufferStats {
            level: self.len(),
            capacity: self.capacity(),
            arrived: self.arrived.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}

/// Jitter buffer statistics
#[derive(Debug, Clone)]
pub struct JitterBufferStats {
    pub level: usize,
    pub capacity: usize,
    pub arrived: usize,
    pub evicted: usize,
}

impl JitterBufferStats {
    /// Fraction of arrived frames that were displaced before playback
    pub fn eviction_rate(&self) -> f32 {
        if self.arrived == 0 {
            0.0
        } else {
            self.evicted as f32 / self.arrived as f32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_sample_ring_basic() {
        let ring = SampleRing::new(8);
        assert_eq!(ring.push_slice(&[1, 2, 3, 4]), 4);
        assert_eq!(ring.len(), 4);

        let mut out = [0i16; 8];
        assert_eq!(ring.pop_slice(&mut out), 4);
        assert_eq!(&out[..4], &[1, 2, 3, 4]);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_sample_ring_overflow_drops_tail() {
        let ring = SampleRing::new(4);
        assert_eq!(ring.push_slice(&[1, 2, 3, 4, 5, 6]), 4);
        assert_eq!(ring.overflow_count(), 2);

        let mut out = [0i16; 4];
        ring.pop_slice(&mut out);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_sample_ring_underrun_counted_once_per_empty_read() {
        let ring = SampleRing::new(4);
        let mut out = [0i16; 4];
        assert_eq!(ring.pop_slice(&mut out), 0);
        assert_eq!(ring.underrun_count(), 1);

        // partial read is not an underrun
        ring.push_slice(&[7]);
        assert_eq!(ring.pop_slice(&mut out), 1);
        assert_eq!(ring.underrun_count(), 1);
    }

    #[test]
    fn test_jitter_buffer_fifo_order() {
        let jitter = JitterBuffer::new(4);
        jitter.push(Bytes::from_static(b"a"));
        jitter.push(Bytes::from_static(b"b"));
        assert_eq!(jitter.pop().unwrap().as_ref(), b"a");
        assert_eq!(jitter.pop().unwrap().as_ref(), b"b");
        assert!(jitter.pop().is_none());
    }

    #[test]
    fn test_jitter_buffer_evicts_oldest_when_full() {
        let jitter = JitterBuffer::new(2);
        assert!(jitter.push(Bytes::from_static(b"a")).is_none());
        assert!(jitter.push(Bytes::from_static(b"b")).is_none());
        // full: pushing c displaces a
        let displaced = jitter.push(Bytes::from_static(b"c")).unwrap();
        assert_eq!(displaced.as_ref(), b"a");
        assert_eq!(jitter.len(), 2);
        assert_eq!(jitter.pop().unwrap().as_ref(), b"b");
        assert_eq!(jitter.pop().unwrap().as_ref(), b"c");

        let stats = jitter.stats();
        assert_eq!(stats.arrived, 3);
        assert_eq!(stats.evicted, 1);
    }

    #[test]
    fn test_jitter_buffer_clear() {
        let jitter = JitterBuffer::new(4);
        jitter.push(Bytes::from_static(b"a"));
        jitter.push(Bytes::from_static(b"b"));
        jitter.clear();
        assert!(jitter.is_empty());
        // counters survive a clear
        assert_eq!(jitter.stats().arrived, 2);
    }

    proptest! {
        // the level never exceeds capacity, and what survives any push
        // sequence is exactly the newest frames in arrival order
        #[test]
        fn prop_jitter_bound_keeps_newest(capacity in 1usize..16, pushes in 0usize..64) {
            let jitter = JitterBuffer::new(capacity);
            for i in 0..pushes {
                jitter.push(Bytes::from(vec![i as u8]));
                prop_assert!(jitter.len() <= capacity);
            }
            let stats = jitter.stats();
            prop_assert_eq!(stats.arrived, pushes);
            prop_assert_eq!(stats.evicted, pushes.saturating_sub(capacity));

            for i in pushes.saturating_sub(capacity)..pushes {
                prop_assert_eq!(jitter.pop().unwrap().as_ref(), &[i as u8][..]);
            }
            prop_assert!(jitter.pop().is_none());
        }
    }
}
