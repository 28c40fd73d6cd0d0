//! Circular sample buffer for audio streams
//!
//! A fixed-capacity FIFO over `f32` samples shared between a producer
//! (device callback or network ingest) and a consumer (network sender or
//! playback scheduler). When full, new samples evict the oldest unread ones:
//! a slow consumer loses audio instead of stalling the producer.
//!
//! Every operation takes the internal lock for exactly its own duration and
//! never waits for data or space. Lack of either is reported to the caller.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::constants;

struct RingState {
    samples: Vec<f32>,
    read_index: usize,
    write_index: usize,
    available: usize,
}

impl RingState {
    fn capacity(&self) -> usize {
        self.samples.len()
    }

    fn is_full(&self) -> bool {
        self.available == self.capacity()
    }
}

/// Thread-safe overwrite-oldest ring buffer of audio samples
pub struct RingBuffer {
    state: Mutex<RingState>,
    capacity: usize,
    overwritten: AtomicU64,
}

impl RingBuffer {
    /// Create a buffer holding `duration_secs` of audio at the given format.
    ///
    /// Capacity is `sample_rate * channels * duration_secs` samples, with the
    /// duration clamped to [`constants::MAX_BUFFER_SECONDS`]. A non-finite
    /// duration gives the minimum capacity.
    pub fn new(sample_rate: u32, channels: u16, duration_secs: f32) -> Self {
        let duration = if duration_secs.is_finite() {
            duration_secs.clamp(0.0, constants::MAX_BUFFER_SECONDS)
        } else {
            0.0
        };
        let capacity = (sample_rate as f64 * channels as f64 * duration as f64) as usize;
        Self::with_capacity(capacity)
    }

    /// Create a buffer with an explicit capacity in samples (minimum 1)
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(RingState {
                samples: vec![0.0; capacity],
                read_index: 0,
                write_index: 0,
                available: 0,
            }),
            capacity,
            overwritten: AtomicU64::new(0),
        }
    }

    /// Append samples, evicting the oldest unread samples when full.
    ///
    /// Returns false only for empty input. If `samples` is longer than the
    /// capacity, only its trailing `capacity` samples are kept.
    pub fn enqueue(&self, samples: &[f32]) -> bool {
        if samples.is_empty() {
            return false;
        }

        let samples = if samples.len() > self.capacity {
            &samples[samples.len() - self.capacity..]
        } else {
            samples
        };

        let mut state = self.state.lock();
        let capacity = state.capacity();
        let mut evicted = 0u64;

        for &sample in samples {
            let write_index = state.write_index;
            state.samples[write_index] = sample;
            state.write_index = (write_index + 1) % capacity;

            if state.is_full() {
                state.read_index = (state.read_index + 1) % capacity;
                evicted += 1;
            } else {
                state.available += 1;
            }
        }
        drop(state);

        if evicted > 0 {
            self.overwritten.fetch_add(evicted, Ordering::Relaxed);
        }
        true
    }

    /// Remove exactly `count` samples in FIFO order.
    ///
    /// Returns `None` without touching the buffer when `count` is zero or
    /// more than the available samples.
    pub fn dequeue(&self, count: usize) -> Option<Vec<f32>> {
        let mut out = Vec::with_capacity(count);
        if self.dequeue_into(&mut out, count) {
            Some(out)
        } else {
            None
        }
    }

    /// Like [`dequeue`](Self::dequeue) but reuses the caller's vector.
    ///
    /// On success `out` holds exactly `count` samples.
    pub fn dequeue_into(&self, out: &mut Vec<f32>, count: usize) -> bool {
        let mut state = self.state.lock();

        if count == 0 || state.available == 0 || count > state.available {
            return false;
        }

        out.clear();
        out.reserve(count);

        let capacity = state.capacity();
        let read_index = state.read_index;
        let first = count.min(capacity - read_index);
        out.extend_from_slice(&state.samples[read_index..read_index + first]);
        out.extend_from_slice(&state.samples[..count - first]);

        state.read_index = (read_index + count) % capacity;
        state.available -= count;
        true
    }

    /// Number of samples currently readable
    pub fn available_count(&self) -> usize {
        self.state.lock().available
    }

    /// Drop all buffered audio and zero the storage
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.read_index = 0;
        state.write_index = 0;
        state.available = 0;
        state.samples.fill(0.0);
    }

    pub fn is_empty(&self) -> bool {
        self.available_count() == 0
    }

    pub fn is_full(&self) -> bool {
        self.state.lock().is_full()
    }

    /// Buffer capacity in samples
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total samples evicted by overwrite since creation
    pub fn overwritten_count(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }

    /// Get fill level as a fraction of capacity
    pub fn fill_level(&self) -> f32 {
        self.available_count() as f32 / self.capacity as f32
    }
}

/// Thread-safe handle to a ring buffer
pub type SharedRingBuffer = Arc<RingBuffer>;

/// Create a new shared ring buffer sized for `duration_secs` of audio
pub fn create_shared_buffer(sample_rate: u32, channels: u16, duration_secs: f32) -> SharedRingBuffer {
    Arc::new(RingBuffer::new(sample_rate, channels, duration_secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ramp(range: std::ops::RangeInclusive<u32>) -> Vec<f32> {
        range.map(|i| i as f32).collect()
    }

    #[test]
    fn test_capacity_from_format() {
        let buffer = RingBuffer::new(48000, 1, 2.0);
        assert_eq!(buffer.capacity(), 96000);
        assert!(buffer.is_empty());
        assert!(!buffer.is_full());
    }

    #[test]
    fn test_capacity_bounded_for_extreme_durations() {
        assert_eq!(RingBuffer::new(48000, 1, f32::INFINITY).capacity(), 1);
        assert_eq!(RingBuffer::new(48000, 1, f32::NAN).capacity(), 1);
        assert_eq!(RingBuffer::new(48000, 1, 1e12).capacity(), 48000 * 60);
    }

    #[test]
    fn test_round_trip() {
        let buffer = RingBuffer::with_capacity(16);
        let input = ramp(1..=10);

        assert!(buffer.enqueue(&input));
        assert_eq!(buffer.available_count(), 10);
        assert_eq!(buffer.dequeue(10).unwrap(), input);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_empty_enqueue_rejected() {
        let buffer = RingBuffer::with_capacity(8);
        assert!(!buffer.enqueue(&[]));
        assert_eq!(buffer.available_count(), 0);
    }

    #[test]
    fn test_overwrite_keeps_most_recent() {
        let capacity = 32u32;
        let buffer = RingBuffer::with_capacity(capacity as usize);

        assert!(buffer.enqueue(&ramp(1..=capacity + 5)));
        assert!(buffer.is_full());
        assert_eq!(buffer.dequeue(capacity as usize).unwrap(), ramp(6..=capacity + 5));
    }

    #[test]
    fn test_overwrite_across_calls() {
        let buffer = RingBuffer::with_capacity(4);
        buffer.enqueue(&[1.0, 2.0, 3.0]);
        buffer.enqueue(&[4.0, 5.0, 6.0]);

        assert_eq!(buffer.available_count(), 4);
        assert_eq!(buffer.overwritten_count(), 2);
        assert_eq!(buffer.dequeue(4).unwrap(), vec![3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_dequeue_more_than_available_fails() {
        let buffer = RingBuffer::with_capacity(8);
        buffer.enqueue(&[1.0, 2.0, 3.0]);

        assert!(buffer.dequeue(4).is_none());
        assert!(buffer.dequeue(0).is_none());
        assert_eq!(buffer.available_count(), 3);
        assert_eq!(buffer.dequeue(3).unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_wrap_around_dequeue() {
        let buffer = RingBuffer::with_capacity(5);
        buffer.enqueue(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(buffer.dequeue(3).unwrap(), vec![1.0, 2.0, 3.0]);

        buffer.enqueue(&[5.0, 6.0, 7.0]);
        assert_eq!(buffer.dequeue(4).unwrap(), vec![4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_reset_is_idempotent() {
        let buffer = RingBuffer::with_capacity(8);
        buffer.enqueue(&ramp(1..=12));

        buffer.reset();
        assert_eq!(buffer.available_count(), 0);
        buffer.reset();
        assert_eq!(buffer.available_count(), 0);
        assert!(buffer.dequeue(1).is_none());
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        let buffer = create_shared_buffer(48000, 1, 0.1);
        let producer = {
            let buffer = buffer.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    buffer.enqueue(&[0.25; 480]);
                }
            })
        };

        let mut drained = 0;
        for _ in 0..200 {
            if let Some(chunk) = buffer.dequeue(240) {
                drained += chunk.len();
            }
        }
        producer.join().unwrap();

        assert!(buffer.available_count() <= buffer.capacity());
        assert!(drained % 240 == 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Enqueue(usize),
        Dequeue(usize),
        Reset,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (1usize..200).prop_map(Op::Enqueue),
            4 => (0usize..200).prop_map(Op::Dequeue),
            1 => Just(Op::Reset),
        ]
    }

    proptest! {
        #[test]
        fn prop_available_stays_within_capacity(
            capacity in 1usize..128,
            ops in prop::collection::vec(op_strategy(), 1..64),
        ) {
            let buffer = RingBuffer::with_capacity(capacity);
            for op in ops {
                let before = buffer.available_count();
                match op {
                    Op::Enqueue(n) => {
                        buffer.enqueue(&vec![0.5; n]);
                        prop_assert_eq!(buffer.available_count(), (before + n).min(capacity));
                    }
                    Op::Dequeue(n) => {
                        let result = buffer.dequeue(n);
                        if n == 0 || n > before {
                            prop_assert!(result.is_none());
                            prop_assert_eq!(buffer.available_count(), before);
                        } else {
                            prop_assert_eq!(result.map(|v| v.len()), Some(n));
                            prop_assert_eq!(buffer.available_count(), before - n);
                        }
                    }
                    Op::Reset => {
                        buffer.reset();
                        prop_assert_eq!(buffer.available_count(), 0);
                    }
                }
                prop_assert!(buffer.available_count() <= capacity);
                prop_assert_eq!(buffer.is_full(), buffer.available_count() == capacity);
            }
        }

        #[test]
        fn prop_fifo_round_trip(samples in prop::collection::vec(-1.0f32..1.0, 1..256)) {
            let buffer = RingBuffer::with_capacity(256);
            prop_assert!(buffer.enqueue(&samples));
            prop_assert_eq!(buffer.dequeue(samples.len()), Some(samples));
        }
    }
}
