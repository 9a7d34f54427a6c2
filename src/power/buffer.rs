//! Bounded, thread-safe sample buffer shared between the sampler thread and its readers.
//!
//! Offsets are strictly increasing; on overflow the oldest sample is evicted.

use super::sample::{PeakPower, PowerSample};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug)]
struct BufferState {
    samples: VecDeque<PowerSample>,
    capacity: usize,
    evicted: u64,
    last_offset_ms: Option<f64>,
    peak: PeakPower,
}

/// Cloneable handle to one sample buffer. Readers receive copies; the buffer keeps ownership.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    inner: Arc<Mutex<BufferState>>,
}

impl SampleBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(BufferState {
                samples: VecDeque::with_capacity(capacity.min(4096)),
                capacity,
                evicted: 0,
                last_offset_ms: None,
                peak: PeakPower::default(),
            })),
        }
    }

    /// Append a sample. Returns false (and drops it) when its offset does not advance
    /// past the last accepted sample or a value is not finite.
    pub fn push(&self, sample: PowerSample) -> bool {
        if !sample.is_valid() {
            return false;
        }
        let mut st = self.inner.lock();
        if let Some(last) = st.last_offset_ms {
            if sample.offset_ms <= last {
                return false;
            }
        }
        if st.samples.len() == st.capacity {
            st.samples.pop_front();
            st.evicted += 1;
        }
        st.last_offset_ms = Some(sample.offset_ms);
        st.peak.observe(&sample);
        st.samples.push_back(sample);
        true
    }

    pub fn latest(&self) -> Option<PowerSample> {
        self.inner.lock().samples.back().cloned()
    }

    /// Samples with offset strictly greater than `offset_ms`.
    pub fn since(&self, offset_ms: f64) -> Vec<PowerSample> {
        let st = self.inner.lock();
        let idx = st.samples.partition_point(|s| s.offset_ms <= offset_ms);
        st.samples.range(idx..).cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<PowerSample> {
        self.inner.lock().samples.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Samples dropped because the buffer was full.
    pub fn evicted(&self) -> u64 {
        self.inner.lock().evicted
    }

    pub fn peak(&self) -> PeakPower {
        self.inner.lock().peak
    }

    pub fn clear(&self) {
        let mut st = self.inner.lock();
        st.samples.clear();
        st.evicted = 0;
        st.last_offset_ms = None;
        st.peak = PeakPower::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(offset: f64, mw: f64) -> PowerSample {
        PowerSample::with_total(offset, mw)
    }

    #[test]
    fn rejects_non_increasing_offsets() {
        let buf = SampleBuffer::new(8);
        assert!(buf.push(s(10.0, 1.0)));
        assert!(!buf.push(s(10.0, 1.0)));
        assert!(!buf.push(s(5.0, 1.0)));
        assert!(buf.push(s(11.0, 1.0)));
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn rejects_non_finite() {
        let buf = SampleBuffer::new(8);
        assert!(!buf.push(s(f64::NAN, 1.0)));
        assert!(!buf.push(s(1.0, f64::INFINITY)));
        assert!(buf.is_empty());
    }

    #[test]
    fn evicts_oldest_on_overflow() {
        let buf = SampleBuffer::new(3);
        for i in 0..5 {
            buf.push(s(i as f64 * 100.0, 1.0));
        }
        let snap = buf.snapshot();
        assert_eq!(snap.len(), 3);
        assert_eq!(snap[0].offset_ms, 200.0);
        assert_eq!(buf.evicted(), 2);
        assert_eq!(buf.latest().unwrap().offset_ms, 400.0);
    }

    #[test]
    fn since_is_exclusive() {
        let buf = SampleBuffer::new(8);
        for i in 0..4 {
            buf.push(s(i as f64 * 100.0, 1.0));
        }
        let after = buf.since(100.0);
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].offset_ms, 200.0);
        assert_eq!(buf.since(-1.0).len(), 4);
    }

    #[test]
    fn peak_survives_eviction() {
        let buf = SampleBuffer::new(1);
        buf.push(s(0.0, 900.0));
        buf.push(s(1.0, 100.0));
        assert_eq!(buf.peak().total_mw, 900.0);
    }
}
