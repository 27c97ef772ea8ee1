//! Network-adjusted time.
//!
//! Peers report their clocks during version exchange; the node applies
//! the median offset, capped so a majority of skewed peers cannot drag
//! validation time far from the local clock.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

const MAX_SAMPLES: usize = 200;
const MAX_OFFSET: i64 = 70 * 60;

#[derive(Debug, Default)]
pub struct TimeData {
    samples: Mutex<Vec<i64>>,
    offset: AtomicI64,
}

impl TimeData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local_now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_secs() as i64)
            .unwrap_or(0)
    }

    /// Adjusted unix time.
    pub fn now(&self) -> i64 {
        Self::local_now() + self.offset.load(Ordering::Relaxed)
    }

    pub fn offset(&self) -> i64 {
        self.offset.load(Ordering::Relaxed)
    }

    /// Record a peer's clock reading and recompute the median offset.
    pub fn add_sample(&self, peer_time: i64) {
        let sample = peer_time - Self::local_now();
        let Ok(mut samples) = self.samples.lock() else {
            return;
        };
        if samples.len() >= MAX_SAMPLES {
            return;
        }
        samples.push(sample);
        let mut sorted = samples.clone();
        sorted.sort_unstable();
        let median = sorted[sorted.len() / 2];
        self.offset
            .store(median.clamp(-MAX_OFFSET, MAX_OFFSET), Ordering::Relaxed);
    }

    /// Force the offset. Test and operator override.
    pub fn set_offset(&self, offset: i64) {
        self.offset.store(offset, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_offset_is_clamped() {
        let time = TimeData::new();
        let now = TimeData::local_now();
        time.add_sample(now + 10_000_000);
        assert_eq!(time.offset(), MAX_OFFSET);
    }

    #[test]
    fn explicit_offset_shifts_now() {
        let time = TimeData::new();
        time.set_offset(5_400);
        let delta = time.now() - TimeData::local_now();
        assert!((5_399..=5_401).contains(&delta));
    }
}
