//! Rolling log of completed-chunk timing samples.
//!
//! Workers append through [`PerformanceTracker::record`]; the controller reads
//! snapshots once per tick. The buffer is bounded and evicts the oldest
//! sample first.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::units;

/// One completed chunk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceSample {
    pub ordinal: u32,
    pub bytes: u64,
    /// Bytes per second.
    pub speed: f64,
    pub completed_at: Instant,
    /// Parallelism in effect when the chunk completed.
    pub parallelism: usize,
}

impl PerformanceSample {
    pub fn mib_per_sec(&self) -> f64 {
        units::mib_per_sec(self.speed)
    }
}

/// Strategy currently applied by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategySnapshot {
    pub chunk_bytes: u64,
    pub parallelism: usize,
    /// Expected part count for the file at the current chunk size.
    pub total_chunks: u64,
}

struct TrackerInner {
    samples: VecDeque<PerformanceSample>,
    total_recorded: u64,
    total_bytes: u64,
    last_completion: Option<Instant>,
    strategy: StrategySnapshot,
}

pub struct PerformanceTracker {
    capacity: usize,
    inner: Mutex<TrackerInner>,
}

impl PerformanceTracker {
    pub fn new(capacity: usize, strategy: StrategySnapshot) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(TrackerInner {
                samples: VecDeque::with_capacity(capacity),
                total_recorded: 0,
                total_bytes: 0,
                last_completion: None,
                strategy,
            }),
        }
    }

    /// Append a sample for a chunk that finished `bytes` in `elapsed`.
    pub fn record(&self, ordinal: u32, bytes: u64, elapsed: Duration, now: Instant) -> PerformanceSample {
        let secs = elapsed.as_secs_f64().max(0.001);
        let mut inner = self.inner.lock();
        let sample = PerformanceSample {
            ordinal,
            bytes,
            speed: bytes as f64 / secs,
            completed_at: now,
            parallelism: inner.strategy.parallelism,
        };
        if inner.samples.len() == self.capacity {
            inner.samples.pop_front();
        }
        inner.samples.push_back(sample);
        inner.total_recorded += 1;
        inner.total_bytes += bytes;
        inner.last_completion = Some(now);
        sample
    }

    /// Append a pre-built sample (synthetic feeds and replays).
    pub fn record_sample(&self, sample: PerformanceSample) {
        let mut inner = self.inner.lock();
        if inner.samples.len() == self.capacity {
            inner.samples.pop_front();
        }
        inner.samples.push_back(sample);
        inner.total_recorded += 1;
        inner.total_bytes += sample.bytes;
        inner.last_completion = Some(sample.completed_at);
    }

    /// Up to `n` most recent samples, oldest first.
    pub fn recent_samples(&self, n: usize) -> Vec<PerformanceSample> {
        let inner = self.inner.lock();
        let skip = inner.samples.len().saturating_sub(n);
        inner.samples.iter().skip(skip).copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().samples.is_empty()
    }

    /// Samples ever recorded, including evicted ones.
    pub fn total_recorded(&self) -> u64 {
        self.inner.lock().total_recorded
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.lock().total_bytes
    }

    pub fn last_completion(&self) -> Option<Instant> {
        self.inner.lock().last_completion
    }

    pub fn update_strategy(&self, chunk_bytes: u64, parallelism: usize, total_chunks: u64) {
        self.inner.lock().strategy = StrategySnapshot {
            chunk_bytes,
            parallelism,
            total_chunks,
        };
    }

    pub fn strategy(&self) -> StrategySnapshot {
        self.inner.lock().strategy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::MIB;

    fn tracker(capacity: usize) -> PerformanceTracker {
        PerformanceTracker::new(
            capacity,
            StrategySnapshot {
                chunk_bytes: 8 * MIB,
                parallelism: 2,
                total_chunks: 10,
            },
        )
    }

    #[test]
    fn evicts_oldest_samples() {
        let tracker = tracker(3);
        let now = Instant::now();
        for ordinal in 1..=5 {
            tracker.record(ordinal, MIB, Duration::from_secs(1), now);
        }
        let ordinals: Vec<u32> = tracker.recent_samples(10).iter().map(|s| s.ordinal).collect();
        assert_eq!(ordinals, vec![3, 4, 5]);
        assert_eq!(tracker.total_recorded(), 5);
        assert_eq!(tracker.total_bytes(), 5 * MIB);
    }

    #[test]
    fn recent_samples_are_oldest_first() {
        let tracker = tracker(10);
        let now = Instant::now();
        for ordinal in 1..=4 {
            tracker.record(ordinal, MIB, Duration::from_secs(1), now);
        }
        let ordinals: Vec<u32> = tracker.recent_samples(2).iter().map(|s| s.ordinal).collect();
        assert_eq!(ordinals, vec![3, 4]);
    }

    #[test]
    fn speed_is_bytes_per_second() {
        let tracker = tracker(4);
        let sample = tracker.record(1, 6 * MIB, Duration::from_secs(2), Instant::now());
        assert!((sample.mib_per_sec() - 3.0).abs() < 1e-9);
        assert_eq!(sample.parallelism, 2);
    }

    #[test]
    fn strategy_updates_tag_later_samples() {
        let tracker = tracker(4);
        tracker.update_strategy(16 * MIB, 5, 4);
        let sample = tracker.record(1, MIB, Duration::from_secs(1), Instant::now());
        assert_eq!(sample.parallelism, 5);
        assert_eq!(tracker.strategy().total_chunks, 4);
    }
}
