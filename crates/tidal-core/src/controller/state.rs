//! Mutable controller state. Owned by a single [`AdaptiveController`] and
//! only touched from its tick.
//!
//! [`AdaptiveController`]: super::AdaptiveController

use std::collections::{HashSet, VecDeque};

use serde::Serialize;
use tokio::time::Instant;

use super::hysteresis::Phase;
use crate::profile::Profile;

/// A locked operating point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakLock {
    /// Throughput at lock time, Mbps.
    pub initial_mbps: f64,
    /// Start of the current protection period; reinforcement pushes it forward.
    pub timestamp: Instant,
    /// Assumed by the profile rather than measured.
    pub assumed: bool,
}

/// Running totals reported when the session ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ControllerCounters {
    pub ticks: u64,
    pub ramp_ups: u32,
    pub ramp_downs: u32,
    pub peak_locks: u32,
    pub unlocks: u32,
    pub zombie_flags: u32,
    pub stall_events: u32,
    pub emergency_resets: u32,
}

/// Bounded history that drops its oldest value when full.
#[derive(Debug, Clone)]
pub struct Window {
    values: VecDeque<f64>,
    limit: usize,
}

impl Window {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            values: VecDeque::with_capacity(limit),
            limit,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.values.len() == self.limit {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        Some(self.values.iter().sum::<f64>() / self.values.len() as f64)
    }

    /// Mean of the newest `n` values.
    pub fn recent_mean(&self, n: usize) -> Option<f64> {
        let n = n.min(self.values.len());
        if n == 0 {
            return None;
        }
        Some(self.values.iter().rev().take(n).sum::<f64>() / n as f64)
    }

    pub fn max(&self) -> Option<f64> {
        self.values.iter().copied().reduce(f64::max)
    }

    pub fn values(&self) -> &VecDeque<f64> {
        &self.values
    }
}

#[derive(Debug, Clone)]
pub struct ControllerState {
    pub phase: Phase,
    /// Ramp decisions are suspended while set.
    pub locked: bool,
    pub peak: Option<PeakLock>,
    /// Sweet spot while a peak is held; ramp-up stops here.
    pub optimal_parallel: Option<usize>,
    /// Best throughput seen so far (Mbps) and the parallelism that produced it.
    pub best: Option<(f64, usize)>,

    /// Mean per-chunk speed per tick, MiB/s.
    pub speed_history: Window,
    /// Throughput per tick for the weighted hysteresis average, Mbps.
    pub weighted_history: Window,
    /// Throughput per tick for the thrashing guard, Mbps.
    pub thrash_history: Window,

    pub strong_samples: usize,
    pub low_samples: usize,
    pub emergency_ticks: u32,

    pub last_scale_up: Option<Instant>,
    pub last_scale_down: Option<Instant>,
    pub last_adjustment: Option<Instant>,

    /// Completions seen at `progress_at`, for the stall watchdog.
    pub progress_mark: u64,
    pub progress_at: Instant,

    /// (ordinal, attempt) pairs already reported as zombies.
    pub flagged_zombies: HashSet<(u32, u8)>,

    pub parallelism: usize,
    pub chunk_bytes: u64,
    /// Effective ceiling; the fallback may lower it below the profile cap.
    pub cap: usize,
    pub fallback_engaged: bool,

    pub started_at: Instant,
    pub counters: ControllerCounters,
}

impl ControllerState {
    /// Initial conditions for `profile` at `now`.
    pub fn new(profile: &Profile, now: Instant) -> Self {
        let parallelism = profile
            .starting_parallel()
            .clamp(profile.min_parallel, profile.max_cap);
        let peak = profile.start_locked.then_some(PeakLock {
            initial_mbps: profile.assumed_peak_mbps,
            timestamp: now,
            assumed: true,
        });
        Self {
            phase: Phase::Stable,
            locked: profile.start_locked,
            peak,
            optimal_parallel: profile.start_locked.then_some(parallelism),
            best: None,
            speed_history: Window::new(profile.speed_history_len),
            weighted_history: Window::new(profile.decay_weights.len()),
            thrash_history: Window::new(profile.thrash_history_len),
            strong_samples: 0,
            low_samples: 0,
            emergency_ticks: 0,
            last_scale_up: None,
            last_scale_down: None,
            last_adjustment: None,
            progress_mark: 0,
            progress_at: now,
            flagged_zombies: HashSet::new(),
            parallelism,
            chunk_bytes: profile.chunk_bytes,
            cap: profile.max_cap,
            fallback_engaged: false,
            started_at: now,
            counters: ControllerCounters::default(),
        }
    }

    /// Forget the peak and everything learned about it.
    pub fn clear_peak(&mut self) {
        self.peak = None;
        self.locked = false;
        self.optimal_parallel = None;
        self.phase = Phase::Stable;
        self.strong_samples = 0;
        self.weighted_history.clear();
    }

    /// Phase label including the orthogonal lock flag.
    pub fn phase_label(&self) -> &'static str {
        if self.locked {
            "locked"
        } else {
            match self.phase {
                Phase::Stable => "stable",
                Phase::Warning => "warning",
                Phase::Dropping => "dropping",
            }
        }
    }
}
