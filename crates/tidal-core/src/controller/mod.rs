//! Adaptive transfer controller.
//!
//! One generic control loop drives every connection class; the [`Profile`]
//! supplies the constants. Each tick reads the recent completion samples,
//! tracks a locked peak with a weighted hysteresis band, and adjusts the
//! scheduler's parallelism and chunk size through the shared [`Knobs`].
//!
//! The controller never fails. Everything it decides is reported as a
//! [`ControllerEvent`] and logged.

pub mod hysteresis;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};

use crate::chunk::StoreLimits;
use crate::events::{EventStream, TransferEvent};
use crate::perf_tracker::{PerformanceSample, PerformanceTracker};
use crate::profile::Profile;
use crate::scheduler::{CancelToken, InFlightChunk, InFlightRegistry, Knobs};
use crate::units;

use hysteresis::{next_phase, weighted_average, Band, Phase, StrongSamples};
use state::{ControllerCounters, ControllerState, PeakLock};

/// Consecutive sub-floor ticks that trigger an emergency reset.
pub const EMERGENCY_TICKS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnlockReason {
    /// Dropping for longer than the decay ceiling.
    DecayCeiling,
    /// Throughput fell below the severe-degradation fraction of the peak.
    SevereDegradation,
}

/// A strategy change or health observation made during one tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControllerEvent {
    RampUp {
        from: usize,
        to: usize,
        part_mib_per_sec: f64,
    },
    RampDown {
        from: usize,
        to: usize,
        part_mib_per_sec: f64,
    },
    PeakLocked {
        throughput_mbps: f64,
        parallelism: usize,
    },
    /// A measured peak replaced the profile's assumed one.
    PeakRaised {
        assumed_mbps: f64,
        measured_mbps: f64,
    },
    PhaseChanged {
        from: Phase,
        to: Phase,
        weighted_mbps: f64,
    },
    /// Enough strong samples to suspend ramp decisions.
    PerformanceLocked {
        strong_samples: usize,
    },
    PeakUnlocked {
        reason: UnlockReason,
        throughput_mbps: f64,
        peak_mbps: f64,
    },
    OptimalLowered {
        from: usize,
        to: usize,
    },
    ZombieFlagged {
        part_number: u32,
        attempt: u8,
        age_ms: u64,
        best_case_mib_per_sec: f64,
    },
    StallDetected {
        idle_ms: u64,
        from: usize,
        to: usize,
    },
    EmergencyReset {
        throughput_mbps: f64,
        parallelism: usize,
    },
    FallbackEngaged {
        average_mib_per_sec: f64,
        cap: usize,
    },
    ChunkSizeChanged {
        from: u64,
        to: u64,
    },
}

/// Final controller figures for the session summary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ControllerReport {
    pub parallelism: usize,
    pub chunk_bytes: u64,
    pub peak_mbps: Option<f64>,
    pub fallback_engaged: bool,
    pub counters: ControllerCounters,
}

pub struct AdaptiveController {
    profile: Profile,
    tracker: Arc<PerformanceTracker>,
    knobs: Arc<Knobs>,
    limits: StoreLimits,
    total_bytes: u64,
    state: ControllerState,
}

impl AdaptiveController {
    /// Build a controller and push its starting strategy to the knobs.
    pub fn new(
        profile: Profile,
        tracker: Arc<PerformanceTracker>,
        knobs: Arc<Knobs>,
        limits: StoreLimits,
        total_bytes: u64,
        now: Instant,
    ) -> Self {
        let state = ControllerState::new(&profile, now);
        let controller = Self {
            profile,
            tracker,
            knobs,
            limits,
            total_bytes,
            state,
        };
        controller.publish();
        controller
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn report(&self) -> ControllerReport {
        ControllerReport {
            parallelism: self.state.parallelism,
            chunk_bytes: self.state.chunk_bytes,
            peak_mbps: self.state.peak.map(|peak| peak.initial_mbps),
            fallback_engaged: self.state.fallback_engaged,
            counters: self.state.counters,
        }
    }

    /// Tick on the profile's interval until `stop` fires. Zombie flags are
    /// forwarded to the in-flight registry; every decision becomes a
    /// [`TransferEvent::Strategy`].
    pub async fn run(
        mut self,
        in_flight: Arc<InFlightRegistry>,
        events: Arc<EventStream>,
        stop: CancelToken,
    ) -> ControllerReport {
        let mut interval = tokio::time::interval_at(
            Instant::now() + self.profile.tick_interval,
            self.profile.tick_interval,
        );
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = interval.tick() => {
                    let snapshot = in_flight.snapshot();
                    for event in self.tick(Instant::now(), &snapshot) {
                        if let ControllerEvent::ZombieFlagged { part_number, attempt, .. } = event {
                            in_flight.flag_zombie(part_number, attempt);
                        }
                        events.emit(TransferEvent::Strategy(event));
                    }
                }
            }
        }

        log::debug!(
            "controller stopped after {} ticks ({} ramp-ups, {} ramp-downs)",
            self.state.counters.ticks,
            self.state.counters.ramp_ups,
            self.state.counters.ramp_downs
        );
        self.report()
    }

    /// Run one control step at `now` against the attempts currently in flight.
    pub fn tick(&mut self, now: Instant, in_flight: &[InFlightChunk]) -> Vec<ControllerEvent> {
        let mut events = Vec::new();
        let before = (self.state.parallelism, self.state.chunk_bytes);
        self.state.counters.ticks += 1;

        self.detect_zombies(now, in_flight, &mut events);
        self.watch_progress(now, &mut events);

        let samples = self.tracker.recent_samples(self.profile.sample_window);
        if samples.len() >= self.profile.min_samples {
            self.evaluate(now, &samples, &mut events);
        }

        self.state.parallelism = self
            .state
            .parallelism
            .clamp(self.profile.min_parallel, self.profile.max_cap);
        if (self.state.parallelism, self.state.chunk_bytes) != before {
            self.publish();
        }
        events
    }

    fn evaluate(&mut self, now: Instant, samples: &[PerformanceSample], events: &mut Vec<ControllerEvent>) {
        let part_speeds: Vec<f64> = samples.iter().map(PerformanceSample::mib_per_sec).collect();
        let mean = part_speeds.iter().sum::<f64>() / part_speeds.len() as f64;
        self.state.speed_history.push(mean);
        let smoothed = self.state.speed_history.mean().unwrap_or(mean);
        let throughput = part_speeds.iter().sum::<f64>() * 8.0;
        let parallelism = self.state.parallelism;

        if self.state.best.is_none_or(|(best, _)| throughput > best) {
            self.state.best = Some((throughput, parallelism));
        }

        // A windowed sum understates throughput until the window fills, so an
        // assumed peak is only compared against full windows.
        let window_full = samples.len() >= self.profile.sample_window;
        let comparable = self.state.peak.is_some_and(|peak| !peak.assumed || window_full);

        if comparable {
            self.raise_assumed_peak(now, throughput, events);
        }
        self.detect_peak(now, throughput, samples.len(), events);
        if comparable {
            self.track_phase(now, throughput, events);
        }
        self.guard_thrashing(throughput, events);
        if comparable {
            self.check_severe_degradation(throughput, events);
        }
        if !self.state.locked {
            self.ramp(now, smoothed, events);
        }
        self.check_emergency(now, throughput, events);
        self.apply_fallback(now, events);
    }

    fn raise_assumed_peak(&mut self, now: Instant, throughput: f64, events: &mut Vec<ControllerEvent>) {
        let Some(peak) = self.state.peak.as_mut() else {
            return;
        };
        if !peak.assumed || throughput <= peak.initial_mbps {
            return;
        }
        log::info!(
            "measured {:.1} Mbps beats assumed peak {:.1} Mbps",
            throughput,
            peak.initial_mbps
        );
        events.push(ControllerEvent::PeakRaised {
            assumed_mbps: peak.initial_mbps,
            measured_mbps: throughput,
        });
        *peak = PeakLock {
            initial_mbps: throughput,
            timestamp: now,
            assumed: false,
        };
        self.state.weighted_history.clear();
    }

    fn detect_peak(&mut self, now: Instant, throughput: f64, sample_count: usize, events: &mut Vec<ControllerEvent>) {
        if self.state.peak.is_some()
            || throughput < self.profile.peak_detection_mbps
            || sample_count < self.profile.peak_min_samples
        {
            return;
        }
        let optimal = self
            .state
            .best
            .map_or(self.state.parallelism, |(_, parallel)| parallel);
        self.state.peak = Some(PeakLock {
            initial_mbps: throughput,
            timestamp: now,
            assumed: false,
        });
        self.state.phase = Phase::Stable;
        self.state.strong_samples = 0;
        self.state.optimal_parallel = Some(optimal);
        self.state.counters.peak_locks += 1;
        log::info!(
            "peak locked at {:.1} Mbps with {} parallel (sweet spot {})",
            throughput,
            self.state.parallelism,
            optimal
        );
        events.push(ControllerEvent::PeakLocked {
            throughput_mbps: throughput,
            parallelism: self.state.parallelism,
        });
    }

    fn track_phase(&mut self, now: Instant, throughput: f64, events: &mut Vec<ControllerEvent>) {
        let Some(mut peak) = self.state.peak else {
            return;
        };
        self.state.weighted_history.push(throughput);
        let Some(average) = weighted_average(self.state.weighted_history.values(), self.profile.decay_weights)
        else {
            return;
        };
        let band = Band::for_peak(peak.initial_mbps, &self.profile.hysteresis);
        let (phase, strong) = next_phase(self.state.phase, average, &band);
        if phase != self.state.phase {
            log::info!(
                "phase {} -> {} (weighted {:.1} Mbps, peak {:.1} Mbps)",
                self.state.phase,
                phase,
                average,
                peak.initial_mbps
            );
            events.push(ControllerEvent::PhaseChanged {
                from: self.state.phase,
                to: phase,
                weighted_mbps: average,
            });
            self.state.phase = phase;
        }
        match strong {
            StrongSamples::Increment => self.state.strong_samples += 1,
            StrongSamples::Reset => self.state.strong_samples = 0,
            StrongSamples::Keep => {}
        }

        if average > band.recovery {
            if self.state.strong_samples >= self.profile.reinforce_extend_samples {
                peak.timestamp = now;
                self.state.peak = Some(peak);
            }
            if self.state.strong_samples >= self.profile.reinforcement_sample_count && !self.state.locked {
                self.state.locked = true;
                log::info!(
                    "performance locked after {} strong samples",
                    self.state.strong_samples
                );
                events.push(ControllerEvent::PerformanceLocked {
                    strong_samples: self.state.strong_samples,
                });
            }
        }

        if self.state.phase == Phase::Dropping
            && now.saturating_duration_since(peak.timestamp) > self.profile.decay_ceiling
        {
            log::warn!(
                "throughput stayed below {:.1} Mbps past the {:?} decay ceiling; releasing peak",
                band.drop,
                self.profile.decay_ceiling
            );
            self.unlock(UnlockReason::DecayCeiling, throughput, events);
        }
    }

    fn check_severe_degradation(&mut self, throughput: f64, events: &mut Vec<ControllerEvent>) {
        let Some(peak) = self.state.peak else {
            return;
        };
        if throughput < peak.initial_mbps * self.profile.severe_degradation {
            log::warn!(
                "severe degradation: {:.1} Mbps against peak {:.1} Mbps; releasing lock",
                throughput,
                peak.initial_mbps
            );
            self.unlock(UnlockReason::SevereDegradation, throughput, events);
        }
    }

    fn unlock(&mut self, reason: UnlockReason, throughput: f64, events: &mut Vec<ControllerEvent>) {
        let peak_mbps = self.state.peak.map_or(0.0, |peak| peak.initial_mbps);
        self.state.clear_peak();
        self.state.counters.unlocks += 1;
        events.push(ControllerEvent::PeakUnlocked {
            reason,
            throughput_mbps: throughput,
            peak_mbps,
        });
    }

    fn guard_thrashing(&mut self, throughput: f64, events: &mut Vec<ControllerEvent>) {
        self.state.thrash_history.push(throughput);
        let (Some(_), Some(optimal)) = (self.state.peak, self.state.optimal_parallel) else {
            return;
        };
        if self.state.thrash_history.len() < self.profile.thrash_recent_len
            || self.state.parallelism <= optimal
        {
            return;
        }
        let (Some(recent), Some(max)) = (
            self.state.thrash_history.recent_mean(self.profile.thrash_recent_len),
            self.state.thrash_history.max(),
        ) else {
            return;
        };
        if recent >= max * self.profile.thrash_fraction {
            return;
        }
        let lowered = optimal.saturating_sub(1).max(self.profile.min_parallel);
        if lowered != optimal {
            log::info!(
                "thrashing: recent {:.1} Mbps vs best {:.1} Mbps; sweet spot {} -> {}",
                recent,
                max,
                optimal,
                lowered
            );
            self.state.optimal_parallel = Some(lowered);
            events.push(ControllerEvent::OptimalLowered {
                from: optimal,
                to: lowered,
            });
        }
    }

    fn ramp(&mut self, now: Instant, smoothed: f64, events: &mut Vec<ControllerEvent>) {
        let current = self.state.parallelism;
        let debounced = elapsed(now, self.state.last_adjustment, self.profile.adjustment_debounce);

        if smoothed >= self.profile.ramp_up_speed {
            self.state.low_samples = 0;
            let ceiling = self
                .state
                .optimal_parallel
                .map_or(self.state.cap, |optimal| optimal.min(self.state.cap));
            if current >= ceiling
                || !debounced
                || !elapsed(now, self.state.last_scale_up, self.profile.scale_up_cooldown)
            {
                return;
            }
            let step = if self.state.peak.is_some() {
                self.profile.ramp_up_step
            } else {
                self.profile.ramp_up_step_before_peak
            };
            let next = (current + step).min(ceiling);
            self.state.parallelism = next;
            self.state.last_scale_up = Some(now);
            self.state.last_adjustment = Some(now);
            self.state.counters.ramp_ups += 1;
            log::info!(
                "ramp up {} -> {} (parts at {:.2} MiB/s)",
                current,
                next,
                smoothed
            );
            events.push(ControllerEvent::RampUp {
                from: current,
                to: next,
                part_mib_per_sec: smoothed,
            });
        } else if smoothed <= self.profile.ramp_down_speed {
            self.state.low_samples += 1;
            if self.state.low_samples < self.profile.low_speed_sample_threshold
                || current <= self.profile.min_parallel
                || !debounced
                || !elapsed(now, self.state.last_scale_down, self.profile.scale_down_cooldown)
            {
                return;
            }
            let next = current
                .saturating_sub(self.profile.ramp_down_step)
                .max(self.profile.min_parallel);
            self.state.parallelism = next;
            self.state.low_samples = 0;
            self.state.last_scale_down = Some(now);
            self.state.last_adjustment = Some(now);
            self.state.counters.ramp_downs += 1;
            log::info!(
                "ramp down {} -> {} (parts at {:.2} MiB/s)",
                current,
                next,
                smoothed
            );
            events.push(ControllerEvent::RampDown {
                from: current,
                to: next,
                part_mib_per_sec: smoothed,
            });
        } else {
            self.state.low_samples = 0;
        }
    }

    fn detect_zombies(&mut self, now: Instant, in_flight: &[InFlightChunk], events: &mut Vec<ControllerEvent>) {
        self.state
            .flagged_zombies
            .retain(|key| in_flight.iter().any(|chunk| (chunk.ordinal, chunk.attempt) == *key));

        for chunk in in_flight {
            if chunk.len == 0 {
                continue;
            }
            let age = now.saturating_duration_since(chunk.started_at);
            if age <= self.profile.min_part_timeout {
                continue;
            }
            let best_case = units::mib_per_sec(chunk.len as f64 / age.as_secs_f64());
            if best_case >= self.profile.min_part_speed
                || !self.state.flagged_zombies.insert((chunk.ordinal, chunk.attempt))
            {
                continue;
            }
            self.state.counters.zombie_flags += 1;
            log::warn!(
                "part {} (attempt {}) is a zombie: {:.1}s old, at most {:.3} MiB/s",
                chunk.ordinal,
                chunk.attempt + 1,
                age.as_secs_f64(),
                best_case
            );
            events.push(ControllerEvent::ZombieFlagged {
                part_number: chunk.ordinal,
                attempt: chunk.attempt,
                age_ms: units::millis(age),
                best_case_mib_per_sec: best_case,
            });
        }
    }

    fn watch_progress(&mut self, now: Instant, events: &mut Vec<ControllerEvent>) {
        let completed = self.tracker.total_recorded();
        if completed != self.state.progress_mark {
            self.state.progress_mark = completed;
            self.state.progress_at = now;
            return;
        }
        let idle = now.saturating_duration_since(self.state.progress_at);
        if idle < self.profile.no_progress_timeout {
            return;
        }
        let from = self.state.parallelism;
        if !self.state.locked {
            self.state.parallelism = from
                .saturating_sub(self.profile.ramp_down_step)
                .max(self.profile.min_parallel);
        }
        if self.state.parallelism != from {
            self.state.last_adjustment = Some(now);
        }
        self.state.progress_at = now;
        self.state.counters.stall_events += 1;
        log::warn!(
            "no part completed for {:.0}s; parallelism {} -> {}",
            idle.as_secs_f64(),
            from,
            self.state.parallelism
        );
        events.push(ControllerEvent::StallDetected {
            idle_ms: units::millis(idle),
            from,
            to: self.state.parallelism,
        });
    }

    fn check_emergency(&mut self, now: Instant, throughput: f64, events: &mut Vec<ControllerEvent>) {
        if throughput >= self.profile.emergency_reset_mbps {
            self.state.emergency_ticks = 0;
            return;
        }
        self.state.emergency_ticks += 1;
        if self.state.emergency_ticks < EMERGENCY_TICKS {
            return;
        }

        self.state.clear_peak();
        self.state.speed_history.clear();
        self.state.thrash_history.clear();
        self.state.best = None;
        self.state.low_samples = 0;
        self.state.emergency_ticks = 0;
        self.state.parallelism = self
            .profile
            .default_parallel
            .clamp(self.profile.min_parallel, self.state.cap);
        self.state.last_adjustment = Some(now);
        self.state.counters.emergency_resets += 1;
        log::warn!(
            "emergency reset: {:.1} Mbps below the {:.1} Mbps floor for {} ticks; parallelism -> {}",
            throughput,
            self.profile.emergency_reset_mbps,
            EMERGENCY_TICKS,
            self.state.parallelism
        );
        events.push(ControllerEvent::EmergencyReset {
            throughput_mbps: throughput,
            parallelism: self.state.parallelism,
        });
    }

    fn apply_fallback(&mut self, now: Instant, events: &mut Vec<ControllerEvent>) {
        let policy = &self.profile.fallback;
        let elapsed = now.saturating_duration_since(self.state.started_at);
        if elapsed < policy.grace || elapsed.is_zero() {
            return;
        }
        let average = units::mib_per_sec(self.tracker.total_bytes() as f64 / elapsed.as_secs_f64());
        if average >= policy.expected_mib_per_sec * policy.speed_fraction {
            return;
        }

        if !self.state.fallback_engaged {
            self.state.fallback_engaged = true;
            self.state.cap = self.profile.fallback_cap();
            self.state.parallelism = self.state.parallelism.min(self.state.cap);
            log::warn!(
                "throttled network: {:.2} MiB/s average against {:.2} MiB/s expected; cap -> {}",
                average,
                policy.expected_mib_per_sec,
                self.state.cap
            );
            events.push(ControllerEvent::FallbackEngaged {
                average_mib_per_sec: average,
                cap: self.state.cap,
            });
        }

        let from = self.state.chunk_bytes;
        let to = from
            .saturating_add(policy.chunk_step)
            .min(policy.chunk_ceiling.max(from))
            .clamp(self.limits.min_part_bytes, self.limits.max_part_bytes);
        if to != from {
            self.state.chunk_bytes = to;
            log::info!(
                "fallback chunk size {} -> {}",
                units::format_bytes(from),
                units::format_bytes(to)
            );
            events.push(ControllerEvent::ChunkSizeChanged { from, to });
        }
    }

    fn publish(&self) {
        let chunk_bytes = self.state.chunk_bytes.max(1);
        self.knobs.set_parallelism(self.state.parallelism);
        self.knobs.set_chunk_bytes(chunk_bytes);
        self.tracker.update_strategy(
            chunk_bytes,
            self.state.parallelism,
            self.total_bytes.div_ceil(chunk_bytes).max(1),
        );
    }
}

fn elapsed(now: Instant, since: Option<Instant>, window: Duration) -> bool {
    since.is_none_or(|at| now.saturating_duration_since(at) >= window)
}
