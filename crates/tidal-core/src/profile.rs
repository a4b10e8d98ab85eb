//! Connection-class tuning profiles.
//!
//! Every connection class runs the same adaptive controller; the classes only
//! differ in the numbers below. A profile is picked once per transfer (see
//! [`crate::estimate`]) and never mutated afterwards. The controller keeps its
//! own effective copies of the knobs it adjusts.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use eyre::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::chunk::StoreLimits;
use crate::units::MIB;

/// Estimated class of the uplink, from slowest to fastest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionClass {
    Dsl,
    Cable,
    Fiber,
    Enterprise,
    Gigabit,
    Ultra,
}

impl ConnectionClass {
    pub const ALL: [ConnectionClass; 6] = [
        ConnectionClass::Dsl,
        ConnectionClass::Cable,
        ConnectionClass::Fiber,
        ConnectionClass::Enterprise,
        ConnectionClass::Gigabit,
        ConnectionClass::Ultra,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ConnectionClass::Dsl => "dsl",
            ConnectionClass::Cable => "cable",
            ConnectionClass::Fiber => "fiber",
            ConnectionClass::Enterprise => "enterprise",
            ConnectionClass::Gigabit => "gigabit",
            ConnectionClass::Ultra => "ultra",
        }
    }
}

impl fmt::Display for ConnectionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ConnectionClass {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        let lowered = s.trim().to_ascii_lowercase();
        ConnectionClass::ALL
            .into_iter()
            .find(|class| class.name() == lowered)
            .ok_or_else(|| {
                eyre::eyre!(
                    "unknown connection class '{}' (expected one of dsl, cable, fiber, enterprise, gigabit, ultra)",
                    s
                )
            })
    }
}

/// Throughput fractions of the locked peak that drive the hysteresis phases.
/// Must satisfy `drop < warning < recovery`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hysteresis {
    pub drop: f64,
    pub warning: f64,
    pub recovery: f64,
}

/// One-way response to a link that stays far below its expected speed.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackPolicy {
    /// Speed the class is expected to sustain, MiB/s for the whole transfer.
    pub expected_mib_per_sec: f64,
    /// Fallback engages below `expected * speed_fraction`.
    pub speed_fraction: f64,
    /// No fallback before the session has run this long.
    pub grace: Duration,
    /// Chunk size growth per fallback tick.
    pub chunk_step: u64,
    /// Chunk size never grows past this (before store clamping).
    pub chunk_ceiling: u64,
    /// The parallelism cap shrinks to `max_cap * cap_multiplier`...
    pub cap_multiplier: f64,
    /// ...but never below this (nor below `min_parallel`).
    pub cap_floor: usize,
}

/// Immutable tuning bundle for one connection class.
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub class: ConnectionClass,
    pub description: &'static str,

    // Sizing and admission.
    pub chunk_bytes: u64,
    /// Starting parallelism when the profile ramps gradually.
    pub initial_parallel: usize,
    /// The class's nominal operating point; emergency resets return here.
    pub default_parallel: usize,
    pub min_parallel: usize,
    pub max_cap: usize,
    /// Launch `default_parallel` chunks at once instead of ramping from
    /// `initial_parallel`.
    pub immediate_saturation: bool,
    pub stagger_delay: Duration,
    pub max_retries: u8,

    // Control loop cadence and sampling.
    pub tick_interval: Duration,
    pub sample_window: usize,
    pub min_samples: usize,
    pub peak_min_samples: usize,
    pub speed_history_len: usize,

    // AIMD ramp.
    /// MiB/s per chunk above which parallelism may grow.
    pub ramp_up_speed: f64,
    /// MiB/s per chunk below which a sample counts as slow.
    pub ramp_down_speed: f64,
    pub ramp_up_step: usize,
    /// Step used before any peak has been locked.
    pub ramp_up_step_before_peak: usize,
    pub ramp_down_step: usize,
    pub scale_up_cooldown: Duration,
    pub scale_down_cooldown: Duration,
    pub adjustment_debounce: Duration,
    pub low_speed_sample_threshold: usize,

    // Peak lock and hysteresis.
    pub peak_detection_mbps: f64,
    pub hysteresis: Hysteresis,
    /// Most recent first; renormalised over the samples available.
    pub decay_weights: &'static [f64],
    pub reinforcement_sample_count: usize,
    pub reinforce_extend_samples: usize,
    pub decay_ceiling: Duration,
    pub severe_degradation: f64,
    pub start_locked: bool,
    pub assumed_peak_mbps: f64,

    // Thrashing guard.
    pub thrash_history_len: usize,
    pub thrash_recent_len: usize,
    pub thrash_fraction: f64,

    // Connection health.
    /// MiB/s floor for an in-flight chunk.
    pub min_part_speed: f64,
    pub min_part_timeout: Duration,
    pub no_progress_timeout: Duration,
    pub emergency_reset_mbps: f64,
    pub fallback: FallbackPolicy,
}

const WEIGHTS_SHORT: &[f64] = &[0.5, 0.3, 0.15, 0.05];
const WEIGHTS_STANDARD: &[f64] = &[0.4, 0.3, 0.15, 0.1, 0.05];
const WEIGHTS_LONG: &[f64] = &[0.4, 0.25, 0.15, 0.1, 0.05, 0.05];

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

impl Profile {
    /// Built-in parameters for a connection class.
    pub fn for_class(class: ConnectionClass) -> Profile {
        match class {
            ConnectionClass::Dsl => Profile {
                class,
                description: "Rural, older or throttled links (< 50 Mbps)",
                chunk_bytes: 8 * MIB,
                initial_parallel: 1,
                default_parallel: 2,
                min_parallel: 1,
                max_cap: 2,
                immediate_saturation: true,
                stagger_delay: ms(200),
                max_retries: 4,
                tick_interval: secs(4),
                sample_window: 5,
                min_samples: 2,
                peak_min_samples: 3,
                speed_history_len: 4,
                ramp_up_speed: 1.5,
                ramp_down_speed: 0.8,
                ramp_up_step: 1,
                ramp_up_step_before_peak: 1,
                ramp_down_step: 1,
                scale_up_cooldown: secs(12),
                scale_down_cooldown: secs(20),
                adjustment_debounce: secs(2),
                low_speed_sample_threshold: 3,
                peak_detection_mbps: 30.0,
                hysteresis: Hysteresis {
                    drop: 0.60,
                    warning: 0.65,
                    recovery: 0.70,
                },
                decay_weights: WEIGHTS_SHORT,
                reinforcement_sample_count: 3,
                reinforce_extend_samples: 2,
                decay_ceiling: secs(45),
                severe_degradation: 0.5,
                start_locked: false,
                assumed_peak_mbps: 0.0,
                thrash_history_len: 6,
                thrash_recent_len: 3,
                thrash_fraction: 0.75,
                min_part_speed: 0.15,
                min_part_timeout: secs(25),
                no_progress_timeout: secs(60),
                emergency_reset_mbps: 5.0,
                fallback: FallbackPolicy {
                    expected_mib_per_sec: 3.1,
                    speed_fraction: 0.5,
                    grace: secs(60),
                    chunk_step: MIB,
                    chunk_ceiling: 12 * MIB,
                    cap_multiplier: 0.6,
                    cap_floor: 1,
                },
            },
            ConnectionClass::Cable => Profile {
                class,
                description: "Suburban broadband and basic fiber (50-100 Mbps)",
                chunk_bytes: 20 * MIB,
                initial_parallel: 2,
                default_parallel: 6,
                min_parallel: 2,
                max_cap: 10,
                immediate_saturation: true,
                stagger_delay: ms(100),
                max_retries: 3,
                tick_interval: secs(3),
                sample_window: 6,
                min_samples: 3,
                peak_min_samples: 4,
                speed_history_len: 5,
                ramp_up_speed: 2.0,
                ramp_down_speed: 1.2,
                ramp_up_step: 1,
                ramp_up_step_before_peak: 2,
                ramp_down_step: 2,
                scale_up_cooldown: secs(8),
                scale_down_cooldown: secs(25),
                adjustment_debounce: secs(5),
                low_speed_sample_threshold: 4,
                peak_detection_mbps: 60.0,
                hysteresis: Hysteresis {
                    drop: 0.65,
                    warning: 0.70,
                    recovery: 0.75,
                },
                decay_weights: WEIGHTS_STANDARD,
                reinforcement_sample_count: 4,
                reinforce_extend_samples: 3,
                decay_ceiling: secs(60),
                severe_degradation: 0.6,
                start_locked: false,
                assumed_peak_mbps: 0.0,
                thrash_history_len: 8,
                thrash_recent_len: 4,
                thrash_fraction: 0.8,
                min_part_speed: 0.25,
                min_part_timeout: secs(20),
                no_progress_timeout: secs(50),
                emergency_reset_mbps: 8.0,
                fallback: FallbackPolicy {
                    expected_mib_per_sec: 9.4,
                    speed_fraction: 0.4,
                    grace: secs(30),
                    chunk_step: 3 * MIB,
                    chunk_ceiling: 25 * MIB,
                    cap_multiplier: 0.7,
                    cap_floor: 2,
                },
            },
            ConnectionClass::Fiber => Profile {
                class,
                description: "Modern high-speed residential fiber (100-500 Mbps)",
                chunk_bytes: 75 * MIB,
                initial_parallel: 6,
                default_parallel: 8,
                min_parallel: 6,
                max_cap: 16,
                immediate_saturation: true,
                stagger_delay: ms(50),
                max_retries: 3,
                tick_interval: secs(3),
                sample_window: 8,
                min_samples: 3,
                peak_min_samples: 6,
                speed_history_len: 5,
                ramp_up_speed: 2.7,
                ramp_down_speed: 1.2,
                ramp_up_step: 1,
                ramp_up_step_before_peak: 1,
                ramp_down_step: 2,
                scale_up_cooldown: secs(10),
                scale_down_cooldown: secs(30),
                adjustment_debounce: secs(5),
                low_speed_sample_threshold: 4,
                peak_detection_mbps: 80.0,
                hysteresis: Hysteresis {
                    drop: 0.70,
                    warning: 0.75,
                    recovery: 0.80,
                },
                decay_weights: WEIGHTS_STANDARD,
                reinforcement_sample_count: 4,
                reinforce_extend_samples: 3,
                decay_ceiling: secs(90),
                severe_degradation: 0.6,
                start_locked: false,
                assumed_peak_mbps: 0.0,
                thrash_history_len: 10,
                thrash_recent_len: 5,
                thrash_fraction: 0.85,
                min_part_speed: 0.35,
                min_part_timeout: secs(15),
                no_progress_timeout: secs(40),
                emergency_reset_mbps: 12.0,
                fallback: FallbackPolicy {
                    expected_mib_per_sec: 6.3,
                    speed_fraction: 0.4,
                    grace: secs(30),
                    chunk_step: 5 * MIB,
                    chunk_ceiling: 100 * MIB,
                    cap_multiplier: 0.7,
                    cap_floor: 8,
                },
            },
            ConnectionClass::Enterprise => Profile {
                class,
                description: "Stable business-class links and studios",
                chunk_bytes: 40 * MIB,
                initial_parallel: 4,
                default_parallel: 6,
                min_parallel: 4,
                max_cap: 10,
                immediate_saturation: true,
                stagger_delay: ms(75),
                max_retries: 3,
                tick_interval: ms(2500),
                sample_window: 12,
                min_samples: 4,
                peak_min_samples: 6,
                speed_history_len: 6,
                ramp_up_speed: 4.0,
                ramp_down_speed: 1.2,
                ramp_up_step: 1,
                ramp_up_step_before_peak: 1,
                ramp_down_step: 2,
                scale_up_cooldown: secs(12),
                scale_down_cooldown: secs(45),
                adjustment_debounce: ms(2500),
                low_speed_sample_threshold: 5,
                peak_detection_mbps: 100.0,
                hysteresis: Hysteresis {
                    drop: 0.65,
                    warning: 0.70,
                    recovery: 0.75,
                },
                decay_weights: WEIGHTS_LONG,
                reinforcement_sample_count: 5,
                reinforce_extend_samples: 3,
                decay_ceiling: secs(120),
                severe_degradation: 0.6,
                start_locked: false,
                assumed_peak_mbps: 0.0,
                thrash_history_len: 12,
                thrash_recent_len: 6,
                thrash_fraction: 0.8,
                min_part_speed: 0.5,
                min_part_timeout: secs(20),
                no_progress_timeout: secs(50),
                emergency_reset_mbps: 15.0,
                fallback: FallbackPolicy {
                    expected_mib_per_sec: 6.25,
                    speed_fraction: 0.4,
                    grace: secs(30),
                    chunk_step: 5 * MIB,
                    chunk_ceiling: 50 * MIB,
                    cap_multiplier: 0.8,
                    cap_floor: 6,
                },
            },
            ConnectionClass::Gigabit => Profile {
                class,
                description: "Sustained 800-950 Mbps data-center class links",
                chunk_bytes: 250 * MIB,
                initial_parallel: 14,
                default_parallel: 16,
                min_parallel: 14,
                max_cap: 20,
                immediate_saturation: true,
                stagger_delay: ms(25),
                max_retries: 3,
                tick_interval: ms(250),
                sample_window: 10,
                min_samples: 3,
                peak_min_samples: 3,
                speed_history_len: 5,
                ramp_up_speed: 25.0,
                ramp_down_speed: 15.0,
                ramp_up_step: 2,
                ramp_up_step_before_peak: 2,
                ramp_down_step: 1,
                scale_up_cooldown: ms(500),
                scale_down_cooldown: secs(8),
                adjustment_debounce: secs(2),
                low_speed_sample_threshold: 2,
                peak_detection_mbps: 500.0,
                hysteresis: Hysteresis {
                    drop: 0.75,
                    warning: 0.80,
                    recovery: 0.85,
                },
                decay_weights: WEIGHTS_STANDARD,
                reinforcement_sample_count: 2,
                reinforce_extend_samples: 2,
                decay_ceiling: secs(60),
                severe_degradation: 0.6,
                start_locked: true,
                assumed_peak_mbps: 600.0,
                thrash_history_len: 10,
                thrash_recent_len: 5,
                thrash_fraction: 0.9,
                min_part_speed: 2.0,
                min_part_timeout: secs(20),
                no_progress_timeout: secs(60),
                emergency_reset_mbps: 100.0,
                fallback: FallbackPolicy {
                    expected_mib_per_sec: 100.0,
                    speed_fraction: 0.3,
                    grace: secs(30),
                    chunk_step: 50 * MIB,
                    chunk_ceiling: 400 * MIB,
                    cap_multiplier: 0.8,
                    cap_floor: 12,
                },
            },
            ConnectionClass::Ultra => Profile {
                class,
                description: "Fast links with high latency (120+ Mbps)",
                chunk_bytes: 200 * MIB,
                initial_parallel: 16,
                default_parallel: 18,
                min_parallel: 16,
                max_cap: 24,
                immediate_saturation: true,
                stagger_delay: ms(25),
                max_retries: 3,
                tick_interval: ms(500),
                sample_window: 10,
                min_samples: 3,
                peak_min_samples: 3,
                speed_history_len: 5,
                ramp_up_speed: 8.0,
                ramp_down_speed: 5.0,
                ramp_up_step: 4,
                ramp_up_step_before_peak: 4,
                ramp_down_step: 2,
                scale_up_cooldown: ms(250),
                scale_down_cooldown: secs(5),
                adjustment_debounce: secs(5),
                low_speed_sample_threshold: 3,
                peak_detection_mbps: 100.0,
                hysteresis: Hysteresis {
                    drop: 0.75,
                    warning: 0.80,
                    recovery: 0.85,
                },
                decay_weights: WEIGHTS_STANDARD,
                reinforcement_sample_count: 3,
                reinforce_extend_samples: 3,
                decay_ceiling: secs(120),
                severe_degradation: 0.6,
                start_locked: true,
                assumed_peak_mbps: 120.0,
                thrash_history_len: 10,
                thrash_recent_len: 5,
                thrash_fraction: 0.9,
                min_part_speed: 0.25,
                min_part_timeout: secs(30),
                no_progress_timeout: secs(90),
                emergency_reset_mbps: 30.0,
                fallback: FallbackPolicy {
                    expected_mib_per_sec: 15.0,
                    speed_fraction: 0.3,
                    grace: secs(30),
                    chunk_step: 25 * MIB,
                    chunk_ceiling: 250 * MIB,
                    cap_multiplier: 0.6,
                    cap_floor: 20,
                },
            },
        }
    }

    /// All built-in profiles, slowest class first.
    pub fn catalog() -> Vec<Profile> {
        ConnectionClass::ALL
            .into_iter()
            .map(Profile::for_class)
            .collect()
    }

    /// Parallelism the scheduler should start with.
    pub fn starting_parallel(&self) -> usize {
        if self.immediate_saturation {
            self.default_parallel
        } else {
            self.initial_parallel
        }
    }

    /// Parallelism cap after the throttled-network fallback tightens it.
    pub fn fallback_cap(&self) -> usize {
        let scaled = (self.max_cap as f64 * self.fallback.cap_multiplier).floor() as usize;
        scaled
            .max(self.fallback.cap_floor)
            .max(self.min_parallel)
            .min(self.max_cap)
    }

    /// Apply user overrides and re-validate.
    pub fn with_overrides(&self, overrides: &ProfileOverrides, limits: &StoreLimits) -> Result<Profile> {
        let mut profile = self.clone();
        if let Some(chunk_mib) = overrides.chunk_mib {
            profile.chunk_bytes = chunk_mib.saturating_mul(MIB);
        }
        if let Some(min) = overrides.min_parallel {
            profile.min_parallel = min;
            profile.initial_parallel = profile.initial_parallel.max(min);
        }
        if let Some(cap) = overrides.max_cap {
            profile.max_cap = cap;
        }
        if let Some(parallel) = overrides.parallel {
            profile.default_parallel = parallel;
        }
        if let Some(retries) = overrides.max_retries {
            profile.max_retries = retries;
        }
        if let Some(tick_ms) = overrides.tick_ms {
            profile.tick_interval = Duration::from_millis(tick_ms);
        }
        profile.initial_parallel = profile
            .initial_parallel
            .clamp(profile.min_parallel, profile.max_cap.max(profile.min_parallel));
        profile.validate(limits)?;
        Ok(profile)
    }

    /// Check the structural invariants every profile must hold.
    pub fn validate(&self, limits: &StoreLimits) -> Result<()> {
        if self.min_parallel == 0 {
            bail!("{}: min_parallel must be at least 1", self.class);
        }
        if self.min_parallel > self.max_cap {
            bail!(
                "{}: min_parallel ({}) exceeds max_cap ({})",
                self.class,
                self.min_parallel,
                self.max_cap
            );
        }
        for (label, value) in [
            ("parallel", self.default_parallel),
            ("initial_parallel", self.initial_parallel),
        ] {
            if value < self.min_parallel || value > self.max_cap {
                bail!(
                    "{}: {} ({}) must lie within [{}, {}]",
                    self.class,
                    label,
                    value,
                    self.min_parallel,
                    self.max_cap
                );
            }
        }
        if self.chunk_bytes < limits.min_part_bytes || self.chunk_bytes > limits.max_part_bytes {
            bail!(
                "{}: chunk size {} bytes outside store limits [{}, {}]",
                self.class,
                self.chunk_bytes,
                limits.min_part_bytes,
                limits.max_part_bytes
            );
        }
        let h = self.hysteresis;
        if !(h.drop < h.warning && h.warning < h.recovery) {
            bail!("{}: hysteresis must satisfy drop < warning < recovery", self.class);
        }
        if self.decay_weights.is_empty() {
            bail!("{}: decay weight schedule is empty", self.class);
        }
        if self.tick_interval.is_zero() {
            bail!("{}: tick interval must be positive", self.class);
        }
        if self.sample_window == 0 || self.min_samples == 0 {
            bail!("{}: sample window and minimum sample count must be positive", self.class);
        }
        if self.min_samples > self.sample_window || self.peak_min_samples > self.sample_window {
            bail!(
                "{}: sample thresholds ({} / {}) exceed the sample window ({})",
                self.class,
                self.min_samples,
                self.peak_min_samples,
                self.sample_window
            );
        }
        Ok(())
    }
}

/// Partial profile changes loaded from the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProfileOverrides {
    pub chunk_mib: Option<u64>,
    pub parallel: Option<usize>,
    pub min_parallel: Option<usize>,
    pub max_cap: Option<usize>,
    pub max_retries: Option<u8>,
    pub tick_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_profiles_are_valid() {
        let limits = StoreLimits::default();
        for profile in Profile::catalog() {
            profile.validate(&limits).expect("built-in profile");
            assert!(profile.fallback_cap() >= profile.min_parallel);
            assert!(profile.fallback_cap() <= profile.max_cap);
            assert!(profile.fallback.chunk_ceiling >= profile.chunk_bytes);
        }
    }

    #[test]
    fn hysteresis_fractions_follow_tiers() {
        let dsl = Profile::for_class(ConnectionClass::Dsl);
        let gigabit = Profile::for_class(ConnectionClass::Gigabit);
        assert!(dsl.hysteresis.drop < gigabit.hysteresis.drop);
        assert!(gigabit.hysteresis.recovery <= 0.85);
    }

    #[test]
    fn only_fast_tiers_start_locked() {
        let locked: Vec<_> = Profile::catalog()
            .into_iter()
            .filter(|p| p.start_locked)
            .map(|p| p.class)
            .collect();
        assert_eq!(locked, vec![ConnectionClass::Gigabit, ConnectionClass::Ultra]);
    }

    #[test]
    fn parses_class_names() {
        assert_eq!("Fiber".parse::<ConnectionClass>().unwrap(), ConnectionClass::Fiber);
        assert!("satellite".parse::<ConnectionClass>().is_err());
    }

    #[test]
    fn overrides_are_validated() {
        let limits = StoreLimits::default();
        let base = Profile::for_class(ConnectionClass::Cable);

        let tuned = base
            .with_overrides(
                &ProfileOverrides {
                    chunk_mib: Some(32),
                    parallel: Some(8),
                    ..Default::default()
                },
                &limits,
            )
            .expect("valid override");
        assert_eq!(tuned.chunk_bytes, 32 * MIB);
        assert_eq!(tuned.default_parallel, 8);

        let too_small = base.with_overrides(
            &ProfileOverrides {
                chunk_mib: Some(1),
                ..Default::default()
            },
            &limits,
        );
        assert!(too_small.is_err());

        let inverted = base.with_overrides(
            &ProfileOverrides {
                min_parallel: Some(12),
                ..Default::default()
            },
            &limits,
        );
        assert!(inverted.is_err());
    }

    #[test]
    fn fallback_cap_respects_floor_and_minimum() {
        let ultra = Profile::for_class(ConnectionClass::Ultra);
        // 24 * 0.6 = 14.4, floored at 20
        assert_eq!(ultra.fallback_cap(), 20);
        let gigabit = Profile::for_class(ConnectionClass::Gigabit);
        // 20 * 0.8 = 16, above both floor (12) and minimum (14)
        assert_eq!(gigabit.fallback_cap(), 16);
    }
}
