//! Weighted throughput tracking and the drop/warning/recovery band.

use std::collections::VecDeque;
use std::fmt;

use serde::Serialize;

use crate::profile::Hysteresis;

/// Hysteresis phase relative to the locked peak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Stable,
    Warning,
    Dropping,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Stable => "stable",
            Phase::Warning => "warning",
            Phase::Dropping => "dropping",
        })
    }
}

/// Absolute thresholds (Mbps) for one locked peak.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Band {
    pub drop: f64,
    pub warning: f64,
    pub recovery: f64,
}

impl Band {
    pub fn for_peak(peak_mbps: f64, fractions: &Hysteresis) -> Self {
        Self {
            drop: peak_mbps * fractions.drop,
            warning: peak_mbps * fractions.warning,
            recovery: peak_mbps * fractions.recovery,
        }
    }
}

/// What a phase evaluation does to the strong-sample counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrongSamples {
    Increment,
    Reset,
    Keep,
}

/// Weighted mean of `history` (oldest first). The newest value takes
/// `weights[0]`; weights are renormalised over the values present.
pub fn weighted_average(history: &VecDeque<f64>, weights: &[f64]) -> Option<f64> {
    let mut weighted = 0.0;
    let mut total = 0.0;
    for (value, weight) in history.iter().rev().zip(weights) {
        weighted += value * weight;
        total += weight;
    }
    (total > 0.0).then(|| weighted / total)
}

/// Advance the phase for a new weighted average.
///
/// Below `drop` always means dropping; above `recovery` always means stable.
/// Dipping under `warning` only demotes a stable phase, so a dropping phase
/// stays dropping until throughput recovers past the recovery line.
pub fn next_phase(current: Phase, average: f64, band: &Band) -> (Phase, StrongSamples) {
    if average < band.drop {
        (Phase::Dropping, StrongSamples::Keep)
    } else if average > band.recovery {
        (Phase::Stable, StrongSamples::Increment)
    } else if average < band.warning && current == Phase::Stable {
        (Phase::Warning, StrongSamples::Reset)
    } else {
        (current, StrongSamples::Keep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WEIGHTS: &[f64] = &[0.4, 0.3, 0.15, 0.1, 0.05];

    fn band() -> Band {
        Band::for_peak(
            100.0,
            &Hysteresis {
                drop: 0.70,
                warning: 0.75,
                recovery: 0.80,
            },
        )
    }

    #[test]
    fn newest_value_weighs_most() {
        let history: VecDeque<f64> = [0.0, 100.0].into_iter().collect();
        // 100 * 0.4 + 0 * 0.3, renormalised over 0.7
        let avg = weighted_average(&history, WEIGHTS).unwrap();
        assert!((avg - 40.0 / 0.7).abs() < 1e-9);
    }

    #[test]
    fn single_value_is_its_own_average() {
        let history: VecDeque<f64> = [42.0].into_iter().collect();
        assert_eq!(weighted_average(&history, WEIGHTS), Some(42.0));
        assert_eq!(weighted_average(&VecDeque::new(), WEIGHTS), None);
    }

    #[test]
    fn phase_transitions_follow_band() {
        let band = band();
        assert_eq!(next_phase(Phase::Stable, 90.0, &band), (Phase::Stable, StrongSamples::Increment));
        assert_eq!(next_phase(Phase::Stable, 72.0, &band), (Phase::Warning, StrongSamples::Reset));
        assert_eq!(next_phase(Phase::Warning, 72.0, &band), (Phase::Warning, StrongSamples::Keep));
        assert_eq!(next_phase(Phase::Warning, 60.0, &band), (Phase::Dropping, StrongSamples::Keep));
        // Between warning and recovery does not leave dropping.
        assert_eq!(next_phase(Phase::Dropping, 77.0, &band), (Phase::Dropping, StrongSamples::Keep));
        assert_eq!(next_phase(Phase::Dropping, 85.0, &band), (Phase::Stable, StrongSamples::Increment));
    }

    #[test]
    fn stable_between_warning_and_recovery_holds() {
        let band = band();
        assert_eq!(next_phase(Phase::Stable, 78.0, &band), (Phase::Stable, StrongSamples::Keep));
    }
}
