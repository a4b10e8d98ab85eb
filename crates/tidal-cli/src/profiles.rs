use crate::context::AppContext;
use eyre::Result;
use tidal_core::chunk::StoreLimits;
use tidal_core::profile::{ConnectionClass, Profile};
use tidal_core::units::format_bytes;

pub fn run_profiles(ctx: &AppContext) -> Result<()> {
    let limits = StoreLimits::default();
    let default_class = ctx.config.default_profile.unwrap_or(ConnectionClass::Cable);
    for class in ConnectionClass::ALL {
        let profile = ctx.config.profile(class, &limits)?;
        let marker = if class == default_class { " (default)" } else { "" };
        println!("{}{}: {}", class, marker, profile.description);
        for line in describe(&profile) {
            println!("  {}", line);
        }
        if ctx.config.profiles.contains_key(&class) {
            println!("  overrides from config.toml applied");
        }
    }
    Ok(())
}

fn describe(profile: &Profile) -> Vec<String> {
    let start = if profile.start_locked {
        format!("locked at an assumed {:.0} Mbps", profile.assumed_peak_mbps)
    } else if profile.immediate_saturation {
        "immediate saturation".to_string()
    } else {
        format!(
            "gradual from {} ({:?} stagger)",
            profile.initial_parallel, profile.stagger_delay
        )
    };
    vec![
        format!(
            "Parts     : {} | parallel {} (min {}, cap {}) | {}",
            format_bytes(profile.chunk_bytes),
            profile.default_parallel,
            profile.min_parallel,
            profile.max_cap,
            start
        ),
        format!(
            "Ramp      : up >= {:.1} MiB/s, down <= {:.1} MiB/s per part | tick {:?}",
            profile.ramp_up_speed, profile.ramp_down_speed, profile.tick_interval
        ),
        format!(
            "Peak      : lock >= {:.0} Mbps | drop/warn/recover {:.0}%/{:.0}%/{:.0}%",
            profile.peak_detection_mbps,
            profile.hysteresis.drop * 100.0,
            profile.hysteresis.warning * 100.0,
            profile.hysteresis.recovery * 100.0
        ),
        format!(
            "Health    : zombie < {:.2} MiB/s after {:?} | stall {:?} | emergency < {:.0} Mbps",
            profile.min_part_speed,
            profile.min_part_timeout,
            profile.no_progress_timeout,
            profile.emergency_reset_mbps
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describes_locked_and_gradual_starts() {
        let gigabit = describe(&Profile::for_class(ConnectionClass::Gigabit));
        assert!(gigabit[0].contains("locked at an assumed 600 Mbps"));

        let mut fiber = Profile::for_class(ConnectionClass::Fiber);
        fiber.immediate_saturation = false;
        assert!(describe(&fiber)[0].contains("gradual from"));
    }
}
