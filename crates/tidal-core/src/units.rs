//! Byte and bit-rate conversions shared by the profile tables and the controller.
//!
//! Throughput figures follow the convention used by the profile tables:
//! one "Mbps" is one MiB/s multiplied by eight.

use std::time::Duration;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Convert a bytes-per-second rate into MiB/s.
pub fn mib_per_sec(bytes_per_sec: f64) -> f64 {
    bytes_per_sec / MIB as f64
}

/// Convert a bytes-per-second rate into Mbps.
pub fn mbps(bytes_per_sec: f64) -> f64 {
    mib_per_sec(bytes_per_sec) * 8.0
}

/// Convert MiB/s into bytes per second.
pub fn bytes_per_sec_from_mib(mib_per_sec: f64) -> f64 {
    mib_per_sec * MIB as f64
}

/// Convert Mbps into bytes per second.
pub fn bytes_per_sec_from_mbps(mbps: f64) -> f64 {
    bytes_per_sec_from_mib(mbps / 8.0)
}

/// Whole milliseconds, saturating at `u64::MAX`.
pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Human-readable byte count (binary units).
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mbps_matches_mib_times_eight() {
        let rate = bytes_per_sec_from_mib(6.0);
        assert!((mbps(rate) - 48.0).abs() < 1e-9);
        assert!((bytes_per_sec_from_mbps(48.0) - rate).abs() < 1e-6);
    }

    #[test]
    fn millis_saturates() {
        assert_eq!(millis(Duration::from_millis(1_500)), 1_500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn formats_binary_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(50 * MIB), "50.0 MiB");
        assert_eq!(format_bytes(GIB + GIB / 2), "1.5 GiB");
    }
}
