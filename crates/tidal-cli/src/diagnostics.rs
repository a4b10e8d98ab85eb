use crate::cli::PerfArgs;
use crate::context::AppContext;
use chrono::{DateTime, Utc};
use eyre::Result;
use std::time::{Duration, UNIX_EPOCH};
use tidal_core::perf_history::{self, TransferOutcome, TransferRecord};
use tidal_core::units::format_bytes;

pub fn run_diagnostics_perf(ctx: &AppContext, args: &PerfArgs) -> Result<()> {
    if args.clear {
        match perf_history::clear_history()? {
            true => println!("Cleared transfer history log."),
            false => println!("No transfer history log to clear."),
        }
    }

    let history_path = perf_history::history_path()?;
    let records = perf_history::read_recent_records(args.limit)?;

    println!(
        "Transfer history (showing up to {} entries): {}",
        args.limit,
        records.len()
    );
    println!("History file: {}", history_path.display());
    println!(
        "Status: {}",
        if ctx.perf_history_enabled {
            if records.is_empty() {
                "enabled (no entries yet)"
            } else {
                "enabled"
            }
        } else if perf_history::perf_history_disabled() {
            "disabled via TIDAL_DISABLE_PERF_HISTORY"
        } else {
            "disabled in config.toml"
        }
    );

    if records.is_empty() {
        return Ok(());
    }

    let stats = HistoryStats::from_records(&records);
    println!(
        "Completed: {} | failed: {} | cancelled: {}",
        stats.completed, stats.failed, stats.cancelled
    );
    if let Some(avg) = stats.average_mbps {
        println!("Average throughput of completed uploads: {:.1} Mbps", avg);
    }
    println!(
        "Health events: {} zombie part(s), {} stall(s), {} emergency reset(s), {} fallback run(s)",
        stats.zombie_flags, stats.stall_events, stats.emergency_resets, stats.fallback_runs
    );

    if let Some(last) = records.last() {
        let millis = last.timestamp_epoch_ms.min(u64::MAX as u128) as u64;
        let timestamp = DateTime::<Utc>::from(UNIX_EPOCH + Duration::from_millis(millis));

        println!("Most recent run:");
        println!(
            "  Timestamp : {}",
            timestamp.format("%Y-%m-%d %H:%M:%S UTC")
        );
        println!("  Outcome   : {}", outcome_label(last.outcome));
        println!("  Profile   : {}", last.profile);
        println!(
            "  Size      : {} in {} part(s), {} ms",
            format_bytes(last.total_bytes),
            last.parts,
            last.duration_ms
        );
        println!(
            "  Strategy  : {} parallel, {} parts{}",
            last.final_parallelism,
            format_bytes(last.final_chunk_bytes),
            if last.fallback_engaged { ", fallback engaged" } else { "" }
        );
        match last.peak_mbps {
            Some(peak) => println!(
                "  Throughput: {:.1} Mbps average, peak {:.1} Mbps",
                last.average_mbps, peak
            ),
            None => println!("  Throughput: {:.1} Mbps average", last.average_mbps),
        }
    }

    Ok(())
}

fn outcome_label(outcome: TransferOutcome) -> &'static str {
    match outcome {
        TransferOutcome::Completed => "completed",
        TransferOutcome::Failed => "failed",
        TransferOutcome::Cancelled => "cancelled",
    }
}

#[derive(Debug, Default, PartialEq)]
struct HistoryStats {
    completed: usize,
    failed: usize,
    cancelled: usize,
    average_mbps: Option<f64>,
    zombie_flags: u32,
    stall_events: u32,
    emergency_resets: u32,
    fallback_runs: usize,
}

impl HistoryStats {
    fn from_records(records: &[TransferRecord]) -> Self {
        let mut stats = HistoryStats::default();
        let mut mbps_total = 0.0;
        for record in records {
            match record.outcome {
                TransferOutcome::Completed => {
                    stats.completed += 1;
                    mbps_total += record.average_mbps;
                }
                TransferOutcome::Failed => stats.failed += 1,
                TransferOutcome::Cancelled => stats.cancelled += 1,
            }
            stats.zombie_flags += record.zombie_flags;
            stats.stall_events += record.stall_events;
            stats.emergency_resets += record.emergency_resets;
            if record.fallback_engaged {
                stats.fallback_runs += 1;
            }
        }
        if stats.completed > 0 {
            stats.average_mbps = Some(mbps_total / stats.completed as f64);
        }
        stats
    }
}
