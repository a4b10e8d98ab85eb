use crate::cli::{OutputArgs, SimulateArgs, UploadArgs};
use crate::context::AppContext;
use chrono::{Local, NaiveDateTime};
use eyre::{bail, Result, WrapErr};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tidal_core::controller::ControllerEvent;
use tidal_core::estimate::{ConnectionEstimate, ConnectionEstimator, HistoryEstimator, StaticEstimator};
use tidal_core::events::TransferEvent;
use tidal_core::profile::ConnectionClass;
use tidal_core::store::memory::Fault;
use tidal_core::store::{FilePartSource, MemoryStore, PresignedStore, SimulatedLink, SyntheticSource};
use tidal_core::units::{format_bytes, MIB};
use tidal_core::{start_transfer, SessionHandle, TransferSummary};

/// Assumed round trip when the endpoint cannot be pinged.
const FALLBACK_LATENCY_MS: f64 = 50.0;
/// Crawl speed for `--stall-part`; slow enough to trip every zombie check.
const STALL_MIB_PER_SEC: f64 = 0.005;

pub async fn run_upload(ctx: &AppContext, args: &UploadArgs) -> Result<()> {
    let endpoint = match args.endpoint.as_deref().or(ctx.config.endpoint.as_deref()) {
        Some(endpoint) => endpoint.to_string(),
        None => bail!("no signing endpoint configured; pass --endpoint or set `endpoint` in config.toml"),
    };
    let mut config = ctx.config.clone();
    if let Some(content_type) = &args.content_type {
        config.content_type = Some(content_type.clone());
    }
    config.history.enabled = ctx.perf_history_enabled;

    let source = FilePartSource::open(&args.file)
        .await
        .wrap_err_with(|| format!("cannot upload {}", args.file.display()))?;
    let store = PresignedStore::new(&endpoint, config.content_type())?;
    let hint = parse_class(args.profile.as_deref())?;

    let estimator: Option<Box<dyn ConnectionEstimator>> = if hint.is_some() {
        None
    } else {
        let latency_ms = match args.latency_ms {
            Some(latency) => latency,
            None => match store.ping().await {
                Ok(rtt) => rtt.as_secs_f64() * 1000.0,
                Err(err) => {
                    log::warn!("could not reach {} to measure latency: {}", endpoint, err);
                    FALLBACK_LATENCY_MS
                }
            },
        };
        match args.bandwidth_mbps {
            Some(mbps) => {
                let estimate = ConnectionEstimate::new(mbps, latency_ms);
                Some(Box::new(StaticEstimator(estimate)) as Box<dyn ConnectionEstimator>)
            }
            None if ctx.perf_history_enabled => {
                Some(Box::new(HistoryEstimator::new(latency_ms)) as Box<dyn ConnectionEstimator>)
            }
            None => None,
        }
    };

    let key = match &args.key {
        Some(key) => key.clone(),
        None => default_key(&args.file, Local::now().naive_local()),
    };
    let handle = start_transfer(
        Arc::new(store),
        Arc::new(source),
        key,
        hint,
        estimator.as_deref(),
        &config,
    )
    .await?;
    drive(handle, &args.output).await
}

pub async fn run_simulate(ctx: &AppContext, args: &SimulateArgs) -> Result<()> {
    if args.link_mbps <= 0.0 {
        bail!("--link-mbps must be positive");
    }
    let mut link = SimulatedLink::new(args.link_mbps);
    if let Some(limit) = args.per_stream_mib {
        link = link.with_per_stream_limit(limit);
    }
    let store = MemoryStore::new()
        .with_link(Arc::new(link))
        .with_request_latency(Duration::from_millis(args.latency_ms));
    for part in &args.fail_part {
        store.inject(*part, Fault::Transient);
    }
    for part in &args.stall_part {
        store.inject(
            *part,
            Fault::Stall {
                mib_per_sec: STALL_MIB_PER_SEC,
            },
        );
    }

    // Simulated runs stay out of the history the estimator learns from.
    let mut config = ctx.config.clone();
    config.history.enabled = false;

    let hint = parse_class(args.profile.as_deref())?;
    let estimator = StaticEstimator(ConnectionEstimate::new(args.link_mbps, args.latency_ms as f64));
    let handle = start_transfer(
        Arc::new(store),
        Arc::new(SyntheticSource::new(args.size_mib.saturating_mul(MIB))),
        format!("simulated-{}MiB.bin", args.size_mib),
        hint,
        Some(&estimator),
        &config,
    )
    .await?;
    drive(handle, &args.output).await
}

fn parse_class(name: Option<&str>) -> Result<Option<ConnectionClass>> {
    name.map(str::parse::<ConnectionClass>).transpose()
}

/// Follow the session's events until it finishes, cancelling it on Ctrl-C.
async fn drive(handle: SessionHandle, output: &OutputArgs) -> Result<()> {
    let cancel = handle.cancel_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted; aborting upload...");
            cancel.cancel();
        }
    });

    let mut progress: Option<ProgressBar> = None;
    let mut events = handle.subscribe();
    while let Some(event) = events.next().await {
        if output.events_json {
            println!("{}", serde_json::to_string(&event)?);
        }
        match &event {
            TransferEvent::Started { size_bytes, .. } if output.progress => {
                progress = Some(progress_bar(*size_bytes)?);
            }
            TransferEvent::PartCompleted { uploaded_bytes, .. } => {
                if let Some(pb) = &progress {
                    pb.set_position(*uploaded_bytes);
                }
            }
            TransferEvent::Strategy(decision) => {
                if let Some(pb) = &progress {
                    pb.set_message(describe(decision));
                }
            }
            _ => {}
        }
        if event.is_terminal() {
            break;
        }
    }
    if let Some(pb) = progress {
        pb.finish_and_clear();
    }
    interrupt.abort();

    let summary = handle.wait().await.wrap_err("upload failed")?;
    if !output.events_json {
        print_summary(&summary);
    }
    Ok(())
}

fn progress_bar(total: u64) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner} [{elapsed_precise}] {wide_bar} {bytes}/{total_bytes} ({bytes_per_sec}) {msg}",
        )?
        .progress_chars("=> "),
    );
    pb.enable_steady_tick(Duration::from_millis(120));
    Ok(pb)
}

/// One-line progress message for a controller decision.
fn describe(event: &ControllerEvent) -> String {
    match event {
        ControllerEvent::RampUp { from, to, .. } => format!("ramping up {} -> {}", from, to),
        ControllerEvent::RampDown { from, to, .. } => format!("backing off {} -> {}", from, to),
        ControllerEvent::PeakLocked { throughput_mbps, .. } => {
            format!("peak locked at {:.0} Mbps", throughput_mbps)
        }
        ControllerEvent::PeakRaised { measured_mbps, .. } => {
            format!("peak raised to {:.0} Mbps", measured_mbps)
        }
        ControllerEvent::PhaseChanged { to, .. } => format!("throughput {}", to),
        ControllerEvent::PerformanceLocked { .. } => "performance locked".to_string(),
        ControllerEvent::PeakUnlocked { reason, .. } => format!("peak released ({:?})", reason),
        ControllerEvent::OptimalLowered { to, .. } => format!("sweet spot lowered to {}", to),
        ControllerEvent::ZombieFlagged { part_number, .. } => {
            format!("restarting stalled part {}", part_number)
        }
        ControllerEvent::StallDetected { idle_ms, .. } => {
            format!("no progress for {}s", idle_ms / 1000)
        }
        ControllerEvent::EmergencyReset { parallelism, .. } => {
            format!("emergency reset to {} parallel", parallelism)
        }
        ControllerEvent::FallbackEngaged { cap, .. } => format!("throttled network, cap {}", cap),
        ControllerEvent::ChunkSizeChanged { to, .. } => format!("parts now {}", format_bytes(*to)),
    }
}

fn print_summary(summary: &TransferSummary) {
    println!(
        "Upload complete: {} ({} in {} part(s)) in {:.2?}",
        summary.key,
        format_bytes(summary.bytes),
        summary.parts,
        summary.elapsed
    );
    println!(
        "• Throughput: {:.1} Mbps | Profile: {} | Final parallelism: {} | Part size: {}",
        summary.average_mbps,
        summary.profile,
        summary.controller.parallelism,
        format_bytes(summary.controller.chunk_bytes)
    );
    if let Some(peak) = summary.controller.peak_mbps {
        println!("• Peak locked at {:.1} Mbps", peak);
    }
    if summary.retries > 0 || summary.zombie_cancellations > 0 {
        println!(
            "• Retries: {} | Stalled parts restarted: {}",
            summary.retries, summary.zombie_cancellations
        );
    }
    if let Some(location) = &summary.location {
        println!("• Location: {}", location);
    }
}

/// `name.ext` becomes `name_YYYYMMDD_HHMMSS.ext`.
fn default_key(path: &Path, at: NaiveDateTime) -> String {
    let stamp = at.format("%Y%m%d_%H%M%S");
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());
    match path.extension() {
        Some(ext) => format!("{}_{}.{}", stem, stamp, ext.to_string_lossy()),
        None => format!("{}_{}", stem, stamp),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::path::PathBuf;

    fn at() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(14, 5, 7)
            .unwrap()
    }

    #[test]
    fn default_key_keeps_extension() {
        let key = default_key(&PathBuf::from("/tmp/footage/clip.final.mov"), at());
        assert_eq!(key, "clip.final_20240309_140507.mov");
    }

    #[test]
    fn default_key_without_extension() {
        assert_eq!(default_key(Path::new("README"), at()), "README_20240309_140507");
    }

    #[test]
    fn parses_profile_names() {
        assert_eq!(parse_class(Some("Gigabit")).unwrap(), Some(ConnectionClass::Gigabit));
        assert_eq!(parse_class(None).unwrap(), None);
        assert!(parse_class(Some("satellite")).is_err());
    }

    #[test]
    fn describes_strategy_changes() {
        let text = describe(&ControllerEvent::ChunkSizeChanged {
            from: 20 * MIB,
            to: 25 * MIB,
        });
        assert_eq!(text, "parts now 25.0 MiB");
        let text = describe(&ControllerEvent::RampUp {
            from: 6,
            to: 8,
            part_mib_per_sec: 3.0,
        });
        assert_eq!(text, "ramping up 6 -> 8");
    }
}
