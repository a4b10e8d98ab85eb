//! Connection-quality estimation and profile selection.
//!
//! An estimator runs once per transfer; its result picks the
//! [`ConnectionClass`] whose profile drives the session.

use std::path::PathBuf;

use async_trait::async_trait;
use eyre::Result;
use serde::{Deserialize, Serialize};

use crate::perf_history::{self, TransferOutcome};
use crate::profile::ConnectionClass;

/// Coarse uplink bandwidth bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandwidthClass {
    /// Below 50 Mbps.
    Limited,
    /// 50 to 100 Mbps.
    Broadband,
    /// 100 to 500 Mbps.
    Fast,
    /// 500 to 800 Mbps.
    VeryFast,
    /// 800 Mbps and above.
    Gigabit,
}

/// Coarse round-trip latency bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyClass {
    /// Below 30 ms.
    Low,
    /// 30 to 100 ms.
    Moderate,
    /// 100 ms and above.
    High,
}

/// Measured or assumed connection characteristics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConnectionEstimate {
    pub bandwidth_mbps: f64,
    pub latency_ms: f64,
}

impl ConnectionEstimate {
    pub fn new(bandwidth_mbps: f64, latency_ms: f64) -> Self {
        Self {
            bandwidth_mbps,
            latency_ms,
        }
    }

    pub fn bandwidth_class(&self) -> BandwidthClass {
        match self.bandwidth_mbps {
            b if b < 50.0 => BandwidthClass::Limited,
            b if b < 100.0 => BandwidthClass::Broadband,
            b if b < 500.0 => BandwidthClass::Fast,
            b if b < 800.0 => BandwidthClass::VeryFast,
            _ => BandwidthClass::Gigabit,
        }
    }

    pub fn latency_class(&self) -> LatencyClass {
        match self.latency_ms {
            l if l < 30.0 => LatencyClass::Low,
            l if l < 100.0 => LatencyClass::Moderate,
            _ => LatencyClass::High,
        }
    }

    /// Map the estimate onto a profile class. Fast links with high latency
    /// need deep parallelism more than raw chunk size, so they get ULTRA.
    pub fn connection_class(&self) -> ConnectionClass {
        let high_latency = self.latency_class() == LatencyClass::High;
        match self.bandwidth_class() {
            BandwidthClass::Limited => ConnectionClass::Dsl,
            BandwidthClass::Broadband => ConnectionClass::Cable,
            BandwidthClass::Gigabit if high_latency => ConnectionClass::Ultra,
            BandwidthClass::Gigabit => ConnectionClass::Gigabit,
            _ if high_latency && self.bandwidth_mbps >= 120.0 => ConnectionClass::Ultra,
            BandwidthClass::Fast => ConnectionClass::Fiber,
            BandwidthClass::VeryFast => ConnectionClass::Enterprise,
        }
    }
}

#[async_trait]
pub trait ConnectionEstimator: Send + Sync {
    /// Estimate the connection, or `None` when there is nothing to go on.
    async fn estimate(&self) -> Result<Option<ConnectionEstimate>>;
}

/// Fixed estimate supplied by the caller (e.g. `--bandwidth-mbps`).
pub struct StaticEstimator(pub ConnectionEstimate);

#[async_trait]
impl ConnectionEstimator for StaticEstimator {
    async fn estimate(&self) -> Result<Option<ConnectionEstimate>> {
        Ok(Some(self.0))
    }
}

/// Derives an estimate from recent successful transfers in the local history.
pub struct HistoryEstimator {
    path: Option<PathBuf>,
    window: usize,
    latency_ms: f64,
}

impl HistoryEstimator {
    /// Use the default history file.
    pub fn new(latency_ms: f64) -> Self {
        Self {
            path: None,
            window: 5,
            latency_ms,
        }
    }

    pub fn at_path(path: PathBuf, latency_ms: f64) -> Self {
        Self {
            path: Some(path),
            window: 5,
            latency_ms,
        }
    }

}

#[async_trait]
impl ConnectionEstimator for HistoryEstimator {
    async fn estimate(&self) -> Result<Option<ConnectionEstimate>> {
        let records = match &self.path {
            Some(path) => perf_history::read_records_from(path, 0)?,
            None => perf_history::read_recent_records(0)?,
        };
        let mut speeds: Vec<f64> = records
            .iter()
            .rev()
            .filter(|r| r.outcome == TransferOutcome::Completed && r.average_mbps > 0.0)
            .take(self.window)
            .map(|r| r.average_mbps)
            .collect();
        if speeds.is_empty() {
            return Ok(None);
        }
        speeds.sort_by(|a, b| a.total_cmp(b));
        let median = speeds[speeds.len() / 2];
        log::debug!(
            "history estimate: median {:.1} Mbps over {} transfer(s)",
            median,
            speeds.len()
        );
        Ok(Some(ConnectionEstimate::new(median, self.latency_ms)))
    }
}

/// Pick the class for a session: an explicit hint wins, then the estimate,
/// then the configured default, then CABLE.
pub async fn select_class(
    hint: Option<ConnectionClass>,
    estimator: Option<&dyn ConnectionEstimator>,
    fallback: Option<ConnectionClass>,
) -> ConnectionClass {
    if let Some(class) = hint {
        return class;
    }
    if let Some(estimator) = estimator {
        match estimator.estimate().await {
            Ok(Some(estimate)) => {
                let class = estimate.connection_class();
                log::info!(
                    "estimated {:.0} Mbps / {:.0} ms ({:?}, {:?} latency) -> {} profile",
                    estimate.bandwidth_mbps,
                    estimate.latency_ms,
                    estimate.bandwidth_class(),
                    estimate.latency_class(),
                    class
                );
                return class;
            }
            Ok(None) => log::debug!("connection estimator had no data"),
            Err(err) => log::warn!("connection estimate failed: {:#}", err),
        }
    }
    fallback.unwrap_or(ConnectionClass::Cable)
}
