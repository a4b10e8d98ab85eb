//! One file's upload lifecycle.
//!
//! A session opens the multipart upload, runs the chunk scheduler and the
//! adaptive controller side by side, and then either completes the upload
//! with the parts sorted by number or aborts it. An open multipart upload is
//! never left behind: failure and cancellation both issue the store's abort.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::TidalConfig;
use crate::controller::{AdaptiveController, ControllerReport};
use crate::errors::{TransferError, TransferResult};
use crate::estimate::{self, ConnectionEstimator};
use crate::events::{EventStream, EventSubscription, TransferEvent};
use crate::perf_history::{self, TransferOutcome, TransferRecord};
use crate::perf_tracker::{PerformanceTracker, StrategySnapshot};
use crate::profile::{ConnectionClass, Profile};
use crate::scheduler::{CancelToken, ChunkScheduler, InFlightRegistry, Knobs, SchedulerOptions};
use crate::store::{MultipartUpload, ObjectStore, PartSource};
use crate::units;

const TRACKER_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Planning,
    Uploading,
    Completing,
    Completed,
    Aborted,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Planning => "planning",
            SessionState::Uploading => "uploading",
            SessionState::Completing => "completing",
            SessionState::Completed => "completed",
            SessionState::Aborted => "aborted",
            SessionState::Failed => "failed",
        })
    }
}

/// What to upload and how.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub key: String,
    pub content_type: String,
    pub profile: Profile,
    /// Where to append the session record; `None` disables history.
    pub history_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferSummary {
    pub key: String,
    pub upload_id: String,
    pub profile: ConnectionClass,
    pub bytes: u64,
    pub parts: u32,
    pub elapsed: Duration,
    pub average_mbps: f64,
    pub location: Option<String>,
    pub retries: u32,
    pub zombie_cancellations: u32,
    pub controller: ControllerReport,
}

pub struct TransferSession {
    store: Arc<dyn ObjectStore>,
    source: Arc<dyn PartSource>,
    request: TransferRequest,
    events: Arc<EventStream>,
    cancel: CancelToken,
    state: Arc<Mutex<SessionState>>,
    /// Set between initiate and complete or abort.
    open_upload: Arc<Mutex<Option<MultipartUpload>>>,
}

impl TransferSession {
    pub fn new(store: Arc<dyn ObjectStore>, source: Arc<dyn PartSource>, request: TransferRequest) -> Self {
        Self {
            store,
            source,
            request,
            events: Arc::new(EventStream::new()),
            cancel: CancelToken::new(),
            state: Arc::new(Mutex::new(SessionState::Planning)),
            open_upload: Arc::new(Mutex::new(None)),
        }
    }

    pub fn events(&self) -> Arc<EventStream> {
        Arc::clone(&self.events)
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Run the session on its own task.
    pub fn start(self) -> SessionHandle {
        let events = self.events();
        let cancel = self.cancel_token();
        let state = Arc::clone(&self.state);
        let store = Arc::clone(&self.store);
        let open_upload = Arc::clone(&self.open_upload);
        let task = tokio::spawn(self.run());
        SessionHandle {
            events,
            cancel,
            state,
            store,
            open_upload,
            task,
        }
    }

    /// Drive the upload to completion, abort or failure.
    pub async fn run(self) -> TransferResult<TransferSummary> {
        let started = Instant::now();
        let profile = self.request.profile.clone();
        let total = self.source.len();

        self.events.emit(TransferEvent::Started {
            key: self.request.key.clone(),
            size_bytes: total,
            profile: profile.class,
            chunk_bytes: profile.chunk_bytes,
            parallelism: profile.starting_parallel(),
        });
        log::info!(
            "uploading {} ({}) with the {} profile: {} parts, {} parallel",
            self.request.key,
            units::format_bytes(total),
            profile.class,
            units::format_bytes(profile.chunk_bytes),
            profile.starting_parallel()
        );

        let upload = match self
            .store
            .initiate_multipart(&self.request.key, &self.request.content_type)
            .await
        {
            Ok(upload) => upload,
            Err(err) => {
                self.set_state(SessionState::Failed);
                log::error!("failed to start multipart upload: {}", err);
                self.events.emit(TransferEvent::Error {
                    message: err.to_string(),
                    aborted: false,
                });
                self.record_history(TransferOutcome::Failed, 0, 0, started.elapsed(), None);
                return Err(err);
            }
        };
        *self.open_upload.lock() = Some(upload.clone());
        self.events.emit(TransferEvent::MultipartStarted {
            key: upload.key.clone(),
            upload_id: upload.upload_id.clone(),
        });
        if self.cancel.is_cancelled() {
            return Err(self.abort(&upload, TransferError::cancelled(), started, None).await);
        }
        self.set_state(SessionState::Uploading);

        let tracker = Arc::new(PerformanceTracker::new(
            TRACKER_CAPACITY,
            StrategySnapshot {
                chunk_bytes: profile.chunk_bytes,
                parallelism: profile.starting_parallel(),
                total_chunks: total.div_ceil(profile.chunk_bytes.max(1)).max(1),
            },
        ));
        let knobs = Arc::new(Knobs::new(profile.starting_parallel(), profile.chunk_bytes));
        let in_flight = Arc::new(InFlightRegistry::new());
        let controller = AdaptiveController::new(
            profile.clone(),
            Arc::clone(&tracker),
            Arc::clone(&knobs),
            self.store.limits(),
            total,
            started,
        );
        let scheduler = ChunkScheduler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.source),
            upload.clone(),
            knobs,
            tracker,
            Arc::clone(&in_flight),
            Arc::clone(&self.events),
            self.cancel.clone(),
            SchedulerOptions::from_profile(&profile),
        );

        let stop = CancelToken::new();
        let uploading = async {
            let outcome = scheduler.run().await;
            stop.cancel();
            outcome
        };
        let (outcome, report) = tokio::join!(
            uploading,
            controller.run(in_flight, Arc::clone(&self.events), stop.clone())
        );

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => return Err(self.abort(&upload, err, started, Some(report)).await),
        };

        self.set_state(SessionState::Completing);
        let parts = outcome.parts.len() as u32;
        let location = match self.store.complete_multipart(&upload, &outcome.parts).await {
            Ok(location) => location,
            Err(err) => return Err(self.abort(&upload, err, started, Some(report)).await),
        };

        *self.open_upload.lock() = None;
        let elapsed = started.elapsed();
        self.set_state(SessionState::Completed);
        self.events.emit(TransferEvent::Completed {
            key: upload.key.clone(),
            parts,
            bytes: outcome.bytes,
            elapsed_ms: units::millis(elapsed),
            location: location.clone(),
        });
        let summary = TransferSummary {
            key: upload.key.clone(),
            upload_id: upload.upload_id.clone(),
            profile: profile.class,
            bytes: outcome.bytes,
            parts,
            elapsed,
            average_mbps: average_mbps(outcome.bytes, elapsed),
            location,
            retries: outcome.retries,
            zombie_cancellations: outcome.zombie_cancellations,
            controller: report,
        };
        log::info!(
            "uploaded {} in {} parts, {:.1}s at {:.1} Mbps",
            units::format_bytes(summary.bytes),
            summary.parts,
            elapsed.as_secs_f64(),
            summary.average_mbps
        );
        self.record_history(TransferOutcome::Completed, summary.bytes, parts, elapsed, Some(&report));
        Ok(summary)
    }

    /// Abort the upload after `err` and report it. Returns the error to surface.
    async fn abort(
        &self,
        upload: &MultipartUpload,
        err: TransferError,
        started: Instant,
        report: Option<ControllerReport>,
    ) -> TransferError {
        *self.open_upload.lock() = None;
        let cancelled = err.is_cancelled();
        let aborted = match self.store.abort_multipart(upload).await {
            Ok(()) => true,
            Err(abort_err) => {
                log::error!(
                    "failed to abort multipart upload {}: {}",
                    upload.upload_id,
                    abort_err
                );
                false
            }
        };
        if cancelled {
            log::warn!("upload of {} cancelled", upload.key);
            self.set_state(SessionState::Aborted);
        } else {
            log::error!("upload of {} failed: {}", upload.key, err);
            self.set_state(SessionState::Failed);
        }
        self.events.emit(TransferEvent::Error {
            message: err.to_string(),
            aborted,
        });
        let outcome = if cancelled {
            TransferOutcome::Cancelled
        } else {
            TransferOutcome::Failed
        };
        self.record_history(outcome, 0, 0, started.elapsed(), report.as_ref());
        err
    }

    fn set_state(&self, state: SessionState) {
        let mut current = self.state.lock();
        log::debug!("session {} -> {}", *current, state);
        *current = state;
    }

    fn record_history(
        &self,
        outcome: TransferOutcome,
        bytes: u64,
        parts: u32,
        elapsed: Duration,
        report: Option<&ControllerReport>,
    ) {
        let Some(path) = self.request.history_path.as_ref() else {
            return;
        };
        let profile = &self.request.profile;
        let counters = report.map(|r| r.counters).unwrap_or_default();
        let record = TransferRecord {
            timestamp_epoch_ms: TransferRecord::timestamp_now(),
            profile: profile.class,
            total_bytes: self.source.len(),
            parts,
            duration_ms: elapsed.as_millis(),
            average_mbps: average_mbps(bytes, elapsed),
            final_parallelism: report.map_or(profile.starting_parallel(), |r| r.parallelism),
            final_chunk_bytes: report.map_or(profile.chunk_bytes, |r| r.chunk_bytes),
            peak_mbps: report.and_then(|r| r.peak_mbps),
            zombie_flags: counters.zombie_flags,
            stall_events: counters.stall_events,
            emergency_resets: counters.emergency_resets,
            fallback_engaged: report.is_some_and(|r| r.fallback_engaged),
            outcome,
        };
        if let Err(err) = perf_history::append_record_to(path, &record) {
            log::warn!("failed to record transfer history: {:#}", err);
        }
    }
}

fn average_mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    units::mbps(bytes as f64 / secs)
}

/// Handle to a running session.
pub struct SessionHandle {
    events: Arc<EventStream>,
    cancel: CancelToken,
    state: Arc<Mutex<SessionState>>,
    store: Arc<dyn ObjectStore>,
    open_upload: Arc<Mutex<Option<MultipartUpload>>>,
    task: JoinHandle<TransferResult<TransferSummary>>,
}

impl SessionHandle {
    /// Stop admitting chunks and abort the upload.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Replays every event so far, then follows the live stream.
    pub fn subscribe(&self) -> EventSubscription {
        self.events.subscribe()
    }

    pub fn events(&self) -> Vec<TransferEvent> {
        self.events.history()
    }

    /// Wait for the session's result. If the session task dies, an upload it
    /// left open is aborted here.
    pub async fn wait(self) -> TransferResult<TransferSummary> {
        let err = match self.task.await {
            Ok(result) => return result,
            Err(err) => TransferError::fatal(format!("transfer task failed: {}", err)),
        };
        log::error!("{}", err);
        let upload = self.open_upload.lock().take();
        let aborted = match upload {
            Some(upload) => match self.store.abort_multipart(&upload).await {
                Ok(()) => true,
                Err(abort_err) => {
                    log::error!(
                        "failed to abort multipart upload {}: {}",
                        upload.upload_id,
                        abort_err
                    );
                    false
                }
            },
            None => false,
        };
        *self.state.lock() = SessionState::Failed;
        self.events.emit(TransferEvent::Error {
            message: err.to_string(),
            aborted,
        });
        Err(err)
    }
}

/// Pick a profile and start uploading `source` as `key`.
///
/// The class comes from `hint`, else the estimator, else the configured
/// default. Configured overrides are applied to the chosen profile.
pub async fn start_transfer(
    store: Arc<dyn ObjectStore>,
    source: Arc<dyn PartSource>,
    key: impl Into<String>,
    hint: Option<ConnectionClass>,
    estimator: Option<&dyn ConnectionEstimator>,
    config: &TidalConfig,
) -> Result<SessionHandle> {
    let class = estimate::select_class(hint, estimator, config.default_profile).await;
    let profile = config.profile(class, &store.limits())?;
    let history_path = if config.history.enabled && !perf_history::perf_history_disabled() {
        match perf_history::history_path() {
            Ok(path) => Some(path),
            Err(err) => {
                log::debug!("transfer history unavailable: {:#}", err);
                None
            }
        }
    } else {
        None
    };
    let request = TransferRequest {
        key: key.into(),
        content_type: config.content_type().to_string(),
        profile,
        history_path,
    };
    Ok(TransferSession::new(store, source, request).start())
}
