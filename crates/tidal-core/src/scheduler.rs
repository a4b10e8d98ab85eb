//! Bounded chunk worker pool.
//!
//! The scheduler carves the source into chunks as they are admitted and keeps
//! at most [`Knobs::parallelism`] attempts in flight. The controller rewrites
//! the knobs while the pool runs; a new chunk size only applies to chunks that
//! have not been planned yet.

use std::collections::{HashMap, VecDeque};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::chunk::{ordered_parts, ChunkPlanner, ChunkRecord, CompletedPart};
use crate::errors::{TransferError, TransferResult};
use crate::events::{EventStream, TransferEvent};
use crate::perf_tracker::PerformanceTracker;
use crate::profile::Profile;
use crate::store::{MultipartUpload, ObjectStore, PartSource};

const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(5);
/// Zombie cancellations allowed per part. Later attempts run to completion.
pub const MAX_ZOMBIE_RESTARTS: u8 = 1;

/// Live parallelism and chunk-size settings.
///
/// Single writer (the controller), read by the scheduler whenever it decides
/// whether to admit more work.
pub struct Knobs {
    parallelism: AtomicUsize,
    chunk_bytes: AtomicU64,
    changed: Notify,
}

impl Knobs {
    pub fn new(parallelism: usize, chunk_bytes: u64) -> Self {
        Self {
            parallelism: AtomicUsize::new(parallelism.max(1)),
            chunk_bytes: AtomicU64::new(chunk_bytes),
            changed: Notify::new(),
        }
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism.load(Ordering::Acquire)
    }

    pub fn chunk_bytes(&self) -> u64 {
        self.chunk_bytes.load(Ordering::Acquire)
    }

    /// Never below one.
    pub fn set_parallelism(&self, parallelism: usize) {
        let parallelism = parallelism.max(1);
        if self.parallelism.swap(parallelism, Ordering::AcqRel) != parallelism {
            self.changed.notify_one();
        }
    }

    pub fn set_chunk_bytes(&self, chunk_bytes: u64) {
        if self.chunk_bytes.swap(chunk_bytes, Ordering::AcqRel) != chunk_bytes {
            self.changed.notify_one();
        }
    }

    /// Resolves after the next change (or immediately if one is pending).
    pub async fn changed(&self) {
        self.changed.notified().await;
    }
}

/// Session-wide cancellation signal. Clones share the same flag.
#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            flag: Arc::new(flag),
        }
    }

    pub fn cancel(&self) {
        self.flag.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.flag.borrow()
    }

    pub async fn cancelled(&self) {
        let mut rx = self.flag.subscribe();
        // The sender lives as long as `self`, so this only returns once cancelled.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// One attempt currently on the wire, as seen by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlightChunk {
    pub ordinal: u32,
    /// Attempts before this one; distinguishes attempts of the same part.
    pub attempt: u8,
    pub len: u64,
    pub started_at: Instant,
}

struct InFlightEntry {
    chunk: InFlightChunk,
    zombie: Arc<Notify>,
}

/// Attempts in flight, shared between the workers and the controller.
#[derive(Default)]
pub struct InFlightRegistry {
    entries: Mutex<HashMap<u32, InFlightEntry>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the signal that fires if this attempt is flagged as a zombie.
    pub fn register(&self, chunk: InFlightChunk) -> Arc<Notify> {
        let zombie = Arc::new(Notify::new());
        self.entries.lock().insert(
            chunk.ordinal,
            InFlightEntry {
                chunk,
                zombie: Arc::clone(&zombie),
            },
        );
        zombie
    }

    pub fn remove(&self, ordinal: u32) {
        self.entries.lock().remove(&ordinal);
    }

    /// In-flight attempts ordered by part number.
    pub fn snapshot(&self) -> Vec<InFlightChunk> {
        let mut chunks: Vec<InFlightChunk> =
            self.entries.lock().values().map(|entry| entry.chunk).collect();
        chunks.sort_by_key(|chunk| chunk.ordinal);
        chunks
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Ask the worker running `ordinal`/`attempt` to give up. Returns false if
    /// that attempt is no longer in flight.
    pub fn flag_zombie(&self, ordinal: u32, attempt: u8) -> bool {
        let entries = self.entries.lock();
        match entries.get(&ordinal) {
            Some(entry) if entry.chunk.attempt == attempt => {
                entry.zombie.notify_one();
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerOptions {
    pub max_retries: u8,
    /// Delay between admissions when not saturating immediately.
    pub stagger_delay: Duration,
    pub immediate_saturation: bool,
    /// Base delay before a retry; doubles per retry.
    pub retry_backoff: Duration,
    /// How often one part may be cancelled as a zombie and restarted.
    pub max_zombie_restarts: u8,
}

impl SchedulerOptions {
    pub fn from_profile(profile: &Profile) -> Self {
        Self {
            max_retries: profile.max_retries,
            stagger_delay: profile.stagger_delay,
            immediate_saturation: profile.immediate_saturation,
            retry_backoff: Duration::from_millis(500),
            max_zombie_restarts: MAX_ZOMBIE_RESTARTS,
        }
    }

    fn backoff(&self, retries: u8) -> Duration {
        if retries == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32 << u32::from(retries.saturating_sub(1)).min(16);
        self.retry_backoff.saturating_mul(factor).min(MAX_RETRY_BACKOFF)
    }
}

/// Parts uploaded by a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerOutcome {
    /// Sorted by part number.
    pub parts: Vec<CompletedPart>,
    pub bytes: u64,
    pub retries: u32,
    pub zombie_cancellations: u32,
}

struct Shared {
    store: Arc<dyn ObjectStore>,
    source: Arc<dyn PartSource>,
    upload: MultipartUpload,
    tracker: Arc<PerformanceTracker>,
    in_flight: Arc<InFlightRegistry>,
    events: Arc<EventStream>,
    uploaded: AtomicU64,
    total: u64,
}

enum AttemptResult {
    Uploaded { etag: String, bytes: u64 },
    Zombie,
    Failed(TransferError),
}

struct AttemptReport {
    chunk: ChunkRecord,
    result: AttemptResult,
}

pub struct ChunkScheduler {
    shared: Arc<Shared>,
    knobs: Arc<Knobs>,
    cancel: CancelToken,
    options: SchedulerOptions,
}

impl ChunkScheduler {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        source: Arc<dyn PartSource>,
        upload: MultipartUpload,
        knobs: Arc<Knobs>,
        tracker: Arc<PerformanceTracker>,
        in_flight: Arc<InFlightRegistry>,
        events: Arc<EventStream>,
        cancel: CancelToken,
        options: SchedulerOptions,
    ) -> Self {
        let total = source.len();
        Self {
            shared: Arc::new(Shared {
                store,
                source,
                upload,
                tracker,
                in_flight,
                events,
                uploaded: AtomicU64::new(0),
                total,
            }),
            knobs,
            cancel,
            options,
        }
    }

    pub fn knobs(&self) -> &Arc<Knobs> {
        &self.knobs
    }

    /// Upload every chunk of the source, or fail with the first error that
    /// cannot be retried. In-flight attempts are aborted on failure or
    /// cancellation.
    pub async fn run(self) -> TransferResult<SchedulerOutcome> {
        let limits = self.shared.store.limits();
        let mut planner = ChunkPlanner::new(self.shared.total, limits)
            .map_err(|err| TransferError::fatal(format!("{:#}", err)))?;
        let mut retry_queue: VecDeque<ChunkRecord> = VecDeque::new();
        let mut tasks: JoinSet<AttemptReport> = JoinSet::new();
        let mut completed: Vec<CompletedPart> = Vec::new();
        let mut retries = 0u32;
        let mut zombie_cancellations = 0u32;
        let stagger = (!self.options.immediate_saturation && !self.options.stagger_delay.is_zero())
            .then_some(self.options.stagger_delay);
        let mut next_admission: Option<Instant> = None;

        loop {
            if self.cancel.is_cancelled() {
                tasks.abort_all();
                return Err(TransferError::cancelled());
            }

            while tasks.len() < self.knobs.parallelism() {
                if next_admission.is_some_and(|at| Instant::now() < at) {
                    break;
                }
                let chunk = match retry_queue.pop_front() {
                    Some(chunk) => chunk,
                    None => match planner.next_chunk(self.knobs.chunk_bytes()) {
                        Some(chunk) => chunk,
                        None => break,
                    },
                };
                log::trace!(
                    "admitting part {} ({} bytes, retry {})",
                    chunk.ordinal,
                    chunk.len(),
                    chunk.retries
                );
                self.spawn_attempt(&mut tasks, chunk);
                if let Some(delay) = stagger {
                    next_admission = Some(Instant::now() + delay);
                }
            }

            let work_pending = !retry_queue.is_empty() || !planner.is_exhausted();
            if tasks.is_empty() && !work_pending {
                break;
            }
            let wake_at = next_admission.filter(|_| work_pending);

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tasks.abort_all();
                    return Err(TransferError::cancelled());
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    let report = match joined {
                        Ok(report) => report,
                        Err(err) => {
                            tasks.abort_all();
                            return Err(TransferError::fatal(format!("chunk worker failed: {}", err)));
                        }
                    };
                    let mut chunk = report.chunk;
                    let failure = match report.result {
                        AttemptResult::Uploaded { etag, bytes } => {
                            log::debug!("part {} uploaded ({} bytes)", chunk.ordinal, bytes);
                            completed.push(CompletedPart {
                                part_number: chunk.ordinal,
                                etag,
                            });
                            None
                        }
                        AttemptResult::Zombie => {
                            zombie_cancellations += 1;
                            if let Err(err) = chunk.restart() {
                                tasks.abort_all();
                                return Err(TransferError::fatal(format!("{:#}", err)));
                            }
                            log::info!("restarting part {} after a zombie cancellation", chunk.ordinal);
                            retry_queue.push_back(chunk);
                            continue;
                        }
                        AttemptResult::Failed(err) => Some(err),
                    };

                    if let Some(mut failure) = failure {
                        failure.attempts = chunk.retries;
                        if !failure.should_retry(self.options.max_retries) {
                            tasks.abort_all();
                            chunk.abort();
                            let failure = failure
                                .with_attempt()
                                .for_chunk(chunk.ordinal, chunk.range.clone());
                            log::error!("{}", failure);
                            return Err(failure);
                        }
                        log::warn!(
                            "part {} attempt {} failed, retrying: {}",
                            chunk.ordinal,
                            chunk.attempt() + 1,
                            failure.message
                        );
                        if let Err(err) = chunk.requeue() {
                            tasks.abort_all();
                            return Err(TransferError::fatal(format!("{:#}", err)));
                        }
                        retries += 1;
                        retry_queue.push_back(chunk);
                    }
                }
                _ = self.knobs.changed() => {}
                _ = sleep_until_or_pending(wake_at), if wake_at.is_some() => {
                    next_admission = None;
                }
            }
        }

        Ok(SchedulerOutcome {
            bytes: self.shared.uploaded.load(Ordering::Acquire),
            parts: ordered_parts(completed),
            retries,
            zombie_cancellations,
        })
    }

    fn spawn_attempt(&self, tasks: &mut JoinSet<AttemptReport>, chunk: ChunkRecord) {
        let shared = Arc::clone(&self.shared);
        let backoff = self.options.backoff(chunk.retries);
        let cancellable = chunk.restarts < self.options.max_zombie_restarts;
        tasks.spawn(async move {
            if !backoff.is_zero() {
                tokio::time::sleep(backoff).await;
            }
            run_attempt(shared, chunk, cancellable).await
        });
    }
}

async fn sleep_until_or_pending(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Upload one attempt. A zombie flag only interrupts it while `cancellable`;
/// past the restart budget a slow part is left to finish.
async fn run_attempt(shared: Arc<Shared>, mut chunk: ChunkRecord, cancellable: bool) -> AttemptReport {
    let started = Instant::now();
    if let Err(err) = chunk.begin_attempt(started) {
        return AttemptReport {
            chunk,
            result: AttemptResult::Failed(TransferError::fatal(format!("{:#}", err))),
        };
    }
    let zombie = shared.in_flight.register(InFlightChunk {
        ordinal: chunk.ordinal,
        attempt: chunk.attempt(),
        len: chunk.len(),
        started_at: started,
    });

    let result = tokio::select! {
        result = transmit(&shared, chunk.ordinal, chunk.range.clone()) => result,
        _ = zombie.notified(), if cancellable => Err(None),
    };
    shared.in_flight.remove(chunk.ordinal);

    let result = match result {
        Ok(etag) => {
            let now = Instant::now();
            let bytes = chunk.len();
            let sample = shared
                .tracker
                .record(chunk.ordinal, bytes, now.duration_since(started), now);
            if let Err(err) = chunk.complete(etag.clone(), sample.speed) {
                return AttemptReport {
                    chunk,
                    result: AttemptResult::Failed(TransferError::fatal(format!("{:#}", err))),
                };
            }
            let uploaded = shared.uploaded.fetch_add(bytes, Ordering::AcqRel) + bytes;
            shared.events.emit(TransferEvent::PartCompleted {
                part_number: chunk.ordinal,
                bytes,
                mib_per_sec: sample.mib_per_sec(),
                uploaded_bytes: uploaded,
                total_bytes: shared.total,
            });
            AttemptResult::Uploaded { etag, bytes }
        }
        Err(None) => {
            log::warn!(
                "part {} attempt {} cancelled as a zombie",
                chunk.ordinal,
                chunk.attempt() + 1
            );
            AttemptResult::Zombie
        }
        Err(Some(err)) => AttemptResult::Failed(err),
    };
    if !matches!(result, AttemptResult::Uploaded { .. }) {
        // Only InFlight chunks reach here.
        let _ = chunk.fail();
    }
    AttemptReport { chunk, result }
}

/// Read and upload one part. `Err(None)` is reserved for zombie cancellation.
async fn transmit(
    shared: &Shared,
    part_number: u32,
    range: Range<u64>,
) -> Result<String, Option<TransferError>> {
    let body = shared.source.read_range(range).await.map_err(Some)?;
    shared
        .store
        .upload_part(&shared.upload, part_number, body)
        .await
        .map_err(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::StoreLimits;
    use crate::errors::ErrorCategory;
    use crate::perf_tracker::StrategySnapshot;
    use crate::store::memory::Fault;
    use crate::store::{MemoryStore, SimulatedLink, SyntheticSource};
    use crate::units::MIB;

    struct Harness {
        store: Arc<MemoryStore>,
        tracker: Arc<PerformanceTracker>,
        in_flight: Arc<InFlightRegistry>,
        events: Arc<EventStream>,
        knobs: Arc<Knobs>,
        cancel: CancelToken,
        upload: MultipartUpload,
    }

    impl Harness {
        async fn new(store: MemoryStore, parallelism: usize, chunk_bytes: u64) -> Self {
            let store = Arc::new(store);
            let upload = store.initiate_multipart("obj.bin", "application/octet-stream").await.unwrap();
            Self {
                store,
                tracker: Arc::new(PerformanceTracker::new(
                    64,
                    StrategySnapshot {
                        chunk_bytes,
                        parallelism,
                        total_chunks: 0,
                    },
                )),
                in_flight: Arc::new(InFlightRegistry::new()),
                events: Arc::new(EventStream::new()),
                knobs: Arc::new(Knobs::new(parallelism, chunk_bytes)),
                cancel: CancelToken::new(),
                upload,
            }
        }

        fn scheduler(&self, len: u64, options: SchedulerOptions) -> ChunkScheduler {
            ChunkScheduler::new(
                self.store.clone(),
                Arc::new(SyntheticSource::new(len)),
                self.upload.clone(),
                Arc::clone(&self.knobs),
                Arc::clone(&self.tracker),
                Arc::clone(&self.in_flight),
                Arc::clone(&self.events),
                self.cancel.clone(),
                options,
            )
        }
    }

    fn options() -> SchedulerOptions {
        SchedulerOptions {
            max_retries: 3,
            stagger_delay: Duration::ZERO,
            immediate_saturation: true,
            retry_backoff: Duration::from_millis(100),
            max_zombie_restarts: 1,
        }
    }

    #[test]
    fn knobs_never_drop_below_one() {
        let knobs = Knobs::new(0, 5 * MIB);
        assert_eq!(knobs.parallelism(), 1);
        knobs.set_parallelism(0);
        assert_eq!(knobs.parallelism(), 1);
        knobs.set_parallelism(7);
        assert_eq!(knobs.parallelism(), 7);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let opts = options();
        assert_eq!(opts.backoff(0), Duration::ZERO);
        assert_eq!(opts.backoff(1), Duration::from_millis(100));
        assert_eq!(opts.backoff(3), Duration::from_millis(400));
        assert_eq!(opts.backoff(20), MAX_RETRY_BACKOFF);
    }

    #[tokio::test]
    async fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
        clone.cancelled().await;
    }

    #[test]
    fn zombie_flag_targets_one_attempt() {
        let registry = InFlightRegistry::new();
        let started_at = Instant::now();
        registry.register(InFlightChunk {
            ordinal: 3,
            attempt: 1,
            len: MIB,
            started_at,
        });
        assert!(!registry.flag_zombie(3, 0));
        assert!(registry.flag_zombie(3, 1));
        assert!(!registry.flag_zombie(4, 0));
        assert_eq!(registry.snapshot().len(), 1);
        registry.remove(3);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn uploads_all_parts_in_order() {
        let link = Arc::new(SimulatedLink::new(400.0));
        let harness = Harness::new(MemoryStore::new().with_link(link), 4, 5 * MIB).await;
        let outcome = harness.scheduler(23 * MIB, options()).run().await.unwrap();

        let numbers: Vec<u32> = outcome.parts.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
        assert_eq!(outcome.bytes, 23 * MIB);
        assert_eq!(harness.tracker.total_recorded(), 5);
        let parts_reported = harness
            .events
            .history()
            .iter()
            .filter(|e| matches!(e, TransferEvent::PartCompleted { .. }))
            .count();
        assert_eq!(parts_reported, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_parallelism() {
        let link = Arc::new(SimulatedLink::new(200.0));
        let harness = Harness::new(MemoryStore::new().with_link(Arc::clone(&link)), 2, 5 * MIB).await;
        let scheduler = harness.scheduler(40 * MIB, options());
        let registry = Arc::clone(&harness.in_flight);
        let watcher = tokio::spawn(async move {
            let mut peak = 0;
            for _ in 0..200 {
                peak = peak.max(registry.len());
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            peak
        });
        scheduler.run().await.unwrap();
        assert!(watcher.await.unwrap() <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let store = MemoryStore::new().with_request_latency(Duration::from_millis(5));
        store.inject(2, Fault::Transient);
        store.inject(2, Fault::Transient);
        let harness = Harness::new(store, 3, 5 * MIB).await;
        let outcome = harness.scheduler(15 * MIB, options()).run().await.unwrap();
        assert_eq!(outcome.parts.len(), 3);
        assert_eq!(outcome.retries, 2);
        assert_eq!(harness.store.part_attempts(2), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_with_chunk_context() {
        let store = MemoryStore::new().with_request_latency(Duration::from_millis(5));
        for _ in 0..4 {
            store.inject(1, Fault::Transient);
        }
        let harness = Harness::new(store, 2, 5 * MIB).await;
        let err = harness.scheduler(10 * MIB, options()).run().await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Retryable);
        assert_eq!(err.chunk.as_ref().map(|c| c.ordinal), Some(1));
        assert_eq!(err.attempts, 4);
        assert_eq!(harness.store.part_attempts(1), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_are_not_retried() {
        let store = MemoryStore::new().with_request_latency(Duration::from_millis(5));
        store.inject(1, Fault::Reject);
        let harness = Harness::new(store, 1, 5 * MIB).await;
        let err = harness.scheduler(10 * MIB, options()).run().await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Fatal);
        assert_eq!(harness.store.part_attempts(1), 1);
        assert!(err.to_string().contains("part 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_admission() {
        let link = Arc::new(SimulatedLink::new(8.0));
        let harness = Harness::new(MemoryStore::new().with_link(link), 2, 5 * MIB).await;
        let scheduler = harness.scheduler(100 * MIB, options());
        let cancel = harness.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            cancel.cancel();
        });
        let err = scheduler.run().await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(harness.tracker.total_recorded() < 20);
    }

    #[tokio::test(start_paused = true)]
    async fn zombie_attempts_are_requeued() {
        let store = MemoryStore::new().with_request_latency(Duration::from_millis(5));
        store.inject(2, Fault::Stall { mib_per_sec: 0.01 });
        let harness = Harness::new(store, 2, 5 * MIB).await;
        let scheduler = harness.scheduler(15 * MIB, options());
        let registry = Arc::clone(&harness.in_flight);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let stuck = registry.snapshot().into_iter().find(|c| c.ordinal == 2);
                if let Some(chunk) = stuck {
                    if registry.flag_zombie(chunk.ordinal, chunk.attempt) {
                        break;
                    }
                }
            }
        });
        let outcome = scheduler.run().await.unwrap();
        assert_eq!(outcome.parts.len(), 3);
        assert_eq!(outcome.zombie_cancellations, 1);
        assert_eq!(harness.store.part_attempts(2), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_part_finishes_once_restarts_are_spent() {
        let store = MemoryStore::new().with_request_latency(Duration::from_millis(5));
        store.inject(2, Fault::Stall { mib_per_sec: 0.05 });
        store.inject(2, Fault::Stall { mib_per_sec: 0.05 });
        let harness = Harness::new(store, 2, 5 * MIB).await;
        let scheduler = harness.scheduler(15 * MIB, SchedulerOptions {
            max_retries: 0,
            ..options()
        });
        let registry = Arc::clone(&harness.in_flight);
        let flagger = tokio::spawn(async move {
            let mut flagged = 0;
            for _ in 0..300 {
                tokio::time::sleep(Duration::from_secs(1)).await;
                for chunk in registry.snapshot() {
                    if chunk.ordinal == 2 && registry.flag_zombie(chunk.ordinal, chunk.attempt) {
                        flagged += 1;
                    }
                }
            }
            flagged
        });
        let outcome = scheduler.run().await.unwrap();
        assert_eq!(outcome.parts.len(), 3);
        assert_eq!(outcome.retries, 0);
        assert_eq!(outcome.zombie_cancellations, 1);
        assert_eq!(harness.store.part_attempts(2), 2);
        flagger.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn raised_parallelism_admits_more_work() {
        let link = Arc::new(SimulatedLink::new(40.0));
        let harness = Harness::new(MemoryStore::new().with_link(link), 1, 5 * MIB).await;
        let scheduler = harness.scheduler(30 * MIB, options());
        let knobs = Arc::clone(&harness.knobs);
        let registry = Arc::clone(&harness.in_flight);
        let watcher = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            knobs.set_parallelism(3);
            tokio::time::sleep(Duration::from_millis(50)).await;
            registry.len()
        });
        scheduler.run().await.unwrap();
        assert_eq!(watcher.await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn chunk_size_change_applies_to_later_chunks() {
        let link = Arc::new(SimulatedLink::new(80.0));
        let harness = Harness::new(MemoryStore::new().with_link(link), 1, 5 * MIB).await;
        let scheduler = harness.scheduler(30 * MIB, options());
        let knobs = Arc::clone(&harness.knobs);
        knobs.set_chunk_bytes(5 * MIB);
        let resize = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            knobs.set_chunk_bytes(10 * MIB);
        });
        let outcome = scheduler.run().await.unwrap();
        resize.await.unwrap();
        assert!(outcome.parts.len() < 6);
        assert_eq!(outcome.bytes, 30 * MIB);
    }

    #[tokio::test(start_paused = true)]
    async fn staggered_start_spaces_admissions() {
        let link = Arc::new(SimulatedLink::new(8.0));
        let harness = Harness::new(MemoryStore::new().with_link(link), 3, 5 * MIB).await;
        let scheduler = harness.scheduler(15 * MIB, SchedulerOptions {
            immediate_saturation: false,
            stagger_delay: Duration::from_millis(500),
            ..options()
        });
        let registry = Arc::clone(&harness.in_flight);
        let watcher = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            let early = registry.len();
            tokio::time::sleep(Duration::from_millis(1_000)).await;
            (early, registry.len())
        });
        scheduler.run().await.unwrap();
        let (early, later) = watcher.await.unwrap();
        assert_eq!(early, 1);
        assert_eq!(later, 3);
    }

    #[tokio::test]
    async fn empty_source_uploads_one_empty_part() {
        let harness = Harness::new(MemoryStore::new(), 2, 5 * MIB).await;
        let outcome = harness.scheduler(0, options()).run().await.unwrap();
        assert_eq!(outcome.parts.len(), 1);
        assert_eq!(outcome.bytes, 0);
    }

    #[tokio::test]
    async fn oversized_source_is_rejected() {
        let store = MemoryStore::new().with_limits(StoreLimits {
            min_part_bytes: MIB,
            max_part_bytes: MIB,
            max_parts: 2,
        });
        let harness = Harness::new(store, 1, MIB).await;
        let err = harness.scheduler(3 * MIB, options()).run().await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Fatal);
    }
}
