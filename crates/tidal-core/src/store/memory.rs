//! In-process object store used by tests and `tidal simulate`.
//!
//! Parts travel over a [`SimulatedLink`], a fluid model of a shared uplink:
//! the link bandwidth is split evenly across active transmissions, optionally
//! capped per stream. Faults can be queued per part number to exercise retry
//! and zombie handling.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{MultipartUpload, ObjectStore};
use crate::chunk::{CompletedPart, StoreLimits};
use crate::errors::{TransferError, TransferResult};
use crate::units;

const SLICE: Duration = Duration::from_millis(50);

pub struct SimulatedLink {
    /// Total link capacity, bytes per second.
    bandwidth: Mutex<f64>,
    /// Ceiling for a single transmission, bytes per second.
    per_stream: Mutex<Option<f64>>,
    active: AtomicUsize,
}

impl SimulatedLink {
    pub fn new(bandwidth_mbps: f64) -> Self {
        Self {
            bandwidth: Mutex::new(units::bytes_per_sec_from_mbps(bandwidth_mbps)),
            per_stream: Mutex::new(None),
            active: AtomicUsize::new(0),
        }
    }

    /// Cap every transmission at `mib_per_sec`, like a latency-bound TCP stream.
    pub fn with_per_stream_limit(self, mib_per_sec: f64) -> Self {
        *self.per_stream.lock() = Some(units::bytes_per_sec_from_mib(mib_per_sec));
        self
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Sleep for as long as `bytes` take to cross the link.
    pub async fn transmit(&self, bytes: u64) {
        self.transmit_capped(bytes, None).await;
    }

    /// Like [`transmit`](Self::transmit) with an extra per-call ceiling in
    /// bytes per second.
    pub async fn transmit_capped(&self, bytes: u64, cap: Option<f64>) {
        let _slot = ActiveSlot::enter(&self.active);
        let mut sent = 0.0_f64;
        let total = bytes as f64;
        while sent < total {
            let rate = self.current_rate(cap);
            if rate <= 0.0 {
                tokio::time::sleep(SLICE).await;
                continue;
            }
            let left = total - sent;
            let slice_bytes = rate * SLICE.as_secs_f64();
            if left <= slice_bytes {
                tokio::time::sleep(Duration::from_secs_f64(left / rate)).await;
                break;
            }
            tokio::time::sleep(SLICE).await;
            sent += slice_bytes;
        }
    }

    fn current_rate(&self, cap: Option<f64>) -> f64 {
        let active = self.active.load(Ordering::Relaxed).max(1) as f64;
        let mut rate = *self.bandwidth.lock() / active;
        if let Some(limit) = *self.per_stream.lock() {
            rate = rate.min(limit);
        }
        if let Some(limit) = cap {
            rate = rate.min(limit);
        }
        rate
    }
}

/// Counts a transmission as active until dropped, including on cancellation.
struct ActiveSlot<'a>(&'a AtomicUsize);

impl<'a> ActiveSlot<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for ActiveSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Failure injected into the next attempt of a part.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fault {
    /// The store answers 503.
    Transient,
    /// The store answers 403.
    Reject,
    /// The attempt crawls at the given MiB/s.
    Stall { mib_per_sec: f64 },
}

#[derive(Debug, Clone)]
struct StoredPart {
    etag: String,
    digest: [u8; 16],
    len: u64,
    data: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct OpenUpload {
    key: String,
    parts: BTreeMap<u32, StoredPart>,
}

/// An assembled object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub size: u64,
    pub etag: String,
    pub parts: u32,
    pub data: Option<Vec<u8>>,
}

#[derive(Default)]
struct MemoryState {
    next_upload: u64,
    uploads: HashMap<String, OpenUpload>,
    objects: HashMap<String, StoredObject>,
    faults: HashMap<u32, VecDeque<Fault>>,
    attempts: HashMap<u32, u32>,
    completions: Vec<(String, Vec<CompletedPart>)>,
    aborts: Vec<String>,
}

pub struct MemoryStore {
    link: Option<Arc<SimulatedLink>>,
    limits: StoreLimits,
    retain_data: bool,
    request_latency: Duration,
    state: Mutex<MemoryState>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            link: None,
            limits: StoreLimits::default(),
            retain_data: false,
            request_latency: Duration::ZERO,
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn with_link(mut self, link: Arc<SimulatedLink>) -> Self {
        self.link = Some(link);
        self
    }

    pub fn with_limits(mut self, limits: StoreLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Keep part bodies so assembled objects can be compared byte for byte.
    pub fn retain_data(mut self, retain: bool) -> Self {
        self.retain_data = retain;
        self
    }

    /// Fixed round-trip latency added to every request.
    pub fn with_request_latency(mut self, latency: Duration) -> Self {
        self.request_latency = latency;
        self
    }

    /// Queue a fault for the next not-yet-faulted attempt of `part_number`.
    pub fn inject(&self, part_number: u32, fault: Fault) {
        self.state
            .lock()
            .faults
            .entry(part_number)
            .or_default()
            .push_back(fault);
    }

    pub fn part_attempts(&self, part_number: u32) -> u32 {
        self.state
            .lock()
            .attempts
            .get(&part_number)
            .copied()
            .unwrap_or(0)
    }

    /// Part lists passed to completion calls, in call order.
    pub fn completions(&self) -> Vec<(String, Vec<CompletedPart>)> {
        self.state.lock().completions.clone()
    }

    pub fn aborts(&self) -> Vec<String> {
        self.state.lock().aborts.clone()
    }

    pub fn open_uploads(&self) -> usize {
        self.state.lock().uploads.len()
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.state.lock().objects.get(key).cloned()
    }

    async fn round_trip(&self) {
        if !self.request_latency.is_zero() {
            tokio::time::sleep(self.request_latency).await;
        }
    }

    async fn carry(&self, bytes: u64, cap_mib: Option<f64>) {
        let cap = cap_mib.map(units::bytes_per_sec_from_mib);
        match &self.link {
            Some(link) => link.transmit_capped(bytes, cap).await,
            None => {
                if let Some(rate) = cap {
                    tokio::time::sleep(Duration::from_secs_f64(bytes as f64 / rate)).await;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn initiate_multipart(&self, key: &str, _content_type: &str) -> TransferResult<MultipartUpload> {
        self.round_trip().await;
        let mut state = self.state.lock();
        state.next_upload += 1;
        let upload_id = format!("mem-{}", state.next_upload);
        state.uploads.insert(
            upload_id.clone(),
            OpenUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(MultipartUpload {
            key: key.to_string(),
            upload_id,
        })
    }

    async fn upload_part(
        &self,
        upload: &MultipartUpload,
        part_number: u32,
        body: Vec<u8>,
    ) -> TransferResult<String> {
        let fault = {
            let mut state = self.state.lock();
            if !state.uploads.contains_key(&upload.upload_id) {
                return Err(TransferError::fatal(format!(
                    "NoSuchUpload: {}",
                    upload.upload_id
                )));
            }
            *state.attempts.entry(part_number).or_default() += 1;
            state
                .faults
                .get_mut(&part_number)
                .and_then(VecDeque::pop_front)
        };

        let len = body.len() as u64;
        if len > self.limits.max_part_bytes {
            return Err(TransferError::fatal(format!(
                "EntityTooLarge: part {} is {} bytes",
                part_number, len
            )));
        }

        self.round_trip().await;
        match fault {
            Some(Fault::Transient) => {
                self.carry(len / 2, None).await;
                return Err(TransferError::retryable("503 Service Unavailable (injected)"));
            }
            Some(Fault::Reject) => {
                return Err(TransferError::fatal("403 Forbidden (injected)"));
            }
            Some(Fault::Stall { mib_per_sec }) => self.carry(len, Some(mib_per_sec)).await,
            None => self.carry(len, None).await,
        }

        let digest = md5::compute(&body);
        let etag = format!("\"{:x}\"", digest);
        let stored = StoredPart {
            etag: etag.clone(),
            digest: digest.0,
            len,
            data: self.retain_data.then_some(body),
        };

        let mut state = self.state.lock();
        match state.uploads.get_mut(&upload.upload_id) {
            Some(open) => {
                open.parts.insert(part_number, stored);
                Ok(etag)
            }
            None => Err(TransferError::fatal(format!(
                "NoSuchUpload: {} was aborted during part {}",
                upload.upload_id, part_number
            ))),
        }
    }

    async fn complete_multipart(
        &self,
        upload: &MultipartUpload,
        parts: &[CompletedPart],
    ) -> TransferResult<Option<String>> {
        self.round_trip().await;
        let mut state = self.state.lock();
        state
            .completions
            .push((upload.upload_id.clone(), parts.to_vec()));

        let open = state.uploads.get(&upload.upload_id).ok_or_else(|| {
            TransferError::fatal(format!("NoSuchUpload: {}", upload.upload_id))
        })?;
        if parts.is_empty() {
            return Err(TransferError::fatal("MalformedXML: no parts listed"));
        }
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(TransferError::fatal("InvalidPartOrder"));
        }

        let mut size = 0u64;
        let mut digests = Vec::with_capacity(parts.len() * 16);
        let mut data = self.retain_data.then(Vec::new);
        for (index, part) in parts.iter().enumerate() {
            let stored = open.parts.get(&part.part_number).ok_or_else(|| {
                TransferError::fatal(format!("InvalidPart: {} was never uploaded", part.part_number))
            })?;
            if stored.etag != part.etag {
                return Err(TransferError::fatal(format!(
                    "InvalidPart: ETag mismatch for part {}",
                    part.part_number
                )));
            }
            let is_last = index + 1 == parts.len();
            if !is_last && stored.len < self.limits.min_part_bytes {
                return Err(TransferError::fatal(format!(
                    "EntityTooSmall: part {} is {} bytes",
                    part.part_number, stored.len
                )));
            }
            size += stored.len;
            digests.extend_from_slice(&stored.digest);
            if let (Some(buf), Some(bytes)) = (data.as_mut(), stored.data.as_ref()) {
                buf.extend_from_slice(bytes);
            }
        }

        let key = open.key.clone();
        let etag = format!("\"{:x}-{}\"", md5::compute(&digests), parts.len());
        state.uploads.remove(&upload.upload_id);
        state.objects.insert(
            key.clone(),
            StoredObject {
                key: key.clone(),
                size,
                etag,
                parts: parts.len() as u32,
                data,
            },
        );
        Ok(Some(format!("memory://{}", key)))
    }

    async fn abort_multipart(&self, upload: &MultipartUpload) -> TransferResult<()> {
        self.round_trip().await;
        let mut state = self.state.lock();
        state.aborts.push(upload.upload_id.clone());
        state.uploads.remove(&upload.upload_id);
        Ok(())
    }

    fn limits(&self) -> StoreLimits {
        self.limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::MIB;

    #[tokio::test(start_paused = true)]
    async fn link_shares_bandwidth_between_streams() {
        // 80 Mbps = 10 MiB/s shared by two streams -> 5 MiB/s each.
        let link = Arc::new(SimulatedLink::new(80.0));
        let started = tokio::time::Instant::now();
        let a = {
            let link = Arc::clone(&link);
            tokio::spawn(async move { link.transmit(10 * MIB).await })
        };
        let b = {
            let link = Arc::clone(&link);
            tokio::spawn(async move { link.transmit(10 * MIB).await })
        };
        a.await.unwrap();
        b.await.unwrap();
        let elapsed = started.elapsed().as_secs_f64();
        assert!((1.9..=2.2).contains(&elapsed), "elapsed {elapsed}");
        assert_eq!(link.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn per_stream_limit_caps_single_transfer() {
        let link = SimulatedLink::new(800.0).with_per_stream_limit(2.0);
        let started = tokio::time::Instant::now();
        link.transmit(4 * MIB).await;
        let elapsed = started.elapsed().as_secs_f64();
        assert!((1.9..=2.1).contains(&elapsed), "elapsed {elapsed}");
    }

    #[tokio::test]
    async fn assembles_parts_with_multipart_etag() {
        let store = MemoryStore::new().retain_data(true);
        let upload = store.initiate_multipart("obj", "application/octet-stream").await.unwrap();
        let first = vec![1u8; (5 * MIB) as usize];
        let second = vec![2u8; 10];
        let e1 = store.upload_part(&upload, 1, first.clone()).await.unwrap();
        let e2 = store.upload_part(&upload, 2, second.clone()).await.unwrap();
        assert_eq!(e1, format!("\"{:x}\"", md5::compute(&first)));

        let location = store
            .complete_multipart(
                &upload,
                &[
                    CompletedPart { part_number: 1, etag: e1 },
                    CompletedPart { part_number: 2, etag: e2 },
                ],
            )
            .await
            .unwrap();
        assert_eq!(location.as_deref(), Some("memory://obj"));

        let object = store.object("obj").unwrap();
        assert_eq!(object.size, 5 * MIB + 10);
        assert!(object.etag.ends_with("-2\""));
        let mut expected = first;
        expected.extend_from_slice(&second);
        assert_eq!(object.data.unwrap(), expected);
        assert_eq!(store.open_uploads(), 0);
    }

    #[tokio::test]
    async fn rejects_unsorted_or_small_parts() {
        let store = MemoryStore::new();
        let upload = store.initiate_multipart("obj", "x").await.unwrap();
        let e1 = store.upload_part(&upload, 1, vec![0u8; 10]).await.unwrap();
        let e2 = store.upload_part(&upload, 2, vec![0u8; 10]).await.unwrap();

        let unsorted = [
            CompletedPart { part_number: 2, etag: e2.clone() },
            CompletedPart { part_number: 1, etag: e1.clone() },
        ];
        assert!(store.complete_multipart(&upload, &unsorted).await.is_err());

        let small = [
            CompletedPart { part_number: 1, etag: e1 },
            CompletedPart { part_number: 2, etag: e2 },
        ];
        let err = store.complete_multipart(&upload, &small).await.unwrap_err();
        assert!(err.message.contains("EntityTooSmall"));
    }

    #[tokio::test]
    async fn injected_faults_apply_to_successive_attempts() {
        let store = MemoryStore::new();
        let upload = store.initiate_multipart("obj", "x").await.unwrap();
        store.inject(1, Fault::Transient);
        store.inject(1, Fault::Reject);

        let first = store.upload_part(&upload, 1, vec![0u8; 4]).await.unwrap_err();
        assert!(first.should_retry(3));
        let second = store.upload_part(&upload, 1, vec![0u8; 4]).await.unwrap_err();
        assert!(!second.should_retry(3));
        assert!(store.upload_part(&upload, 1, vec![0u8; 4]).await.is_ok());
        assert_eq!(store.part_attempts(1), 3);
    }

    #[tokio::test]
    async fn abort_discards_upload() {
        let store = MemoryStore::new();
        let upload = store.initiate_multipart("obj", "x").await.unwrap();
        store.abort_multipart(&upload).await.unwrap();
        assert_eq!(store.aborts(), vec![upload.upload_id.clone()]);
        assert!(store.upload_part(&upload, 1, vec![1]).await.is_err());
        assert!(store.object("obj").is_none());
    }
}
