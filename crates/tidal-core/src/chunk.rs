//! Chunk bookkeeping: byte-range planning, per-chunk lifecycle and the
//! object store's multipart limits.

use std::ops::Range;

use eyre::{bail, Result};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::units::{GIB, MIB};

/// Multipart limits imposed by the object store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    /// Smallest allowed part, except for the last one.
    pub min_part_bytes: u64,
    pub max_part_bytes: u64,
    pub max_parts: u32,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            min_part_bytes: 5 * MIB,
            max_part_bytes: 5 * GIB,
            max_parts: 10_000,
        }
    }
}

impl StoreLimits {
    /// Largest object these limits can describe.
    pub fn max_object_bytes(&self) -> u64 {
        self.max_part_bytes.saturating_mul(self.max_parts as u64)
    }
}

/// Clamp a requested chunk size so the remaining bytes still fit in the parts
/// the store has left.
///
/// `parts_planned` is the number of parts already carved out of the file.
pub fn clamp_chunk_size(
    requested: u64,
    remaining_bytes: u64,
    parts_planned: u32,
    limits: &StoreLimits,
) -> u64 {
    let parts_left = limits.max_parts.saturating_sub(parts_planned).max(1) as u64;
    let floor = remaining_bytes.div_ceil(parts_left);
    requested
        .clamp(limits.min_part_bytes, limits.max_part_bytes)
        .max(floor)
        .min(limits.max_part_bytes)
}

/// Lifecycle of one chunk. Each attempt moves `Pending -> InFlight` and then
/// to `Completed` or `Failed`; a failed attempt that will be retried goes back
/// to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    Pending,
    InFlight,
    Completed,
    Failed,
    Aborted,
}

#[derive(Debug, Clone)]
pub struct ChunkRecord {
    /// 1-based part number.
    pub ordinal: u32,
    pub range: Range<u64>,
    pub state: ChunkState,
    pub started_at: Option<Instant>,
    /// Bytes per second of the successful attempt.
    pub speed: Option<f64>,
    pub retries: u8,
    /// Attempts cancelled for crawling; not charged against the retry bound.
    pub restarts: u8,
    pub etag: Option<String>,
}

impl ChunkRecord {
    pub fn new(ordinal: u32, range: Range<u64>) -> Self {
        Self {
            ordinal,
            range,
            state: ChunkState::Pending,
            started_at: None,
            speed: None,
            retries: 0,
            restarts: 0,
            etag: None,
        }
    }

    pub fn len(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Attempts made before the current one, whatever ended them.
    pub fn attempt(&self) -> u8 {
        self.retries.saturating_add(self.restarts)
    }

    pub fn begin_attempt(&mut self, now: Instant) -> Result<()> {
        if self.state != ChunkState::Pending {
            bail!("part {} cannot start from state {:?}", self.ordinal, self.state);
        }
        self.state = ChunkState::InFlight;
        self.started_at = Some(now);
        Ok(())
    }

    pub fn complete(&mut self, etag: String, speed: f64) -> Result<()> {
        if self.state != ChunkState::InFlight {
            bail!("part {} cannot complete from state {:?}", self.ordinal, self.state);
        }
        self.state = ChunkState::Completed;
        self.etag = Some(etag);
        self.speed = Some(speed);
        Ok(())
    }

    pub fn fail(&mut self) -> Result<()> {
        if self.state != ChunkState::InFlight {
            bail!("part {} cannot fail from state {:?}", self.ordinal, self.state);
        }
        self.state = ChunkState::Failed;
        Ok(())
    }

    /// Put a failed attempt back in the queue.
    pub fn requeue(&mut self) -> Result<()> {
        if self.state != ChunkState::Failed {
            bail!("part {} cannot be re-queued from state {:?}", self.ordinal, self.state);
        }
        self.state = ChunkState::Pending;
        self.started_at = None;
        self.retries = self.retries.saturating_add(1);
        Ok(())
    }

    /// Put a zombie-cancelled attempt back in the queue without using up a retry.
    pub fn restart(&mut self) -> Result<()> {
        if self.state != ChunkState::Failed {
            bail!("part {} cannot be restarted from state {:?}", self.ordinal, self.state);
        }
        self.state = ChunkState::Pending;
        self.started_at = None;
        self.restarts = self.restarts.saturating_add(1);
        Ok(())
    }

    /// Mark the chunk as abandoned by a cancelled or failed session.
    pub fn abort(&mut self) {
        if self.state != ChunkState::Completed {
            self.state = ChunkState::Aborted;
        }
    }
}

/// Carves a file into chunks lazily, using whatever chunk size is current
/// when the next chunk is admitted.
#[derive(Debug)]
pub struct ChunkPlanner {
    total: u64,
    next_offset: u64,
    planned: u32,
    limits: StoreLimits,
}

impl ChunkPlanner {
    pub fn new(total: u64, limits: StoreLimits) -> Result<Self> {
        if total > limits.max_object_bytes() {
            bail!(
                "object of {} bytes exceeds the store limit of {} parts x {} bytes",
                total,
                limits.max_parts,
                limits.max_part_bytes
            );
        }
        Ok(Self {
            total,
            next_offset: 0,
            planned: 0,
            limits,
        })
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn planned(&self) -> u32 {
        self.planned
    }

    pub fn remaining(&self) -> u64 {
        self.total - self.next_offset
    }

    pub fn is_exhausted(&self) -> bool {
        if self.total == 0 {
            self.planned > 0
        } else {
            self.next_offset >= self.total
        }
    }

    /// Clamp `requested` against what is left of the file.
    pub fn effective_chunk_size(&self, requested: u64) -> u64 {
        clamp_chunk_size(requested, self.remaining(), self.planned, &self.limits)
    }

    /// Plan the next chunk, or `None` once the whole file is covered.
    /// An empty file yields a single empty chunk.
    pub fn next_chunk(&mut self, requested: u64) -> Option<ChunkRecord> {
        if self.is_exhausted() {
            return None;
        }
        let size = self.effective_chunk_size(requested);
        let start = self.next_offset;
        let end = start + size.min(self.remaining());
        self.next_offset = end;
        self.planned += 1;
        Some(ChunkRecord::new(self.planned, start..end))
    }
}

/// Part identifier handed to the store's completion call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Sort completed parts by ordinal; completion order is irrelevant.
pub fn ordered_parts(mut parts: Vec<CompletedPart>) -> Vec<CompletedPart> {
    parts.sort_by_key(|part| part.part_number);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn planner_covers_file_in_order() {
        let mut planner = ChunkPlanner::new(12 * MIB + 7, StoreLimits::default()).unwrap();
        let mut chunks = Vec::new();
        while let Some(chunk) = planner.next_chunk(5 * MIB) {
            chunks.push(chunk);
        }
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].ordinal, 1);
        assert_eq!(chunks[0].range, 0..5 * MIB);
        assert_eq!(chunks[2].range, 10 * MIB..12 * MIB + 7);
    }

    #[test]
    fn chunk_size_changes_apply_to_later_chunks_only() {
        let mut planner = ChunkPlanner::new(30 * MIB, StoreLimits::default()).unwrap();
        let first = planner.next_chunk(5 * MIB).unwrap();
        let second = planner.next_chunk(20 * MIB).unwrap();
        assert_eq!(first.len(), 5 * MIB);
        assert_eq!(second.range, 5 * MIB..25 * MIB);
    }

    #[test]
    fn empty_file_yields_single_empty_part() {
        let mut planner = ChunkPlanner::new(0, StoreLimits::default()).unwrap();
        let only = planner.next_chunk(8 * MIB).unwrap();
        assert_eq!(only.ordinal, 1);
        assert!(only.is_empty());
        assert!(planner.next_chunk(8 * MIB).is_none());
    }

    #[test]
    fn clamp_enforces_part_count_limit() {
        let limits = StoreLimits::default();
        // 100 GiB with 5 MiB parts would need 20,480 parts.
        let size = clamp_chunk_size(5 * MIB, 100 * GIB, 0, &limits);
        assert!(100 * GIB / size <= 10_000);
        assert!(size >= limits.min_part_bytes);
    }

    #[test]
    fn clamp_respects_min_and_max() {
        let limits = StoreLimits::default();
        assert_eq!(clamp_chunk_size(MIB, GIB, 0, &limits), 5 * MIB);
        assert_eq!(clamp_chunk_size(10 * GIB, 20 * GIB, 0, &limits), 5 * GIB);
    }

    #[test]
    fn rejects_oversized_objects() {
        let limits = StoreLimits::default();
        assert!(ChunkPlanner::new(limits.max_object_bytes() + 1, limits).is_err());
    }

    #[test]
    fn restart_does_not_use_up_retries() {
        let now = Instant::now();
        let mut chunk = ChunkRecord::new(3, 0..10);
        assert!(chunk.restart().is_err());
        chunk.begin_attempt(now).unwrap();
        chunk.fail().unwrap();
        chunk.restart().unwrap();
        assert_eq!(chunk.state, ChunkState::Pending);
        assert_eq!((chunk.retries, chunk.restarts, chunk.attempt()), (0, 1, 1));
        chunk.begin_attempt(now).unwrap();
        chunk.fail().unwrap();
        chunk.requeue().unwrap();
        assert_eq!(chunk.attempt(), 2);
    }

    #[test]
    fn lifecycle_transitions_once_per_attempt() {
        let now = Instant::now();
        let mut chunk = ChunkRecord::new(1, 0..10);
        chunk.begin_attempt(now).unwrap();
        assert!(chunk.begin_attempt(now).is_err());
        chunk.fail().unwrap();
        chunk.requeue().unwrap();
        assert_eq!(chunk.retries, 1);
        chunk.begin_attempt(now).unwrap();
        chunk.complete("etag".into(), 1024.0).unwrap();
        assert!(chunk.fail().is_err());
        chunk.abort();
        assert_eq!(chunk.state, ChunkState::Completed);
    }

    proptest! {
        #[test]
        fn completed_parts_sorted_regardless_of_completion_order(
            order in (1u32..200).prop_flat_map(|n| Just((1..=n).collect::<Vec<u32>>()).prop_shuffle())
        ) {
            let parts: Vec<CompletedPart> = order
                .iter()
                .map(|n| CompletedPart { part_number: *n, etag: format!("etag-{n}") })
                .collect();
            let sorted = ordered_parts(parts);
            for (index, part) in sorted.iter().enumerate() {
                prop_assert_eq!(part.part_number, index as u32 + 1);
                prop_assert_eq!(&part.etag, &format!("etag-{}", index + 1));
            }
        }

        #[test]
        fn planned_chunks_respect_store_limits(
            total in 0u64..(200 * GIB),
            sizes in proptest::collection::vec(1u64..(6 * GIB), 1..8),
        ) {
            let limits = StoreLimits::default();
            let mut planner = ChunkPlanner::new(total, limits).unwrap();
            let mut covered = 0u64;
            let mut count = 0u32;
            let mut index = 0usize;
            while let Some(chunk) = planner.next_chunk(sizes[index % sizes.len()]) {
                index += 1;
                count += 1;
                prop_assert_eq!(chunk.range.start, covered);
                prop_assert!(chunk.len() <= limits.max_part_bytes);
                if chunk.range.end < total {
                    prop_assert!(chunk.len() >= limits.min_part_bytes);
                }
                covered = chunk.range.end;
            }
            prop_assert_eq!(covered, total);
            prop_assert!(count <= limits.max_parts);
        }
    }
}
