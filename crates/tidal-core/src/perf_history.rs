//! Local transfer history.
//!
//! Records a summary of every session to a capped JSONL file under the user's
//! config directory. The data stays on-device and can be disabled via
//! `TIDAL_DISABLE_PERF_HISTORY=1` or `[history] enabled = false`.

use std::collections::VecDeque;
use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::config_dir;
use crate::profile::ConnectionClass;

const DEFAULT_MAX_BYTES: u64 = 1_000_000; // ~1 MB
const DISABLE_ENV: &str = "TIDAL_DISABLE_PERF_HISTORY";
pub const HISTORY_FILE: &str = "transfers.jsonl";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// Summary of one session, written after it ends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferRecord {
    pub timestamp_epoch_ms: u128,
    pub profile: ConnectionClass,
    pub total_bytes: u64,
    pub parts: u32,
    pub duration_ms: u128,
    pub average_mbps: f64,
    pub final_parallelism: usize,
    pub final_chunk_bytes: u64,
    pub peak_mbps: Option<f64>,
    pub zombie_flags: u32,
    pub stall_events: u32,
    pub emergency_resets: u32,
    pub fallback_engaged: bool,
    pub outcome: TransferOutcome,
}

impl TransferRecord {
    pub fn timestamp_now() -> u128 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
    }
}

pub fn history_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(HISTORY_FILE))
}

pub fn perf_history_disabled() -> bool {
    env::var(DISABLE_ENV)
        .map(|val| val == "1" || val.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

pub fn append_record_to(path: &Path, record: &TransferRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!("failed to create transfer history directory {}", parent.display())
        })?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open transfer history file {}", path.display()))?;

    let line = serde_json::to_string(record).context("serialize transfer record")?;
    writeln!(file, "{line}").context("write transfer record")?;
    drop(file);

    enforce_size_cap(path, DEFAULT_MAX_BYTES)
}

pub fn read_recent_records(limit: usize) -> Result<Vec<TransferRecord>> {
    read_records_from(&history_path()?, limit)
}

/// The newest `limit` records in file order; `0` means all. Unparseable lines
/// are skipped.
pub fn read_records_from(path: &Path, limit: usize) -> Result<Vec<TransferRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path)
        .with_context(|| format!("failed to open transfer history file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut records = Vec::new();

    for line in reader.lines() {
        let Ok(line) = line else { continue };
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(record) = serde_json::from_str::<TransferRecord>(&line) {
            records.push(record);
        }
    }

    if limit == 0 || records.len() <= limit {
        return Ok(records);
    }

    let start = records.len().saturating_sub(limit);
    Ok(records[start..].to_vec())
}

/// Delete the history file. Returns whether there was one.
pub fn clear_history() -> Result<bool> {
    clear_history_at(&history_path()?)
}

pub fn clear_history_at(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err)
            .with_context(|| format!("failed to remove transfer history {}", path.display())),
    }
}

/// Best-effort rotation that prefers keeping the newest records over enforcing the cap exactly.
/// If a concurrent writer appends while we're trimming, we skip rotation to avoid data loss.
fn enforce_size_cap(path: &Path, max_bytes: u64) -> Result<()> {
    let metadata = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };

    if metadata.len() <= max_bytes {
        return Ok(());
    }

    let observed_len = metadata.len();

    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut lines: VecDeque<String> = reader
        .lines()
        .collect::<std::result::Result<Vec<String>, _>>()
        .context("read transfer history for rotation")?
        .into_iter()
        .filter(|line| !line.trim().is_empty())
        .collect();

    let mut total_size: usize = lines.iter().map(|l| l.len() + 1).sum();
    let mut trimmed = false;

    while lines.len() > 1 && total_size > max_bytes as usize {
        if let Some(front) = lines.pop_front() {
            total_size -= front.len() + 1;
            trimmed = true;
        }
    }

    if !trimmed {
        return Ok(());
    }

    // Another writer appended since we looked; try again on the next write.
    if fs::metadata(path)?.len() > observed_len {
        return Ok(());
    }

    let mut file = OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .context("truncate transfer history during rotation")?;

    for line in lines {
        writeln!(file, "{line}")?;
    }
    Ok(())
}
