//! Object-store collaborator: the multipart primitives the engine consumes and
//! the sources that supply part bodies.

use std::ops::Range;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::chunk::{CompletedPart, StoreLimits};
use crate::errors::{TransferError, TransferResult};

pub mod memory;
pub mod presigned;

pub use memory::{MemoryStore, SimulatedLink};
pub use presigned::PresignedStore;

/// An open multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartUpload {
    pub key: String,
    pub upload_id: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Opens a multipart upload for `key`.
    async fn initiate_multipart(&self, key: &str, content_type: &str) -> TransferResult<MultipartUpload>;

    /// Uploads one part and returns its ETag. Part numbers are 1-based.
    async fn upload_part(
        &self,
        upload: &MultipartUpload,
        part_number: u32,
        body: Vec<u8>,
    ) -> TransferResult<String>;

    /// Assembles the object from `parts`, which must be sorted by part number.
    /// Returns the object location when the store reports one.
    async fn complete_multipart(
        &self,
        upload: &MultipartUpload,
        parts: &[CompletedPart],
    ) -> TransferResult<Option<String>>;

    /// Discards the upload and any parts already stored.
    async fn abort_multipart(&self, upload: &MultipartUpload) -> TransferResult<()>;

    fn limits(&self) -> StoreLimits {
        StoreLimits::default()
    }
}

/// Supplies the bytes of the object being uploaded.
#[async_trait]
pub trait PartSource: Send + Sync {
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads exactly `range` from the source.
    async fn read_range(&self, range: Range<u64>) -> TransferResult<Vec<u8>>;
}

/// Reads parts straight from a file on disk; each read opens its own handle
/// so parts can be read concurrently.
pub struct FilePartSource {
    path: PathBuf,
    len: u64,
}

impl FilePartSource {
    pub async fn open(path: &Path) -> TransferResult<Self> {
        let metadata = tokio::fs::metadata(path).await.map_err(|err| {
            TransferError::with_io(&err, format!("stat {}: {}", path.display(), err))
        })?;
        if !metadata.is_file() {
            return Err(TransferError::fatal(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            len: metadata.len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PartSource for FilePartSource {
    fn len(&self) -> u64 {
        self.len
    }

    async fn read_range(&self, range: Range<u64>) -> TransferResult<Vec<u8>> {
        let io_err = |err: std::io::Error| {
            TransferError::with_io(&err, format!("read {}: {}", self.path.display(), err))
        };
        let mut file = tokio::fs::File::open(&self.path).await.map_err(io_err)?;
        file.seek(std::io::SeekFrom::Start(range.start))
            .await
            .map_err(io_err)?;
        let mut buf = vec![0u8; (range.end - range.start) as usize];
        file.read_exact(&mut buf).await.map_err(io_err)?;
        Ok(buf)
    }
}

/// Deterministic generated content of a fixed length, for simulations.
pub struct SyntheticSource {
    len: u64,
}

impl SyntheticSource {
    pub fn new(len: u64) -> Self {
        Self { len }
    }
}

#[async_trait]
impl PartSource for SyntheticSource {
    fn len(&self) -> u64 {
        self.len
    }

    async fn read_range(&self, range: Range<u64>) -> TransferResult<Vec<u8>> {
        if range.end > self.len {
            return Err(TransferError::no_retry(format!(
                "range {}..{} beyond synthetic length {}",
                range.start, range.end, self.len
            )));
        }
        Ok(range.map(|offset| (offset % 251) as u8).collect())
    }
}

/// An in-memory buffer used as the object body.
pub struct BytesSource {
    data: Vec<u8>,
}

impl BytesSource {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

#[async_trait]
impl PartSource for BytesSource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_range(&self, range: Range<u64>) -> TransferResult<Vec<u8>> {
        self.data
            .get(range.start as usize..range.end as usize)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                TransferError::no_retry(format!(
                    "range {}..{} beyond buffer length {}",
                    range.start,
                    range.end,
                    self.data.len()
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn file_source_reads_exact_ranges() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789abcdef").unwrap();
        file.flush().unwrap();

        let source = FilePartSource::open(file.path()).await.unwrap();
        assert_eq!(source.len(), 16);
        assert_eq!(source.read_range(4..8).await.unwrap(), b"4567");
        assert_eq!(source.read_range(12..16).await.unwrap(), b"cdef");
    }

    #[tokio::test]
    async fn file_source_short_read_is_not_retried() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"short").unwrap();
        file.flush().unwrap();

        let source = FilePartSource::open(file.path()).await.unwrap();
        let err = source.read_range(0..64).await.unwrap_err();
        assert_eq!(err.category, crate::errors::ErrorCategory::NoRetry);
    }

    #[tokio::test]
    async fn missing_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = FilePartSource::open(&dir.path().join("absent.bin"))
            .await
            .err()
            .unwrap();
        assert_eq!(err.category, crate::errors::ErrorCategory::Fatal);
    }

    #[tokio::test]
    async fn synthetic_source_is_deterministic() {
        let source = SyntheticSource::new(1000);
        let first = source.read_range(250..260).await.unwrap();
        let again = source.read_range(250..260).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(first[1], 0);
        assert!(source.read_range(990..1001).await.is_err());
    }
}
