//! Error categorization for chunk retry handling.
//!
//! Chunk uploads fail in one of a few ways:
//! - Retryable: transient network or store failures that may succeed on retry
//! - Fatal: the store rejected the request and will keep rejecting it
//! - NoRetry: not worth repeating (e.g. the source file changed underneath us)
//! - Cancelled: the session was cancelled; never retried

use std::io;
use std::ops::Range;

/// Category of transfer error for retry decision-making.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transient error - retry may succeed (timeout, connection reset, 5xx, throttling)
    Retryable,
    /// Permanent error - retry will never succeed (auth failure, bad request, missing upload)
    Fatal,
    /// Not retried, but not a store failure either
    NoRetry,
    /// Session cancellation
    Cancelled,
}

/// Which chunk an error belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkContext {
    pub ordinal: u32,
    pub range: Range<u64>,
}

/// A transfer error with its category.
#[derive(Debug)]
pub struct TransferError {
    /// The underlying error message.
    pub message: String,
    /// The chunk that failed (if applicable).
    pub chunk: Option<ChunkContext>,
    /// The error category for retry decisions.
    pub category: ErrorCategory,
    /// Number of attempts made so far.
    pub attempts: u8,
}

impl TransferError {
    /// Create a new retryable transfer error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::with_category(message, ErrorCategory::Retryable)
    }

    /// Create a new fatal transfer error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::with_category(message, ErrorCategory::Fatal)
    }

    /// Create a new no-retry transfer error.
    pub fn no_retry(message: impl Into<String>) -> Self {
        Self::with_category(message, ErrorCategory::NoRetry)
    }

    /// The session was cancelled before it could finish.
    pub fn cancelled() -> Self {
        Self::with_category("transfer cancelled", ErrorCategory::Cancelled)
    }

    /// Wrap an IO error, choosing the category from its kind.
    pub fn with_io(err: &io::Error, message: impl Into<String>) -> Self {
        Self::with_category(message, categorize_io_error(err))
    }

    fn with_category(message: impl Into<String>, category: ErrorCategory) -> Self {
        Self {
            message: message.into(),
            chunk: None,
            category,
            attempts: 0,
        }
    }

    /// Attach the chunk this error originated from.
    pub fn for_chunk(mut self, ordinal: u32, range: Range<u64>) -> Self {
        self.chunk = Some(ChunkContext { ordinal, range });
        self
    }

    /// Check if this error should be retried.
    pub fn should_retry(&self, max_retries: u8) -> bool {
        self.category == ErrorCategory::Retryable && self.attempts < max_retries
    }

    /// Increment the attempt counter and return self for chaining.
    pub fn with_attempt(mut self) -> Self {
        self.attempts = self.attempts.saturating_add(1);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.category == ErrorCategory::Cancelled
    }
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref chunk) = self.chunk {
            write!(
                f,
                "part {} (bytes {}..{}): {}",
                chunk.ordinal, chunk.range.start, chunk.range.end, self.message
            )?;
        } else {
            write!(f, "{}", self.message)?;
        }
        if self.attempts > 1 {
            write!(f, " after {} attempts", self.attempts)?;
        }
        Ok(())
    }
}

impl std::error::Error for TransferError {}

/// Categorize an IO error for retry decisions.
pub fn categorize_io_error(err: &io::Error) -> ErrorCategory {
    match err.kind() {
        io::ErrorKind::TimedOut
        | io::ErrorKind::Interrupted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::WouldBlock => ErrorCategory::Retryable,

        io::ErrorKind::PermissionDenied
        | io::ErrorKind::NotFound
        | io::ErrorKind::InvalidData
        | io::ErrorKind::InvalidInput => ErrorCategory::Fatal,

        // A short read means the source shrank while we were uploading it.
        io::ErrorKind::UnexpectedEof => ErrorCategory::NoRetry,

        _ => ErrorCategory::Fatal,
    }
}

/// Categorize an HTTP status returned by the object store.
pub fn categorize_http_status(status: u16) -> ErrorCategory {
    match status {
        408 | 429 => ErrorCategory::Retryable,
        500..=599 => ErrorCategory::Retryable,
        _ => ErrorCategory::Fatal,
    }
}

/// Result type for chunk and session operations.
pub type TransferResult<T> = std::result::Result<T, TransferError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_error_should_retry() {
        let err = TransferError::retryable("connection reset");
        assert!(err.should_retry(3));
    }

    #[test]
    fn test_fatal_error_should_not_retry() {
        let err = TransferError::fatal("access denied");
        assert!(!err.should_retry(3));
    }

    #[test]
    fn test_cancelled_never_retries() {
        let err = TransferError::cancelled();
        assert!(err.is_cancelled());
        assert!(!err.should_retry(3));
    }

    #[test]
    fn test_retry_limit_exhausted() {
        let mut err = TransferError::retryable("timeout");
        err.attempts = 3;
        assert!(!err.should_retry(3));
    }

    #[test]
    fn test_display_includes_chunk_context() {
        let err = TransferError::fatal("bad digest")
            .for_chunk(7, 100..200)
            .with_attempt()
            .with_attempt();
        let text = err.to_string();
        assert!(text.contains("part 7"));
        assert!(text.contains("100..200"));
        assert!(text.contains("after 2 attempts"));
    }

    #[test]
    fn test_io_error_categorization() {
        let timeout = io::Error::new(io::ErrorKind::TimedOut, "timeout");
        assert_eq!(categorize_io_error(&timeout), ErrorCategory::Retryable);

        let perm = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(categorize_io_error(&perm), ErrorCategory::Fatal);

        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "short");
        assert_eq!(categorize_io_error(&eof), ErrorCategory::NoRetry);
    }

    #[test]
    fn test_http_status_categorization() {
        assert_eq!(categorize_http_status(503), ErrorCategory::Retryable);
        assert_eq!(categorize_http_status(429), ErrorCategory::Retryable);
        assert_eq!(categorize_http_status(403), ErrorCategory::Fatal);
        assert_eq!(categorize_http_status(404), ErrorCategory::Fatal);
    }
}
