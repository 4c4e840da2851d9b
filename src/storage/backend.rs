//! Storage capability contract (§4.1).
//!
//! Every mutating/caching component in ClxDB talks to the remote only
//! through this trait. S3, WebDAV, and OPFS drivers are variants
//! implementing the same contract; no inheritance, matching SPEC_FULL's
//! "dynamic dispatch over storage drivers" design note.

use crate::error::StorageResult;
use async_trait::async_trait;

/// Inclusive-start, exclusive-end byte range for a partial read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Metadata about a stored object. `etag` must distinguish content versions
/// (HTTP ETag, S3 ETag, or a `<mtime>-<size>` fallback) (§4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStat {
    pub etag: String,
    pub size: u64,
    pub last_modified: Option<i64>,
}

/// Outcome of a compare-and-swap write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    Success { new_etag: String },
    Conflict,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read a file, optionally restricted to a byte range. Missing file or
    /// out-of-bounds range fails with `StorageError::NotFound` /
    /// `RangeNotSatisfiable`.
    async fn read(&self, path: &str, range: Option<ByteRange>) -> StorageResult<Vec<u8>>;

    /// `None` on absence; never errors for a missing file.
    async fn stat(&self, path: &str) -> StorageResult<Option<ObjectStat>>;

    /// Write iff the stored ETag equals `previous_etag` (`None` means "must
    /// not already exist"). Returns `CasOutcome::Conflict` rather than an
    /// error on mismatch; any other failure propagates.
    async fn atomic_update(
        &self,
        path: &str,
        bytes: &[u8],
        previous_etag: Option<&str>,
    ) -> StorageResult<CasOutcome>;

    /// Create-only; fails with `StorageError::AlreadyExists` if present.
    /// Shards are content-addressed, so a collision implies byte-identical
    /// contents — callers absorb the error by checking `stat` (§4.1, §4.5).
    async fn write(&self, path: &str, bytes: &[u8]) -> StorageResult<()>;

    /// Idempotent; a missing file is success.
    async fn delete(&self, path: &str) -> StorageResult<()>;

    /// Flat list of filenames directly inside `directory`.
    async fn list(&self, directory: &str) -> StorageResult<Vec<String>>;

    /// Idempotent directory creation.
    async fn ensure_directory(&self, directory: &str) -> StorageResult<()>;
}
