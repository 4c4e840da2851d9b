//! Local filesystem `StorageBackend` (§4.1), used by the CLI binary and the
//! integration tests. Grounded on `StorageEngine::new`'s open-by-path
//! pattern, substituting a plain data directory for a RocksDB handle.

use super::backend::{ByteRange, CasOutcome, ObjectStat, StorageBackend};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::sync::Mutex;

/// A filesystem-backed `StorageBackend`.
///
/// Real remotes (S3, WebDAV) provide server-assigned ETags and real CAS; a
/// single local filesystem has neither, so this implementation falls back
/// to a `<mtime_nanos>-<size>` ETag (§4.1) and serializes `atomic_update`
/// through an internal mutex to give CAS its compare-then-write semantics
/// within one process. Across processes this is best-effort, not a
/// guarantee — two processes racing a rename within the same mtime tick
/// could both observe a stale-but-matching etag.
pub struct FileSystemBackend {
    root: PathBuf,
    cas_lock: Mutex<()>,
}

impl FileSystemBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cas_lock: Mutex::new(()),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    async fn stat_path(path: &Path) -> StorageResult<Option<ObjectStat>> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => {
                let mtime_nanos = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_nanos())
                    .unwrap_or(0);
                let size = meta.len();
                Ok(Some(ObjectStat {
                    etag: format!("{mtime_nanos}-{size}"),
                    size,
                    last_modified: meta
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                        .map(|d| d.as_millis() as i64),
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

#[async_trait]
impl StorageBackend for FileSystemBackend {
    async fn read(&self, path: &str, range: Option<ByteRange>) -> StorageResult<Vec<u8>> {
        let full = self.resolve(path);
        let bytes = tokio::fs::read(&full).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(path.to_string())
            } else {
                StorageError::Io(e)
            }
        })?;

        match range {
            None => Ok(bytes),
            Some(r) => {
                let start = r.start as usize;
                let end = (r.end as usize).min(bytes.len());
                if start > bytes.len() || start > end {
                    return Err(StorageError::RangeNotSatisfiable {
                        path: path.to_string(),
                        offset: r.start,
                        offset_end: r.end,
                    });
                }
                Ok(bytes[start..end].to_vec())
            }
        }
    }

    async fn stat(&self, path: &str) -> StorageResult<Option<ObjectStat>> {
        Self::stat_path(&self.resolve(path)).await
    }

    async fn atomic_update(
        &self,
        path: &str,
        bytes: &[u8],
        previous_etag: Option<&str>,
    ) -> StorageResult<CasOutcome> {
        let _guard = self.cas_lock.lock().await;
        let full = self.resolve(path);

        let current = Self::stat_path(&full).await?;
        let current_etag = current.as_ref().map(|s| s.etag.as_str());
        if current_etag != previous_etag {
            return Ok(CasOutcome::Conflict);
        }

        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = full.with_extension(format!(
            "tmp-{}",
            uuid::Uuid::new_v4().simple().to_string()
        ));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &full).await?;

        let new_stat = Self::stat_path(&full)
            .await?
            .ok_or_else(|| StorageError::Backend("write vanished immediately".to_string()))?;
        Ok(CasOutcome::Success {
            new_etag: new_stat.etag,
        })
    }

    async fn write(&self, path: &str, bytes: &[u8]) -> StorageResult<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        match options.open(&full).await {
            Ok(mut file) => {
                use tokio::io::AsyncWriteExt;
                file.write_all(bytes).await?;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(StorageError::AlreadyExists(path.to_string()))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        match tokio::fs::remove_file(self.resolve(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn list(&self, directory: &str) -> StorageResult<Vec<String>> {
        let full = self.resolve(directory);
        let mut entries = match tokio::fs::read_dir(&full).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::Io(e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    async fn ensure_directory(&self, directory: &str) -> StorageResult<()> {
        tokio::fs::create_dir_all(self.resolve(directory)).await?;
        Ok(())
    }
}
