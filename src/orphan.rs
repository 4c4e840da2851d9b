//! Orphan shard collection: delete files under the shard directory that no
//! manifest entry references, once they clear a grace period (§4.9, §8
//! invariant 7).
//!
//! The grace period exists because a shard can be written and then briefly
//! be unreferenced — another client's concurrent compaction raced the
//! manifest CAS and produced a different merged shard — before a later
//! read/retry picks it back up. Deleting on sight would delete data still
//! in flight.

use crate::config::ClxConfig;
use crate::manifest_store::ManifestManager;
use crate::storage::StorageBackend;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

const SHARD_DIR: &str = "shards";

pub struct OrphanCollector {
    backend: Arc<dyn StorageBackend>,
    manifest: Arc<ManifestManager>,
    config: ClxConfig,
}

impl OrphanCollector {
    pub fn new(backend: Arc<dyn StorageBackend>, manifest: Arc<ManifestManager>, config: ClxConfig) -> Self {
        Self {
            backend,
            manifest,
            config,
        }
    }

    /// List every shard file, subtract the ones the manifest still
    /// references, and delete whichever of the rest are older than
    /// `gc_grace_period`. A single file's stat/delete failure is logged and
    /// skipped rather than aborting the whole pass (§4.9).
    pub async fn collect_once(&self, now_ms: i64) -> usize {
        let Some(manifest) = self.manifest.cached() else {
            warn!("orphan collection skipped: manifest not loaded");
            return 0;
        };
        let referenced: HashSet<&str> = manifest
            .shard_files
            .iter()
            .map(|s| s.filename.as_str())
            .collect();

        let listed = match self.backend.list(SHARD_DIR).await {
            Ok(files) => files,
            Err(e) => {
                warn!(error = %e, "orphan collection: failed to list shard directory");
                return 0;
            }
        };

        let grace_ms = self.config.gc_grace_period.as_millis() as i64;
        let mut deleted = 0;

        for filename in listed {
            if referenced.contains(filename.as_str()) {
                continue;
            }

            let path = format!("{SHARD_DIR}/{filename}");
            let stat = match self.backend.stat(&path).await {
                Ok(Some(stat)) => stat,
                Ok(None) => continue,
                Err(e) => {
                    warn!(filename, error = %e, "orphan collection: stat failed, skipping");
                    continue;
                }
            };

            let old_enough = stat
                .last_modified
                .map(|lm| now_ms.saturating_sub(lm) > grace_ms)
                .unwrap_or(false);
            if !old_enough {
                continue;
            }

            match self.backend.delete(&path).await {
                Ok(()) => {
                    deleted += 1;
                }
                Err(e) => {
                    warn!(filename, error = %e, "orphan collection: delete failed, skipping");
                }
            }
        }

        deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CryptoEnvelope;
    use crate::model::manifest::{SequenceRange, ShardFileInfo};
    use crate::storage::FileSystemBackend;
    use std::time::Duration;

    async fn setup(grace: Duration) -> (OrphanCollector, Arc<FileSystemBackend>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FileSystemBackend::new(dir.path()));
        let mut config = ClxConfig::default();
        config.gc_grace_period = grace;

        let manifest = Arc::new(ManifestManager::new(backend.clone(), config.clone()));
        manifest.load("db-1", &CryptoEnvelope::disabled()).await.unwrap();

        (
            OrphanCollector::new(backend.clone(), manifest, config),
            backend,
            dir,
        )
    }

    #[tokio::test]
    async fn test_referenced_shard_is_never_deleted() {
        let (collector, backend, _dir) = setup(Duration::from_secs(0)).await;
        backend.ensure_directory(SHARD_DIR).await.unwrap();
        backend.write("shards/shard_a.clx", b"data").await.unwrap();
        collector
            .manifest
            .update(&CryptoEnvelope::disabled(), 0, &|m| {
                m.shard_files.push(ShardFileInfo {
                    filename: "shard_a.clx".to_string(),
                    level: 0,
                    range: SequenceRange { min: 1, max: 1 },
                });
                m.last_sequence = 1;
                Ok(())
            })
            .await
            .unwrap();

        let far_future_ms = i64::MAX / 2;
        let deleted = collector.collect_once(far_future_ms).await;
        assert_eq!(deleted, 0);
        assert!(backend.stat("shards/shard_a.clx").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unreferenced_shard_within_grace_period_survives() {
        let (collector, backend, _dir) = setup(Duration::from_secs(3600)).await;
        backend.ensure_directory(SHARD_DIR).await.unwrap();
        backend.write("shards/shard_orphan.clx", b"data").await.unwrap();

        let deleted = collector.collect_once(0).await;
        assert_eq!(deleted, 0);
        assert!(backend
            .stat("shards/shard_orphan.clx")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_unreferenced_shard_past_grace_period_is_deleted() {
        let (collector, backend, _dir) = setup(Duration::from_millis(0)).await;
        backend.ensure_directory(SHARD_DIR).await.unwrap();
        backend.write("shards/shard_orphan.clx", b"data").await.unwrap();

        let far_future_ms = i64::MAX / 2;
        let deleted = collector.collect_once(far_future_ms).await;
        assert_eq!(deleted, 1);
        assert!(backend
            .stat("shards/shard_orphan.clx")
            .await
            .unwrap()
            .is_none());
    }
}
