//! Tombstone garbage collection for terminal-level shards: a small random
//! sample is checked each pass, and only shards whose reclaimable fraction
//! clears `vacuum_threshold` are rewritten (§4.8).

use crate::config::ClxConfig;
use crate::crypto::CryptoEnvelope;
use crate::error::ClxResult;
use crate::manifest_store::ManifestManager;
use crate::model::manifest::ShardFileInfo;
use crate::shard_manager::ShardManager;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::{debug, info};

pub struct VacuumEngine {
    manifest: Arc<ManifestManager>,
    shards: Arc<ShardManager>,
    config: ClxConfig,
}

impl VacuumEngine {
    pub fn new(manifest: Arc<ManifestManager>, shards: Arc<ShardManager>, config: ClxConfig) -> Self {
        Self {
            manifest,
            shards,
            config,
        }
    }

    /// Fisher-Yates shuffle the terminal-level shards and take the first
    /// `vacuum_count` as this pass's sample (§4.8 step 1).
    fn sample_terminal_shards(&self, shard_files: &[ShardFileInfo]) -> Vec<String> {
        let mut candidates: Vec<String> = shard_files
            .iter()
            .filter(|s| s.level == self.config.max_shard_level)
            .map(|s| s.filename.clone())
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(self.config.vacuum_count);
        candidates
    }

    /// Run one vacuum pass, rewriting each sampled shard whose expired-
    /// tombstone fraction meets `vacuum_threshold`. Returns the number of
    /// shards actually rewritten.
    pub async fn vacuum_once(&self, crypto: &CryptoEnvelope, now_ms: i64) -> ClxResult<usize> {
        let manifest = self
            .manifest
            .cached()
            .ok_or_else(|| crate::error::ClxError::Transient("manifest not loaded".to_string()))?;

        let sample = self.sample_terminal_shards(&manifest.shard_files);
        let max_age_ms = self.config.max_sync_age_days as i64 * 24 * 60 * 60 * 1000;
        let mut rewritten = 0;

        for filename in sample {
            let header = self.shards.fetch_header(&filename, crypto).await?;
            if header.docs.is_empty() {
                continue;
            }

            // Reclaim ratio is measured in bytes, not document count: a
            // shard dominated by one large live document and many tiny
            // expired tombstones should not be rewritten just because most
            // of its entries are tombstones.
            let original_len: u64 = header.docs.iter().map(|d| d.len).sum();
            let alive_len: u64 = header
                .docs
                .iter()
                .filter(|d| !(d.del && now_ms.saturating_sub(d.at) > max_age_ms))
                .map(|d| d.len)
                .sum();

            let ratio = if original_len == 0 {
                0.0
            } else {
                1.0 - (alive_len as f64 / original_len as f64)
            };
            debug!(filename = %filename, ratio, "vacuum candidate evaluated");

            // Skip when the rewrite would not recover enough space.
            if alive_len as f64 >= original_len as f64 * (1.0 - self.config.vacuum_threshold) {
                continue;
            }

            let alive_entries: Vec<_> = header
                .docs
                .iter()
                .filter(|d| !(d.del && now_ms.saturating_sub(d.at) > max_age_ms))
                .cloned()
                .collect();
            let alive = if alive_entries.is_empty() {
                Vec::new()
            } else {
                self.shards
                    .fetch_documents(&filename, crypto, Some(&alive_entries))
                    .await?
            };

            let old_filename = filename.clone();
            if alive.is_empty() {
                self.manifest
                    .update(crypto, now_ms, &move |m| {
                        m.shard_files.retain(|s| s.filename != old_filename);
                        Ok(())
                    })
                    .await?;
            } else {
                let new_shard = self
                    .shards
                    .write_shard(&alive, crypto)
                    .await?;
                self.manifest
                    .update(crypto, now_ms, &move |m| {
                        m.shard_files.retain(|s| s.filename != old_filename);
                        if !m.shard_files.iter().any(|s| s.filename == new_shard.filename) {
                            m.shard_files.push(new_shard.clone());
                        }
                        Ok(())
                    })
                    .await?;
            }

            info!(filename, ratio, "vacuumed shard");
            rewritten += 1;
        }

        Ok(rewritten)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheStore;
    use crate::model::Document;
    use crate::storage::FileSystemBackend;
    use serde_json::json;

    async fn setup() -> (VacuumEngine, CryptoEnvelope, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FileSystemBackend::new(dir.path()));
        let cache = Arc::new(InMemoryCacheStore::new());
        let mut config = ClxConfig::default();
        config.vacuum_threshold = 0.5;
        config.vacuum_count = 10;
        config.max_shard_level = 1;

        let manifest = Arc::new(ManifestManager::new(backend.clone(), config.clone()));
        let shards = Arc::new(ShardManager::new(backend, cache, config.clone()));
        let crypto = CryptoEnvelope::disabled();
        manifest.load("db-1", &crypto).await.unwrap();

        (VacuumEngine::new(manifest, shards, config), crypto, dir)
    }

    #[tokio::test]
    async fn test_skips_shard_below_threshold() {
        let (engine, crypto, _dir) = setup().await;
        let docs = vec![
            Document { id: "a".into(), at: 0, seq: Some(1), del: true, data: None },
            Document { id: "b".into(), at: 0, seq: Some(2), del: false, data: Some(json!({})) },
            Document { id: "c".into(), at: 0, seq: Some(3), del: false, data: Some(json!({})) },
        ];
        let info = engine.shards.write_shard(&docs, &crypto).await.unwrap();
        // Force terminal level regardless of the tiny test shard's actual
        // encoded size, so the sampler (which filters on level) picks it up.
        let info = ShardFileInfo { level: engine.config.max_shard_level, ..info };
        engine
            .manifest
            .update(&crypto, 0, &move |m| {
                m.shard_files.push(info.clone());
                m.last_sequence = 3;
                Ok(())
            })
            .await
            .unwrap();

        let far_future_ms = 1_000 * 24 * 60 * 60 * 1000_i64 * 1000;
        let rewritten = engine.vacuum_once(&crypto, far_future_ms).await.unwrap();
        assert_eq!(rewritten, 0);
    }

    #[tokio::test]
    async fn test_rewrites_shard_above_threshold() {
        let (engine, crypto, _dir) = setup().await;
        let docs = vec![
            Document { id: "a".into(), at: 0, seq: Some(1), del: true, data: None },
            Document { id: "b".into(), at: 0, seq: Some(2), del: true, data: None },
            Document { id: "c".into(), at: 0, seq: Some(3), del: false, data: Some(json!({})) },
        ];
        let info = engine.shards.write_shard(&docs, &crypto).await.unwrap();
        // Force terminal level regardless of the tiny test shard's actual
        // encoded size, so the sampler (which filters on level) picks it up.
        let info = ShardFileInfo { level: engine.config.max_shard_level, ..info };
        engine
            .manifest
            .update(&crypto, 0, &move |m| {
                m.shard_files.push(info.clone());
                m.last_sequence = 3;
                Ok(())
            })
            .await
            .unwrap();

        let far_future_ms = 1_000 * 24 * 60 * 60 * 1000_i64 * 1000;
        let rewritten = engine.vacuum_once(&crypto, far_future_ms).await.unwrap();
        assert_eq!(rewritten, 1);

        let manifest = engine.manifest.cached().unwrap();
        assert_eq!(manifest.shard_files.len(), 1);
        let remaining = engine
            .shards
            .fetch_documents(&manifest.shard_files[0].filename, &crypto, None)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "c");
    }

    #[tokio::test]
    async fn test_reclaim_ratio_is_measured_in_bytes_not_document_count() {
        // Many tiny expired tombstones alongside one large live document: by
        // document count tombstones are the majority, but by bytes they're
        // a small fraction of the shard, so the rewrite should be skipped.
        let (engine, crypto, _dir) = setup().await;
        let mut docs = vec![Document {
            id: "big".into(),
            at: 0,
            seq: Some(1),
            del: false,
            data: Some(json!({"payload": "x".repeat(500)})),
        }];
        for i in 0..5u64 {
            docs.push(Document {
                id: format!("tiny-{i}"),
                at: 0,
                seq: Some(i + 2),
                del: true,
                data: None,
            });
        }
        let info = engine.shards.write_shard(&docs, &crypto).await.unwrap();
        // Force terminal level regardless of the tiny test shard's actual
        // encoded size, so the sampler (which filters on level) picks it up.
        let info = ShardFileInfo { level: engine.config.max_shard_level, ..info };
        engine
            .manifest
            .update(&crypto, 0, &move |m| {
                m.shard_files.push(info.clone());
                m.last_sequence = 6;
                Ok(())
            })
            .await
            .unwrap();

        let far_future_ms = 1_000 * 24 * 60 * 60 * 1000_i64 * 1000;
        let rewritten = engine.vacuum_once(&crypto, far_future_ms).await.unwrap();
        assert_eq!(rewritten, 0);
    }

    #[tokio::test]
    async fn test_all_tombstones_expired_removes_shard_entirely() {
        let (engine, crypto, _dir) = setup().await;
        let docs = vec![
            Document { id: "a".into(), at: 0, seq: Some(1), del: true, data: None },
        ];
        let info = engine.shards.write_shard(&docs, &crypto).await.unwrap();
        // Force terminal level regardless of the tiny test shard's actual
        // encoded size, so the sampler (which filters on level) picks it up.
        let info = ShardFileInfo { level: engine.config.max_shard_level, ..info };
        engine
            .manifest
            .update(&crypto, 0, &move |m| {
                m.shard_files.push(info.clone());
                m.last_sequence = 1;
                Ok(())
            })
            .await
            .unwrap();

        let far_future_ms = 1_000 * 24 * 60 * 60 * 1000_i64 * 1000;
        engine.vacuum_once(&crypto, far_future_ms).await.unwrap();
        assert!(engine.manifest.cached().unwrap().shard_files.is_empty());
    }
}
