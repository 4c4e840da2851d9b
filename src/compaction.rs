//! Tiered compaction: merge a level's shards into one shard at the next
//! level once a level holds at least `compaction_threshold` files (§4.7).

use crate::config::ClxConfig;
use crate::crypto::CryptoEnvelope;
use crate::database::DatabaseBackend;
use crate::error::{ClxError, ClxResult};
use crate::manifest_store::ManifestManager;
use crate::model::manifest::ShardFileInfo;
use crate::model::Document;
use crate::shard_manager::ShardManager;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::info;

pub struct CompactionEngine {
    database: Arc<dyn DatabaseBackend>,
    manifest: Arc<ManifestManager>,
    shards: Arc<ShardManager>,
    config: ClxConfig,
}

impl CompactionEngine {
    pub fn new(
        database: Arc<dyn DatabaseBackend>,
        manifest: Arc<ManifestManager>,
        shards: Arc<ShardManager>,
        config: ClxConfig,
    ) -> Self {
        Self {
            database,
            manifest,
            shards,
            config,
        }
    }

    /// Pick the lowest non-terminal level that has reached the compaction
    /// threshold, if any (§4.7 step 1).
    fn select_level(&self, shard_files: &[ShardFileInfo]) -> Option<u8> {
        let mut counts: HashMap<u8, usize> = HashMap::new();
        for shard in shard_files {
            if shard.level < self.config.max_shard_level {
                *counts.entry(shard.level).or_insert(0) += 1;
            }
        }
        counts
            .into_iter()
            .filter(|(_, count)| *count >= self.config.compaction_threshold)
            .map(|(level, _)| level)
            .min()
    }

    /// Merge every alive document across a set of shards into one document
    /// per id, keeping the newest copy, then dropping tombstones older than
    /// `max_sync_age_days` (§4.7 step 2; the same rule vacuum uses for
    /// terminal-level rewrites). Cross-checks each merged id against the
    /// local database: a pending local write for that id drops it from the
    /// merged set entirely (compaction waits for the next push to settle
    /// it), and a local seq ahead of the merged header seq is an invariant
    /// violation — the gate in `compact_once` should have caught it first.
    async fn merge_alive_documents(
        &self,
        filenames: &[String],
        crypto: &CryptoEnvelope,
        now_ms: i64,
    ) -> ClxResult<Vec<Document>> {
        let mut merged: HashMap<String, Document> = HashMap::new();
        for filename in filenames {
            for document in self.shards.fetch_documents(filename, crypto, None).await? {
                let id = document.id.clone();
                let winner = crate::sync::merge_to_latest_document(document, merged.get(&id));
                merged.insert(id, winner);
            }
        }

        let mut checked = Vec::with_capacity(merged.len());
        for (id, document) in merged {
            if let Some(local) = self.database.read(&id).await? {
                match local.seq {
                    None => continue,
                    Some(local_seq) if local_seq > document.seq.unwrap_or(0) => {
                        return Err(ClxError::Transient(format!(
                            "local seq {local_seq} for {id} is ahead of compaction's merged seq"
                        )));
                    }
                    Some(_) => {}
                }
            }
            checked.push(document);
        }

        let max_age_ms = self.config.max_sync_age_days as i64 * 24 * 60 * 60 * 1000;
        Ok(checked
            .into_iter()
            .filter(|d| !(d.del && now_ms.saturating_sub(d.at) > max_age_ms))
            .collect())
    }

    /// Run one compaction pass: select a level, merge it, and CAS the
    /// manifest to swap the merged-away shards for the single merged shard
    /// (§4.7). No-op if no level has reached the threshold, or if any local
    /// document has a pending (not-yet-pushed) change.
    pub async fn compact_once(&self, crypto: &CryptoEnvelope, now_ms: i64) -> ClxResult<bool> {
        if !self.database.read_pending_ids().await?.is_empty() {
            return Ok(false);
        }

        let manifest = self
            .manifest
            .cached()
            .ok_or_else(|| crate::error::ClxError::Transient("manifest not loaded".to_string()))?;

        let Some(level) = self.select_level(&manifest.shard_files) else {
            return Ok(false);
        };

        let targets: Vec<String> = manifest
            .shard_files
            .iter()
            .filter(|s| s.level == level)
            .map(|s| s.filename.clone())
            .collect();

        info!(level, count = targets.len(), "compacting shard level");

        let merged_documents = self.merge_alive_documents(&targets, crypto, now_ms).await?;
        if merged_documents.is_empty() {
            // Every document in this level was an expired tombstone; drop
            // the shards from the manifest without writing a replacement.
            let target_set: HashSet<String> = targets.iter().cloned().collect();
            self.manifest
                .update(crypto, now_ms, &move |m| {
                    m.shard_files.retain(|s| !target_set.contains(&s.filename));
                    Ok(())
                })
                .await?;
            return Ok(true);
        }

        let new_shard = self.shards.write_shard(&merged_documents, crypto).await?;

        let target_set: HashSet<String> = targets.into_iter().collect();
        let new_shard_for_delta = new_shard.clone();
        self.manifest
            .update(crypto, now_ms, &move |m| {
                m.shard_files.retain(|s| !target_set.contains(&s.filename));
                if !m.shard_files.iter().any(|s| s.filename == new_shard_for_delta.filename) {
                    m.shard_files.push(new_shard_for_delta.clone());
                }
                Ok(())
            })
            .await?;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheStore;
    use crate::database::InMemoryDatabase;
    use crate::storage::FileSystemBackend;
    use serde_json::json;

    async fn setup() -> (CompactionEngine, CryptoEnvelope, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FileSystemBackend::new(dir.path()));
        let cache = Arc::new(InMemoryCacheStore::new());
        let database: Arc<dyn DatabaseBackend> = Arc::new(InMemoryDatabase::new());
        let mut config = ClxConfig::default();
        config.compaction_threshold = 2;

        let manifest = Arc::new(ManifestManager::new(backend.clone(), config.clone()));
        let shards = Arc::new(ShardManager::new(backend, cache, config.clone()));
        let crypto = CryptoEnvelope::disabled();
        manifest.load("db-1", &crypto).await.unwrap();

        (
            CompactionEngine::new(database, manifest, shards, config),
            crypto,
            dir,
        )
    }

    #[tokio::test]
    async fn test_no_compaction_below_threshold() {
        let (engine, crypto, _dir) = setup().await;
        let docs = vec![Document {
            id: "a".into(),
            at: 1,
            seq: Some(1),
            del: false,
            data: Some(json!({"v": 1})),
        }];
        let info = engine.shards.write_shard(&docs, &crypto).await.unwrap();
        engine
            .manifest
            .update(&crypto, 0, &move |m| {
                m.shard_files.push(info.clone());
                m.last_sequence = 1;
                Ok(())
            })
            .await
            .unwrap();

        let ran = engine.compact_once(&crypto, 1000).await.unwrap();
        assert!(!ran);
    }

    #[tokio::test]
    async fn test_compacts_level_at_threshold_into_next_level() {
        let (engine, crypto, _dir) = setup().await;

        for i in 0..2u64 {
            let docs = vec![Document {
                id: format!("doc-{i}"),
                at: 1,
                seq: Some(i + 1),
                del: false,
                data: Some(json!({"v": i})),
            }];
            let info = engine.shards.write_shard(&docs, &crypto).await.unwrap();
            engine
                .manifest
                .update(&crypto, 0, &move |m| {
                    m.shard_files.push(info.clone());
                    m.last_sequence = m.last_sequence.max(i + 1);
                    Ok(())
                })
                .await
                .unwrap();
        }

        let ran = engine.compact_once(&crypto, 1000).await.unwrap();
        assert!(ran);

        let manifest = engine.manifest.cached().unwrap();
        assert_eq!(manifest.shard_files.len(), 1);
        // Level is derived from the merged shard's actual encoded size
        // (§3, §4.7), not bumped a fixed tier; two tiny documents land well
        // below the level-0/level-1 size threshold.
        assert_eq!(manifest.shard_files[0].level, 0);

        let merged = engine
            .shards
            .fetch_documents(&manifest.shard_files[0].filename, &crypto, None)
            .await
            .unwrap();
        assert_eq!(merged.len(), 2);
    }

    #[tokio::test]
    async fn test_skips_when_pending_local_changes_exist() {
        let (engine, crypto, _dir) = setup().await;

        for i in 0..2u64 {
            let docs = vec![Document {
                id: format!("doc-{i}"),
                at: 1,
                seq: Some(i + 1),
                del: false,
                data: Some(json!({"v": i})),
            }];
            let info = engine.shards.write_shard(&docs, &crypto).await.unwrap();
            engine
                .manifest
                .update(&crypto, 0, &move |m| {
                    m.shard_files.push(info.clone());
                    m.last_sequence = m.last_sequence.max(i + 1);
                    Ok(())
                })
                .await
                .unwrap();
        }

        engine.database.upsert("untouched", json!({"v": "new"}), 10).await.unwrap();

        let ran = engine.compact_once(&crypto, 1000).await.unwrap();
        assert!(!ran);
        assert_eq!(engine.manifest.cached().unwrap().shard_files.len(), 2);
    }

    #[tokio::test]
    async fn test_compaction_drops_expired_tombstones_entirely() {
        let (engine, crypto, _dir) = setup().await;
        let very_old_at = 0;

        for i in 0..2u64 {
            let docs = vec![Document {
                id: format!("doc-{i}"),
                at: very_old_at,
                seq: Some(i + 1),
                del: true,
                data: None,
            }];
            let info = engine.shards.write_shard(&docs, &crypto).await.unwrap();
            engine
                .manifest
                .update(&crypto, 0, &move |m| {
                    m.shard_files.push(info.clone());
                    m.last_sequence = m.last_sequence.max(i + 1);
                    Ok(())
                })
                .await
                .unwrap();
        }

        let far_future_ms = 1_000 * 24 * 60 * 60 * 1000_i64 * 1000;
        let ran = engine.compact_once(&crypto, far_future_ms).await.unwrap();
        assert!(ran);
        assert!(engine.manifest.cached().unwrap().shard_files.is_empty());
    }
}
