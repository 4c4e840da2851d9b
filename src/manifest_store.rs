//! Manifest manager: cached read plus the CAS update loop (§4.4, §7).

use crate::config::ClxConfig;
use crate::crypto::CryptoEnvelope;
use crate::error::{ClxError, ClxResult, CodecError, ManifestError};
use crate::model::manifest::Manifest;
use crate::storage::{CasOutcome, StorageBackend};
use parking_lot::RwLock;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Well-known path of the single manifest object in the remote (§3, §6).
pub const MANIFEST_PATH: &str = "manifest.json";

/// A caller-supplied mutation applied to a freshly-fetched manifest copy
/// before each CAS attempt (§4.4). An `Err` return aborts the whole update
/// without retrying — reserved for mutations that are invalid regardless of
/// races, not for conflicts (those are handled by the retry loop itself).
pub type DeltaFn<'a> = dyn Fn(&mut Manifest) -> ClxResult<()> + Send + Sync + 'a;

struct Cached {
    manifest: Manifest,
    etag: Option<String>,
}

/// Owns the manifest's single writable copy for this process and serializes
/// updates against the backend via compare-and-swap (§4.4).
///
/// No coordinator is assumed: every writer races every other writer's CAS
/// attempt, and conflicts are resolved by refetching and reapplying the
/// delta, not by locking (§2, §4.4).
pub struct ManifestManager {
    backend: Arc<dyn StorageBackend>,
    config: ClxConfig,
    cached: RwLock<Option<Cached>>,
}

impl ManifestManager {
    pub fn new(backend: Arc<dyn StorageBackend>, config: ClxConfig) -> Self {
        Self {
            backend,
            config,
            cached: RwLock::new(None),
        }
    }

    /// Fetch the remote manifest, or synthesize a fresh empty one if none
    /// exists yet, verify its signature, and populate the cache (§4.4 init).
    pub async fn load(&self, db_uuid: &str, crypto: &CryptoEnvelope) -> ClxResult<Manifest> {
        match self.backend.stat(MANIFEST_PATH).await? {
            None => {
                let manifest = Manifest::empty(db_uuid.to_string());
                *self.cached.write() = Some(Cached {
                    manifest: manifest.clone(),
                    etag: None,
                });
                Ok(manifest)
            }
            Some(stat) => {
                let bytes = self.backend.read(MANIFEST_PATH, None).await?;
                let manifest: Manifest =
                    serde_json::from_slice(&bytes).map_err(CodecError::from)?;
                if !manifest.is_well_formed() {
                    return Err(ClxError::FormatInvalid(
                        "manifest failed well-formedness check".to_string(),
                    ));
                }
                crypto.verify_manifest(&manifest)?;
                *self.cached.write() = Some(Cached {
                    manifest: manifest.clone(),
                    etag: Some(stat.etag),
                });
                Ok(manifest)
            }
        }
    }

    /// The last manifest this process observed, without touching the backend.
    pub fn cached(&self) -> Option<Manifest> {
        self.cached.read().as_ref().map(|c| c.manifest.clone())
    }

    /// Apply `delta` to the current manifest and CAS-write it, refetching
    /// and retrying on conflict with exponential jittered backoff, up to
    /// `config.max_cas_retries` attempts (§4.4, §7).
    pub async fn update(
        &self,
        crypto: &CryptoEnvelope,
        now_ms: i64,
        delta: &DeltaFn<'_>,
    ) -> ClxResult<Manifest> {
        if self.cached.read().is_none() {
            return Err(ClxError::FormatInvalid(
                "manifest not loaded; call load() before update()".to_string(),
            ));
        }

        let max_attempts = self.config.max_cas_retries;
        for attempt in 0..max_attempts {
            let (mut manifest, etag) = {
                let guard = self.cached.read();
                let cached = guard.as_ref().expect("checked above");
                (cached.manifest.clone(), cached.etag.clone())
            };

            delta(&mut manifest)?;
            normalize_shard_files(&mut manifest);
            crypto.finalize_manifest(&mut manifest, now_ms)?;
            let bytes = serde_json::to_vec(&manifest).map_err(CodecError::from)?;

            match self
                .backend
                .atomic_update(MANIFEST_PATH, &bytes, etag.as_deref())
                .await?
            {
                CasOutcome::Success { new_etag } => {
                    *self.cached.write() = Some(Cached {
                        manifest: manifest.clone(),
                        etag: Some(new_etag),
                    });
                    return Ok(manifest);
                }
                CasOutcome::Conflict => {
                    warn!(attempt, "manifest CAS conflict, refetching before retry");
                    self.refresh(crypto).await?;
                    if attempt + 1 < max_attempts {
                        tokio::time::sleep(backoff_duration(attempt)).await;
                    }
                }
            }
        }

        Err(ManifestError::UpdateConflict(max_attempts).into())
    }

    async fn refresh(&self, crypto: &CryptoEnvelope) -> ClxResult<()> {
        match self.backend.stat(MANIFEST_PATH).await? {
            None => {
                *self.cached.write() = None;
            }
            Some(stat) => {
                let bytes = self.backend.read(MANIFEST_PATH, None).await?;
                let manifest: Manifest =
                    serde_json::from_slice(&bytes).map_err(CodecError::from)?;
                crypto.verify_manifest(&manifest)?;
                *self.cached.write() = Some(Cached {
                    manifest,
                    etag: Some(stat.etag),
                });
            }
        }
        Ok(())
    }
}

/// §4.4 steps 4-5: `newShards = sort_by_range_min(dedup_by_filename(existing
/// ∪ added ∖ removed))`, then `lastSequence = max(old.lastSequence,
/// max(newShards.range.max))`. Delta closures only add/remove entries
/// (`retain` then `push`); they do not keep `shard_files` sorted or unique
/// themselves, so `update` enforces both invariants once, after every delta,
/// rather than trusting each caller to re-derive them. A duplicate filename
/// keeps its last occurrence, since callers always push the newest version
/// after retaining the old one out.
fn normalize_shard_files(manifest: &mut Manifest) {
    let mut seen = std::collections::HashSet::new();
    let mut deduped: Vec<_> = manifest
        .shard_files
        .drain(..)
        .rev()
        .filter(|s| seen.insert(s.filename.clone()))
        .collect();
    deduped.reverse();
    deduped.sort_by_key(|s| s.range.min);

    let max_range = deduped.iter().map(|s| s.range.max).max().unwrap_or(0);
    manifest.shard_files = deduped;
    manifest.last_sequence = manifest.last_sequence.max(max_range);
}

/// Exponential backoff with +/-25% jitter, base 100ms, factor 2, capped at
/// 10s (§4.4).
fn backoff_duration(attempt: u32) -> Duration {
    let base_ms = 100u64.saturating_mul(1u64 << attempt.min(16)).min(10_000);
    let jitter_frac: f64 = rand::thread_rng().gen_range(-0.25..=0.25);
    let jittered_ms = (base_ms as f64) * (1.0 + jitter_frac);
    Duration::from_millis(jittered_ms.max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileSystemBackend;

    fn manager() -> (ManifestManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FileSystemBackend::new(dir.path()));
        let manager = ManifestManager::new(backend, ClxConfig::default());
        (manager, dir)
    }

    #[tokio::test]
    async fn test_load_synthesizes_empty_manifest_when_absent() {
        let (manager, _dir) = manager();
        let crypto = CryptoEnvelope::disabled();
        let manifest = manager.load("db-1", &crypto).await.unwrap();
        assert_eq!(manifest.uuid, "db-1");
        assert_eq!(manifest.last_sequence, 0);
    }

    #[tokio::test]
    async fn test_update_requires_load_first() {
        let (manager, _dir) = manager();
        let crypto = CryptoEnvelope::disabled();
        let result = manager.update(&crypto, 0, &|_m| Ok(())).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_update_persists_delta_and_bumps_sequence() {
        let (manager, _dir) = manager();
        let crypto = CryptoEnvelope::disabled();
        manager.load("db-1", &crypto).await.unwrap();

        let updated = manager
            .update(&crypto, 1000, &|m| {
                m.last_sequence += 1;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(updated.last_sequence, 1);
        assert_eq!(manager.cached().unwrap().last_sequence, 1);
    }

    #[tokio::test]
    async fn test_two_independent_managers_both_converge_via_retry() {
        let dir = tempfile::tempdir().unwrap();
        let backend_a = Arc::new(FileSystemBackend::new(dir.path()));
        let backend_b = Arc::new(FileSystemBackend::new(dir.path()));
        let manager_a = ManifestManager::new(backend_a, ClxConfig::default());
        let manager_b = ManifestManager::new(backend_b, ClxConfig::default());
        let crypto = CryptoEnvelope::disabled();

        manager_a.load("db-1", &crypto).await.unwrap();
        manager_b.load("db-1", &crypto).await.unwrap();

        manager_a
            .update(&crypto, 1, &|m| {
                m.last_sequence += 1;
                Ok(())
            })
            .await
            .unwrap();

        // manager_b's cached etag is now stale; its update must refetch and
        // retry rather than fail outright.
        let result = manager_b
            .update(&crypto, 2, &|m| {
                m.last_sequence += 1;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(result.last_sequence, 2);
    }

    #[tokio::test]
    async fn test_delta_error_aborts_without_retry() {
        let (manager, _dir) = manager();
        let crypto = CryptoEnvelope::disabled();
        manager.load("db-1", &crypto).await.unwrap();

        let result = manager
            .update(&crypto, 0, &|_m| {
                Err(ClxError::UserPreconditionFailed("bad delta".to_string()))
            })
            .await;
        assert!(matches!(result, Err(ClxError::UserPreconditionFailed(_))));
    }

    #[tokio::test]
    async fn test_update_keeps_shard_files_sorted_when_rewriting_a_low_range_shard() {
        use crate::model::manifest::{SequenceRange, ShardFileInfo};

        // Mirrors what vacuum/compaction do: retain a low-range shard out,
        // then push its rewritten replacement. If `update` didn't re-sort,
        // the replacement would land after a higher-range shard that was
        // never touched, breaking the manifest's sortedness invariant and
        // wedging the next `load`.
        let (manager, _dir) = manager();
        let crypto = CryptoEnvelope::disabled();
        manager.load("db-1", &crypto).await.unwrap();

        let terminal = ShardFileInfo {
            filename: "shard_t.clx".to_string(),
            level: 6,
            range: SequenceRange { min: 1, max: 1 },
        };
        let pending = ShardFileInfo {
            filename: "shard_p.clx".to_string(),
            level: 0,
            range: SequenceRange { min: 20, max: 20 },
        };
        manager
            .update(&crypto, 0, &{
                let terminal = terminal.clone();
                let pending = pending.clone();
                move |m| {
                    m.shard_files.push(terminal.clone());
                    m.shard_files.push(pending.clone());
                    m.last_sequence = 20;
                    Ok(())
                }
            })
            .await
            .unwrap();

        let rewritten = ShardFileInfo {
            filename: "shard_t2.clx".to_string(),
            level: 6,
            range: SequenceRange { min: 1, max: 1 },
        };
        let terminal_filename = terminal.filename.clone();
        let updated = manager
            .update(&crypto, 0, &move |m| {
                m.shard_files.retain(|s| s.filename != terminal_filename);
                m.shard_files.push(rewritten.clone());
                Ok(())
            })
            .await
            .unwrap();

        assert!(updated.is_well_formed());
        let names: Vec<_> = updated.shard_files.iter().map(|s| s.filename.as_str()).collect();
        assert_eq!(names, vec!["shard_t2.clx", "shard_p.clx"]);
    }
}
