//! The sync engine: pull, push, and the scheduler that drives them (§4.6,
//! §5, §9).

use super::merge::merge_to_latest_document;
use super::state::{SyncEvent, SyncState};
use crate::cache::{CacheStore, LAST_SEQUENCE_KEY};
use crate::config::ClxConfig;
use crate::crypto::CryptoEnvelope;
use crate::database::DatabaseBackend;
use crate::error::{ClxError, ClxResult, ManifestError};
use crate::manifest_store::ManifestManager;
use crate::model::manifest::ShardFileInfo;
use crate::model::Document;
use crate::pool::run_bounded;
use crate::shard_manager::ShardManager;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Orchestrates pull (remote -> local) and push (local -> remote) against
/// the manifest and shard files, with no coordinator beyond the manifest's
/// own compare-and-swap (§2, §4.6).
pub struct SyncEngine {
    database: Arc<dyn DatabaseBackend>,
    manifest: Arc<ManifestManager>,
    shards: Arc<ShardManager>,
    cache: Arc<dyn CacheStore>,
    config: ClxConfig,
    state: RwLock<SyncState>,
    local_sequence: AtomicU64,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncEngine {
    pub fn new(
        database: Arc<dyn DatabaseBackend>,
        manifest: Arc<ManifestManager>,
        shards: Arc<ShardManager>,
        cache: Arc<dyn CacheStore>,
        config: ClxConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            database,
            manifest,
            shards,
            cache,
            config,
            state: RwLock::new(SyncState::Idle),
            local_sequence: AtomicU64::new(0),
            events,
        }
    }

    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
        let _ = self.events.send(SyncEvent::StateChanged(state));
    }

    async fn load_local_sequence(&self) -> u64 {
        if let Some(bytes) = self.cache.get(LAST_SEQUENCE_KEY).await {
            if let Ok(text) = std::str::from_utf8(&bytes) {
                if let Ok(seq) = text.parse::<u64>() {
                    self.local_sequence.store(seq, Ordering::SeqCst);
                    return seq;
                }
            }
        }
        self.local_sequence.load(Ordering::SeqCst)
    }

    async fn save_local_sequence(&self, seq: u64) {
        self.local_sequence.store(seq, Ordering::SeqCst);
        self.cache
            .set(LAST_SEQUENCE_KEY, seq.to_string().into_bytes())
            .await;
    }

    /// Pull: diff the manifest against the local watermark, fetch every
    /// shard with newer sequences (bounded concurrency), and merge each
    /// document into the local database (§4.6 pull steps 1-5).
    pub async fn pull(&self, crypto: &CryptoEnvelope, now_ms: i64) -> ClxResult<usize> {
        self.set_state(SyncState::Syncing);

        let result = self.pull_inner(crypto, now_ms).await;
        match &result {
            Ok(applied) => {
                let _ = self.events.send(SyncEvent::PullCompleted { applied: *applied });
                // A no-op pull (nothing past the local watermark) must not
                // be observable as a change (§4.6 pull step 7, §8 invariant 5).
                if *applied > 0 {
                    let _ = self.events.send(SyncEvent::DocumentsChanged { applied: *applied });
                }
                self.set_state(SyncState::Idle);
            }
            Err(e) => {
                let _ = self.events.send(SyncEvent::Error(e.to_string()));
                self.set_state(SyncState::Offline);
            }
        }
        result
    }

    async fn pull_inner(&self, crypto: &CryptoEnvelope, now_ms: i64) -> ClxResult<usize> {
        let db_uuid = self
            .manifest
            .cached()
            .map(|m| m.uuid)
            .unwrap_or_else(|| "local".to_string());
        let manifest = self.manifest.load(&db_uuid, crypto).await?;
        let local_sequence = self.load_local_sequence().await;

        let to_scan: Vec<ShardFileInfo> = manifest
            .shards_to_scan(local_sequence)
            .into_iter()
            .cloned()
            .collect();

        let shards = self.shards.clone();
        let mut tasks: Vec<std::pin::Pin<Box<dyn std::future::Future<Output = ClxResult<Vec<Document>>> + Send + '_>>> =
            Vec::with_capacity(to_scan.len());
        for shard in to_scan {
            let shards = shards.clone();
            // A shard whose range starts at or below the watermark has
            // already been partly scanned; only its newer entries are
            // fetched. A shard that starts above it is wholly new.
            if local_sequence >= shard.range.min {
                let header = shards.fetch_header(&shard.filename, crypto).await?;
                let newer: Vec<_> = header
                    .docs
                    .iter()
                    .filter(|e| e.seq > local_sequence)
                    .cloned()
                    .collect();
                if newer.is_empty() {
                    continue;
                }
                tasks.push(Box::pin(async move {
                    shards
                        .fetch_documents(&shard.filename, crypto, Some(&newer))
                        .await
                }));
            } else {
                tasks.push(Box::pin(async move {
                    shards.fetch_documents(&shard.filename, crypto, None).await
                }));
            }
        }

        let (batches, first_error) = run_bounded(self.config.fetch_concurrency, tasks).await;
        if let Some(e) = first_error {
            return Err(e);
        }

        let mut applied = 0;
        for document in batches.into_iter().flatten() {
            applied += self.apply_pulled_document(document).await?;
        }

        self.save_local_sequence(manifest.last_sequence).await;
        Ok(applied)
    }

    async fn apply_pulled_document(&self, document: Document) -> ClxResult<usize> {
        let existing = self.database.read(&document.id).await?;
        let winner = merge_to_latest_document(document, existing.as_ref());
        let applied = self.database.replicate(winner).await?;
        Ok(if applied { 1 } else { 0 })
    }

    /// Push: pull first (§9 Open Question: minimizes, though cannot fully
    /// eliminate, wasted CAS attempts under concurrent writers), then assign
    /// sequence numbers to every pending local document from the current
    /// manifest snapshot, write them as one new shard, and CAS the manifest.
    /// A conflict triggers a fresh pull and a full retry with renumbered
    /// sequences and a freshly written shard; the shard from an abandoned
    /// attempt is left as an unreferenced orphan for the grace-period
    /// collector to reclaim (§4.6 push steps 1-4, §4.9).
    pub async fn push(&self, crypto: &CryptoEnvelope, now_ms: i64) -> ClxResult<usize> {
        self.set_state(SyncState::Syncing);
        let result = self.push_inner(crypto, now_ms).await;
        match &result {
            Ok(pushed) => {
                let _ = self.events.send(SyncEvent::PushCompleted { pushed: *pushed });
                self.set_state(SyncState::Idle);
            }
            Err(e) => {
                let _ = self.events.send(SyncEvent::Error(e.to_string()));
                self.set_state(SyncState::Offline);
            }
        }
        result
    }

    async fn push_inner(&self, crypto: &CryptoEnvelope, now_ms: i64) -> ClxResult<usize> {
        self.pull(crypto, now_ms).await?;

        let pending_ids = self.database.read_pending_ids().await?;
        if pending_ids.is_empty() {
            return Ok(0);
        }
        let mut documents = Vec::with_capacity(pending_ids.len());
        for id in &pending_ids {
            if let Some(document) = self.database.read(id).await? {
                documents.push(document);
            }
        }
        if documents.is_empty() {
            return Ok(0);
        }

        let max_attempts = self.config.max_cas_retries;
        for attempt in 0..max_attempts {
            let manifest = self
                .manifest
                .cached()
                .ok_or_else(|| ClxError::Transient("manifest not loaded".to_string()))?;
            let expected_previous = manifest.last_sequence;
            let start_seq = expected_previous + 1;

            let assigned: Vec<Document> = documents
                .iter()
                .cloned()
                .enumerate()
                .map(|(i, d)| d.with_seq(start_seq + i as u64))
                .collect();
            let new_last_sequence = start_seq + assigned.len() as u64 - 1;

            let new_shard = self.shards.write_shard(&assigned, crypto).await?;
            let new_shard_for_delta = new_shard.clone();

            let outcome = self
                .manifest
                .update(crypto, now_ms, &move |m| {
                    if m.last_sequence != expected_previous {
                        return Err(ClxError::Transient(
                            "manifest sequence advanced since assignment".to_string(),
                        ));
                    }
                    m.last_sequence = new_last_sequence;
                    m.shard_files.push(new_shard_for_delta.clone());
                    Ok(())
                })
                .await;

            match outcome {
                Ok(_) => {
                    for (id, document) in pending_ids.iter().zip(assigned.iter()) {
                        self.database
                            .mark_synced(id, document.seq.expect("just assigned"))
                            .await?;
                    }
                    self.save_local_sequence(new_last_sequence).await;
                    return Ok(assigned.len());
                }
                Err(ClxError::Transient(_)) if attempt + 1 < max_attempts => {
                    info!(attempt, "push lost the CAS race, refetching and retrying");
                    self.pull_inner(crypto, now_ms).await?;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Err(ManifestError::UpdateConflict(max_attempts).into())
    }

    /// Run a full pull-then-push cycle, the unit of work the scheduler
    /// re-invokes on a timer (§4.6, §9).
    pub async fn trigger_sync(&self, crypto: &CryptoEnvelope, now_ms: i64) -> ClxResult<(usize, usize)> {
        let applied = self.pull(crypto, now_ms).await?;
        let pushed = self.push(crypto, now_ms).await?;
        Ok((applied, pushed))
    }

    /// Spawn the periodic sync loop. `crypto` is shared so the same envelope
    /// used for interactive reads/writes drives the background task.
    pub fn spawn_scheduler(
        self: Arc<Self>,
        crypto: Arc<CryptoEnvelope>,
        now_ms_fn: impl Fn() -> i64 + Send + Sync + 'static,
    ) -> tokio::task::JoinHandle<()> {
        let interval = self.config.sync_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let now_ms = now_ms_fn();
                if let Err(e) = self.trigger_sync(&crypto, now_ms).await {
                    error!(error = %e, "scheduled sync failed");
                }
            }
        })
    }
}
