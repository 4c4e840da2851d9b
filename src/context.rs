//! `ClxDB`: the single facade wiring the storage backend, manifest manager,
//! shard manager, crypto envelope, database, and maintenance engines behind
//! one handle (§9 "Global state: none" — every engine lives on this struct,
//! not behind statics).

use crate::cache::{CacheStore, InMemoryCacheStore};
use crate::compaction::CompactionEngine;
use crate::config::ClxConfig;
use crate::crypto::CryptoEnvelope;
use crate::database::DatabaseBackend;
use crate::error::ClxResult;
use crate::manifest_store::ManifestManager;
use crate::model::Document;
use crate::orphan::OrphanCollector;
use crate::shard_manager::ShardManager;
use crate::storage::StorageBackend;
use crate::sync::{SyncEngine, SyncEvent, SyncState};
use crate::vacuum::VacuumEngine;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// A single open database. Cheap to clone (every field is an `Arc`), so a
/// handle can be shared across tasks without wrapping it again.
#[derive(Clone)]
pub struct ClxDB {
    database: Arc<dyn DatabaseBackend>,
    sync: Arc<SyncEngine>,
    compaction: Arc<CompactionEngine>,
    vacuum: Arc<VacuumEngine>,
    orphans: Arc<OrphanCollector>,
    crypto: Arc<CryptoEnvelope>,
    config: ClxConfig,
}

impl ClxDB {
    /// Open a database, unencrypted, against `backend`, using `database` as
    /// the local document store. Runs the manifest's initial load and, per
    /// config, the startup GC/vacuum passes (§4.4 init, §6 `gc_on_start`,
    /// `vacuum_on_start`).
    pub async fn open(
        backend: Arc<dyn StorageBackend>,
        database: Arc<dyn DatabaseBackend>,
        db_uuid: &str,
        config: ClxConfig,
        now_ms: i64,
    ) -> ClxResult<Self> {
        Self::open_with_crypto(backend, database, db_uuid, config, CryptoEnvelope::disabled(), now_ms).await
    }

    /// Open a database with a pre-unlocked crypto envelope, for callers that
    /// run `CryptoEnvelope::initialize_master`/`unlock_with_*` themselves
    /// (§4.3).
    pub async fn open_with_crypto(
        backend: Arc<dyn StorageBackend>,
        database: Arc<dyn DatabaseBackend>,
        db_uuid: &str,
        config: ClxConfig,
        crypto: CryptoEnvelope,
        now_ms: i64,
    ) -> ClxResult<Self> {
        backend.ensure_directory("shards").await?;

        let cache: Arc<dyn CacheStore> = Arc::new(InMemoryCacheStore::new());
        let manifest = Arc::new(ManifestManager::new(backend.clone(), config.clone()));
        manifest.load(db_uuid, &crypto).await?;
        let shards = Arc::new(ShardManager::new(backend.clone(), cache.clone(), config.clone()));
        let crypto = Arc::new(crypto);

        let sync = Arc::new(SyncEngine::new(
            database.clone(),
            manifest.clone(),
            shards.clone(),
            cache.clone(),
            config.clone(),
        ));
        let compaction = Arc::new(CompactionEngine::new(
            database.clone(),
            manifest.clone(),
            shards.clone(),
            config.clone(),
        ));
        let vacuum = Arc::new(VacuumEngine::new(manifest.clone(), shards.clone(), config.clone()));
        let orphans = Arc::new(OrphanCollector::new(backend.clone(), manifest.clone(), config.clone()));

        let db = Self {
            database,
            sync,
            compaction,
            vacuum,
            orphans,
            crypto,
            config,
        };

        if db.config.gc_on_start {
            let deleted = db.orphans.collect_once(now_ms).await;
            info!(deleted, "startup orphan collection complete");
        }
        if db.config.vacuum_on_start {
            let rewritten = db.vacuum.vacuum_once(&db.crypto, now_ms).await?;
            info!(rewritten, "startup vacuum pass complete");
        }

        Ok(db)
    }

    pub async fn get(&self, id: &str) -> ClxResult<Option<Document>> {
        self.database.read(id).await
    }

    pub async fn put(&self, id: &str, data: Value, now_ms: i64) -> ClxResult<Document> {
        self.database.upsert(id, data, now_ms).await
    }

    pub async fn delete(&self, id: &str, now_ms: i64) -> ClxResult<Document> {
        self.database.delete(id, now_ms).await
    }

    pub async fn pull(&self, now_ms: i64) -> ClxResult<usize> {
        self.sync.pull(&self.crypto, now_ms).await
    }

    pub async fn push(&self, now_ms: i64) -> ClxResult<usize> {
        self.sync.push(&self.crypto, now_ms).await
    }

    pub async fn sync_now(&self, now_ms: i64) -> ClxResult<(usize, usize)> {
        self.sync.trigger_sync(&self.crypto, now_ms).await
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync.state()
    }

    pub fn subscribe_sync_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.sync.subscribe()
    }

    pub async fn compact_once(&self, now_ms: i64) -> ClxResult<bool> {
        self.compaction.compact_once(&self.crypto, now_ms).await
    }

    pub async fn vacuum_once(&self, now_ms: i64) -> ClxResult<usize> {
        self.vacuum.vacuum_once(&self.crypto, now_ms).await
    }

    pub async fn collect_orphans(&self, now_ms: i64) -> usize {
        self.orphans.collect_once(now_ms).await
    }

    /// Start the background pull/push scheduler (§6 `sync_interval`).
    pub fn start_scheduler(&self, now_ms_fn: impl Fn() -> i64 + Send + Sync + 'static) -> tokio::task::JoinHandle<()> {
        self.sync.clone().spawn_scheduler(self.crypto.clone(), now_ms_fn)
    }
}
