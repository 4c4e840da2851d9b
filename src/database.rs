//! Local document store capability (§4.6, §9).
//!
//! `ClxDB` talks to the application's documents only through this trait, the
//! same way it talks to the remote only through `StorageBackend` — a real
//! integration would back it with IndexedDB/OPFS or a local SQLite file; the
//! in-memory implementation here is a reference/testing backend, not
//! something meant to persist across process restarts.

use crate::error::ClxResult;
use crate::model::Document;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;

#[async_trait]
pub trait DatabaseBackend: Send + Sync {
    /// The current local view of a document, or `None` if it has never
    /// existed or has been fully forgotten.
    async fn read(&self, id: &str) -> ClxResult<Option<Document>>;

    /// IDs of documents with local writes that have not yet been assigned a
    /// sequence number by a successful push (§4.6 push path).
    async fn read_pending_ids(&self) -> ClxResult<Vec<String>>;

    /// Apply a local create/update, producing a pending document (no `seq`
    /// yet) that `read_pending_ids` will surface until it's pushed.
    async fn upsert(&self, id: &str, data: Value, now_ms: i64) -> ClxResult<Document>;

    /// Apply a local delete as a pending tombstone.
    async fn delete(&self, id: &str, now_ms: i64) -> ClxResult<Document>;

    /// Apply a document learned from the remote (pull) or a push
    /// confirmation, keeping whichever of the incoming/existing document is
    /// newer under `Document::is_newer_than` (§4.6, §7, §8 invariant 2).
    /// Returns `true` if the incoming document won and replaced local state.
    async fn replicate(&self, incoming: Document) -> ClxResult<bool>;

    /// Stamp a locally pending document with the sequence number a
    /// successful push assigned to it, so it stops showing up as pending.
    async fn mark_synced(&self, id: &str, seq: u64) -> ClxResult<()>;
}

/// An in-process `DatabaseBackend` backed by a `HashMap`. Good enough to run
/// the whole sync protocol end to end in tests and in the CLI demo, with no
/// on-disk persistence of its own.
#[derive(Default)]
pub struct InMemoryDatabase {
    documents: RwLock<HashMap<String, Document>>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DatabaseBackend for InMemoryDatabase {
    async fn read(&self, id: &str) -> ClxResult<Option<Document>> {
        Ok(self.documents.read().get(id).cloned())
    }

    async fn read_pending_ids(&self) -> ClxResult<Vec<String>> {
        Ok(self
            .documents
            .read()
            .values()
            .filter(|d| d.seq.is_none())
            .map(|d| d.id.clone())
            .collect())
    }

    async fn upsert(&self, id: &str, data: Value, now_ms: i64) -> ClxResult<Document> {
        let document = Document::pending(id, now_ms, data);
        self.documents
            .write()
            .insert(id.to_string(), document.clone());
        Ok(document)
    }

    async fn delete(&self, id: &str, now_ms: i64) -> ClxResult<Document> {
        let document = Document::pending_tombstone(id, now_ms);
        self.documents
            .write()
            .insert(id.to_string(), document.clone());
        Ok(document)
    }

    async fn replicate(&self, incoming: Document) -> ClxResult<bool> {
        let mut documents = self.documents.write();
        match documents.get(&incoming.id) {
            Some(existing) if !incoming.is_newer_than(existing) => Ok(false),
            _ => {
                documents.insert(incoming.id.clone(), incoming);
                Ok(true)
            }
        }
    }

    async fn mark_synced(&self, id: &str, seq: u64) -> ClxResult<()> {
        if let Some(document) = self.documents.write().get_mut(id) {
            document.seq = Some(seq);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_upsert_then_read_is_pending() {
        let db = InMemoryDatabase::new();
        db.upsert("a", json!({"x": 1}), 1000).await.unwrap();
        let doc = db.read("a").await.unwrap().unwrap();
        assert!(doc.seq.is_none());
        assert_eq!(db.read_pending_ids().await.unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_mark_synced_clears_pending() {
        let db = InMemoryDatabase::new();
        db.upsert("a", json!({"x": 1}), 1000).await.unwrap();
        db.mark_synced("a", 5).await.unwrap();
        assert!(db.read_pending_ids().await.unwrap().is_empty());
        assert_eq!(db.read("a").await.unwrap().unwrap().seq, Some(5));
    }

    #[tokio::test]
    async fn test_replicate_rejects_older_document() {
        let db = InMemoryDatabase::new();
        db.replicate(Document {
            id: "a".into(),
            at: 2000,
            seq: Some(5),
            del: false,
            data: Some(json!({"v": 2})),
        })
        .await
        .unwrap();

        let applied = db
            .replicate(Document {
                id: "a".into(),
                at: 1000,
                seq: Some(4),
                del: false,
                data: Some(json!({"v": 1})),
            })
            .await
            .unwrap();
        assert!(!applied);
        assert_eq!(db.read("a").await.unwrap().unwrap().data, Some(json!({"v": 2})));
    }

    #[tokio::test]
    async fn test_replicate_accepts_newer_document() {
        let db = InMemoryDatabase::new();
        db.replicate(Document {
            id: "a".into(),
            at: 1000,
            seq: Some(4),
            del: false,
            data: Some(json!({"v": 1})),
        })
        .await
        .unwrap();

        let applied = db
            .replicate(Document {
                id: "a".into(),
                at: 2000,
                seq: Some(5),
                del: false,
                data: Some(json!({"v": 2})),
            })
            .await
            .unwrap();
        assert!(applied);
        assert_eq!(db.read("a").await.unwrap().unwrap().data, Some(json!({"v": 2})));
    }

    #[tokio::test]
    async fn test_delete_then_replicate_tombstone() {
        let db = InMemoryDatabase::new();
        let tombstone = db.delete("a", 1000).await.unwrap();
        assert!(tombstone.del);
        assert_eq!(db.read("a").await.unwrap().unwrap().data, None);
    }
}
