use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single ClxDB document (§3).
///
/// `seq = None` marks a user-originated pending change not yet assigned a
/// sequence by a manifest CAS. `del = true` is a tombstone; `data` must be
/// `None` whenever `del` is set — callers that violate this invariant get a
/// `CodecError::InvalidHeader` out of the shard codec rather than silently
/// losing the flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default)]
    pub del: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Document {
    /// Construct a pending (not-yet-synced) document for a user write.
    pub fn pending(id: impl Into<String>, at: i64, data: Value) -> Self {
        Self {
            id: id.into(),
            at,
            seq: None,
            del: false,
            data: Some(data),
        }
    }

    /// Construct a pending tombstone for a user delete.
    pub fn pending_tombstone(id: impl Into<String>, at: i64) -> Self {
        Self {
            id: id.into(),
            at,
            seq: None,
            del: true,
            data: None,
        }
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    /// Ordering used by pull and compaction to decide which copy of a
    /// document wins: `(seq, at)` lexicographically, higher wins (§4.6 step 5).
    pub fn is_newer_than(&self, other: &Document) -> bool {
        (self.seq, self.at) > (other.seq, other.at)
    }

    pub fn is_valid(&self) -> bool {
        !(self.del && self.data.is_some())
    }
}
