use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Bumped whenever the on-disk manifest shape changes incompatibly (§6).
pub const PROTOCOL_VERSION: u32 = 2;

/// Sequence range covered by a shard's documents, inclusive (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRange {
    pub min: u64,
    pub max: u64,
}

/// A manifest entry describing one immutable shard file (§3, §6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardFileInfo {
    pub filename: String,
    pub level: u8,
    pub range: SequenceRange,
}

/// One device's wrapped copy of the root key, for quick-unlock (§3, §4.3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceKeyEntry {
    /// Root key encrypted under that device's quick-unlock key, base64.
    pub key: String,
    pub device_name: String,
    pub last_used_at: i64,
}

/// Crypto state carried inside the manifest when encryption is enabled (§3, §4.3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoDescriptor {
    /// Root key encrypted under the master key, base64.
    pub master_key: String,
    pub master_key_salt: String,
    #[serde(default)]
    pub device_key: BTreeMap<String, DeviceKeyEntry>,
    pub nonce: String,
    pub timestamp: i64,
    /// HMAC-SHA-256 over the manifest with this field zeroed (§3, §4.3).
    #[serde(default)]
    pub signature: String,
}

/// The single serialized document enumerating live shards and crypto state (§3, §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub uuid: String,
    pub last_sequence: u64,
    pub shard_files: Vec<ShardFileInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto: Option<CryptoDescriptor>,
}

impl Manifest {
    /// A fresh, empty manifest for a newly created database (§4.4 init).
    pub fn empty(uuid: String) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            uuid,
            last_sequence: 0,
            shard_files: Vec::new(),
            crypto: None,
        }
    }

    /// Shards whose range overlaps sequences greater than `local_sequence` (§4.6 pull step 2).
    pub fn shards_to_scan(&self, local_sequence: u64) -> Vec<&ShardFileInfo> {
        self.shard_files
            .iter()
            .filter(|s| s.range.max > local_sequence)
            .collect()
    }

    /// Invariant check used by tests and by callers before trusting a freshly
    /// parsed manifest (§3 invariants).
    pub fn is_well_formed(&self) -> bool {
        let sorted = self
            .shard_files
            .windows(2)
            .all(|w| w[0].range.min <= w[1].range.min);
        let mut seen = std::collections::HashSet::new();
        let unique = self.shard_files.iter().all(|s| seen.insert(&s.filename));
        let max_range = self
            .shard_files
            .iter()
            .map(|s| s.range.max)
            .max()
            .unwrap_or(0);
        sorted && unique && self.last_sequence >= max_range
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(filename: &str, min: u64, max: u64) -> ShardFileInfo {
        ShardFileInfo {
            filename: filename.to_string(),
            level: 0,
            range: SequenceRange { min, max },
        }
    }

    #[test]
    fn test_empty_manifest_is_well_formed() {
        let m = Manifest::empty("db-1".to_string());
        assert!(m.is_well_formed());
    }

    #[test]
    fn test_shards_to_scan_filters_by_local_sequence() {
        let mut m = Manifest::empty("db-1".to_string());
        m.shard_files = vec![info("a", 1, 1), info("b", 2, 5), info("c", 6, 6)];
        m.last_sequence = 6;
        let to_scan = m.shards_to_scan(1);
        let names: Vec<_> = to_scan.iter().map(|s| s.filename.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn test_unsorted_shards_fail_well_formed() {
        let mut m = Manifest::empty("db-1".to_string());
        m.shard_files = vec![info("b", 5, 5), info("a", 1, 1)];
        m.last_sequence = 5;
        assert!(!m.is_well_formed());
    }

    #[test]
    fn test_duplicate_filenames_fail_well_formed() {
        let mut m = Manifest::empty("db-1".to_string());
        m.shard_files = vec![info("a", 1, 1), info("a", 2, 2)];
        m.last_sequence = 2;
        assert!(!m.is_well_formed());
    }

    #[test]
    fn test_last_sequence_below_max_fails_well_formed() {
        let mut m = Manifest::empty("db-1".to_string());
        m.shard_files = vec![info("a", 1, 5)];
        m.last_sequence = 4;
        assert!(!m.is_well_formed());
    }
}
