//! Shard file encoding/decoding (§4.2, §6).
//!
//! A shard is `[u32 LE header length][encrypted header][encrypted body
//! chunks]`. The codec itself holds no key material: callers inject an
//! encrypt/decrypt closure obtained from the crypto envelope, so this module
//! has no crypto dependency of its own beyond the trait boundary — the same
//! separation `storage/codec.rs` draws between wire encoding and the engine
//! that owns the keys.

use crate::config::ClxConfig;
use crate::error::{CodecError, CodecResult};
use crate::model::Document;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Length of the little-endian header-length prefix (§6).
const HEADER_LEN_PREFIX: usize = 4;

/// A cipher callback supplied by the crypto envelope: given plaintext bytes,
/// return the encrypted frame (`encrypt_shard_part`) or the reverse
/// (`decrypt_shard_part`).
pub type CipherFn<'a> = dyn Fn(&[u8]) -> CodecResult<Vec<u8>> + 'a;

/// One document's metadata entry inside a shard header (§3, §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardDocEntry {
    pub id: String,
    pub at: i64,
    pub seq: u64,
    pub del: bool,
    pub offset: u64,
    pub len: u64,
}

/// The decrypted JSON header of a shard file (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardHeader {
    pub docs: Vec<ShardDocEntry>,
}

impl ShardHeader {
    pub fn min_seq(&self) -> Option<u64> {
        self.docs.iter().map(|d| d.seq).min()
    }

    pub fn max_seq(&self) -> Option<u64> {
        self.docs.iter().map(|d| d.seq).max()
    }
}

/// Encode a set of fully-sequenced documents into a shard file.
///
/// Every document must carry a `seq` (only documents that survived a
/// manifest CAS are ever written to a shard) and must not violate the
/// `del => data.is_none()` invariant. Rejects an empty document set (§4.2).
pub fn encode_shard(documents: &[Document], encrypt: &CipherFn) -> CodecResult<Vec<u8>> {
    if documents.is_empty() {
        return Err(CodecError::EmptyDocumentSet);
    }

    let mut body = Vec::new();
    let mut entries = Vec::with_capacity(documents.len());

    for doc in documents {
        if !doc.is_valid() {
            return Err(CodecError::InvalidHeader(format!(
                "document {} has both del and data set",
                doc.id
            )));
        }
        let seq = doc.seq.ok_or_else(|| {
            CodecError::InvalidHeader(format!("document {} has no assigned sequence", doc.id))
        })?;

        let plain = if doc.del {
            serde_json::to_vec(&Value::Null)?
        } else {
            serde_json::to_vec(&doc.data)?
        };
        let stored = encrypt(&plain)?;

        let offset = body.len() as u64;
        let len = stored.len() as u64;
        body.extend_from_slice(&stored);

        entries.push(ShardDocEntry {
            id: doc.id.clone(),
            at: doc.at,
            seq,
            del: doc.del,
            offset,
            len,
        });
    }

    let header = ShardHeader { docs: entries };
    let header_plain = serde_json::to_vec(&header)?;
    let header_encrypted = encrypt(&header_plain)?;

    let mut out = Vec::with_capacity(HEADER_LEN_PREFIX + header_encrypted.len() + body.len());
    out.extend_from_slice(&(header_encrypted.len() as u32).to_le_bytes());
    out.extend_from_slice(&header_encrypted);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Parse and validate the decrypted header of a shard file.
///
/// `header_bytes` is the already-decrypted header JSON; the caller (shard
/// manager) is responsible for the two range reads and the decryption step
/// described in §4.5, since those require the storage backend.
pub fn parse_header(header_bytes: &[u8]) -> CodecResult<ShardHeader> {
    let header: ShardHeader = serde_json::from_slice(header_bytes)?;

    let mut prev_end: Option<u64> = None;
    for entry in &header.docs {
        if entry.len == 0 {
            return Err(CodecError::InvalidHeader(format!(
                "document {} has zero-length body",
                entry.id
            )));
        }
        let end = entry.offset.checked_add(entry.len).ok_or_else(|| {
            CodecError::InvalidHeader(format!("document {} offset+len overflows", entry.id))
        })?;
        if let Some(prev) = prev_end {
            if entry.offset < prev {
                return Err(CodecError::InvalidHeader(
                    "document offsets are not strictly increasing".to_string(),
                ));
            }
        }
        prev_end = Some(end);
    }

    Ok(header)
}

/// Read the `[len_prefix][encrypted_header]` framing out of a full shard
/// file buffer, returning `(encrypted_header_bytes, body_start_offset)`.
pub fn split_header(bytes: &[u8]) -> CodecResult<(&[u8], usize)> {
    if bytes.len() < HEADER_LEN_PREFIX {
        return Err(CodecError::Truncated {
            expected: HEADER_LEN_PREFIX,
            actual: bytes.len(),
        });
    }
    let mut len_bytes = [0u8; HEADER_LEN_PREFIX];
    len_bytes.copy_from_slice(&bytes[..HEADER_LEN_PREFIX]);
    let header_len = u32::from_le_bytes(len_bytes) as usize;
    let body_start = HEADER_LEN_PREFIX + header_len;
    if bytes.len() < body_start {
        return Err(CodecError::Truncated {
            expected: body_start,
            actual: bytes.len(),
        });
    }
    Ok((&bytes[HEADER_LEN_PREFIX..body_start], body_start))
}

/// SHA-256 of the full encoded shard file, hex-encoded (§4.2).
pub fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Derive a shard's tier level from its on-disk size (§3).
///
/// `level = clamp(round(log_C(size / S0)), 0, L)` where `S0 = desired_size /
/// C^L`. A raw negative value (small first shards) clamps to 0 rather than
/// erroring — intentional (SPEC_FULL §9 Open Question 2).
pub fn level_of(size: u64, config: &ClxConfig) -> u8 {
    let c = config.compaction_threshold as f64;
    let l = config.max_shard_level as f64;
    let s0 = config.desired_shard_size as f64 / c.powf(l);
    if size == 0 || s0 <= 0.0 {
        return 0;
    }
    let raw = (size as f64 / s0).log(c).round();
    raw.clamp(0.0, l) as u8
}

/// Filename→hash extraction: the substring between `shard_` and `.clx` (§4.5).
pub fn hash_from_filename(filename: &str) -> Option<&str> {
    filename.strip_prefix("shard_")?.strip_suffix(".clx")
}

pub fn shard_filename(hash: &str) -> String {
    format!("shard_{}.clx", hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity(bytes: &[u8]) -> CodecResult<Vec<u8>> {
        Ok(bytes.to_vec())
    }

    #[test]
    fn test_round_trip_preserves_metadata() {
        let docs = vec![
            Document {
                id: "a".into(),
                at: 1000,
                seq: Some(1),
                del: false,
                data: Some(json!({"x": 1})),
            },
            Document {
                id: "b".into(),
                at: 2000,
                seq: Some(2),
                del: true,
                data: None,
            },
        ];

        let encoded = encode_shard(&docs, &identity).unwrap();
        let (header_bytes, body_start) = split_header(&encoded).unwrap();
        let header = parse_header(header_bytes).unwrap();

        assert_eq!(header.docs.len(), 2);
        assert_eq!(header.docs[0].id, "a");
        assert_eq!(header.docs[0].seq, 1);
        assert!(!header.docs[0].del);
        assert_eq!(header.docs[1].id, "b");
        assert!(header.docs[1].del);
        assert_eq!(header.min_seq(), Some(1));
        assert_eq!(header.max_seq(), Some(2));

        // Body slices, through the identity cipher, are exactly the plain JSON bytes.
        let body = &encoded[body_start..];
        let entry0 = &header.docs[0];
        let slice0 = &body[entry0.offset as usize..(entry0.offset + entry0.len) as usize];
        let value0: Value = serde_json::from_slice(slice0).unwrap();
        assert_eq!(value0, json!({"x": 1}));

        let entry1 = &header.docs[1];
        let slice1 = &body[entry1.offset as usize..(entry1.offset + entry1.len) as usize];
        let value1: Value = serde_json::from_slice(slice1).unwrap();
        assert_eq!(value1, Value::Null);
    }

    #[test]
    fn test_empty_document_set_rejected() {
        let err = encode_shard(&[], &identity).unwrap_err();
        assert!(matches!(err, CodecError::EmptyDocumentSet));
    }

    #[test]
    fn test_tombstone_with_data_rejected() {
        let docs = vec![Document {
            id: "a".into(),
            at: 1,
            seq: Some(1),
            del: true,
            data: Some(json!({"x": 1})),
        }];
        assert!(encode_shard(&docs, &identity).is_err());
    }

    #[test]
    fn test_pending_document_without_seq_rejected() {
        let docs = vec![Document::pending("a", 1, json!({}))];
        assert!(encode_shard(&docs, &identity).is_err());
    }

    #[test]
    fn test_identical_content_yields_identical_hash() {
        let docs = vec![Document {
            id: "a".into(),
            at: 1,
            seq: Some(1),
            del: false,
            data: Some(json!({"x": 1})),
        }];
        let a = encode_shard(&docs, &identity).unwrap();
        let b = encode_shard(&docs, &identity).unwrap();
        assert_eq!(compute_hash(&a), compute_hash(&b));
    }

    #[test]
    fn test_non_increasing_offsets_rejected() {
        let bad_header = ShardHeader {
            docs: vec![
                ShardDocEntry {
                    id: "a".into(),
                    at: 1,
                    seq: 1,
                    del: false,
                    offset: 10,
                    len: 5,
                },
                ShardDocEntry {
                    id: "b".into(),
                    at: 1,
                    seq: 2,
                    del: false,
                    offset: 5,
                    len: 5,
                },
            ],
        };
        let bytes = serde_json::to_vec(&bad_header).unwrap();
        assert!(parse_header(&bytes).is_err());
    }

    #[test]
    fn test_level_of_clamps_small_sizes_to_zero() {
        let config = ClxConfig::default();
        assert_eq!(level_of(1, &config), 0);
        assert_eq!(level_of(0, &config), 0);
    }

    #[test]
    fn test_level_of_terminal_for_huge_shard() {
        let config = ClxConfig::default();
        let huge = config.desired_shard_size * 10_000_000;
        assert_eq!(level_of(huge, &config), config.max_shard_level);
    }

    #[test]
    fn test_level_of_desired_size_is_terminal() {
        // S0 = desired / C^L, so size == desired_shard_size is exactly C^L * S0,
        // i.e. log_C(size/S0) == L: desired_shard_size is the target size a
        // shard reaches once fully compacted to the terminal level.
        let config = ClxConfig::default();
        let level = level_of(config.desired_shard_size, &config);
        assert_eq!(level, config.max_shard_level);
    }

    #[test]
    fn test_level_of_one_tier_above_s0() {
        let config = ClxConfig::default();
        let s0 = config.desired_shard_size as f64
            / (config.compaction_threshold as f64).powf(config.max_shard_level as f64);
        let size_at_level_1 = (s0 * config.compaction_threshold as f64).round() as u64;
        assert_eq!(level_of(size_at_level_1, &config), 1);
    }

    #[test]
    fn test_hash_from_filename() {
        assert_eq!(hash_from_filename("shard_abcd.clx"), Some("abcd"));
        assert_eq!(hash_from_filename("manifest.json"), None);
        assert_eq!(shard_filename("abcd"), "shard_abcd.clx");
    }
}
