//! Large binary attachment capability (§4.3 `blob_key`, Non-goals).
//!
//! Binary attachment chunking, dedup, and streaming are explicitly out of
//! scope; this trait exists only so `blob_key` in the crypto envelope has a
//! caller-facing contract to derive keys for, without this crate committing
//! to a chunking/transport scheme it doesn't implement.

use crate::error::ClxResult;
use async_trait::async_trait;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch a previously stored blob's plaintext by its content digest.
    async fn get(&self, digest: &str) -> ClxResult<Option<Vec<u8>>>;

    /// Store a blob's plaintext, returning its content digest.
    async fn put(&self, bytes: &[u8]) -> ClxResult<String>;
}
