//! Crypto envelope: key derivation tree, per-part AES-GCM, and manifest
//! signing (§4.3, §6).

pub mod envelope;
pub mod keys;
pub mod signature;

pub use envelope::{CryptoEnvelope, CryptoMode};
