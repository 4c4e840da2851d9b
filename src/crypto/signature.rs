//! Manifest signing and verification (§3, §4.3).
//!
//! The manifest is modeled as a concrete `serde`-derived struct rather than
//! a dynamic `serde_json::Value`, so `serde_json::to_vec` already produces a
//! deterministic byte sequence (struct fields serialize in declaration
//! order; `CryptoDescriptor::device_key` is a `BTreeMap`, so its entries
//! serialize in sorted key order too). That is the "canonical key ordering"
//! the signature is computed over — no separate canonicalization pass is
//! needed on top of it.

use crate::error::CryptoError;
use crate::model::manifest::Manifest;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Bytes signed: the manifest with `crypto.signature` zeroed.
fn signable_bytes(manifest: &Manifest) -> Result<Vec<u8>, CryptoError> {
    let mut manifest = manifest.clone();
    if let Some(crypto) = manifest.crypto.as_mut() {
        crypto.signature = String::new();
    }
    serde_json::to_vec(&manifest).map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
}

/// HMAC-SHA-256 the manifest under `signing_key`, returning base64.
pub fn sign(signing_key: &[u8; 32], manifest: &Manifest) -> Result<String, CryptoError> {
    let bytes = signable_bytes(manifest)?;
    let mut mac = HmacSha256::new_from_slice(signing_key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac.update(&bytes);
    let tag = mac.finalize().into_bytes();
    Ok(base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        tag,
    ))
}

/// Verify the manifest's stored signature under `signing_key` in constant
/// time. Any byte modification outside the `signature` field is detected
/// here (§8 invariant 6).
pub fn verify(signing_key: &[u8; 32], manifest: &Manifest) -> Result<(), CryptoError> {
    let expected = sign(signing_key, manifest)?;
    let stored = manifest
        .crypto
        .as_ref()
        .map(|c| c.signature.as_str())
        .unwrap_or("");

    if expected.as_bytes().ct_eq(stored.as_bytes()).unwrap_u8() == 1 {
        Ok(())
    } else {
        Err(CryptoError::SignatureMismatch)
    }
}
