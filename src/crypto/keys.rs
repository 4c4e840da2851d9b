//! Key derivation tree and per-part AES-GCM framing (§4.3, §6).
//!
//! All derivation is HKDF-SHA-256 with an empty salt; the `info` string is
//! the only domain separator between key classes. The root key is the only
//! key ever persisted (wrapped) in the manifest; every other key is
//! recomputed on demand from it.

use crate::error::CryptoError;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const PBKDF2_ITERATIONS: u32 = 1_500_000;

/// `masterKey = PBKDF2-SHA-256(password, salt, iterations=1_500_000)` (§4.3).
pub fn derive_master_key(password: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut out = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut out);
    out
}

/// `HKDF(ikm, info) -> 32 bytes`, used for every derivation below the root key.
fn hkdf_expand(ikm: &[u8], info: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; KEY_LEN];
    hkdf.expand(info, &mut okm)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(okm)
}

/// `signingKey = HKDF(rootKey, info="sign:manifest")` (§4.3).
pub fn signing_key(root_key: &[u8; KEY_LEN]) -> Result<[u8; KEY_LEN], CryptoError> {
    hkdf_expand(root_key, b"sign:manifest")
}

/// `shardKey(h) = HKDF(rootKey, info="encryption:shard/" + h)` (§4.3).
pub fn shard_key(root_key: &[u8; KEY_LEN], shard_hash: &str) -> Result<[u8; KEY_LEN], CryptoError> {
    let info = format!("encryption:shard/{shard_hash}");
    hkdf_expand(root_key, info.as_bytes())
}

/// `blobKey(d) = HKDF(rootKey, info="encryption:blob/" + d)` (§4.3).
pub fn blob_key(root_key: &[u8; KEY_LEN], blob_digest: &str) -> Result<[u8; KEY_LEN], CryptoError> {
    let info = format!("encryption:blob/{blob_digest}");
    hkdf_expand(root_key, info.as_bytes())
}

/// `quickUnlockKey(pwd, dev) = HKDF(deviceKey, info="encryption:quick_unlock/" + pwd)` (§4.3).
pub fn quick_unlock_key(
    device_secret: &[u8; KEY_LEN],
    quick_unlock_password: &str,
) -> Result<[u8; KEY_LEN], CryptoError> {
    let info = format!("encryption:quick_unlock/{quick_unlock_password}");
    hkdf_expand(device_secret, info.as_bytes())
}

/// Encrypt one part under AES-GCM-256 with a fresh random IV: `[IV ||
/// ciphertext || tag]` (§4.3). Every header, body chunk, and blob chunk is
/// its own independent frame.
pub fn encrypt_part(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    let nonce = Nonce::from_slice(&iv);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt one `[IV || ciphertext || tag]` frame.
pub fn decrypt_part(key: &[u8; KEY_LEN], stored: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if stored.len() < IV_LEN + TAG_LEN {
        return Err(CryptoError::DecryptionFailed);
    }
    let (iv, ciphertext) = stored.split_at(IV_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(iv);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// `encrypted_part_size(plain_size) = plain_size + IV + TAG` (§4.3).
pub fn encrypted_part_size(plain_size: usize) -> usize {
    plain_size + IV_LEN + TAG_LEN
}
