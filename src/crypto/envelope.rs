//! The crypto envelope: key-tree state plus the operations the shard codec
//! and manifest manager call into (§4.3).

use super::keys::{self, KEY_LEN};
use super::signature;
use crate::codec::CipherFn;
use crate::error::{CodecError, CryptoError, CryptoResult};
use crate::model::manifest::{CryptoDescriptor, DeviceKeyEntry, Manifest};
use rand::RngCore;
use std::collections::BTreeMap;

/// Which of the three modes in §4.3 this envelope is operating in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoMode {
    None,
    Master,
    QuickUnlock,
}

/// Holds the unlocked root key (if any) and exposes every derived operation.
///
/// A single `ClxDB` instance owns exactly one `CryptoEnvelope` (§9 "Global
/// state: none"); there is no shared/static crypto state.
pub struct CryptoEnvelope {
    mode: CryptoMode,
    root_key: Option<[u8; KEY_LEN]>,
}

impl CryptoEnvelope {
    pub fn disabled() -> Self {
        Self {
            mode: CryptoMode::None,
            root_key: None,
        }
    }

    fn unlocked(mode: CryptoMode, root_key: [u8; KEY_LEN]) -> Self {
        Self {
            mode,
            root_key: Some(root_key),
        }
    }

    pub fn mode(&self) -> CryptoMode {
        self.mode
    }

    pub fn is_enabled(&self) -> bool {
        self.mode != CryptoMode::None
    }

    fn require_root_key(&self) -> CryptoResult<&[u8; KEY_LEN]> {
        self.root_key
            .as_ref()
            .ok_or(CryptoError::ModeMismatch("crypto is not unlocked".into()))
    }

    /// `encrypted_part_size(plain_size)` (§4.3).
    pub fn encrypted_part_size(&self, plain_size: usize) -> usize {
        if self.is_enabled() {
            keys::encrypted_part_size(plain_size)
        } else {
            plain_size
        }
    }

    /// `encrypt_shard_part(shard_hash) -> fn(plain) -> stored` (§4.3).
    pub fn encrypt_shard_part<'a>(&'a self, shard_hash: &str) -> CryptoResult<Box<CipherFn<'a>>> {
        if !self.is_enabled() {
            return Ok(Box::new(|plain: &[u8]| Ok(plain.to_vec())));
        }
        let key = keys::shard_key(self.require_root_key()?, shard_hash)?;
        Ok(Box::new(move |plain: &[u8]| {
            keys::encrypt_part(&key, plain).map_err(to_codec_error)
        }))
    }

    /// `decrypt_shard_part(shard_hash) -> fn(stored) -> plain` (§4.3).
    pub fn decrypt_shard_part<'a>(&'a self, shard_hash: &str) -> CryptoResult<Box<CipherFn<'a>>> {
        if !self.is_enabled() {
            return Ok(Box::new(|stored: &[u8]| Ok(stored.to_vec())));
        }
        let key = keys::shard_key(self.require_root_key()?, shard_hash)?;
        Ok(Box::new(move |stored: &[u8]| {
            keys::decrypt_part(&key, stored).map_err(to_codec_error)
        }))
    }

    /// Refresh `nonce`/`timestamp` and sign; called on every manifest write (§4.3).
    pub fn finalize_manifest(&self, manifest: &mut Manifest, now_ms: i64) -> CryptoResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let root_key = *self.require_root_key()?;
        let crypto = manifest
            .crypto
            .get_or_insert_with(|| CryptoDescriptor {
                master_key: String::new(),
                master_key_salt: String::new(),
                device_key: BTreeMap::new(),
                nonce: String::new(),
                timestamp: now_ms,
                signature: String::new(),
            });
        crypto.nonce = uuid::Uuid::new_v4().to_string();
        crypto.timestamp = now_ms;
        let signing_key = keys::signing_key(&root_key)?;
        let sig = signature::sign(&signing_key, manifest)?;
        manifest.crypto.as_mut().unwrap().signature = sig;
        Ok(())
    }

    /// Fatal open-time check: any tampering outside `signature` is detected (§7, §8 invariant 6).
    pub fn verify_manifest(&self, manifest: &Manifest) -> CryptoResult<()> {
        let Some(root_key) = self.root_key else {
            return Ok(());
        };
        let signing_key = keys::signing_key(&root_key)?;
        signature::verify(&signing_key, manifest)
    }

    /// Establish `master` mode for a brand-new database: generate a random
    /// root key, wrap it under a freshly derived master key.
    pub fn initialize_master(password: &str) -> CryptoResult<(Self, CryptoDescriptor)> {
        let mut root_key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut root_key);

        let mut salt = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut salt);

        let master_key = keys::derive_master_key(password, &salt);
        let wrapped_root = keys::encrypt_part(&master_key, &root_key)?;

        let descriptor = CryptoDescriptor {
            master_key: b64(&wrapped_root),
            master_key_salt: b64(&salt),
            device_key: BTreeMap::new(),
            nonce: uuid::Uuid::new_v4().to_string(),
            timestamp: 0,
            signature: String::new(),
        };

        Ok((Self::unlocked(CryptoMode::Master, root_key), descriptor))
    }

    /// Unlock `master` mode from a password plus the manifest's crypto descriptor.
    pub fn unlock_with_master_password(
        descriptor: &CryptoDescriptor,
        password: &str,
    ) -> CryptoResult<Self> {
        let salt = unb64(&descriptor.master_key_salt)?;
        let master_key = keys::derive_master_key(password, &salt);
        let wrapped_root = unb64(&descriptor.master_key)?;
        let root_key_bytes = keys::decrypt_part(&master_key, &wrapped_root)?;
        let root_key = to_key(&root_key_bytes)?;
        Ok(Self::unlocked(CryptoMode::Master, root_key))
    }

    /// Unlock `quick-unlock` mode for a registered device.
    pub fn unlock_with_quick_unlock(
        descriptor: &CryptoDescriptor,
        device_id: &str,
        device_secret: &[u8; KEY_LEN],
        quick_unlock_password: &str,
    ) -> CryptoResult<Self> {
        let entry = descriptor
            .device_key
            .get(device_id)
            .ok_or_else(|| CryptoError::UnknownDevice(device_id.to_string()))?;
        let quick_key = keys::quick_unlock_key(device_secret, quick_unlock_password)?;
        let wrapped_root = unb64(&entry.key)?;
        let root_key_bytes = keys::decrypt_part(&quick_key, &wrapped_root)?;
        let root_key = to_key(&root_key_bytes)?;
        Ok(Self::unlocked(CryptoMode::QuickUnlock, root_key))
    }

    /// Master-password-change delta: re-wrap the (already unlocked) root key
    /// under a new master key and salt. Device entries are untouched; the
    /// caller re-signs through `finalize_manifest` after a successful CAS.
    pub fn change_master_password(
        &self,
        descriptor: &CryptoDescriptor,
        new_password: &str,
    ) -> CryptoResult<CryptoDescriptor> {
        let root_key = *self.require_root_key()?;
        let mut salt = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut salt);
        let master_key = keys::derive_master_key(new_password, &salt);
        let wrapped_root = keys::encrypt_part(&master_key, &root_key)?;

        Ok(CryptoDescriptor {
            master_key: b64(&wrapped_root),
            master_key_salt: b64(&salt),
            device_key: descriptor.device_key.clone(),
            nonce: descriptor.nonce.clone(),
            timestamp: descriptor.timestamp,
            signature: descriptor.signature.clone(),
        })
    }

    /// Register (or re-register) a device's quick-unlock wrapping of the root key.
    pub fn add_device(
        &self,
        descriptor: &CryptoDescriptor,
        device_id: &str,
        device_name: &str,
        device_secret: &[u8; KEY_LEN],
        quick_unlock_password: &str,
        now_ms: i64,
    ) -> CryptoResult<CryptoDescriptor> {
        let root_key = *self.require_root_key()?;
        let quick_key = keys::quick_unlock_key(device_secret, quick_unlock_password)?;
        let wrapped_root = keys::encrypt_part(&quick_key, &root_key)?;

        let mut device_key = descriptor.device_key.clone();
        device_key.insert(
            device_id.to_string(),
            DeviceKeyEntry {
                key: b64(&wrapped_root),
                device_name: device_name.to_string(),
                last_used_at: now_ms,
            },
        );

        Ok(CryptoDescriptor {
            device_key,
            ..descriptor.clone()
        })
    }

    /// Remove a device's quick-unlock entry (e.g. device revocation).
    pub fn remove_device(descriptor: &CryptoDescriptor, device_id: &str) -> CryptoDescriptor {
        let mut device_key = descriptor.device_key.clone();
        device_key.remove(device_id);
        CryptoDescriptor {
            device_key,
            ..descriptor.clone()
        }
    }
}

fn to_codec_error(err: CryptoError) -> CodecError {
    CodecError::InvalidHeader(err.to_string())
}

fn to_key(bytes: &[u8]) -> CryptoResult<[u8; KEY_LEN]> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::DecryptionFailed)
}

fn b64(bytes: &[u8]) -> String {
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, bytes)
}

fn unb64(s: &str) -> CryptoResult<Vec<u8>> {
    base64::Engine::decode(&base64::engine::general_purpose::STANDARD, s).map_err(CryptoError::from)
}
