use thiserror::Error;

/// Errors raised by the storage capability (§4.1).
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("range not satisfiable for {path}: {offset}..{offset_end}")]
    RangeNotSatisfiable {
        path: String,
        offset: u64,
        offset_end: u64,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend error: {0}")]
    Backend(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised while encoding/decoding shard files (§4.2, §6).
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("cannot encode an empty document set")]
    EmptyDocumentSet,

    #[error("invalid shard header: {0}")]
    InvalidHeader(String),

    #[error("encrypted length mismatch for document {id}: declared {declared}, actual {actual}")]
    LengthMismatch {
        id: String,
        declared: usize,
        actual: usize,
    },

    #[error("truncated shard file: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Errors raised by the crypto envelope (§4.3).
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("manifest signature mismatch")]
    SignatureMismatch,

    #[error("decryption failed (wrong key or corrupted ciphertext)")]
    DecryptionFailed,

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("encryption mode mismatch: {0}")]
    ModeMismatch(String),

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}

pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors raised by the manifest manager's CAS update loop (§4.4, §7).
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("manifest update conflict after {0} attempts")]
    UpdateConflict(u32),

    #[error("invalid manifest: {0}")]
    Invalid(String),
}

pub type ManifestResult<T> = Result<T, ManifestError>;

/// Top-level error type threaded through every engine.
///
/// Mirrors the taxonomy in SPEC_FULL §7: `NotFound` and `Transient` downgrade
/// to skip-and-log in the pull path; `SignatureMismatch` and
/// `ManifestUpdateConflict` are always fatal to the caller.
#[derive(Error, Debug)]
pub enum ClxError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid format: {0}")]
    FormatInvalid(String),

    #[error("manifest signature mismatch")]
    SignatureMismatch,

    #[error("manifest update conflict after {0} attempts")]
    ManifestUpdateConflict(u32),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("precondition failed: {0}")]
    UserPreconditionFailed(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

pub type ClxResult<T> = Result<T, ClxError>;

impl From<ManifestError> for ClxError {
    fn from(err: ManifestError) -> Self {
        match err {
            ManifestError::UpdateConflict(attempts) => ClxError::ManifestUpdateConflict(attempts),
            ManifestError::Invalid(msg) => ClxError::FormatInvalid(msg),
        }
    }
}

impl From<CryptoError> for ClxError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::SignatureMismatch => ClxError::SignatureMismatch,
            other => ClxError::Crypto(other),
        }
    }
}
