//! Wire-level data model: documents and the manifest (§3).

pub mod document;
pub mod manifest;

pub use document::Document;
pub use manifest::{CryptoDescriptor, DeviceKeyEntry, Manifest, SequenceRange, ShardFileInfo};
