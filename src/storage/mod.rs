//! Storage drivers (§4.1).

pub mod backend;
pub mod fs;

pub use backend::{ByteRange, CasOutcome, ObjectStat, StorageBackend};
pub use fs::FileSystemBackend;
