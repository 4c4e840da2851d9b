//! Sync protocol: pull, push, merge rule, and engine state (§4.6, §9).

pub mod engine;
pub mod merge;
pub mod state;

pub use engine::SyncEngine;
pub use merge::merge_to_latest_document;
pub use state::{SyncEvent, SyncState};
