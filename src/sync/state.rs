//! Sync engine state and the events it broadcasts to observers (§4.6, §9).

use std::fmt;

/// Coarse sync status exposed to application UI (e.g. an "offline" badge).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Nothing pending, last sync attempt (if any) succeeded.
    Idle,
    /// Local writes exist that haven't been pushed yet.
    Pending,
    /// A pull or push is in flight right now.
    Syncing,
    /// The last sync attempt failed with a transient/network-shaped error.
    Offline,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncState::Idle => "idle",
            SyncState::Pending => "pending",
            SyncState::Syncing => "syncing",
            SyncState::Offline => "offline",
        };
        write!(f, "{s}")
    }
}

/// Broadcast to `SyncEngine::subscribe` receivers (§9 observability note).
#[derive(Debug, Clone)]
pub enum SyncEvent {
    StateChanged(SyncState),
    PullCompleted { applied: usize },
    /// Emitted only when a pull actually applied at least one document
    /// (§4.6 pull step 7, §8 invariant 5: a no-op pull emits nothing here).
    DocumentsChanged { applied: usize },
    PushCompleted { pushed: usize },
    Error(String),
}
