use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the sync, compaction, vacuum, and orphan-collection engines (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClxConfig {
    /// How often the scheduler invokes `trigger_sync()`.
    #[serde(with = "duration_millis")]
    pub sync_interval: Duration,

    /// Minimum number of shards at a level before that level is compactable.
    pub compaction_threshold: usize,

    /// Target shard size in bytes used by the level formula (§3).
    pub desired_shard_size: u64,

    /// Terminal tier; shards at this level are excluded from compaction.
    pub max_shard_level: u8,

    /// Run the orphan collector once on startup.
    pub gc_on_start: bool,

    /// Orphan files younger than this are never deleted (§4.9, §8 invariant 7).
    #[serde(with = "duration_millis")]
    pub gc_grace_period: Duration,

    /// Run the vacuum engine once on startup.
    pub vacuum_on_start: bool,

    /// Maximum number of terminal-level shards sampled per vacuum pass.
    pub vacuum_count: usize,

    /// Minimum reclaim ratio required for a vacuum rewrite to proceed (§4.8).
    pub vacuum_threshold: f64,

    /// Tombstones older than this are dropped during compaction/vacuum (§3, §4.7, §4.8).
    pub max_sync_age_days: u64,

    /// Maximum consecutive CAS conflicts before `update()` gives up (§4.4, §5).
    pub max_cas_retries: u32,

    /// Bounded concurrency used for parallel shard fetches (§4.6, §5).
    pub fetch_concurrency: usize,
}

impl Default for ClxConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(5 * 60),
            compaction_threshold: 4,
            desired_shard_size: 5 * 1024 * 1024,
            max_shard_level: 6,
            gc_on_start: true,
            gc_grace_period: Duration::from_secs(60 * 60),
            vacuum_on_start: true,
            vacuum_count: 3,
            vacuum_threshold: 0.15,
            max_sync_age_days: 30,
            max_cas_retries: 10,
            fetch_concurrency: 5,
        }
    }
}

/// Serializes a `Duration` as whole milliseconds, so `ClxConfig` round-trips
/// through a plain JSON/TOML config file the way `cluster/config.rs` does for
/// its own settings.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}
