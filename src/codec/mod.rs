//! Shard file binary codec (§4.2, §6).

pub mod shard;

pub use shard::{
    compute_hash, encode_shard, hash_from_filename, level_of, parse_header, shard_filename,
    split_header, CipherFn, ShardDocEntry, ShardHeader,
};
