//! Sharding control plane: shard registry, chunk metadata, chunk splits and
//! migrations, shard draining, and the admin commands that drive them.

use std::time::{SystemTime, UNIX_EPOCH};

pub mod admin;
pub mod catalog;
pub mod chunk;
pub mod config;
pub mod context;
pub mod drain;
pub mod error;
pub mod index;
pub mod key;
pub mod lock;
pub mod metadata;
pub mod migration;
pub mod namespace;
pub mod registry;
pub mod shard_client;
pub mod shard_collection;
pub mod shard_key;
pub mod sim;
pub mod splitter;

pub use admin::{AdminCommand, AdminService};
pub use chunk::{Chunk, ChunkManager, ChunkVersion};
pub use config::CoordinatorConfig;
pub use context::ClusterContext;
pub use error::{ErrorKind, Result, ShardingError};
pub use key::{KeyValue, ShardKey};
pub use lock::{DistributedLock, InMemoryLockManager, LockLease};
pub use metadata::{ClusterMetadata, ClusterMetadataStore, MetadataCommand, MetadataStateStore};
pub use registry::{ShardEntry, ShardId, ShardRegistry, ShardState};
pub use shard_client::ShardClient;
pub use shard_key::ShardKeyPattern;
pub use sim::SimulatedShardCluster;

pub(crate) fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

/// Parses `name@endpoint[,name@endpoint...]` shard lists.
pub fn parse_shard_list(raw: &str) -> Result<Vec<ShardEntry>> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| match item.split_once('@') {
            Some((name, endpoint)) if !name.is_empty() && !endpoint.is_empty() => {
                Ok(ShardEntry::new(name, endpoint))
            }
            _ => Err(ShardingError::BadRequest(format!(
                "invalid shard '{item}', expected name@endpoint"
            ))),
        })
        .collect()
}
