use std::sync::Arc;

use crate::catalog::ChunkManagerCache;
use crate::config::CoordinatorConfig;
use crate::error::{Result, ShardingError};
use crate::lock::{DistributedLock, LockLease};
use crate::metadata::{ClusterMetadata, ClusterMetadataStore};
use crate::registry::ShardEntry;
use crate::shard_client::ShardClient;

/// Collaborators every coordinator works through.
#[derive(Clone)]
pub struct ClusterContext {
    pub store: Arc<dyn ClusterMetadataStore>,
    pub locks: Arc<dyn DistributedLock>,
    pub shards: Arc<dyn ShardClient>,
    pub catalog: ChunkManagerCache,
    pub config: CoordinatorConfig,
}

impl ClusterContext {
    pub fn new(
        store: Arc<dyn ClusterMetadataStore>,
        locks: Arc<dyn DistributedLock>,
        shards: Arc<dyn ShardClient>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            locks,
            shards,
            catalog: ChunkManagerCache::new(),
            config,
        }
    }

    pub(crate) async fn lock(&self, resource: &str, why: &str) -> Result<LockLease> {
        self.locks
            .acquire(resource, why, self.config.lock_wait)
            .await
    }

    /// Releases `lease`, logging instead of failing: the operation it
    /// guarded has already finished.
    pub(crate) async fn unlock(&self, lease: LockLease) {
        if let Err(err) = self.locks.release(&lease).await {
            tracing::warn!(resource = %lease.resource, error = %err, "failed to release lock");
        }
    }

    pub(crate) async fn snapshot(&self) -> Result<ClusterMetadata> {
        self.store.snapshot().await
    }

    pub(crate) fn shard_entry(state: &ClusterMetadata, id: &str) -> Result<ShardEntry> {
        state
            .shards
            .get(id)
            .cloned()
            .ok_or_else(|| ShardingError::UnknownShard(id.to_string()))
    }
}
