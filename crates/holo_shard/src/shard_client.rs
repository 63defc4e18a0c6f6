//! Data-plane operations the coordinators issue against individual shards.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::index::IndexDescriptor;
use crate::key::ShardKey;
use crate::registry::ShardEntry;
use crate::shard_key::{KeyField, ShardKeyPattern};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub capped: bool,
    pub count: u64,
}

/// Result of copying a key range to a recipient shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneReport {
    pub docs: u64,
    pub bytes: u64,
}

/// A key range of one collection on one shard.
#[derive(Debug, Clone, Copy)]
pub struct RangeRef<'a> {
    pub ns: &'a str,
    pub pattern: &'a ShardKeyPattern,
    pub min: &'a ShardKey,
    pub max: &'a ShardKey,
}

#[async_trait]
pub trait ShardClient: Send + Sync {
    /// Checks that `shard` is reachable and ready to hold data.
    async fn connect(&self, shard: &ShardEntry) -> Result<()>;

    /// `None` when the collection does not exist on `shard`.
    async fn collection_info(&self, shard: &ShardEntry, ns: &str) -> Result<Option<CollectionInfo>>;

    async fn list_indexes(&self, shard: &ShardEntry, ns: &str) -> Result<Vec<IndexDescriptor>>;

    async fn create_index(
        &self,
        shard: &ShardEntry,
        ns: &str,
        key: &[KeyField],
        unique: bool,
    ) -> Result<()>;

    /// Median shard key of the documents in `range`. Never returns
    /// `range.min`; `None` when every document sits on it.
    async fn median_key(&self, shard: &ShardEntry, range: RangeRef<'_>) -> Result<Option<ShardKey>>;

    /// Copies the documents in `range` from `from` to `to`. Fails with
    /// `ChunkTooLarge` before copying anything if the range exceeds `max_bytes`.
    async fn clone_range(
        &self,
        from: &ShardEntry,
        to: &ShardEntry,
        range: RangeRef<'_>,
        max_bytes: u64,
    ) -> Result<CloneReport>;

    /// Drops whatever a failed migration copied into `to`.
    async fn discard_clone(&self, to: &ShardEntry, range: RangeRef<'_>) -> Result<()>;

    /// Deletes the documents in `range` from `shard`, returning how many were removed.
    async fn delete_range(&self, shard: &ShardEntry, range: RangeRef<'_>) -> Result<u64>;

    /// Copies every collection of `db` except `skip` from `from` to `to`.
    /// Returns the copied namespaces.
    async fn clone_database(
        &self,
        from: &ShardEntry,
        to: &ShardEntry,
        db: &str,
        skip: &[String],
    ) -> Result<Vec<String>>;

    async fn drop_collections(&self, shard: &ShardEntry, namespaces: &[String]) -> Result<()>;
}
