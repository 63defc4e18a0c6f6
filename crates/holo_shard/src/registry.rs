//! Registered shards.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub type ShardId = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEntry {
    pub id: ShardId,
    pub endpoint: String,
    /// Set once removal starts. Never cleared.
    #[serde(default)]
    pub draining: bool,
    /// Advisory size cap in megabytes, 0 for unlimited.
    #[serde(default)]
    pub max_size_mb: u64,
}

impl ShardEntry {
    pub fn new(id: impl Into<ShardId>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            draining: false,
            max_size_mb: 0,
        }
    }
}

/// Lifecycle of a shard as seen by the registry.
///
/// `Active -> Draining -> Removed`. Absent shards report `Removed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardState {
    Active,
    Draining,
    Removed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardRegistry {
    shards: BTreeMap<ShardId, ShardEntry>,
}

impl ShardRegistry {
    pub fn from_entries(entries: impl IntoIterator<Item = ShardEntry>) -> Self {
        Self {
            shards: entries.into_iter().map(|e| (e.id.clone(), e)).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&ShardEntry> {
        self.shards.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.shards.contains_key(id)
    }

    pub fn state(&self, id: &str) -> ShardState {
        match self.shards.get(id) {
            Some(entry) if entry.draining => ShardState::Draining,
            Some(_) => ShardState::Active,
            None => ShardState::Removed,
        }
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ShardEntry> {
        self.shards.values()
    }

    /// Shards that may receive data, in id order.
    pub fn active(&self) -> impl Iterator<Item = &ShardEntry> {
        self.shards.values().filter(|e| !e.draining)
    }

    pub fn draining_shard(&self) -> Option<&ShardEntry> {
        self.shards.values().find(|e| e.draining)
    }

    pub fn find_by_endpoint(&self, endpoint: &str) -> Option<&ShardEntry> {
        self.shards.values().find(|e| e.endpoint == endpoint)
    }

    /// First free name of the form `shardNNNN`.
    pub fn next_generated_name(&self) -> ShardId {
        (0..)
            .map(|n| format!("shard{n:04}"))
            .find(|name| !self.shards.contains_key(name))
            .unwrap_or_else(|| format!("shard{}", self.shards.len()))
    }

    pub(crate) fn insert(&mut self, entry: ShardEntry) {
        self.shards.insert(entry.id.clone(), entry);
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut ShardEntry> {
        self.shards.get_mut(id)
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<ShardEntry> {
        self.shards.remove(id)
    }
}
