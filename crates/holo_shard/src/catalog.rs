//! Cached routing snapshots per namespace.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::chunk::ChunkManager;
use crate::error::Result;
use crate::metadata::ClusterMetadataStore;

/// Holds the latest [`ChunkManager`] of every sharded collection this
/// process has routed for. Snapshots are replaced, never edited.
#[derive(Debug, Clone, Default)]
pub struct ChunkManagerCache {
    entries: Arc<RwLock<BTreeMap<String, Arc<ChunkManager>>>>,
}

impl ChunkManagerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached(&self, ns: &str) -> Result<Option<Arc<ChunkManager>>> {
        Ok(self.entries.read()?.get(ns).cloned())
    }

    /// Rebuilds the snapshot of `ns` from the metadata store.
    pub async fn refresh(
        &self,
        store: &dyn ClusterMetadataStore,
        ns: &str,
    ) -> Result<Arc<ChunkManager>> {
        let state = store.snapshot().await?;
        let manager = match state.chunk_manager(ns) {
            Ok(manager) => Arc::new(manager),
            Err(err) => {
                self.invalidate(ns)?;
                return Err(err);
            }
        };
        let mut entries = self.entries.write()?;
        if let Some(previous) = entries.get(ns) {
            if previous.version() != manager.version() || previous.epoch() != manager.epoch() {
                tracing::debug!(
                    ns,
                    from = %previous.version(),
                    to = %manager.version(),
                    "chunk manager refreshed"
                );
            }
        }
        entries.insert(ns.to_string(), manager.clone());
        Ok(manager)
    }

    /// Cached snapshot, loading it on first use.
    pub async fn get_or_refresh(
        &self,
        store: &dyn ClusterMetadataStore,
        ns: &str,
    ) -> Result<Arc<ChunkManager>> {
        match self.cached(ns)? {
            Some(manager) => Ok(manager),
            None => self.refresh(store, ns).await,
        }
    }

    pub fn invalidate(&self, ns: &str) -> Result<()> {
        self.entries.write()?.remove(ns);
        Ok(())
    }

    /// Drops every snapshot, returning how many were cached.
    pub fn flush(&self) -> Result<usize> {
        let mut entries = self.entries.write()?;
        let count = entries.len();
        entries.clear();
        Ok(count)
    }
}
