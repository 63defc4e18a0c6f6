//! In-process shards holding JSON documents.
//!
//! Backs the CLI and the test suites. Individual operations can be made to
//! fail per shard to exercise partial-failure paths.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Result, ShardingError};
use crate::index::IndexDescriptor;
use crate::key::ShardKey;
use crate::namespace::Namespace;
use crate::registry::{ShardEntry, ShardId};
use crate::shard_client::{CloneReport, CollectionInfo, RangeRef, ShardClient};
use crate::shard_key::KeyField;

#[derive(Debug, Clone, Default)]
struct SimCollection {
    docs: Vec<Value>,
    indexes: Vec<IndexDescriptor>,
    capped: bool,
}

impl SimCollection {
    fn new(capped: bool) -> Self {
        Self {
            docs: Vec::new(),
            indexes: vec![IndexDescriptor::id_index()],
            capped,
        }
    }
}

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Fault {
    /// Cloning into this shard fails.
    CloneInto,
    /// Deleting ranges on this shard fails.
    DeleteRange,
    /// Index creation on this shard fails.
    CreateIndex,
}

#[derive(Debug, Default)]
struct SimState {
    shards: BTreeMap<ShardId, BTreeMap<String, SimCollection>>,
    faults: BTreeSet<(ShardId, Fault)>,
}

impl SimState {
    fn shard_mut(&mut self, shard: &str) -> Result<&mut BTreeMap<String, SimCollection>> {
        self.shards
            .get_mut(shard)
            .ok_or_else(|| ShardingError::Unavailable(format!("shard {shard} is not reachable")))
    }

    fn shard(&self, shard: &str) -> Result<&BTreeMap<String, SimCollection>> {
        self.shards
            .get(shard)
            .ok_or_else(|| ShardingError::Unavailable(format!("shard {shard} is not reachable")))
    }

    fn check_fault(&self, shard: &str, fault: Fault) -> Result<()> {
        if self.faults.contains(&(shard.to_string(), fault)) {
            return Err(ShardingError::Unavailable(format!(
                "injected {fault:?} failure on {shard}"
            )));
        }
        Ok(())
    }
}

fn in_range(range: &RangeRef<'_>, doc: &Value) -> bool {
    let key = range.pattern.extract_key_or_null(doc);
    &key >= range.min && (&key < range.max || (range.max.is_global_max() && &key == range.max))
}

#[derive(Debug, Default)]
pub struct SimulatedShardCluster {
    state: Mutex<SimState>,
}

impl SimulatedShardCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shards<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ShardId>,
    {
        let sim = Self::new();
        for id in ids {
            sim.add_shard(id);
        }
        sim
    }

    pub fn add_shard(&self, id: impl Into<ShardId>) {
        if let Ok(mut state) = self.state.lock() {
            state.shards.entry(id.into()).or_default();
        }
    }

    pub fn create_collection(&self, shard: &str, ns: &str, capped: bool) -> Result<()> {
        let mut state = self.state.lock()?;
        state
            .shard_mut(shard)?
            .entry(ns.to_string())
            .or_insert_with(|| SimCollection::new(capped));
        Ok(())
    }

    pub fn insert(&self, shard: &str, ns: &str, docs: impl IntoIterator<Item = Value>) -> Result<()> {
        let mut state = self.state.lock()?;
        let coll = state
            .shard_mut(shard)?
            .entry(ns.to_string())
            .or_insert_with(|| SimCollection::new(false));
        coll.docs.extend(docs);
        Ok(())
    }

    pub fn add_index(&self, shard: &str, ns: &str, index: IndexDescriptor) -> Result<()> {
        let mut state = self.state.lock()?;
        let coll = state
            .shard_mut(shard)?
            .entry(ns.to_string())
            .or_insert_with(|| SimCollection::new(false));
        coll.indexes.retain(|idx| idx.name != index.name);
        coll.indexes.push(index);
        Ok(())
    }

    pub fn documents(&self, shard: &str, ns: &str) -> Result<Vec<Value>> {
        let state = self.state.lock()?;
        Ok(state
            .shard(shard)?
            .get(ns)
            .map(|c| c.docs.clone())
            .unwrap_or_default())
    }

    pub fn indexes(&self, shard: &str, ns: &str) -> Result<Vec<IndexDescriptor>> {
        let state = self.state.lock()?;
        Ok(state
            .shard(shard)?
            .get(ns)
            .map(|c| c.indexes.clone())
            .unwrap_or_default())
    }

    pub fn has_collection(&self, shard: &str, ns: &str) -> Result<bool> {
        Ok(self.state.lock()?.shard(shard)?.contains_key(ns))
    }

    pub fn set_fault(&self, shard: &str, fault: Fault, enabled: bool) -> Result<()> {
        let mut state = self.state.lock()?;
        let key = (shard.to_string(), fault);
        if enabled {
            state.faults.insert(key);
        } else {
            state.faults.remove(&key);
        }
        Ok(())
    }
}

#[async_trait]
impl ShardClient for SimulatedShardCluster {
    async fn connect(&self, shard: &ShardEntry) -> Result<()> {
        self.add_shard(shard.id.clone());
        Ok(())
    }

    async fn collection_info(&self, shard: &ShardEntry, ns: &str) -> Result<Option<CollectionInfo>> {
        let state = self.state.lock()?;
        Ok(state.shard(&shard.id)?.get(ns).map(|c| CollectionInfo {
            capped: c.capped,
            count: c.docs.len() as u64,
        }))
    }

    async fn list_indexes(&self, shard: &ShardEntry, ns: &str) -> Result<Vec<IndexDescriptor>> {
        let state = self.state.lock()?;
        Ok(state
            .shard(&shard.id)?
            .get(ns)
            .map(|c| c.indexes.clone())
            .unwrap_or_default())
    }

    async fn create_index(
        &self,
        shard: &ShardEntry,
        ns: &str,
        key: &[KeyField],
        unique: bool,
    ) -> Result<()> {
        let mut state = self.state.lock()?;
        state.check_fault(&shard.id, Fault::CreateIndex)?;
        let coll = state
            .shard_mut(&shard.id)?
            .entry(ns.to_string())
            .or_insert_with(|| SimCollection::new(false));
        let name = IndexDescriptor::default_name(key);
        if !coll.indexes.iter().any(|idx| idx.key.as_slice() == key) {
            coll.indexes.push(IndexDescriptor {
                unique,
                ..IndexDescriptor::new(name, key.to_vec())
            });
        }
        Ok(())
    }

    async fn median_key(&self, shard: &ShardEntry, range: RangeRef<'_>) -> Result<Option<ShardKey>> {
        let state = self.state.lock()?;
        let Some(coll) = state.shard(&shard.id)?.get(range.ns) else {
            return Ok(None);
        };
        let mut keys: Vec<ShardKey> = coll
            .docs
            .iter()
            .filter(|doc| in_range(&range, doc))
            .map(|doc| range.pattern.extract_key_or_null(doc))
            .filter(|key| key < range.max)
            .collect();
        keys.sort();
        let median = match keys.get(keys.len() / 2) {
            Some(key) if key == range.min => keys.iter().find(|k| *k > range.min),
            other => other,
        };
        Ok(median.cloned())
    }

    async fn clone_range(
        &self,
        from: &ShardEntry,
        to: &ShardEntry,
        range: RangeRef<'_>,
        max_bytes: u64,
    ) -> Result<CloneReport> {
        let mut state = self.state.lock()?;
        let source = state
            .shard(&from.id)?
            .get(range.ns)
            .cloned()
            .unwrap_or_default();
        let docs: Vec<Value> = source
            .docs
            .iter()
            .filter(|doc| in_range(&range, doc))
            .cloned()
            .collect();
        let bytes = docs
            .iter()
            .map(|doc| serde_json::to_vec(doc).map(|v| v.len() as u64))
            .sum::<std::result::Result<u64, _>>()?;
        if bytes > max_bytes {
            return Err(ShardingError::ChunkTooLarge {
                bytes,
                limit: max_bytes,
            });
        }
        state.check_fault(&to.id, Fault::CloneInto)?;
        let report = CloneReport {
            docs: docs.len() as u64,
            bytes,
        };
        let target = state
            .shard_mut(&to.id)?
            .entry(range.ns.to_string())
            .or_insert_with(|| SimCollection {
                docs: Vec::new(),
                indexes: source.indexes.clone(),
                capped: source.capped,
            });
        target.docs.extend(docs);
        Ok(report)
    }

    async fn discard_clone(&self, to: &ShardEntry, range: RangeRef<'_>) -> Result<()> {
        let mut state = self.state.lock()?;
        if let Some(coll) = state.shard_mut(&to.id)?.get_mut(range.ns) {
            coll.docs.retain(|doc| !in_range(&range, doc));
        }
        Ok(())
    }

    async fn delete_range(&self, shard: &ShardEntry, range: RangeRef<'_>) -> Result<u64> {
        let mut state = self.state.lock()?;
        state.check_fault(&shard.id, Fault::DeleteRange)?;
        let Some(coll) = state.shard_mut(&shard.id)?.get_mut(range.ns) else {
            return Ok(0);
        };
        let before = coll.docs.len();
        coll.docs.retain(|doc| !in_range(&range, doc));
        Ok((before - coll.docs.len()) as u64)
    }

    async fn clone_database(
        &self,
        from: &ShardEntry,
        to: &ShardEntry,
        db: &str,
        skip: &[String],
    ) -> Result<Vec<String>> {
        let mut state = self.state.lock()?;
        state.check_fault(&to.id, Fault::CloneInto)?;
        let to_copy: Vec<(String, SimCollection)> = state
            .shard(&from.id)?
            .iter()
            .filter(|(ns, _)| {
                Namespace::parse(ns).map(|n| n.db() == db).unwrap_or(false) && !skip.contains(ns)
            })
            .map(|(ns, coll)| (ns.clone(), coll.clone()))
            .collect();
        let target = state.shard_mut(&to.id)?;
        let mut cloned = Vec::with_capacity(to_copy.len());
        for (ns, coll) in to_copy {
            target.insert(ns.clone(), coll);
            cloned.push(ns);
        }
        Ok(cloned)
    }

    async fn drop_collections(&self, shard: &ShardEntry, namespaces: &[String]) -> Result<()> {
        let mut state = self.state.lock()?;
        let colls = state.shard_mut(&shard.id)?;
        for ns in namespaces {
            colls.remove(ns);
        }
        Ok(())
    }
}
