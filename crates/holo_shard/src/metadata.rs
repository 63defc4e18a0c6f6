//! Authoritative cluster metadata.
//!
//! All mutations go through [`MetadataCommand`]s. Each command re-checks the
//! state it was planned against and fails with a concurrency error when that
//! state moved underneath it, so a command either applies completely or not
//! at all.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::chunk::{check_coverage, Chunk, ChunkManager, ChunkVersion};
use crate::error::{Result, ShardingError};
use crate::key::ShardKey;
use crate::namespace::Namespace;
use crate::registry::{ShardEntry, ShardId, ShardRegistry};
use crate::shard_key::ShardKeyPattern;
use crate::unix_time_ms;

/// Number of change log entries kept in memory and on disk.
pub const CHANGELOG_LIMIT: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseEntry {
    pub name: String,
    pub primary: ShardId,
    #[serde(default)]
    pub sharding_enabled: bool,
}

/// A sharded collection. Unsharded collections have no entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionMetadata {
    pub ns: String,
    pub key_pattern: ShardKeyPattern,
    #[serde(default)]
    pub unique: bool,
    /// Changes every time the collection is (re)sharded.
    pub epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub epoch: u64,
    pub unix_ms: u64,
    pub what: String,
    pub ns: String,
    pub details: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterMetadata {
    pub epoch: u64,
    pub shards: ShardRegistry,
    #[serde(default)]
    pub databases: BTreeMap<String, DatabaseEntry>,
    #[serde(default)]
    pub collections: BTreeMap<String, CollectionMetadata>,
    /// Chunks per namespace, sorted by min.
    #[serde(default)]
    pub chunks: BTreeMap<String, Vec<Chunk>>,
    #[serde(default)]
    pub changelog: VecDeque<ChangeLogEntry>,
}

/// A validated metadata mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetadataCommand {
    AddShard {
        entry: ShardEntry,
    },
    SetShardDraining {
        shard: ShardId,
    },
    RemoveShard {
        shard: ShardId,
    },
    EnableSharding {
        database: String,
        primary: ShardId,
    },
    SetDatabasePrimary {
        database: String,
        expected: ShardId,
        primary: ShardId,
    },
    ShardCollection {
        collection: CollectionMetadata,
        chunks: Vec<Chunk>,
    },
    /// Replaces `parent` by `children`, which must tile the same range.
    SplitChunk {
        ns: String,
        parent: Chunk,
        children: Vec<Chunk>,
    },
    /// Reassigns `[min, max)` from `from` to `to` if it is still at `expected`.
    CommitChunkMove {
        ns: String,
        min: ShardKey,
        max: ShardKey,
        expected: ChunkVersion,
        from: ShardId,
        to: ShardId,
        version: ChunkVersion,
    },
}

impl MetadataCommand {
    fn change_log_entry(&self, epoch: u64) -> ChangeLogEntry {
        let (what, ns, details) = match self {
            MetadataCommand::AddShard { entry } => (
                "addShard",
                String::new(),
                json!({"shard": entry.id, "host": entry.endpoint}),
            ),
            MetadataCommand::SetShardDraining { shard } => {
                ("removeShard.start", String::new(), json!({"shard": shard}))
            }
            MetadataCommand::RemoveShard { shard } => {
                ("removeShard", String::new(), json!({"shard": shard}))
            }
            MetadataCommand::EnableSharding { database, primary } => (
                "enableSharding",
                database.clone(),
                json!({"primary": primary}),
            ),
            MetadataCommand::SetDatabasePrimary {
                database,
                expected,
                primary,
            } => (
                "movePrimary",
                database.clone(),
                json!({"from": expected, "to": primary}),
            ),
            MetadataCommand::ShardCollection { collection, chunks } => (
                "shardCollection",
                collection.ns.clone(),
                json!({
                    "shardKey": collection.key_pattern.to_document(),
                    "unique": collection.unique,
                    "numChunks": chunks.len(),
                }),
            ),
            MetadataCommand::SplitChunk {
                ns,
                parent,
                children,
            } => (
                if children.len() > 2 { "multi-split" } else { "split" },
                ns.clone(),
                json!({
                    "before": {"min": parent.min, "max": parent.max, "lastmod": parent.version},
                    "number": children.len(),
                }),
            ),
            MetadataCommand::CommitChunkMove {
                ns,
                min,
                max,
                from,
                to,
                version,
                ..
            } => (
                "moveChunk.commit",
                ns.clone(),
                json!({"min": min, "max": max, "from": from, "to": to, "lastmod": version}),
            ),
        };
        ChangeLogEntry {
            epoch,
            unix_ms: unix_time_ms(),
            what: what.to_string(),
            ns,
            details,
        }
    }
}

impl ClusterMetadata {
    pub fn with_shards(shards: impl IntoIterator<Item = ShardEntry>) -> Self {
        Self {
            epoch: 1,
            shards: ShardRegistry::from_entries(shards),
            ..Self::default()
        }
    }

    pub fn database(&self, name: &str) -> Option<&DatabaseEntry> {
        self.databases.get(name)
    }

    pub fn collection(&self, ns: &str) -> Option<&CollectionMetadata> {
        self.collections.get(ns)
    }

    pub fn chunk_manager(&self, ns: &str) -> Result<ChunkManager> {
        let coll = self
            .collections
            .get(ns)
            .ok_or_else(|| ShardingError::NamespaceNotSharded(ns.to_string()))?;
        let chunks = self.chunks.get(ns).cloned().unwrap_or_default();
        ChunkManager::new(
            ns,
            coll.key_pattern.clone(),
            coll.unique,
            coll.epoch,
            chunks,
        )
    }

    pub fn collection_version(&self, ns: &str) -> ChunkVersion {
        self.chunks
            .get(ns)
            .and_then(|chunks| chunks.iter().map(|c| c.version).max())
            .unwrap_or_default()
    }

    pub fn chunk_count_on(&self, shard: &str) -> usize {
        self.chunks
            .values()
            .flatten()
            .filter(|c| c.shard == shard)
            .count()
    }

    pub fn databases_with_primary(&self, shard: &str) -> Vec<String> {
        self.databases
            .values()
            .filter(|db| db.primary == shard)
            .map(|db| db.name.clone())
            .collect()
    }

    /// Sharded collections that live in `db`.
    pub fn sharded_collections_in(&self, db: &str) -> Vec<String> {
        self.collections
            .keys()
            .filter(|ns| Namespace::parse(ns).map(|n| n.db() == db).unwrap_or(false))
            .cloned()
            .collect()
    }

    /// Primary for a database created implicitly: the non-draining shard
    /// owning the fewest chunks, ties broken by shard id.
    pub fn pick_primary(&self) -> Option<ShardId> {
        self.shards
            .active()
            .min_by_key(|entry| (self.chunk_count_on(&entry.id), entry.id.clone()))
            .map(|entry| entry.id.clone())
    }

    fn require_shard(&self, shard: &str) -> Result<&ShardEntry> {
        self.shards
            .get(shard)
            .ok_or_else(|| ShardingError::UnknownShard(shard.to_string()))
    }

    fn apply(&mut self, cmd: &MetadataCommand) -> Result<()> {
        match cmd {
            MetadataCommand::AddShard { entry } => {
                if self.shards.contains(&entry.id) {
                    return Err(ShardingError::DuplicateShard(entry.id.clone()));
                }
                if let Some(existing) = self.shards.find_by_endpoint(&entry.endpoint) {
                    return Err(ShardingError::DuplicateShard(format!(
                        "{} is already registered as {}",
                        entry.endpoint, existing.id
                    )));
                }
                self.shards.insert(entry.clone());
            }
            MetadataCommand::SetShardDraining { shard } => {
                if let Some(other) = self.shards.draining_shard() {
                    if &other.id != shard {
                        return Err(ShardingError::AnotherShardDraining(other.id.clone()));
                    }
                }
                self.shards
                    .get_mut(shard)
                    .ok_or_else(|| ShardingError::UnknownShard(shard.clone()))?
                    .draining = true;
            }
            MetadataCommand::RemoveShard { shard } => {
                self.require_shard(shard)?;
                let chunks = self.chunk_count_on(shard);
                let dbs = self.databases_with_primary(shard).len();
                if chunks > 0 || dbs > 0 {
                    return Err(ShardingError::StaleVersion(format!(
                        "shard {shard} still owns {chunks} chunks and {dbs} databases"
                    )));
                }
                self.shards.remove(shard);
            }
            MetadataCommand::EnableSharding { database, primary } => {
                match self.databases.get_mut(database) {
                    Some(db) if db.sharding_enabled => {
                        return Err(ShardingError::AlreadyEnabled(database.clone()));
                    }
                    Some(db) => db.sharding_enabled = true,
                    None => {
                        self.require_shard(primary)?;
                        self.databases.insert(
                            database.clone(),
                            DatabaseEntry {
                                name: database.clone(),
                                primary: primary.clone(),
                                sharding_enabled: true,
                            },
                        );
                    }
                }
            }
            MetadataCommand::SetDatabasePrimary {
                database,
                expected,
                primary,
            } => {
                self.require_shard(primary)?;
                let db = self
                    .databases
                    .get_mut(database)
                    .ok_or_else(|| ShardingError::UnknownDatabase(database.clone()))?;
                if &db.primary != expected {
                    return Err(ShardingError::StaleVersion(format!(
                        "primary of {database} is {} not {expected}",
                        db.primary
                    )));
                }
                db.primary = primary.clone();
            }
            MetadataCommand::ShardCollection { collection, chunks } => {
                let ns = Namespace::parse(&collection.ns)?;
                if !self
                    .databases
                    .get(ns.db())
                    .map(|db| db.sharding_enabled)
                    .unwrap_or(false)
                {
                    return Err(ShardingError::ShardingNotEnabled(ns.db().to_string()));
                }
                if self.collections.contains_key(&collection.ns) {
                    return Err(ShardingError::AlreadySharded(collection.ns.clone()));
                }
                let mut chunks = chunks.clone();
                chunks.sort_by(|a, b| a.min.cmp(&b.min));
                check_coverage(&collection.ns, &collection.key_pattern, &chunks)?;
                for chunk in &chunks {
                    self.require_shard(&chunk.shard)?;
                }
                self.collections
                    .insert(collection.ns.clone(), collection.clone());
                self.chunks.insert(collection.ns.clone(), chunks);
            }
            MetadataCommand::SplitChunk {
                ns,
                parent,
                children,
            } => {
                let coll_version = self.collection_version(ns);
                let pattern = self
                    .collections
                    .get(ns)
                    .map(|c| c.key_pattern.clone())
                    .ok_or_else(|| ShardingError::NamespaceNotSharded(ns.clone()))?;
                let chunks = self
                    .chunks
                    .get_mut(ns)
                    .ok_or_else(|| ShardingError::NamespaceNotSharded(ns.clone()))?;
                let pos = chunks
                    .iter()
                    .position(|c| c == parent)
                    .ok_or_else(|| {
                        ShardingError::StaleVersion(format!(
                            "chunk {} of {ns} changed since the split was planned",
                            parent.range_string()
                        ))
                    })?;
                let contiguous = children.windows(2).all(|w| w[0].max == w[1].min);
                let same_range = children.first().map(|c| &c.min) == Some(&parent.min)
                    && children.last().map(|c| &c.max) == Some(&parent.max);
                if !contiguous || !same_range || children.len() < 2 {
                    return Err(ShardingError::InconsistentMetadata(format!(
                        "split children of {} do not tile the parent range",
                        parent.range_string()
                    )));
                }
                if children
                    .iter()
                    .any(|c| c.shard != parent.shard || c.version <= coll_version || c.min >= c.max)
                {
                    return Err(ShardingError::StaleVersion(format!(
                        "split of {} planned against an older collection version than {coll_version}",
                        parent.range_string()
                    )));
                }
                chunks.splice(pos..=pos, children.iter().cloned());
                check_coverage(ns, &pattern, chunks)?;
            }
            MetadataCommand::CommitChunkMove {
                ns,
                min,
                max,
                expected,
                from,
                to,
                version,
            } => {
                let target = self.require_shard(to)?;
                if target.draining {
                    return Err(ShardingError::ShardDraining(to.clone()));
                }
                let coll_version = self.collection_version(ns);
                let chunk = self
                    .chunks
                    .get_mut(ns)
                    .and_then(|chunks| chunks.iter_mut().find(|c| &c.min == min))
                    .ok_or_else(|| ShardingError::ChunkNotFound(format!("{ns} {min}")))?;
                if &chunk.max != max || &chunk.shard != from {
                    return Err(ShardingError::StaleVersion(format!(
                        "chunk {} of {ns} is no longer {min} -> {max} on {from}",
                        chunk.range_string()
                    )));
                }
                if chunk.version != *expected {
                    return Err(ShardingError::VersionMismatch {
                        ns: ns.clone(),
                        expected: *expected,
                        found: chunk.version,
                    });
                }
                if *version <= coll_version {
                    return Err(ShardingError::StaleVersion(format!(
                        "new version {version} does not advance {ns} past {coll_version}"
                    )));
                }
                chunk.shard = to.clone();
                chunk.version = *version;
            }
        }
        Ok(())
    }
}

/// Authoritative store of cluster metadata.
#[async_trait]
pub trait ClusterMetadataStore: Send + Sync {
    /// A consistent copy of the whole metadata.
    async fn snapshot(&self) -> Result<ClusterMetadata>;

    /// Applies `cmd` atomically and returns the new metadata epoch.
    async fn apply(&self, cmd: MetadataCommand) -> Result<u64>;
}

/// Metadata held in memory, optionally persisted as JSON after every change.
#[derive(Clone)]
pub struct MetadataStateStore {
    state: Arc<RwLock<ClusterMetadata>>,
    path: Option<PathBuf>,
}

impl MetadataStateStore {
    pub fn in_memory(shards: impl IntoIterator<Item = ShardEntry>) -> Self {
        Self {
            state: Arc::new(RwLock::new(ClusterMetadata::with_shards(shards))),
            path: None,
        }
    }

    /// Loads `path` if it exists, otherwise starts from `shards` and writes
    /// the initial state.
    pub fn load_or_init(
        path: impl AsRef<Path>,
        shards: impl IntoIterator<Item = ShardEntry>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match fs::read(&path) {
            Ok(data) => serde_json::from_slice::<ClusterMetadata>(&data).map_err(|err| {
                ShardingError::InconsistentMetadata(format!(
                    "can't parse {}: {err}",
                    path.display()
                ))
            })?,
            Err(err) if err.kind() == IoErrorKind::NotFound => ClusterMetadata::with_shards(shards),
            Err(err) => return Err(err.into()),
        };
        let store = Self {
            state: Arc::new(RwLock::new(state)),
            path: Some(path),
        };
        let current = store.state()?;
        store.persist(&current)?;
        Ok(store)
    }

    pub fn state(&self) -> Result<ClusterMetadata> {
        Ok(self.state.read()?.clone())
    }

    pub fn epoch(&self) -> Result<u64> {
        Ok(self.state.read()?.epoch)
    }

    pub fn changelog(&self) -> Result<Vec<ChangeLogEntry>> {
        Ok(self.state.read()?.changelog.iter().cloned().collect())
    }

    /// Applies `cmd` to a copy of the state, persists the copy, then swaps it in.
    pub fn apply_command(&self, cmd: MetadataCommand) -> Result<u64> {
        let mut state = self.state.write()?;
        let mut next = state.clone();
        next.apply(&cmd)?;
        next.epoch = next.epoch.saturating_add(1);
        let entry = cmd.change_log_entry(next.epoch);
        tracing::debug!(epoch = next.epoch, what = %entry.what, ns = %entry.ns, "metadata change");
        next.changelog.push_back(entry);
        while next.changelog.len() > CHANGELOG_LIMIT {
            next.changelog.pop_front();
        }
        self.persist(&next)?;
        *state = next;
        Ok(state.epoch)
    }

    fn persist(&self, state: &ClusterMetadata) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(state)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[async_trait]
impl ClusterMetadataStore for MetadataStateStore {
    async fn snapshot(&self) -> Result<ClusterMetadata> {
        self.state()
    }

    async fn apply(&self, cmd: MetadataCommand) -> Result<u64> {
        self.apply_command(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyValue;
    use proptest::prelude::*;
    use serde_json::json;

    fn shards() -> Vec<ShardEntry> {
        vec![ShardEntry::new("s1", "h1:27018"), ShardEntry::new("s2", "h2:27018")]
    }

    fn pattern() -> ShardKeyPattern {
        ShardKeyPattern::from_document(&json!({"a": 1})).expect("pattern")
    }

    fn key(v: i64) -> ShardKey {
        ShardKey::new(vec![KeyValue::Int(v)])
    }

    fn chunk(min: ShardKey, max: ShardKey, shard: &str, version: ChunkVersion) -> Chunk {
        Chunk {
            ns: "db.c".into(),
            min,
            max,
            shard: shard.into(),
            version,
        }
    }

    fn sharded_store() -> MetadataStateStore {
        let store = MetadataStateStore::in_memory(shards());
        store
            .apply_command(MetadataCommand::EnableSharding {
                database: "db".into(),
                primary: "s1".into(),
            })
            .expect("enable");
        store
            .apply_command(MetadataCommand::ShardCollection {
                collection: CollectionMetadata {
                    ns: "db.c".into(),
                    key_pattern: pattern(),
                    unique: false,
                    epoch: 1,
                },
                chunks: vec![chunk(
                    pattern().global_min(),
                    pattern().global_max(),
                    "s1",
                    ChunkVersion::new(1, 0),
                )],
            })
            .expect("shard collection");
        store
    }

    #[test]
    fn enable_sharding_twice_is_rejected() {
        let store = sharded_store();
        let err = store
            .apply_command(MetadataCommand::EnableSharding {
                database: "db".into(),
                primary: "s1".into(),
            })
            .expect_err("already enabled");
        assert_eq!(err, ShardingError::AlreadyEnabled("db".into()));
    }

    #[test]
    fn split_replaces_parent_and_bumps_epoch() {
        let store = sharded_store();
        let before = store.epoch().expect("epoch");
        let parent = chunk(pattern().global_min(), pattern().global_max(), "s1", ChunkVersion::new(1, 0));
        store
            .apply_command(MetadataCommand::SplitChunk {
                ns: "db.c".into(),
                parent: parent.clone(),
                children: vec![
                    chunk(pattern().global_min(), key(0), "s1", ChunkVersion::new(1, 1)),
                    chunk(key(0), pattern().global_max(), "s1", ChunkVersion::new(1, 2)),
                ],
            })
            .expect("split");
        let state = store.state().expect("state");
        assert_eq!(state.epoch, before + 1);
        assert_eq!(state.chunks["db.c"].len(), 2);
        assert_eq!(state.changelog.back().map(|e| e.what.as_str()), Some("split"));

        let err = store
            .apply_command(MetadataCommand::SplitChunk {
                ns: "db.c".into(),
                parent,
                children: vec![],
            })
            .expect_err("parent is gone");
        assert_eq!(err.kind(), crate::error::ErrorKind::Concurrency);
    }

    #[test]
    fn commit_requires_expected_version() {
        let store = sharded_store();
        let cmd = |expected| MetadataCommand::CommitChunkMove {
            ns: "db.c".into(),
            min: pattern().global_min(),
            max: pattern().global_max(),
            expected,
            from: "s1".into(),
            to: "s2".into(),
            version: ChunkVersion::new(2, 0),
        };
        let err = store
            .apply_command(cmd(ChunkVersion::new(1, 5)))
            .expect_err("stale");
        assert_eq!(err.code_name(), "VersionMismatch");
        assert_eq!(store.state().expect("state").chunks["db.c"][0].shard, "s1");

        store.apply_command(cmd(ChunkVersion::new(1, 0))).expect("commit");
        let state = store.state().expect("state");
        assert_eq!(state.chunks["db.c"][0].shard, "s2");
        assert_eq!(state.collection_version("db.c"), ChunkVersion::new(2, 0));
    }

    #[test]
    fn remove_shard_refuses_while_data_remains() {
        let store = sharded_store();
        let err = store
            .apply_command(MetadataCommand::RemoveShard { shard: "s1".into() })
            .expect_err("owns data");
        assert_eq!(err.kind(), crate::error::ErrorKind::Concurrency);
        store
            .apply_command(MetadataCommand::RemoveShard { shard: "s2".into() })
            .expect("empty shard");
        assert!(!store.state().expect("state").shards.contains("s2"));
    }

    #[test]
    fn persists_and_reloads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("meta").join("state.json");
        let store = MetadataStateStore::load_or_init(&path, shards()).expect("init");
        store
            .apply_command(MetadataCommand::EnableSharding {
                database: "db".into(),
                primary: "s2".into(),
            })
            .expect("enable");

        let reloaded = MetadataStateStore::load_or_init(&path, Vec::new()).expect("reload");
        let state = reloaded.state().expect("state");
        assert_eq!(state.shards.len(), 2);
        assert_eq!(state.database("db").map(|d| d.primary.as_str()), Some("s2"));
        assert_eq!(state.epoch, store.epoch().expect("epoch"));
    }

    #[test]
    fn pick_primary_prefers_least_loaded_shard() {
        let store = sharded_store();
        assert_eq!(store.state().expect("state").pick_primary().as_deref(), Some("s2"));
    }

    proptest! {
        #[test]
        fn splits_preserve_coverage(points in proptest::collection::btree_set(-1000i64..1000, 1..20)) {
            let store = sharded_store();
            let mut version = ChunkVersion::new(1, 0);
            for p in points {
                let state = store.state().expect("state");
                let parent = state.chunk_manager("db.c").expect("manager")
                    .find_intersecting_chunk(&key(p)).expect("chunk").clone();
                if parent.min == key(p) {
                    continue;
                }
                let left = version.next_minor();
                let right = left.next_minor();
                version = right;
                store.apply_command(MetadataCommand::SplitChunk {
                    ns: "db.c".into(),
                    parent: parent.clone(),
                    children: vec![
                        chunk(parent.min.clone(), key(p), "s1", left),
                        chunk(key(p), parent.max.clone(), "s1", right),
                    ],
                }).expect("split");
                let state = store.state().expect("state");
                prop_assert!(state.chunk_manager("db.c").is_ok());
            }
        }
    }
}
