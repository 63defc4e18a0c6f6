//! Chunks and immutable routing snapshots.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShardingError};
use crate::key::ShardKey;
use crate::registry::ShardId;
use crate::shard_key::ShardKeyPattern;

/// `(major, minor)` version of a chunk.
///
/// The major component moves when ownership changes, the minor component
/// when a chunk is split in place.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ChunkVersion {
    pub major: u32,
    pub minor: u32,
}

impl ChunkVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    pub fn is_set(&self) -> bool {
        self.major > 0
    }

    pub fn next_major(self) -> Self {
        Self::new(self.major.saturating_add(1), 0)
    }

    pub fn next_minor(self) -> Self {
        Self::new(self.major, self.minor.saturating_add(1))
    }
}

impl fmt::Display for ChunkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.major, self.minor)
    }
}

/// Contiguous half-open key range `[min, max)` of one collection, owned by one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub ns: String,
    pub min: ShardKey,
    pub max: ShardKey,
    pub shard: ShardId,
    pub version: ChunkVersion,
}

impl Chunk {
    /// The chunk ending at the global maximum also owns the `MaxKey` point.
    pub fn contains_key(&self, key: &ShardKey) -> bool {
        key >= &self.min && (key < &self.max || (self.max.is_global_max() && key == &self.max))
    }

    pub fn same_range(&self, other: &Chunk) -> bool {
        self.min == other.min && self.max == other.max
    }

    pub fn range_string(&self) -> String {
        format!("{} -> {}", self.min, self.max)
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} on {} v{}",
            self.ns,
            self.range_string(),
            self.shard,
            self.version
        )
    }
}

/// Checks that `chunks`, sorted by min, tile the whole key space.
pub fn check_coverage(ns: &str, pattern: &ShardKeyPattern, chunks: &[Chunk]) -> Result<()> {
    let (Some(first), Some(last)) = (chunks.first(), chunks.last()) else {
        return Err(ShardingError::InconsistentMetadata(format!(
            "{ns} has no chunks"
        )));
    };
    if first.min != pattern.global_min() {
        return Err(ShardingError::InconsistentMetadata(format!(
            "{ns} first chunk starts at {} instead of the global minimum",
            first.min
        )));
    }
    if last.max != pattern.global_max() {
        return Err(ShardingError::InconsistentMetadata(format!(
            "{ns} last chunk ends at {} instead of the global maximum",
            last.max
        )));
    }
    for chunk in chunks {
        if chunk.min >= chunk.max {
            return Err(ShardingError::InconsistentMetadata(format!(
                "{ns} chunk {} is empty or inverted",
                chunk.range_string()
            )));
        }
        if chunk.min.len() != pattern.len() || chunk.max.len() != pattern.len() {
            return Err(ShardingError::InconsistentMetadata(format!(
                "{ns} chunk {} does not match pattern {pattern}",
                chunk.range_string()
            )));
        }
    }
    for pair in chunks.windows(2) {
        if pair[0].max != pair[1].min {
            return Err(ShardingError::InconsistentMetadata(format!(
                "{ns} chunks {} and {} are not contiguous",
                pair[0].range_string(),
                pair[1].range_string()
            )));
        }
    }
    Ok(())
}

/// Immutable routing table of one sharded collection.
///
/// Readers hold it behind an `Arc`; a refresh builds a new one instead of
/// mutating this.
#[derive(Debug, Clone)]
pub struct ChunkManager {
    ns: String,
    pattern: ShardKeyPattern,
    unique: bool,
    epoch: u64,
    chunks: BTreeMap<ShardKey, Chunk>,
    version: ChunkVersion,
    shard_versions: BTreeMap<ShardId, ChunkVersion>,
}

impl ChunkManager {
    pub fn new(
        ns: impl Into<String>,
        pattern: ShardKeyPattern,
        unique: bool,
        epoch: u64,
        mut chunks: Vec<Chunk>,
    ) -> Result<Self> {
        let ns = ns.into();
        chunks.sort_by(|a, b| a.min.cmp(&b.min));
        check_coverage(&ns, &pattern, &chunks)?;

        let mut version = ChunkVersion::default();
        let mut shard_versions: BTreeMap<ShardId, ChunkVersion> = BTreeMap::new();
        for chunk in &chunks {
            version = version.max(chunk.version);
            let entry = shard_versions.entry(chunk.shard.clone()).or_default();
            *entry = (*entry).max(chunk.version);
        }
        let chunks = chunks.into_iter().map(|c| (c.min.clone(), c)).collect();
        Ok(Self {
            ns,
            pattern,
            unique,
            epoch,
            chunks,
            version,
            shard_versions,
        })
    }

    pub fn ns(&self) -> &str {
        &self.ns
    }

    pub fn pattern(&self) -> &ShardKeyPattern {
        &self.pattern
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Highest chunk version in the collection.
    pub fn version(&self) -> ChunkVersion {
        self.version
    }

    /// Highest version of any chunk on `shard`, or `0|0` when it owns none.
    pub fn shard_version(&self, shard: &str) -> ChunkVersion {
        self.shard_versions.get(shard).copied().unwrap_or_default()
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }

    pub fn chunks_on(&self, shard: &str) -> usize {
        self.chunks.values().filter(|c| c.shard == shard).count()
    }

    pub fn shards(&self) -> impl Iterator<Item = &ShardId> {
        self.shard_versions.keys()
    }

    pub fn find_intersecting_chunk(&self, key: &ShardKey) -> Option<&Chunk> {
        self.chunks
            .range((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .map(|(_, chunk)| chunk)
            .filter(|chunk| chunk.contains_key(key))
    }

    pub fn find_chunk_with_bounds(&self, min: &ShardKey, max: &ShardKey) -> Option<&Chunk> {
        self.chunks.get(min).filter(|chunk| &chunk.max == max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyValue;
    use serde_json::json;

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

    fn manager() -> ChunkManager {
        let pattern = ShardKeyPattern::from_document(&json!({"a": 1})).expect("pattern");
        let chunks = vec![
            chunk(key(10), pattern.global_max(), "s2", ChunkVersion::new(2, 0)),
            chunk(pattern.global_min(), key(10), "s1", ChunkVersion::new(1, 1)),
        ];
        ChunkManager::new("db.c", pattern, false, 1, chunks).expect("manager")
    }

    #[test]
    fn routes_keys_to_owning_chunk() {
        let m = manager();
        assert_eq!(m.find_intersecting_chunk(&key(-5)).expect("chunk").shard, "s1");
        assert_eq!(m.find_intersecting_chunk(&key(10)).expect("chunk").shard, "s2");
        assert_eq!(
            m.find_intersecting_chunk(&m.pattern().global_max())
                .expect("chunk")
                .shard,
            "s2"
        );
    }

    #[test]
    fn tracks_collection_and_shard_versions() {
        let m = manager();
        assert_eq!(m.version(), ChunkVersion::new(2, 0));
        assert_eq!(m.shard_version("s1"), ChunkVersion::new(1, 1));
        assert_eq!(m.shard_version("s3"), ChunkVersion::default());
        assert_eq!(m.chunks_on("s2"), 1);
    }

    #[test]
    fn bounds_lookup_requires_exact_match() {
        let m = manager();
        assert!(m.find_chunk_with_bounds(&key(10), &m.pattern().global_max()).is_some());
        assert!(m.find_chunk_with_bounds(&key(10), &key(20)).is_none());
    }

    #[test]
    fn coverage_gaps_are_rejected() {
        let pattern = ShardKeyPattern::from_document(&json!({"a": 1})).expect("pattern");
        let chunks = vec![
            chunk(pattern.global_min(), key(0), "s1", ChunkVersion::new(1, 0)),
            chunk(key(5), pattern.global_max(), "s1", ChunkVersion::new(1, 1)),
        ];
        let err = ChunkManager::new("db.c", pattern, false, 1, chunks).expect_err("gap");
        assert_eq!(err.code_name(), "InconsistentMetadata");
    }

    #[test]
    fn version_ordering_is_major_then_minor() {
        assert!(ChunkVersion::new(1, 9) < ChunkVersion::new(2, 0));
        assert_eq!(ChunkVersion::new(3, 4).next_major(), ChunkVersion::new(4, 0));
        assert_eq!(ChunkVersion::new(3, 4).to_string(), "3|4");
    }
}
