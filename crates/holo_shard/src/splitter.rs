//! Split point computation.

use crate::chunk::{Chunk, ChunkManager, ChunkVersion};
use crate::error::{Result, ShardingError};
use crate::key::{KeyValue, ShardKey};
use crate::registry::ShardId;
use crate::shard_key::ShardKeyPattern;

/// Chunk layout for a new, empty collection with a hashed shard key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedPresplit {
    /// Every boundary of the final layout, sorted.
    pub all_splits: Vec<ShardKey>,
    /// Boundaries of the coarse chunks created at sharding time, one chunk
    /// per destination shard.
    pub initial_splits: Vec<ShardKey>,
}

/// Evenly spaced hash values splitting the signed 64-bit space into
/// `num_chunks` ranges.
///
/// Inputs:
/// - `num_chunks`: desired number of chunks, at least 1.
///
/// Output:
/// - `num_chunks - 1` sorted split values. An even count includes 0; the
///   set is symmetric around 0 either way.
pub fn hashed_split_values(num_chunks: usize) -> Vec<i64> {
    let n = num_chunks.max(1) as i128;
    let interval = (i128::from(i64::MAX) / n) * 2;
    let mut values = Vec::with_capacity(num_chunks);
    let mut current = if n % 2 == 0 {
        values.push(0);
        interval
    } else {
        interval / 2
    };
    for _ in 0..(n - 1) / 2 {
        values.push(current as i64);
        values.push(-current as i64);
        current += interval;
    }
    values.sort_unstable();
    values
}

/// Picks which of `all` become the coarse boundaries so that each of
/// `shard_count` shards receives one contiguous block of the final chunks.
pub fn coarse_split_values(all: &[i64], shard_count: usize) -> Vec<i64> {
    let n = all.len() + 1;
    let mut last_index: i64 = -1;
    let mut coarse = Vec::new();
    for i in 1..shard_count {
        let index = (i * n / shard_count) as i64 - 1;
        if index > last_index {
            last_index = index;
            if let Some(value) = all.get(index as usize) {
                coarse.push(*value);
            }
        }
    }
    coarse
}

/// Largest hashed pre-split, per active shard, that shardCollection accepts.
pub const MAX_INITIAL_CHUNKS_PER_SHARD: u64 = 8192;

/// Plans the pre-split of a hashed collection.
///
/// `requested` of `None` or zero means two chunks per shard.
pub fn plan_hashed_presplit(requested: Option<u64>, shard_count: usize) -> HashedPresplit {
    let shard_count = shard_count.max(1);
    let num_chunks = match requested {
        Some(n) if n > 0 => {
            let cap = MAX_INITIAL_CHUNKS_PER_SHARD.saturating_mul(shard_count as u64);
            usize::try_from(n.min(cap)).unwrap_or(2 * shard_count)
        }
        _ => 2 * shard_count,
    };
    let all = hashed_split_values(num_chunks);
    let coarse = coarse_split_values(&all, shard_count);
    let to_key = |v: &i64| ShardKey::new(vec![KeyValue::Int(*v)]);
    HashedPresplit {
        all_splits: all.iter().map(to_key).collect(),
        initial_splits: coarse.iter().map(to_key).collect(),
    }
}

/// Builds the chunks of a freshly sharded collection, all on `shard`.
///
/// Versions start at `1|0` and count up the minor component.
pub fn initial_chunks(
    ns: &str,
    pattern: &ShardKeyPattern,
    split_points: &[ShardKey],
    shard: &ShardId,
) -> Vec<Chunk> {
    let mut bounds = Vec::with_capacity(split_points.len() + 2);
    bounds.push(pattern.global_min());
    bounds.extend(split_points.iter().cloned());
    bounds.push(pattern.global_max());
    bounds
        .windows(2)
        .enumerate()
        .map(|(i, pair)| Chunk {
            ns: ns.to_string(),
            min: pair[0].clone(),
            max: pair[1].clone(),
            shard: shard.clone(),
            version: ChunkVersion::new(1, i as u32),
        })
        .collect()
}

/// Splits `chunk` at `points` into contiguous children.
///
/// Children stay on the parent's shard and take consecutive minor versions
/// after `collection_version`, so they sort after every existing chunk.
pub fn split_chunk(
    chunk: &Chunk,
    points: &[ShardKey],
    collection_version: ChunkVersion,
) -> Result<Vec<Chunk>> {
    let mut points = points.to_vec();
    points.sort();
    points.dedup();
    if points.is_empty() {
        return Err(ShardingError::NoSplitPoint(chunk.range_string()));
    }
    for point in &points {
        if point == &chunk.min || point == &chunk.max {
            return Err(ShardingError::SplitPointOnBoundary(format!(
                "{point} is a boundary of chunk {}",
                chunk.range_string()
            )));
        }
        if point < &chunk.min || point > &chunk.max {
            return Err(ShardingError::BadRequest(format!(
                "split point {point} is outside chunk {}",
                chunk.range_string()
            )));
        }
    }

    let mut bounds = Vec::with_capacity(points.len() + 2);
    bounds.push(chunk.min.clone());
    bounds.extend(points);
    bounds.push(chunk.max.clone());
    let mut version = collection_version;
    Ok(bounds
        .windows(2)
        .map(|pair| {
            version = version.next_minor();
            Chunk {
                ns: chunk.ns.clone(),
                min: pair[0].clone(),
                max: pair[1].clone(),
                shard: chunk.shard.clone(),
                version,
            }
        })
        .collect())
}

/// Assigns each split point to the chunk that strictly contains it.
/// Points on an existing boundary are dropped.
pub fn group_split_points(
    manager: &ChunkManager,
    points: &[ShardKey],
) -> Vec<(Chunk, Vec<ShardKey>)> {
    manager
        .chunks()
        .filter_map(|chunk| {
            let inside: Vec<ShardKey> = points
                .iter()
                .filter(|p| *p > &chunk.min && *p < &chunk.max)
                .cloned()
                .collect();
            (!inside.is_empty()).then(|| (chunk.clone(), inside))
        })
        .collect()
}
