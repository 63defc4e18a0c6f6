//! Shard removal.
//!
//! Removal is driven by repeated `removeShard` calls. The first call marks
//! the shard draining; later calls report what still lives there and delete
//! the shard once nothing does. Chunks leave through ordinary migrations and
//! databases through `movePrimary`.

use serde::Serialize;

use crate::context::ClusterContext;
use crate::error::{Result, ShardingError};
use crate::metadata::MetadataCommand;
use crate::namespace::{CONFIG_DATABASE, RESERVED_DATABASES};
use crate::registry::ShardId;

/// Cluster-wide lock resource serializing shard removals.
pub const REMOVE_SHARD_LOCK: &str = "removeShard";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DrainState {
    Started,
    Ongoing,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DrainRemaining {
    pub chunks: usize,
    pub dbs: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveShardOutcome {
    pub shard: ShardId,
    pub state: DrainState,
    pub msg: &'static str,
    pub remaining: Option<DrainRemaining>,
    /// Databases whose primary is still this shard.
    pub dbs_to_move: Vec<String>,
}

#[derive(Clone)]
pub struct ShardDrainCoordinator {
    ctx: ClusterContext,
}

impl ShardDrainCoordinator {
    pub fn new(ctx: ClusterContext) -> Self {
        Self { ctx }
    }

    /// Advances removal of `shard` by one step.
    pub async fn remove_shard(&self, shard: &str) -> Result<RemoveShardOutcome> {
        let lease = self
            .ctx
            .lock(REMOVE_SHARD_LOCK, &format!("removing shard {shard}"))
            .await?;
        let result = self.remove_locked(shard).await;
        self.ctx.unlock(lease).await;
        result
    }

    async fn remove_locked(&self, shard: &str) -> Result<RemoveShardOutcome> {
        let state = self.ctx.snapshot().await?;
        let entry = ClusterContext::shard_entry(&state, shard)?;
        if let Some(other) = state.shards.draining_shard() {
            if other.id != entry.id {
                return Err(ShardingError::AnotherShardDraining(other.id.clone()));
            }
        }
        if state.shards.iter().all(|e| e.id == entry.id) {
            return Err(ShardingError::OnlyShard);
        }

        let dbs_to_move: Vec<String> = state
            .databases_with_primary(&entry.id)
            .into_iter()
            .filter(|db| db != CONFIG_DATABASE && !RESERVED_DATABASES.contains(&db.as_str()))
            .collect();

        if !entry.draining {
            self.ctx
                .store
                .apply(MetadataCommand::SetShardDraining {
                    shard: entry.id.clone(),
                })
                .await?;
            tracing::info!(shard = %entry.id, dbs_to_move = ?dbs_to_move, "going to start draining shard");
            return Ok(RemoveShardOutcome {
                shard: entry.id,
                state: DrainState::Started,
                msg: "draining started successfully",
                remaining: None,
                dbs_to_move,
            });
        }

        let chunks = state.chunk_count_on(&entry.id);
        let dbs = dbs_to_move.len();
        if chunks == 0 && dbs == 0 {
            self.ctx
                .store
                .apply(MetadataCommand::RemoveShard {
                    shard: entry.id.clone(),
                })
                .await?;
            let flushed = self.ctx.catalog.flush()?;
            tracing::info!(shard = %entry.id, flushed, "removed shard");
            return Ok(RemoveShardOutcome {
                shard: entry.id,
                state: DrainState::Completed,
                msg: "removeshard completed successfully",
                remaining: None,
                dbs_to_move,
            });
        }

        tracing::debug!(shard = %entry.id, chunks, dbs, "draining ongoing");
        Ok(RemoveShardOutcome {
            shard: entry.id,
            state: DrainState::Ongoing,
            msg: "draining ongoing",
            remaining: Some(DrainRemaining { chunks, dbs }),
            dbs_to_move,
        })
    }
}
