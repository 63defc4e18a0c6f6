//! Chunk splits and migrations.
//!
//! A migration runs through `Cloning -> Committing -> Deleting -> Done`.
//! Failures while cloning or committing end in `Aborted` and leave the
//! chunk on its donor; once the ownership change is committed the
//! migration always finishes, with donor cleanup best effort.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::chunk::{Chunk, ChunkManager, ChunkVersion};
use crate::context::ClusterContext;
use crate::error::{Result, ShardingError};
use crate::key::ShardKey;
use crate::metadata::MetadataCommand;
use crate::namespace::Namespace;
use crate::registry::{ShardEntry, ShardId};
use crate::shard_client::{CloneReport, RangeRef};
use crate::shard_key::ShardKeyPattern;
use crate::splitter;

/// How an admin request names a chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkLocator {
    /// The chunk containing the shard key of this document.
    Find(Value),
    /// The chunk with exactly these bounds.
    Bounds { min: Value, max: Value },
    /// Split point inside a chunk. Only valid for splits.
    Middle(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    Cloning,
    Committing,
    Deleting,
    Done,
    Aborted,
}

impl MigrationPhase {
    pub fn can_transition_to(self, next: MigrationPhase) -> bool {
        use MigrationPhase::*;
        matches!(
            (self, next),
            (Cloning, Committing)
                | (Cloning, Aborted)
                | (Committing, Deleting)
                | (Committing, Aborted)
                | (Deleting, Done)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MigrationPhase::Done | MigrationPhase::Aborted)
    }
}

/// Progress of one chunk migration.
#[derive(Debug, Clone)]
pub struct Migration {
    pub ns: String,
    pub min: ShardKey,
    pub max: ShardKey,
    pub from: ShardId,
    pub to: ShardId,
    phase: MigrationPhase,
    history: Vec<MigrationPhase>,
}

impl Migration {
    pub fn new(chunk: &Chunk, to: &str) -> Self {
        Self {
            ns: chunk.ns.clone(),
            min: chunk.min.clone(),
            max: chunk.max.clone(),
            from: chunk.shard.clone(),
            to: to.to_string(),
            phase: MigrationPhase::Cloning,
            history: vec![MigrationPhase::Cloning],
        }
    }

    pub fn phase(&self) -> MigrationPhase {
        self.phase
    }

    pub fn history(&self) -> &[MigrationPhase] {
        &self.history
    }

    pub fn advance(&mut self, next: MigrationPhase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(ShardingError::InconsistentMetadata(format!(
                "invalid migration transition {:?} -> {:?} for {} {} -> {}",
                self.phase, next, self.ns, self.min, self.max
            )));
        }
        tracing::debug!(ns = %self.ns, from = ?self.phase, to = ?next, "migration phase");
        self.phase = next;
        self.history.push(next);
        Ok(())
    }
}

/// What happened to the donor's copy after commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeleteOutcome {
    Completed { docs: u64 },
    Scheduled,
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub struct MoveChunkRequest {
    pub ns: String,
    pub locator: ChunkLocator,
    pub to: ShardId,
    /// `None` or 0 falls back to the configured limit.
    pub max_chunk_size_bytes: Option<u64>,
    /// `None` falls back to the configured default.
    pub wait_for_delete: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct MoveChunkOutcome {
    pub chunk: Chunk,
    pub from: ShardId,
    pub cloned: CloneReport,
    pub delete: DeleteOutcome,
    pub phases: Vec<MigrationPhase>,
    pub millis: u64,
}

#[derive(Debug, Clone)]
pub struct SplitOutcome {
    pub parent: Chunk,
    pub children: Vec<Chunk>,
    pub version: ChunkVersion,
}

/// Resolves `locator` to a chunk of `manager`. `Middle` is rejected here;
/// splits handle it themselves.
pub fn resolve_chunk(manager: &ChunkManager, locator: &ChunkLocator) -> Result<Chunk> {
    match locator {
        ChunkLocator::Find(doc) => {
            let key = manager.pattern().extract_key(doc).ok_or_else(|| {
                ShardingError::BadRequest(format!("no shard key found in chunk query {doc}"))
            })?;
            manager
                .find_intersecting_chunk(&key)
                .cloned()
                .ok_or_else(|| ShardingError::ChunkNotFound(format!("{} containing {key}", manager.ns())))
        }
        ChunkLocator::Bounds { min, max } => {
            let min = manager.pattern().parse_key_document(min)?;
            let max = manager.pattern().parse_key_document(max)?;
            manager
                .find_chunk_with_bounds(&min, &max)
                .cloned()
                .ok_or_else(|| {
                    ShardingError::ChunkNotFound(format!(
                        "{} with bounds {min} -> {max}",
                        manager.ns()
                    ))
                })
        }
        ChunkLocator::Middle(_) => Err(ShardingError::BadRequest(
            "middle can only be used to split a chunk".into(),
        )),
    }
}

/// Splits and moves chunks of sharded collections.
#[derive(Clone)]
pub struct ChunkMigrationCoordinator {
    ctx: ClusterContext,
    pending_deletes: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ChunkMigrationCoordinator {
    pub fn new(ctx: ClusterContext) -> Self {
        Self {
            ctx,
            pending_deletes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Splits one chunk in two, either at an explicit `Middle` point or at
    /// the median key of its documents.
    pub async fn split_chunk(&self, ns: &str, locator: &ChunkLocator) -> Result<SplitOutcome> {
        Namespace::parse(ns)?;
        let lease = self.ctx.lock(ns, "split").await?;
        let result = self.split_locked(ns, locator).await;
        self.ctx.unlock(lease).await;
        result
    }

    /// Splits the chunk `[min, max)` at every point in `points`.
    pub async fn multi_split(
        &self,
        ns: &str,
        min: &ShardKey,
        max: &ShardKey,
        points: &[ShardKey],
    ) -> Result<SplitOutcome> {
        let lease = self.ctx.lock(ns, "multi-split").await?;
        let result = async {
            let manager = self.ctx.catalog.refresh(&*self.ctx.store, ns).await?;
            let chunk = manager
                .find_chunk_with_bounds(min, max)
                .cloned()
                .ok_or_else(|| ShardingError::ChunkNotFound(format!("{ns} with bounds {min} -> {max}")))?;
            self.commit_split(&manager, &chunk, points).await
        }
        .await;
        self.ctx.unlock(lease).await;
        result
    }

    async fn split_locked(&self, ns: &str, locator: &ChunkLocator) -> Result<SplitOutcome> {
        let manager = self.ctx.catalog.refresh(&*self.ctx.store, ns).await?;
        let (chunk, point) = match locator {
            ChunkLocator::Middle(doc) => {
                let point = manager.pattern().parse_key_document(doc)?;
                let chunk = manager
                    .find_intersecting_chunk(&point)
                    .cloned()
                    .ok_or_else(|| ShardingError::ChunkNotFound(format!("{ns} containing {point}")))?;
                if point == chunk.min || point == chunk.max {
                    return Err(ShardingError::SplitPointOnBoundary(format!(
                        "{point} is a boundary of chunk {}",
                        chunk.range_string()
                    )));
                }
                (chunk, point)
            }
            other => {
                let chunk = resolve_chunk(&manager, other)?;
                let point = self.median_point(&manager, &chunk).await?;
                (chunk, point)
            }
        };
        self.commit_split(&manager, &chunk, &[point]).await
    }

    async fn median_point(&self, manager: &ChunkManager, chunk: &Chunk) -> Result<ShardKey> {
        let state = self.ctx.snapshot().await?;
        let owner = ClusterContext::shard_entry(&state, &chunk.shard)?;
        let range = RangeRef {
            ns: manager.ns(),
            pattern: manager.pattern(),
            min: &chunk.min,
            max: &chunk.max,
        };
        match self.ctx.shards.median_key(&owner, range).await? {
            Some(point) if point != chunk.min && point != chunk.max => Ok(point),
            _ => Err(ShardingError::NoSplitPoint(chunk.range_string())),
        }
    }

    async fn commit_split(
        &self,
        manager: &ChunkManager,
        chunk: &Chunk,
        points: &[ShardKey],
    ) -> Result<SplitOutcome> {
        let children = splitter::split_chunk(chunk, points, manager.version())?;
        self.ctx
            .store
            .apply(MetadataCommand::SplitChunk {
                ns: manager.ns().to_string(),
                parent: chunk.clone(),
                children: children.clone(),
            })
            .await?;
        let refreshed = self.ctx.catalog.refresh(&*self.ctx.store, manager.ns()).await?;
        tracing::info!(
            ns = manager.ns(),
            chunk = %chunk.range_string(),
            pieces = children.len(),
            version = %refreshed.version(),
            "split chunk"
        );
        Ok(SplitOutcome {
            parent: chunk.clone(),
            children,
            version: refreshed.version(),
        })
    }

    /// Moves one chunk to another shard.
    pub async fn move_chunk(&self, req: &MoveChunkRequest) -> Result<MoveChunkOutcome> {
        let started = Instant::now();
        Namespace::parse(&req.ns)?;
        let lease = self
            .ctx
            .lock(&req.ns, &format!("migrating chunk to {}", req.to))
            .await?;
        let result = self.move_locked(req, started).await;
        self.ctx.unlock(lease).await;
        result
    }

    async fn move_locked(&self, req: &MoveChunkRequest, started: Instant) -> Result<MoveChunkOutcome> {
        let ns = req.ns.as_str();
        let manager = self.ctx.catalog.refresh(&*self.ctx.store, ns).await?;
        let chunk = resolve_chunk(&manager, &req.locator)?;
        if chunk.shard == req.to {
            return Err(ShardingError::AlreadyOnShard(req.to.clone()));
        }
        let state = self.ctx.snapshot().await?;
        let to = ClusterContext::shard_entry(&state, &req.to)?;
        if to.draining {
            return Err(ShardingError::ShardDraining(to.id));
        }
        let from = ClusterContext::shard_entry(&state, &chunk.shard)?;
        let max_bytes = self.ctx.config.chunk_size_limit(req.max_chunk_size_bytes);
        let wait_for_delete = req
            .wait_for_delete
            .unwrap_or(self.ctx.config.default_wait_for_delete);

        let mut migration = Migration::new(&chunk, &to.id);
        let range = RangeRef {
            ns,
            pattern: manager.pattern(),
            min: &chunk.min,
            max: &chunk.max,
        };
        tracing::info!(
            ns,
            chunk = %chunk.range_string(),
            from = %from.id,
            to = %to.id,
            max_bytes,
            "moving chunk"
        );

        let cloned = match self.ctx.shards.clone_range(&from, &to, range, max_bytes).await {
            Ok(report) => report,
            Err(err) => {
                migration.advance(MigrationPhase::Aborted)?;
                tracing::warn!(ns, chunk = %chunk.range_string(), error = %err, "migration clone failed");
                return Err(match err {
                    too_big @ ShardingError::ChunkTooLarge { .. } => too_big,
                    other => ShardingError::MigrationCloneFailed {
                        to: to.id.clone(),
                        reason: other.to_string(),
                    },
                });
            }
        };

        migration.advance(MigrationPhase::Committing)?;
        let version = manager.version().next_major();
        let commit = self
            .ctx
            .store
            .apply(MetadataCommand::CommitChunkMove {
                ns: ns.to_string(),
                min: chunk.min.clone(),
                max: chunk.max.clone(),
                expected: chunk.version,
                from: from.id.clone(),
                to: to.id.clone(),
                version,
            })
            .await;
        if let Err(err) = commit {
            if let Err(discard_err) = self.ctx.shards.discard_clone(&to, range).await {
                tracing::warn!(ns, to = %to.id, error = %discard_err, "failed to discard cloned range");
            }
            migration.advance(MigrationPhase::Aborted)?;
            tracing::warn!(ns, chunk = %chunk.range_string(), error = %err, "migration commit failed");
            return Err(ShardingError::MigrationCommitFailed {
                reason: err.to_string(),
            });
        }

        // Ownership has moved. Nothing past this point fails the call.
        if let Err(err) = migration.advance(MigrationPhase::Deleting) {
            tracing::warn!(ns, error = %err, "migration phase");
        }
        let refreshed = match self.ctx.catalog.refresh(&*self.ctx.store, ns).await {
            Ok(manager) => Some(manager),
            Err(err) => {
                tracing::warn!(ns, error = %err, "couldn't refresh chunk manager after commit");
                if let Err(err) = self.ctx.catalog.invalidate(ns) {
                    tracing::warn!(ns, error = %err, "couldn't invalidate chunk manager");
                }
                None
            }
        };
        let delete = if wait_for_delete {
            match self.ctx.shards.delete_range(&from, range).await {
                Ok(docs) => DeleteOutcome::Completed { docs },
                Err(err) => {
                    tracing::warn!(ns, shard = %from.id, error = %err, "donor range delete failed");
                    DeleteOutcome::Failed {
                        reason: err.to_string(),
                    }
                }
            }
        } else {
            self.schedule_delete(
                from.clone(),
                ns.to_string(),
                manager.pattern().clone(),
                chunk.min.clone(),
                chunk.max.clone(),
            );
            DeleteOutcome::Scheduled
        };
        if let Err(err) = migration.advance(MigrationPhase::Done) {
            tracing::warn!(ns, error = %err, "migration phase");
        }

        let committed = refreshed
            .as_ref()
            .and_then(|m| m.find_chunk_with_bounds(&chunk.min, &chunk.max))
            .cloned()
            .unwrap_or_else(|| Chunk {
                shard: to.id.clone(),
                version,
                ..chunk.clone()
            });
        let millis = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::info!(
            ns,
            chunk = %chunk.range_string(),
            to = %to.id,
            version = %committed.version,
            millis,
            "moved chunk"
        );
        Ok(MoveChunkOutcome {
            chunk: committed,
            from: from.id,
            cloned,
            delete,
            phases: migration.history().to_vec(),
            millis,
        })
    }

    fn schedule_delete(
        &self,
        shard: ShardEntry,
        ns: String,
        pattern: ShardKeyPattern,
        min: ShardKey,
        max: ShardKey,
    ) {
        let shards = self.ctx.shards.clone();
        let handle = tokio::spawn(async move {
            let range = RangeRef {
                ns: &ns,
                pattern: &pattern,
                min: &min,
                max: &max,
            };
            match shards.delete_range(&shard, range).await {
                Ok(docs) => tracing::info!(ns = %ns, shard = %shard.id, docs, "deleted migrated range"),
                Err(err) => {
                    tracing::warn!(ns = %ns, shard = %shard.id, error = %err, "deferred range delete failed")
                }
            }
        });
        match self.pending_deletes.lock() {
            Ok(mut pending) => {
                pending.retain(|h| !h.is_finished());
                pending.push(handle);
            }
            Err(err) => {
                tracing::warn!(error = %err, "deferred delete not tracked");
            }
        }
    }

    /// Waits for every scheduled donor cleanup, returning how many ran.
    pub async fn wait_for_pending_deletes(&self) -> Result<usize> {
        let handles = std::mem::take(&mut *self.pending_deletes.lock()?);
        let count = handles.len();
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "range delete task panicked");
            }
        }
        Ok(count)
    }
}
