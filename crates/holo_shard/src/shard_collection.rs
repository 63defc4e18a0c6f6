//! Enabling sharding on databases and collections.

use serde::Serialize;

use crate::chunk::ChunkVersion;
use crate::context::ClusterContext;
use crate::error::{Result, ShardingError};
use crate::index::{validate_candidate, IndexVerdict};
use crate::metadata::{CollectionMetadata, MetadataCommand};
use crate::migration::{ChunkLocator, ChunkMigrationCoordinator, MoveChunkRequest};
use crate::namespace::{validate_db_name, Namespace, CONFIG_DATABASE, RESERVED_DATABASES};
use crate::registry::ShardId;
use crate::shard_key::ShardKeyPattern;
use crate::splitter::{self, HashedPresplit};

#[derive(Debug, Clone)]
pub struct ShardCollectionRequest {
    pub ns: String,
    pub key: ShardKeyPattern,
    pub unique: bool,
    /// Only honored for hashed keys on empty collections.
    pub num_initial_chunks: Option<u64>,
}

/// How the optional hashed pre-split went. Individual failures are logged
/// and counted; the collection is sharded either way.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PresplitReport {
    pub moves_attempted: usize,
    pub moves_failed: usize,
    pub splits_failed: usize,
}

#[derive(Debug, Clone)]
pub struct ShardCollectionOutcome {
    pub ns: String,
    pub version: ChunkVersion,
    pub num_chunks: usize,
    pub index_created: bool,
    pub presplit: Option<PresplitReport>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovePrimaryOutcome {
    pub db: String,
    pub from: ShardId,
    pub to: ShardId,
    pub endpoint: String,
    pub cloned: Vec<String>,
}

#[derive(Clone)]
pub struct ShardCollectionOrchestrator {
    ctx: ClusterContext,
    migrations: ChunkMigrationCoordinator,
}

impl ShardCollectionOrchestrator {
    pub fn new(ctx: ClusterContext, migrations: ChunkMigrationCoordinator) -> Self {
        Self { ctx, migrations }
    }

    /// Marks `db` as allowed to hold sharded collections, creating its
    /// database entry on the least loaded shard if needed.
    pub async fn enable_sharding(&self, db: &str) -> Result<()> {
        validate_db_name(db)?;
        if RESERVED_DATABASES.contains(&db) {
            return Err(ShardingError::ReservedDatabase(db.to_string()));
        }
        let state = self.ctx.snapshot().await?;
        let primary = match state.database(db) {
            Some(entry) if entry.sharding_enabled => {
                return Err(ShardingError::AlreadyEnabled(db.to_string()));
            }
            Some(entry) => entry.primary.clone(),
            None => state
                .pick_primary()
                .ok_or_else(|| ShardingError::Unavailable("no shards available".into()))?,
        };
        self.ctx
            .store
            .apply(MetadataCommand::EnableSharding {
                database: db.to_string(),
                primary: primary.clone(),
            })
            .await?;
        tracing::info!(db, primary = %primary, "enabling sharding");
        Ok(())
    }

    /// Shards `req.ns` on `req.key`.
    ///
    /// Inputs:
    /// - `req.key`: already shape-checked shard key pattern.
    /// - `req.num_initial_chunks`: hashed pre-split size, defaulting to two
    ///   chunks per shard.
    ///
    /// Output:
    /// - the collection version after the optional pre-split.
    pub async fn shard_collection(&self, req: &ShardCollectionRequest) -> Result<ShardCollectionOutcome> {
        let ns = Namespace::parse(&req.ns)?;
        self.check_preconditions(&ns, req).await?;

        let lease = self.ctx.lock(&req.ns, "shardCollection").await?;
        let created = self.create_sharded_collection(&ns, req).await;
        self.ctx.unlock(lease).await;
        let (index_created, presplit) = created?;

        let report = match presplit {
            Some(plan) => Some(self.distribute_presplit(&req.ns, &plan).await?),
            None => None,
        };
        let manager = self.ctx.catalog.refresh(&*self.ctx.store, &req.ns).await?;
        tracing::info!(
            ns = %req.ns,
            key = %req.key,
            chunks = manager.num_chunks(),
            version = %manager.version(),
            "sharded collection"
        );
        Ok(ShardCollectionOutcome {
            ns: req.ns.clone(),
            version: manager.version(),
            num_chunks: manager.num_chunks(),
            index_created,
            presplit: report,
        })
    }

    async fn check_preconditions(&self, ns: &Namespace, req: &ShardCollectionRequest) -> Result<()> {
        let state = self.ctx.snapshot().await?;
        if !state
            .database(ns.db())
            .map(|db| db.sharding_enabled)
            .unwrap_or(false)
        {
            return Err(ShardingError::ShardingNotEnabled(ns.db().to_string()));
        }
        if state.collection(&req.ns).is_some() {
            return Err(ShardingError::AlreadySharded(req.ns.clone()));
        }
        if req.key.is_hashed() && req.unique {
            return Err(ShardingError::InvalidShardKey(
                "hashed shard keys cannot be declared unique".into(),
            ));
        }
        if ns.is_system() {
            return Err(ShardingError::ReservedNamespace(req.ns.clone()));
        }
        if let Some(requested) = req.num_initial_chunks.filter(|_| req.key.is_hashed()) {
            let shard_count = state.shards.active().count().max(1) as u64;
            let limit = splitter::MAX_INITIAL_CHUNKS_PER_SHARD.saturating_mul(shard_count);
            if requested > limit {
                return Err(ShardingError::BadRequest(format!(
                    "numInitialChunks {requested} exceeds {limit} for {shard_count} shards"
                )));
            }
        }
        Ok(())
    }

    /// Validates indexes on the primary and writes the initial chunks.
    /// Runs under the namespace lock.
    async fn create_sharded_collection(
        &self,
        ns: &Namespace,
        req: &ShardCollectionRequest,
    ) -> Result<(bool, Option<HashedPresplit>)> {
        let state = self.ctx.snapshot().await?;
        if state.collection(&req.ns).is_some() {
            return Err(ShardingError::AlreadySharded(req.ns.clone()));
        }
        let db = state
            .database(ns.db())
            .filter(|db| db.sharding_enabled)
            .ok_or_else(|| ShardingError::ShardingNotEnabled(ns.db().to_string()))?;
        let primary = ClusterContext::shard_entry(&state, &db.primary)?;

        let info = self.ctx.shards.collection_info(&primary, &req.ns).await?;
        if info.map(|i| i.capped).unwrap_or(false) {
            return Err(ShardingError::CappedCollection(req.ns.clone()));
        }
        let is_empty = info.map(|i| i.count == 0).unwrap_or(true);
        let indexes = self.ctx.shards.list_indexes(&primary, &req.ns).await?;
        let verdict = validate_candidate(&req.ns, &req.key, &indexes, is_empty, req.unique)?;
        let index_created = match verdict {
            IndexVerdict::Supported { index } => {
                tracing::debug!(ns = %req.ns, index = %index, "shard key index exists");
                false
            }
            IndexVerdict::CreateIndex { key, unique } => {
                self.ctx
                    .shards
                    .create_index(&primary, &req.ns, &key, unique)
                    .await?;
                tracing::info!(ns = %req.ns, key = %req.key, unique, "created shard key index");
                true
            }
        };

        let presplit = (req.key.is_hashed() && is_empty).then(|| {
            splitter::plan_hashed_presplit(req.num_initial_chunks, state.shards.active().count())
        });
        let initial_splits = presplit
            .as_ref()
            .map(|plan| plan.initial_splits.as_slice())
            .unwrap_or_default();
        let chunks = splitter::initial_chunks(&req.ns, &req.key, initial_splits, &primary.id);
        let epoch = state.epoch;
        self.ctx
            .store
            .apply(MetadataCommand::ShardCollection {
                collection: CollectionMetadata {
                    ns: req.ns.clone(),
                    key_pattern: req.key.clone(),
                    unique: req.unique,
                    epoch,
                },
                chunks,
            })
            .await?;
        self.ctx.catalog.refresh(&*self.ctx.store, &req.ns).await?;
        Ok((index_created, presplit))
    }

    /// Spreads the coarse pre-split chunks round-robin over the shards, then
    /// cuts them at the remaining split points.
    async fn distribute_presplit(&self, ns: &str, plan: &HashedPresplit) -> Result<PresplitReport> {
        let mut report = PresplitReport::default();
        let state = self.ctx.snapshot().await?;
        let targets: Vec<ShardId> = state.shards.active().map(|e| e.id.clone()).collect();
        let manager = self.ctx.catalog.refresh(&*self.ctx.store, ns).await?;
        let coarse: Vec<_> = manager.chunks().cloned().collect();

        for (i, chunk) in coarse.iter().enumerate() {
            let Some(target) = targets.get(i % targets.len().max(1)) else {
                break;
            };
            if &chunk.shard == target {
                continue;
            }
            report.moves_attempted += 1;
            let req = MoveChunkRequest {
                ns: ns.to_string(),
                locator: ChunkLocator::Bounds {
                    min: manager.pattern().key_document(&chunk.min),
                    max: manager.pattern().key_document(&chunk.max),
                },
                to: target.clone(),
                max_chunk_size_bytes: None,
                wait_for_delete: Some(true),
            };
            if let Err(err) = self.migrations.move_chunk(&req).await {
                report.moves_failed += 1;
                tracing::warn!(ns, chunk = %chunk.range_string(), to = %target, error = %err, "couldn't move pre-split chunk");
            }
        }

        let manager = self.ctx.catalog.refresh(&*self.ctx.store, ns).await?;
        for (chunk, points) in splitter::group_split_points(&manager, &plan.all_splits) {
            if let Err(err) = self
                .migrations
                .multi_split(ns, &chunk.min, &chunk.max, &points)
                .await
            {
                report.splits_failed += 1;
                tracing::warn!(ns, chunk = %chunk.range_string(), error = %err, "couldn't split pre-split chunk");
            }
        }
        Ok(report)
    }

    /// Makes `to` the primary shard of `db`, copying its unsharded collections.
    pub async fn move_primary(&self, db: &str, to: &str) -> Result<MovePrimaryOutcome> {
        validate_db_name(db)?;
        if db == CONFIG_DATABASE || RESERVED_DATABASES.contains(&db) {
            return Err(ShardingError::ReservedDatabase(db.to_string()));
        }
        let lease = self.ctx.lock(&format!("{db}-movePrimary"), "Moving primary shard").await?;
        let result = self.move_primary_locked(db, to).await;
        self.ctx.unlock(lease).await;
        result
    }

    async fn move_primary_locked(&self, db: &str, to: &str) -> Result<MovePrimaryOutcome> {
        let state = self.ctx.snapshot().await?;
        let entry = state
            .database(db)
            .ok_or_else(|| ShardingError::UnknownDatabase(db.to_string()))?;
        let target = ClusterContext::shard_entry(&state, to)?;
        if entry.primary == target.id {
            return Err(ShardingError::AlreadyPrimary(target.id));
        }
        let source = ClusterContext::shard_entry(&state, &entry.primary)?;
        let sharded = state.sharded_collections_in(db);
        tracing::info!(db, from = %source.id, to = %target.id, "moving primary");

        let cloned = self
            .ctx
            .shards
            .clone_database(&source, &target, db, &sharded)
            .await
            .map_err(|err| ShardingError::MigrationCloneFailed {
                to: target.id.clone(),
                reason: err.to_string(),
            })?;
        if let Err(err) = self
            .ctx
            .store
            .apply(MetadataCommand::SetDatabasePrimary {
                database: db.to_string(),
                expected: source.id.clone(),
                primary: target.id.clone(),
            })
            .await
        {
            if let Err(drop_err) = self.ctx.shards.drop_collections(&target, &cloned).await {
                tracing::warn!(db, shard = %target.id, error = %drop_err, "failed to drop partial primary copy");
            }
            return Err(ShardingError::MigrationCommitFailed {
                reason: err.to_string(),
            });
        }
        if let Err(err) = self.ctx.shards.drop_collections(&source, &cloned).await {
            tracing::warn!(db, shard = %source.id, error = %err, "failed to drop collections from old primary");
        }
        Ok(MovePrimaryOutcome {
            db: db.to_string(),
            from: source.id,
            to: target.id,
            endpoint: target.endpoint,
            cloned,
        })
    }
}
