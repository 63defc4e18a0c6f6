//! JSON admin command surface.
//!
//! Commands are documents whose first field names the command, e.g.
//! `{"moveChunk": "app.users", "find": {"uid": 7}, "to": "shard0001"}`.
//! Responses carry `"ok": 1` on success, or `"ok": 0` with `errmsg` and
//! `codeName` on failure.

use serde_json::{json, Map, Value};

use crate::context::ClusterContext;
use crate::drain::{RemoveShardOutcome, ShardDrainCoordinator};
use crate::error::{Result, ShardingError};
use crate::metadata::MetadataCommand;
use crate::migration::{ChunkLocator, ChunkMigrationCoordinator, DeleteOutcome, MoveChunkRequest};
use crate::registry::ShardEntry;
use crate::shard_collection::{ShardCollectionOrchestrator, ShardCollectionRequest};
use crate::shard_key::ShardKeyPattern;

/// A parsed admin command.
#[derive(Debug, Clone)]
pub enum AdminCommand {
    EnableSharding { db: String },
    ShardCollection(ShardCollectionRequest),
    Split { ns: String, locator: ChunkLocator },
    MoveChunk(MoveChunkRequest),
    RemoveShard { shard: String },
    AddShard {
        name: Option<String>,
        endpoint: String,
        max_size_mb: u64,
    },
    ListShards,
    MovePrimary { db: String, to: String },
    GetShardVersion { ns: String },
    FlushRouterConfig,
}

fn string_field(cmd: &Map<String, Value>, field: &str, what: &str) -> Result<String> {
    match cmd.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        _ => Err(ShardingError::BadRequest(format!("no {what} specified"))),
    }
}

fn object_field<'a>(cmd: &'a Map<String, Value>, field: &str) -> Result<Option<&'a Value>> {
    match cmd.get(field) {
        None => Ok(None),
        Some(value @ Value::Object(_)) => Ok(Some(value)),
        Some(other) => Err(ShardingError::BadRequest(format!(
            "{field} must be a document, got {other}"
        ))),
    }
}

fn bool_field(cmd: &Map<String, Value>, field: &str) -> Option<bool> {
    cmd.get(field).map(|v| match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        _ => false,
    })
}

fn u64_field(cmd: &Map<String, Value>, field: &str) -> Result<Option<u64>> {
    match cmd.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .map(Some)
            .ok_or_else(|| ShardingError::BadRequest(format!("{field} must be non-negative"))),
        Some(other) => Err(ShardingError::BadRequest(format!(
            "{field} must be a number, got {other}"
        ))),
    }
}

/// Chunk count for a hashed pre-split. Zero or negative means unspecified.
fn initial_chunks_field(cmd: &Map<String, Value>) -> Result<Option<u64>> {
    match cmd.get("numInitialChunks") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => {
            let count = n
                .as_i64()
                .map(|i| i.max(0) as u64)
                .or_else(|| n.as_u64())
                .or_else(|| n.as_f64().map(|f| if f > 0.0 { f as u64 } else { 0 }))
                .unwrap_or(0);
            Ok((count > 0).then_some(count))
        }
        Some(other) => Err(ShardingError::BadRequest(format!(
            "numInitialChunks must be a number, got {other}"
        ))),
    }
}

fn bounds_field(cmd: &Map<String, Value>) -> Result<Option<(Value, Value)>> {
    match cmd.get("bounds") {
        None => Ok(None),
        Some(Value::Array(items)) if items.len() == 2 && items.iter().all(Value::is_object) => {
            Ok(Some((items[0].clone(), items[1].clone())))
        }
        Some(_) => Err(ShardingError::BadRequest(
            "bounds must be an array of the form [min, max]".into(),
        )),
    }
}

impl AdminCommand {
    pub fn parse(doc: &Value) -> Result<Self> {
        let cmd = doc
            .as_object()
            .ok_or_else(|| ShardingError::BadRequest(format!("command must be a document, got {doc}")))?;
        let (name, _) = cmd
            .iter()
            .next()
            .ok_or_else(|| ShardingError::BadRequest("empty command".into()))?;
        let name_lower = name.to_ascii_lowercase();
        match name_lower.as_str() {
            "enablesharding" => Ok(AdminCommand::EnableSharding {
                db: string_field(cmd, name, "database")?,
            }),
            "shardcollection" => {
                let ns = string_field(cmd, name, "ns")?;
                let key = object_field(cmd, "key")?
                    .ok_or_else(|| ShardingError::BadRequest("no shard key".into()))?;
                Ok(AdminCommand::ShardCollection(ShardCollectionRequest {
                    ns,
                    key: ShardKeyPattern::from_document(key)?,
                    unique: bool_field(cmd, "unique").unwrap_or(false),
                    num_initial_chunks: initial_chunks_field(cmd)?,
                }))
            }
            "split" => {
                let ns = string_field(cmd, name, "ns")?;
                let find = object_field(cmd, "find")?;
                let middle = object_field(cmd, "middle")?;
                let locator = match (find, middle, bounds_field(cmd)?) {
                    (Some(find), None, None) => ChunkLocator::Find(find.clone()),
                    (None, Some(middle), None) => ChunkLocator::Middle(middle.clone()),
                    (None, None, Some((min, max))) => ChunkLocator::Bounds { min, max },
                    _ => {
                        return Err(ShardingError::BadRequest(
                            "need to specify exactly one of find, bounds, or middle".into(),
                        ))
                    }
                };
                Ok(AdminCommand::Split { ns, locator })
            }
            "movechunk" => {
                let ns = string_field(cmd, name, "ns")?;
                let to = string_field(cmd, "to", "destination shard (to)")?;
                let locator = match (object_field(cmd, "find")?, bounds_field(cmd)?) {
                    (Some(find), None) => ChunkLocator::Find(find.clone()),
                    (None, Some((min, max))) => ChunkLocator::Bounds { min, max },
                    _ => {
                        return Err(ShardingError::BadRequest(
                            "need to specify either a find query, or both lower and upper bounds."
                                .into(),
                        ))
                    }
                };
                Ok(AdminCommand::MoveChunk(MoveChunkRequest {
                    ns,
                    locator,
                    to,
                    max_chunk_size_bytes: u64_field(cmd, "maxChunkSizeBytes")?,
                    wait_for_delete: bool_field(cmd, "_waitForDelete"),
                }))
            }
            "removeshard" => Ok(AdminCommand::RemoveShard {
                shard: string_field(cmd, name, "shard")?,
            }),
            "addshard" => Ok(AdminCommand::AddShard {
                endpoint: string_field(cmd, name, "host")?,
                name: match cmd.get("name") {
                    Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
                    None => None,
                    Some(_) => {
                        return Err(ShardingError::BadRequest("name must be a string".into()))
                    }
                },
                max_size_mb: u64_field(cmd, "maxSize")?.unwrap_or(0),
            }),
            "listshards" => Ok(AdminCommand::ListShards),
            "moveprimary" => Ok(AdminCommand::MovePrimary {
                db: string_field(cmd, name, "database")?,
                to: string_field(cmd, "to", "target shard (to)")?,
            }),
            "getshardversion" => Ok(AdminCommand::GetShardVersion {
                ns: string_field(cmd, name, "ns")?,
            }),
            "flushrouterconfig" => Ok(AdminCommand::FlushRouterConfig),
            _ => Err(ShardingError::BadRequest(format!("no such command: '{name}'"))),
        }
    }
}

/// Error document returned for a failed command.
pub fn error_response(err: &ShardingError) -> Value {
    json!({
        "ok": 0,
        "errmsg": err.to_string(),
        "codeName": err.code_name(),
        "kind": err.kind(),
    })
}

fn remove_shard_response(outcome: RemoveShardOutcome) -> Value {
    let mut resp = json!({
        "msg": outcome.msg,
        "state": outcome.state,
        "shard": outcome.shard,
    });
    if let Some(remaining) = outcome.remaining {
        resp["remaining"] = json!(remaining);
    }
    if !outcome.dbs_to_move.is_empty() {
        resp["note"] = json!("you need to drop or movePrimary these databases");
        resp["dbsToMove"] = json!(outcome.dbs_to_move);
    }
    resp
}

/// Entry point for admin clients.
#[derive(Clone)]
pub struct AdminService {
    ctx: ClusterContext,
    collections: ShardCollectionOrchestrator,
    migrations: ChunkMigrationCoordinator,
    drain: ShardDrainCoordinator,
}

impl AdminService {
    pub fn new(ctx: ClusterContext) -> Self {
        let migrations = ChunkMigrationCoordinator::new(ctx.clone());
        Self {
            collections: ShardCollectionOrchestrator::new(ctx.clone(), migrations.clone()),
            drain: ShardDrainCoordinator::new(ctx.clone()),
            migrations,
            ctx,
        }
    }

    pub fn context(&self) -> &ClusterContext {
        &self.ctx
    }

    pub fn collections(&self) -> &ShardCollectionOrchestrator {
        &self.collections
    }

    pub fn migrations(&self) -> &ChunkMigrationCoordinator {
        &self.migrations
    }

    pub fn drain(&self) -> &ShardDrainCoordinator {
        &self.drain
    }

    /// Parses and runs `doc`, always answering with a response document.
    pub async fn run_command(&self, doc: &Value) -> Value {
        let result = match AdminCommand::parse(doc) {
            Ok(cmd) => self.execute(cmd).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(mut resp) => {
                if let Value::Object(map) = &mut resp {
                    map.insert("ok".into(), json!(1));
                }
                resp
            }
            Err(err) => {
                tracing::warn!(command = %doc, code = err.code_name(), error = %err, "admin command failed");
                error_response(&err)
            }
        }
    }

    pub async fn execute(&self, cmd: AdminCommand) -> Result<Value> {
        match cmd {
            AdminCommand::EnableSharding { db } => {
                self.collections.enable_sharding(&db).await?;
                Ok(json!({}))
            }
            AdminCommand::ShardCollection(req) => {
                let outcome = self.collections.shard_collection(&req).await?;
                let mut resp = json!({
                    "collectionsharded": outcome.ns,
                    "version": outcome.version,
                    "numChunks": outcome.num_chunks,
                    "indexCreated": outcome.index_created,
                });
                if let Some(report) = outcome.presplit {
                    resp["presplit"] = json!(report);
                }
                Ok(resp)
            }
            AdminCommand::Split { ns, locator } => {
                let outcome = self.migrations.split_chunk(&ns, &locator).await?;
                Ok(json!({
                    "chunks": outcome.children.len(),
                    "version": outcome.version,
                }))
            }
            AdminCommand::MoveChunk(req) => {
                let outcome = self.migrations.move_chunk(&req).await?;
                Ok(json!({
                    "millis": outcome.millis,
                    "from": outcome.from,
                    "to": outcome.chunk.shard,
                    "version": outcome.chunk.version,
                    "cloned": outcome.cloned,
                    "deleteScheduled": outcome.delete == DeleteOutcome::Scheduled,
                    "delete": outcome.delete,
                }))
            }
            AdminCommand::RemoveShard { shard } => {
                let outcome = self.drain.remove_shard(&shard).await?;
                Ok(remove_shard_response(outcome))
            }
            AdminCommand::AddShard {
                name,
                endpoint,
                max_size_mb,
            } => self.add_shard(name, endpoint, max_size_mb).await,
            AdminCommand::ListShards => {
                let state = self.ctx.snapshot().await?;
                let shards: Vec<Value> = state
                    .shards
                    .iter()
                    .map(|entry| {
                        let mut doc = json!({"_id": entry.id, "host": entry.endpoint});
                        if entry.draining {
                            doc["draining"] = json!(true);
                        }
                        if entry.max_size_mb > 0 {
                            doc["maxSize"] = json!(entry.max_size_mb);
                        }
                        doc
                    })
                    .collect();
                Ok(json!({ "shards": shards }))
            }
            AdminCommand::MovePrimary { db, to } => {
                let outcome = self.collections.move_primary(&db, &to).await?;
                Ok(json!({
                    "primary": format!("{}:{}", outcome.to, outcome.endpoint),
                    "cloned": outcome.cloned,
                }))
            }
            AdminCommand::GetShardVersion { ns } => {
                let manager = self.ctx.catalog.refresh(&*self.ctx.store, &ns).await?;
                Ok(json!({
                    "version": manager.version(),
                    "versionEpoch": manager.epoch(),
                    "numChunks": manager.num_chunks(),
                }))
            }
            AdminCommand::FlushRouterConfig => {
                let flushed = self.ctx.catalog.flush()?;
                Ok(json!({ "flushed": flushed }))
            }
        }
    }

    async fn add_shard(&self, name: Option<String>, endpoint: String, max_size_mb: u64) -> Result<Value> {
        let state = self.ctx.snapshot().await?;
        let id = name.unwrap_or_else(|| state.shards.next_generated_name());
        let entry = ShardEntry {
            max_size_mb,
            ..ShardEntry::new(id, endpoint)
        };
        self.ctx.shards.connect(&entry).await?;
        self.ctx
            .store
            .apply(MetadataCommand::AddShard {
                entry: entry.clone(),
            })
            .await?;
        tracing::info!(shard = %entry.id, host = %entry.endpoint, "added shard");
        Ok(json!({ "shardAdded": entry.id }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_move_chunk_with_bounds() {
        let cmd = AdminCommand::parse(&json!({
            "moveChunk": "db.c",
            "bounds": [{"a": 0}, {"a": 10}],
            "to": "s2",
            "maxChunkSizeBytes": 1024,
            "_waitForDelete": true,
        }))
        .expect("parse");
        match cmd {
            AdminCommand::MoveChunk(req) => {
                assert_eq!(req.to, "s2");
                assert_eq!(req.max_chunk_size_bytes, Some(1024));
                assert_eq!(req.wait_for_delete, Some(true));
                assert_eq!(
                    req.locator,
                    ChunkLocator::Bounds {
                        min: json!({"a": 0}),
                        max: json!({"a": 10})
                    }
                );
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn move_chunk_needs_exactly_one_locator() {
        let err = AdminCommand::parse(&json!({"moveChunk": "db.c", "to": "s2"})).expect_err("none");
        assert_eq!(err.code_name(), "BadRequest");
        let err = AdminCommand::parse(&json!({
            "moveChunk": "db.c",
            "to": "s2",
            "find": {"a": 1},
            "bounds": [{"a": 0}, {"a": 10}],
        }))
        .expect_err("both");
        assert_eq!(err.code_name(), "BadRequest");
    }

    #[test]
    fn split_rejects_multiple_locators() {
        let err = AdminCommand::parse(&json!({"split": "db.c", "find": {"a": 1}, "middle": {"a": 2}}))
            .expect_err("two locators");
        assert_eq!(err.code_name(), "BadRequest");
        assert!(matches!(
            AdminCommand::parse(&json!({"split": "db.c", "middle": {"a": 2}})).expect("middle"),
            AdminCommand::Split {
                locator: ChunkLocator::Middle(_),
                ..
            }
        ));
    }

    #[test]
    fn command_names_are_case_insensitive() {
        assert!(matches!(
            AdminCommand::parse(&json!({"enablesharding": "app"})).expect("parse"),
            AdminCommand::EnableSharding { .. }
        ));
        assert!(matches!(
            AdminCommand::parse(&json!({"shardCollection": "app.c", "key": {"a": "hashed"}, "numInitialChunks": 8}))
                .expect("parse"),
            AdminCommand::ShardCollection(ShardCollectionRequest {
                num_initial_chunks: Some(8),
                ..
            })
        ));
        let err = AdminCommand::parse(&json!({"dropEverything": 1})).expect_err("unknown");
        assert_eq!(err.code_name(), "BadRequest");
    }

    #[test]
    fn non_positive_initial_chunks_mean_unspecified() {
        for raw in [json!(-5), json!(0), json!(-0.5), json!(null)] {
            let cmd = AdminCommand::parse(&json!({
                "shardCollection": "app.c",
                "key": {"a": "hashed"},
                "numInitialChunks": raw,
            }))
            .expect("parse");
            match cmd {
                AdminCommand::ShardCollection(req) => assert_eq!(req.num_initial_chunks, None),
                other => panic!("unexpected command {other:?}"),
            }
        }
        let err = AdminCommand::parse(&json!({
            "shardCollection": "app.c",
            "key": {"a": "hashed"},
            "numInitialChunks": "six",
        }))
        .expect_err("not a number");
        assert_eq!(err.code_name(), "BadRequest");
    }

    #[test]
    fn error_documents_carry_code_names() {
        let resp = error_response(&ShardingError::OnlyShard);
        assert_eq!(resp["ok"], json!(0));
        assert_eq!(resp["codeName"], json!("OnlyShard"));
        assert_eq!(resp["kind"], json!("precondition"));
    }
}
