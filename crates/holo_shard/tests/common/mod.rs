#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use holo_shard::{
    AdminService, ChunkManager, ClusterContext, ClusterMetadata, ClusterMetadataStore,
    CoordinatorConfig, InMemoryLockManager, MetadataCommand, MetadataStateStore, Result,
    ShardEntry, ShardingError, SimulatedShardCluster,
};
use serde_json::{json, Value};

/// Store wrapper that can be told to reject chunk move commits, or to go
/// unreachable right after one succeeds.
pub struct FlakyCommitStore {
    pub inner: MetadataStateStore,
    pub fail_commits: AtomicBool,
    pub down_after_commit: AtomicBool,
    pub down: AtomicBool,
}

impl FlakyCommitStore {
    fn check_up(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(ShardingError::Unavailable("metadata store unreachable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterMetadataStore for FlakyCommitStore {
    async fn snapshot(&self) -> Result<ClusterMetadata> {
        self.check_up()?;
        self.inner.snapshot().await
    }

    async fn apply(&self, cmd: MetadataCommand) -> Result<u64> {
        self.check_up()?;
        let is_commit = matches!(cmd, MetadataCommand::CommitChunkMove { .. });
        if is_commit && self.fail_commits.load(Ordering::SeqCst) {
            return Err(ShardingError::StaleVersion(
                "chunk version changed during migration".into(),
            ));
        }
        let epoch = self.inner.apply(cmd).await?;
        if is_commit && self.down_after_commit.load(Ordering::SeqCst) {
            self.down.store(true, Ordering::SeqCst);
        }
        Ok(epoch)
    }
}

pub struct Harness {
    pub store: MetadataStateStore,
    pub flaky: Arc<FlakyCommitStore>,
    pub sim: Arc<SimulatedShardCluster>,
    pub locks: InMemoryLockManager,
    pub admin: AdminService,
}

pub fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        process_id: "test-router".into(),
        lock_wait: Duration::from_millis(100),
        lock_retry_interval: Duration::from_millis(5),
        lock_ttl: Duration::from_secs(60),
        default_wait_for_delete: true,
        ..CoordinatorConfig::default()
    }
}

pub fn shard_entries(ids: &[&str]) -> Vec<ShardEntry> {
    ids.iter()
        .map(|id| ShardEntry::new(*id, format!("{id}.example:27018")))
        .collect()
}

pub fn harness(ids: &[&str]) -> Harness {
    let store = MetadataStateStore::in_memory(shard_entries(ids));
    let flaky = Arc::new(FlakyCommitStore {
        inner: store.clone(),
        fail_commits: AtomicBool::new(false),
        down_after_commit: AtomicBool::new(false),
        down: AtomicBool::new(false),
    });
    let sim = Arc::new(SimulatedShardCluster::with_shards(ids.iter().copied()));
    let config = test_config();
    let locks = InMemoryLockManager::new(
        config.process_id.clone(),
        config.lock_ttl,
        config.lock_retry_interval,
    );
    let ctx = ClusterContext::new(flaky.clone(), Arc::new(locks.clone()), sim.clone(), config);
    Harness {
        store,
        flaky,
        sim,
        locks,
        admin: AdminService::new(ctx),
    }
}

impl Harness {
    /// Runs a command that must succeed and returns its response.
    pub async fn ok(&self, cmd: Value) -> Value {
        let resp = self.admin.run_command(&cmd).await;
        assert_eq!(resp["ok"], json!(1), "command {cmd} failed: {resp}");
        resp
    }

    /// Runs a command that must fail and returns its code name.
    pub async fn err(&self, cmd: Value) -> String {
        let resp = self.admin.run_command(&cmd).await;
        assert_eq!(resp["ok"], json!(0), "command {cmd} unexpectedly succeeded: {resp}");
        resp["codeName"].as_str().unwrap_or_default().to_string()
    }

    pub fn state(&self) -> ClusterMetadata {
        self.store.state().expect("state")
    }

    pub fn manager(&self, ns: &str) -> ChunkManager {
        self.state().chunk_manager(ns).expect("chunk manager")
    }

    pub fn fail_commits(&self, fail: bool) {
        self.flaky.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Makes the metadata store unreachable once the next chunk move commits.
    pub fn store_down_after_commit(&self) {
        self.flaky.down_after_commit.store(true, Ordering::SeqCst);
    }

    pub fn restore_store(&self) {
        self.flaky.down_after_commit.store(false, Ordering::SeqCst);
        self.flaky.down.store(false, Ordering::SeqCst);
    }

    /// Enables sharding on the database of `ns`, loads `docs` into the
    /// primary, and shards on `{"a": 1}` with a supporting index.
    pub async fn sharded_on_a(&self, ns: &str, docs: impl IntoIterator<Item = Value>) -> String {
        let db = ns.split('.').next().expect("db");
        if self.state().database(db).is_none() {
            self.ok(json!({"enableSharding": db})).await;
        }
        let primary = self.state().database(db).expect("db entry").primary.clone();
        self.sim.insert(&primary, ns, docs).expect("insert");
        self.sim
            .add_index(
                &primary,
                ns,
                holo_shard::index::descriptor_from_document(&json!({"key": {"a": 1}}))
                    .expect("index"),
            )
            .expect("add index");
        self.ok(json!({"shardCollection": ns, "key": {"a": 1}})).await;
        primary
    }
}

pub fn docs(range: std::ops::Range<i64>) -> Vec<Value> {
    range.map(|i| json!({"_id": i, "a": i, "pad": "x".repeat(16)})).collect()
}
