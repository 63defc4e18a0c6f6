mod common;

use std::time::Duration;

use common::{docs, harness};
use holo_shard::migration::{ChunkLocator, DeleteOutcome, MigrationPhase, MoveChunkRequest};
use holo_shard::sim::Fault;
use holo_shard::{ChunkVersion, DistributedLock, KeyValue, ShardKey};
use proptest::prelude::*;
use serde_json::json;

fn key(v: i64) -> ShardKey {
    ShardKey::new(vec![KeyValue::Int(v)])
}

#[tokio::test]
async fn split_at_middle_assigns_fresh_minor_versions() {
    let h = harness(&["s1", "s2"]);
    h.sharded_on_a("app.c", docs(0..20)).await;
    let resp = h.ok(json!({"split": "app.c", "middle": {"a": 10}})).await;
    assert_eq!(resp["chunks"], json!(2));

    let manager = h.manager("app.c");
    let chunks: Vec<_> = manager.chunks().cloned().collect();
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].max, key(10));
    assert_eq!(chunks[0].version, ChunkVersion::new(1, 1));
    assert_eq!(chunks[1].version, ChunkVersion::new(1, 2));
    assert_eq!(manager.version(), ChunkVersion::new(1, 2));

    assert_eq!(
        h.err(json!({"split": "app.c", "middle": {"a": 10}})).await,
        "SplitPointOnBoundary"
    );
    assert_eq!(
        h.err(json!({"split": "app.c", "middle": {"b": 10}})).await,
        "BadRequest"
    );
}

#[tokio::test]
async fn split_without_point_uses_median() {
    let h = harness(&["s1", "s2"]);
    h.sharded_on_a("app.c", docs(0..9)).await;
    h.ok(json!({"split": "app.c", "find": {"a": 3}})).await;
    let manager = h.manager("app.c");
    assert_eq!(manager.num_chunks(), 2);
    assert_eq!(manager.chunks().next().expect("first").max, key(4));

    h.ok(json!({"split": "app.c", "bounds": [{"a": 4}, {"a": {"$maxKey": 1}}]}))
        .await;
    assert_eq!(h.manager("app.c").num_chunks(), 3);
}

#[tokio::test]
async fn split_needs_distinct_keys() {
    let h = harness(&["s1", "s2"]);
    h.sharded_on_a("app.c", Vec::new()).await;
    assert_eq!(
        h.err(json!({"split": "app.c", "find": {"a": 1}})).await,
        "NoSplitPoint"
    );
    assert_eq!(
        h.err(json!({"split": "app.none", "find": {"a": 1}})).await,
        "NamespaceNotSharded"
    );
}

#[tokio::test]
async fn move_chunk_transfers_documents_and_bumps_major() {
    let h = harness(&["s1", "s2"]);
    h.sharded_on_a("app.c", docs(0..20)).await;
    h.ok(json!({"split": "app.c", "middle": {"a": 10}})).await;
    let before = h.manager("app.c");
    let low_version = before
        .find_intersecting_chunk(&key(0))
        .expect("low chunk")
        .version;

    let resp = h
        .ok(json!({"moveChunk": "app.c", "find": {"a": 15}, "to": "s2", "_waitForDelete": true}))
        .await;
    assert!(resp["millis"].is_u64());
    assert_eq!(resp["cloned"]["docs"], json!(10));
    assert_eq!(resp["deleteScheduled"], json!(false));

    let after = h.manager("app.c");
    let moved = after.find_intersecting_chunk(&key(15)).expect("moved chunk");
    assert_eq!(moved.shard, "s2");
    assert_eq!(moved.version, ChunkVersion::new(2, 0));
    assert!(after.version() > before.version());
    assert_eq!(
        after.find_intersecting_chunk(&key(0)).expect("low").version,
        low_version
    );
    assert_eq!(after.shard_version("s2"), ChunkVersion::new(2, 0));

    assert_eq!(h.sim.documents("s1", "app.c").expect("s1").len(), 10);
    assert_eq!(h.sim.documents("s2", "app.c").expect("s2").len(), 10);
}

#[tokio::test]
async fn move_chunk_rejects_bad_targets() {
    let h = harness(&["s1", "s2", "s3"]);
    h.sharded_on_a("app.c", docs(0..5)).await;
    assert_eq!(
        h.err(json!({"moveChunk": "app.c", "find": {"a": 1}, "to": "s1"})).await,
        "AlreadyOnShard"
    );
    assert_eq!(
        h.err(json!({"moveChunk": "app.c", "find": {"a": 1}, "to": "nowhere"})).await,
        "UnknownShard"
    );
    assert_eq!(
        h.err(json!({"moveChunk": "app.c", "bounds": [{"a": 0}, {"a": 3}], "to": "s2"}))
            .await,
        "ChunkNotFound"
    );

    h.ok(json!({"removeShard": "s3"})).await;
    assert_eq!(
        h.err(json!({"moveChunk": "app.c", "find": {"a": 1}, "to": "s3"})).await,
        "ShardDraining"
    );
}

#[tokio::test]
async fn oversized_chunk_is_not_moved() {
    let h = harness(&["s1", "s2"]);
    h.sharded_on_a("app.c", docs(0..50)).await;
    assert_eq!(
        h.err(json!({"moveChunk": "app.c", "find": {"a": 1}, "to": "s2", "maxChunkSizeBytes": 100}))
            .await,
        "ChunkTooLarge"
    );
    let manager = h.manager("app.c");
    assert_eq!(manager.chunks_on("s1"), 1);
    assert_eq!(manager.version(), ChunkVersion::new(1, 0));
    assert!(h.sim.documents("s2", "app.c").expect("s2").is_empty());
}

#[tokio::test]
async fn clone_failure_leaves_ownership_unchanged() {
    let h = harness(&["s1", "s2"]);
    h.sharded_on_a("app.c", docs(0..10)).await;
    h.sim.set_fault("s2", Fault::CloneInto, true).expect("fault");
    assert_eq!(
        h.err(json!({"moveChunk": "app.c", "find": {"a": 1}, "to": "s2"})).await,
        "MigrationCloneFailed"
    );
    assert_eq!(h.manager("app.c").chunks_on("s1"), 1);
    assert_eq!(h.sim.documents("s1", "app.c").expect("s1").len(), 10);
}

#[tokio::test]
async fn commit_failure_discards_clone() {
    let h = harness(&["s1", "s2"]);
    h.sharded_on_a("app.c", docs(0..10)).await;
    let before = h.state().epoch;
    h.fail_commits(true);
    assert_eq!(
        h.err(json!({"moveChunk": "app.c", "find": {"a": 1}, "to": "s2"})).await,
        "MigrationCommitFailed"
    );

    let state = h.state();
    assert_eq!(state.epoch, before);
    let manager = state.chunk_manager("app.c").expect("manager");
    assert_eq!(manager.chunks_on("s1"), 1);
    assert_eq!(manager.version(), ChunkVersion::new(1, 0));
    assert!(h.sim.documents("s2", "app.c").expect("s2").is_empty());
    assert_eq!(h.sim.documents("s1", "app.c").expect("s1").len(), 10);

    h.fail_commits(false);
    h.ok(json!({"moveChunk": "app.c", "find": {"a": 1}, "to": "s2"})).await;
    assert_eq!(h.manager("app.c").chunks_on("s2"), 1);
}

#[tokio::test]
async fn committed_move_succeeds_when_store_drops_after_commit() {
    let h = harness(&["s1", "s2"]);
    h.sharded_on_a("app.c", docs(0..10)).await;
    h.store_down_after_commit();
    let resp = h
        .ok(json!({"moveChunk": "app.c", "find": {"a": 1}, "to": "s2", "_waitForDelete": true}))
        .await;
    assert_eq!(resp["to"], json!("s2"));
    assert_eq!(resp["version"], json!({"major": 2, "minor": 0}));
    assert_eq!(resp["delete"]["state"], json!("completed"));
    assert!(h.sim.documents("s1", "app.c").expect("s1").is_empty());
    assert_eq!(h.sim.documents("s2", "app.c").expect("s2").len(), 10);

    h.restore_store();
    assert_eq!(h.manager("app.c").chunks_on("s2"), 1);
    assert_eq!(
        h.err(json!({"moveChunk": "app.c", "find": {"a": 1}, "to": "s2"})).await,
        "AlreadyOnShard"
    );
}

#[tokio::test]
async fn deferred_delete_runs_after_response() {
    let h = harness(&["s1", "s2"]);
    h.sharded_on_a("app.c", docs(0..10)).await;
    let req = MoveChunkRequest {
        ns: "app.c".into(),
        locator: ChunkLocator::Find(json!({"a": 1})),
        to: "s2".into(),
        max_chunk_size_bytes: Some(0),
        wait_for_delete: Some(false),
    };
    let outcome = h.admin.migrations().move_chunk(&req).await.expect("move");
    assert_eq!(outcome.delete, DeleteOutcome::Scheduled);
    assert_eq!(
        outcome.phases,
        vec![
            MigrationPhase::Cloning,
            MigrationPhase::Committing,
            MigrationPhase::Deleting,
            MigrationPhase::Done
        ]
    );
    let waited = h
        .admin
        .migrations()
        .wait_for_pending_deletes()
        .await
        .expect("wait");
    assert_eq!(waited, 1);
    assert!(h.sim.documents("s1", "app.c").expect("s1").is_empty());
}

#[tokio::test]
async fn donor_delete_failure_does_not_fail_the_move() {
    let h = harness(&["s1", "s2"]);
    h.sharded_on_a("app.c", docs(0..10)).await;
    h.sim.set_fault("s1", Fault::DeleteRange, true).expect("fault");
    let resp = h
        .ok(json!({"moveChunk": "app.c", "find": {"a": 1}, "to": "s2", "_waitForDelete": true}))
        .await;
    assert_eq!(resp["delete"]["state"], json!("failed"));
    assert_eq!(h.manager("app.c").chunks_on("s2"), 1);
}

#[tokio::test]
async fn contended_namespace_lock_fails_without_changes() {
    let h = harness(&["s1", "s2"]);
    h.sharded_on_a("app.c", docs(0..10)).await;
    let other = h.locks.for_holder("other-router");
    let lease = other
        .acquire("app.c", "balancing", Duration::ZERO)
        .await
        .expect("lock");

    assert_eq!(
        h.err(json!({"moveChunk": "app.c", "find": {"a": 1}, "to": "s2"})).await,
        "LockNotAcquired"
    );
    assert_eq!(
        h.err(json!({"split": "app.c", "middle": {"a": 5}})).await,
        "LockNotAcquired"
    );
    assert_eq!(h.manager("app.c").chunks_on("s1"), 1);

    other.release(&lease).await.expect("release");
    h.ok(json!({"split": "app.c", "middle": {"a": 5}})).await;
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn chunks_cover_key_space_after_splits_and_moves(
        ops in proptest::collection::vec((-50i64..50, any::<bool>(), 0usize..3), 1..12)
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        rt.block_on(async {
            let h = harness(&["s1", "s2", "s3"]);
            h.sharded_on_a("app.c", docs(-50..50)).await;
            let shards = ["s1", "s2", "s3"];
            let mut last = h.manager("app.c").version();
            for (point, is_split, target) in ops {
                let cmd = if is_split {
                    json!({"split": "app.c", "middle": {"a": point}})
                } else {
                    json!({"moveChunk": "app.c", "find": {"a": point}, "to": shards[target]})
                };
                let resp = h.admin.run_command(&cmd).await;
                let manager = h.manager("app.c");
                assert!(manager.version() >= last);
                if resp["ok"] == json!(1) {
                    assert!(manager.version() > last);
                }
                last = manager.version();

                let mut total = 0;
                for shard in shards {
                    for doc in h.sim.documents(shard, "app.c").expect("docs") {
                        let k = manager.pattern().extract_key(&doc).expect("key");
                        assert_eq!(manager.find_intersecting_chunk(&k).expect("owner").shard, shard);
                        total += 1;
                    }
                }
                assert_eq!(total, 100);
            }
        });
    }
}
