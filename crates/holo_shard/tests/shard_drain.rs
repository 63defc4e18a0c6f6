mod common;

use common::{docs, harness};
use holo_shard::ShardState;
use serde_json::json;

#[tokio::test]
async fn drain_runs_to_completion() {
    let h = harness(&["s1", "s2"]);
    h.sharded_on_a("app.c", docs(0..10)).await;

    let resp = h.ok(json!({"removeShard": "s1"})).await;
    assert_eq!(resp["state"], json!("started"));
    assert_eq!(resp["msg"], json!("draining started successfully"));
    assert_eq!(resp["dbsToMove"], json!(["app"]));
    assert_eq!(resp["note"], json!("you need to drop or movePrimary these databases"));
    assert_eq!(h.state().shards.state("s1"), ShardState::Draining);

    let resp = h.ok(json!({"removeShard": "s1"})).await;
    assert_eq!(resp["state"], json!("ongoing"));
    assert_eq!(resp["msg"], json!("draining ongoing"));
    assert_eq!(resp["remaining"], json!({"chunks": 1, "dbs": 1}));

    h.ok(json!({"moveChunk": "app.c", "find": {"a": 1}, "to": "s2"})).await;
    let resp = h.ok(json!({"removeShard": "s1"})).await;
    assert_eq!(resp["remaining"], json!({"chunks": 0, "dbs": 1}));

    h.ok(json!({"movePrimary": "app", "to": "s2"})).await;
    let resp = h.ok(json!({"removeShard": "s1"})).await;
    assert_eq!(resp["state"], json!("completed"));
    assert_eq!(resp["msg"], json!("removeshard completed successfully"));
    assert_eq!(h.state().shards.state("s1"), ShardState::Removed);

    assert_eq!(h.err(json!({"removeShard": "s1"})).await, "UnknownShard");
    let shards = h.ok(json!({"listShards": 1})).await;
    assert_eq!(shards["shards"], json!([{"_id": "s2", "host": "s2.example:27018"}]));
}

#[tokio::test]
async fn last_shard_cannot_be_removed() {
    let h = harness(&["s1"]);
    assert_eq!(h.err(json!({"removeShard": "s1"})).await, "OnlyShard");
    assert_eq!(h.state().shards.state("s1"), ShardState::Active);
}

#[tokio::test]
async fn only_one_shard_drains_at_a_time() {
    let h = harness(&["s1", "s2", "s3"]);
    h.ok(json!({"removeShard": "s2"})).await;
    assert_eq!(h.err(json!({"removeShard": "s3"})).await, "AnotherShardDraining");
    assert_eq!(h.err(json!({"removeShard": "s9"})).await, "UnknownShard");

    let resp = h.ok(json!({"removeShard": "s2"})).await;
    assert_eq!(resp["state"], json!("completed"));
    h.ok(json!({"removeShard": "s3"})).await;
}

#[tokio::test]
async fn draining_shard_is_skipped_for_new_databases() {
    let h = harness(&["s1", "s2"]);
    h.ok(json!({"removeShard": "s1"})).await;
    h.ok(json!({"enableSharding": "fresh"})).await;
    assert_eq!(h.state().database("fresh").expect("db").primary, "s2");
}
