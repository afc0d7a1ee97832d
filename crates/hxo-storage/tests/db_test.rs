//! Integration tests for the Turso checkpoint store
//!
//! Covers:
//! - Schema initialization on a fresh file
//! - Plan, shard and result round-trips
//! - Write-once results
//! - Incomplete-plan discovery across reopen (crash recovery input)
//! - Atomic autosplit swap

use hxo_core::{
    HxoPlan, HxoStage, PlanRequest, PlanStatus, ShardPhase, ShardResult, ShardSpec,
};
use hxo_storage::{Checkpointer, TursoCheckpointer};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

/// Helper to create a store in a fresh temp directory
async fn create_test_store() -> (TursoCheckpointer, TempDir, PathBuf) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir
        .path()
        .join(format!("hxo_{}.db", uuid::Uuid::new_v4()));
    let store = TursoCheckpointer::open(&path)
        .await
        .expect("Failed to open store");
    (store, dir, path)
}

fn create_plan(name: &str) -> HxoPlan {
    let request = PlanRequest::new(name).with_stage(HxoStage::new("s1", "echo"));
    HxoPlan::from_request(request)
}

fn create_shard(plan: &HxoPlan, index: u64) -> ShardSpec {
    let stage = HxoStage::new("s1", "echo");
    let mut shard = ShardSpec::new(&plan.id, &stage, index, json!({ "index": index }), 1_000);
    shard.seq = index;
    shard
}

#[tokio::test]
async fn test_plan_roundtrip() {
    let (store, _dir, _) = create_test_store().await;
    let mut plan = create_plan("roundtrip");
    plan.status = PlanStatus::Running;
    plan.counters.pending = 3;

    store.save_plan(&plan).await.unwrap();
    let loaded = store.load_plan(&plan.id).await.unwrap().unwrap();
    assert_eq!(loaded.id, plan.id);
    assert_eq!(loaded.status, PlanStatus::Running);
    assert_eq!(loaded.counters.pending, 3);
    assert_eq!(loaded.stages.len(), 1);

    assert!(store.load_plan("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn test_shard_upsert_keeps_latest_phase() {
    let (store, _dir, _) = create_test_store().await;
    let plan = create_plan("upsert");
    let mut shard = create_shard(&plan, 0);

    store.save_shard(&shard).await.unwrap();
    shard.set_phase(ShardPhase::Claimed);
    store.save_shard(&shard).await.unwrap();
    shard.set_phase(ShardPhase::Running);
    store.commit_shard(&plan, &shard).await.unwrap();

    let loaded = store
        .load_shard(&plan.id, &shard.shard_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.phase, ShardPhase::Running);
    assert_eq!(store.list_shards(&plan.id).await.unwrap().len(), 1);

    let counts = store.phase_counts(&plan.id).await.unwrap();
    assert_eq!(counts, vec![("running".to_string(), 1)]);
}

#[tokio::test]
async fn test_batch_save_lists_in_sequence() {
    let (store, _dir, _) = create_test_store().await;
    let plan = create_plan("batch");
    let shards: Vec<ShardSpec> = (0..6).rev().map(|i| create_shard(&plan, i)).collect();

    store.save_shards(&shards).await.unwrap();
    let listed = store.list_shards(&plan.id).await.unwrap();
    let seqs: Vec<u64> = listed.iter().map(|s| s.seq).collect();
    assert_eq!(seqs, vec![0, 1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_results_write_once() {
    let (store, _dir, _) = create_test_store().await;
    let plan = create_plan("results");
    let shard = create_shard(&plan, 0);

    let first = ShardResult::success(&shard, json!({"v": 1}), Duration::from_millis(5));
    let second = ShardResult::success(&shard, json!({"v": 2}), Duration::from_millis(5));
    store.save_result(&first).await.unwrap();
    store.save_result(&second).await.unwrap();

    let loaded = store
        .load_result(&plan.id, &shard.shard_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.output, Some(json!({"v": 1})));
    assert_eq!(store.list_results(&plan.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_incomplete_plans_survive_reopen() {
    let (store, _dir, path) = create_test_store().await;

    let mut running = create_plan("running");
    running.status = PlanStatus::Running;
    let mut done = create_plan("done");
    done.status = PlanStatus::Done;
    let mut aborted = create_plan("aborted");
    aborted.status = PlanStatus::Aborted;

    for plan in [&running, &done, &aborted] {
        store.save_plan(plan).await.unwrap();
    }
    drop(store);

    let reopened = TursoCheckpointer::open(&path).await.unwrap();
    let incomplete = reopened.list_incomplete_plans().await.unwrap();
    assert_eq!(incomplete, vec![running.id.clone()]);
    assert_eq!(reopened.list_plans().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_replace_shards_is_atomic_swap() {
    let (store, _dir, _) = create_test_store().await;
    let mut plan = create_plan("autosplit");
    let originals: Vec<ShardSpec> = (0..2).map(|i| create_shard(&plan, i)).collect();
    store.save_shards(&originals).await.unwrap();

    let refined: Vec<ShardSpec> = (10..14).map(|i| create_shard(&plan, i)).collect();
    plan.counters.pending = 4;
    let removed: Vec<String> = originals.iter().map(|s| s.shard_id.clone()).collect();
    store.replace_shards(&plan, &removed, &refined).await.unwrap();

    let listed = store.list_shards(&plan.id).await.unwrap();
    assert_eq!(listed.len(), 4);
    assert!(listed.iter().all(|s| s.seq >= 10));
    let stored_plan = store.load_plan(&plan.id).await.unwrap().unwrap();
    assert_eq!(stored_plan.counters.pending, 4);
}
