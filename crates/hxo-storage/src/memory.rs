//! In-process checkpoint store
//!
//! Shares state through an `Arc`, so two orchestrator instances pointed at
//! the same store behave like a process before and after a restart.

use async_trait::async_trait;
use hxo_core::{HxoError, HxoPlan, Result, ShardResult, ShardSpec};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

use crate::checkpointer::Checkpointer;

#[derive(Default)]
struct MemoryState {
    plans: HashMap<String, HxoPlan>,
    shards: HashMap<String, BTreeMap<String, ShardSpec>>,
    results: HashMap<String, BTreeMap<String, ShardResult>>,
}

/// Checkpointer backed by in-memory maps
#[derive(Default)]
pub struct MemoryCheckpointer {
    state: RwLock<MemoryState>,
    unavailable: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail with a checkpoint I/O error until reset
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of successful writes so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_writable(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(HxoError::CheckpointIo("memory store unavailable".to_string()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn sorted_shards(shards: &BTreeMap<String, ShardSpec>) -> Vec<ShardSpec> {
    let mut out: Vec<ShardSpec> = shards.values().cloned().collect();
    out.sort_by(|a, b| a.seq.cmp(&b.seq).then_with(|| a.shard_id.cmp(&b.shard_id)));
    out
}

#[async_trait]
impl Checkpointer for MemoryCheckpointer {
    async fn save_plan(&self, plan: &HxoPlan) -> Result<()> {
        self.check_writable()?;
        self.state
            .write()
            .await
            .plans
            .insert(plan.id.clone(), plan.clone());
        Ok(())
    }

    async fn load_plan(&self, plan_id: &str) -> Result<Option<HxoPlan>> {
        Ok(self.state.read().await.plans.get(plan_id).cloned())
    }

    async fn list_plans(&self) -> Result<Vec<HxoPlan>> {
        let state = self.state.read().await;
        let mut plans: Vec<HxoPlan> = state.plans.values().cloned().collect();
        plans.sort_by_key(|p| p.created_at);
        Ok(plans)
    }

    async fn list_incomplete_plans(&self) -> Result<Vec<String>> {
        Ok(self
            .list_plans()
            .await?
            .into_iter()
            .filter(|p| !p.status.is_terminal())
            .map(|p| p.id)
            .collect())
    }

    async fn save_shard(&self, shard: &ShardSpec) -> Result<()> {
        self.check_writable()?;
        self.state
            .write()
            .await
            .shards
            .entry(shard.plan_id.clone())
            .or_default()
            .insert(shard.shard_id.clone(), shard.clone());
        Ok(())
    }

    async fn load_shard(&self, plan_id: &str, shard_id: &str) -> Result<Option<ShardSpec>> {
        Ok(self
            .state
            .read()
            .await
            .shards
            .get(plan_id)
            .and_then(|shards| shards.get(shard_id))
            .cloned())
    }

    async fn list_shards(&self, plan_id: &str) -> Result<Vec<ShardSpec>> {
        Ok(self
            .state
            .read()
            .await
            .shards
            .get(plan_id)
            .map(sorted_shards)
            .unwrap_or_default())
    }

    async fn save_result(&self, result: &ShardResult) -> Result<()> {
        self.check_writable()?;
        self.state
            .write()
            .await
            .results
            .entry(result.plan_id.clone())
            .or_default()
            .entry(result.shard_id.clone())
            .or_insert_with(|| result.clone());
        Ok(())
    }

    async fn load_result(&self, plan_id: &str, shard_id: &str) -> Result<Option<ShardResult>> {
        Ok(self
            .state
            .read()
            .await
            .results
            .get(plan_id)
            .and_then(|results| results.get(shard_id))
            .cloned())
    }

    async fn list_results(&self, plan_id: &str) -> Result<Vec<ShardResult>> {
        Ok(self
            .state
            .read()
            .await
            .results
            .get(plan_id)
            .map(|results| results.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn replace_shards(
        &self,
        plan: &HxoPlan,
        removed: &[String],
        added: &[ShardSpec],
    ) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        let shards = state.shards.entry(plan.id.clone()).or_default();
        for id in removed {
            shards.remove(id);
        }
        for shard in added {
            shards.insert(shard.shard_id.clone(), shard.clone());
        }
        state.plans.insert(plan.id.clone(), plan.clone());
        Ok(())
    }

    async fn commit_shard(&self, plan: &HxoPlan, shard: &ShardSpec) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        state
            .shards
            .entry(plan.id.clone())
            .or_default()
            .insert(shard.shard_id.clone(), shard.clone());
        state.plans.insert(plan.id.clone(), plan.clone());
        Ok(())
    }
}
