//! Checkpoint interface
//!
//! Every phase transition is written here before the orchestrator treats it
//! as committed. A failed write surfaces as `HxoError::CheckpointIo` and is
//! never swallowed.

use async_trait::async_trait;
use hxo_core::{HxoPlan, Result, ShardResult, ShardSpec};

/// Durable store for plan, shard and result state
///
/// Implementations must make per-(plan, shard) upserts atomic so that a
/// later write for the same key never loses to an earlier one.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    async fn save_plan(&self, plan: &HxoPlan) -> Result<()>;

    async fn load_plan(&self, plan_id: &str) -> Result<Option<HxoPlan>>;

    /// All plans, oldest first
    async fn list_plans(&self) -> Result<Vec<HxoPlan>>;

    /// Ids of plans whose status is not terminal, oldest first
    async fn list_incomplete_plans(&self) -> Result<Vec<String>>;

    async fn save_shard(&self, shard: &ShardSpec) -> Result<()>;

    async fn load_shard(&self, plan_id: &str, shard_id: &str) -> Result<Option<ShardSpec>>;

    /// Shards of a plan ordered by creation sequence
    async fn list_shards(&self, plan_id: &str) -> Result<Vec<ShardSpec>>;

    /// Store a final result. Results are write-once; a second write for the
    /// same shard is ignored.
    async fn save_result(&self, result: &ShardResult) -> Result<()>;

    async fn load_result(&self, plan_id: &str, shard_id: &str) -> Result<Option<ShardResult>>;

    async fn list_results(&self, plan_id: &str) -> Result<Vec<ShardResult>>;

    /// Swap pending shards for their refinements during an autosplit
    async fn replace_shards(
        &self,
        plan: &HxoPlan,
        removed: &[String],
        added: &[ShardSpec],
    ) -> Result<()>;

    async fn save_shards(&self, shards: &[ShardSpec]) -> Result<()> {
        for shard in shards {
            self.save_shard(shard).await?;
        }
        Ok(())
    }

    /// Persist a shard transition together with the plan counters it moved
    async fn commit_shard(&self, plan: &HxoPlan, shard: &ShardSpec) -> Result<()> {
        self.save_shard(shard).await?;
        self.save_plan(plan).await
    }

    /// Reclaim space held by the store
    async fn compact(&self) -> Result<()> {
        Ok(())
    }
}
