//! Rehydration of interrupted plans
//!
//! After a restart the checkpoint store is the only truth. Shards that were
//! claimed or running when the process died are returned to pending, and
//! shards whose result was written but whose phase commit was lost are
//! settled from that result. DONE shards are never dispatched again.

use chrono::Utc;
use hxo_core::{
    HxoError, HxoPlan, PlanStatus, PlanStatusReport, Result, ShardCounters, ShardPhase,
    ShardResult, ShardSpec,
};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, instrument, warn};

use crate::orchestrator::{partition_plan, HxoCore};
use crate::state_machine::{plan_transition, shard_transition, PlanEvent, ShardEvent};

/// Resumes incomplete plans from the checkpoint store
pub struct Rehydrator {
    core: HxoCore,
}

impl Rehydrator {
    pub fn new(core: HxoCore) -> Self {
        Self { core }
    }

    /// Ids of non-terminal plans in the store, oldest first
    pub async fn find_incomplete_plans(&self) -> Result<Vec<String>> {
        self.core.checkpointer().list_incomplete_plans().await
    }

    /// Resume every incomplete plan. A plan that cannot be resumed is logged
    /// and skipped; the others still start.
    pub async fn resume_all(&self) -> Result<Vec<PlanStatusReport>> {
        let plan_ids = self.find_incomplete_plans().await?;
        if plan_ids.is_empty() {
            debug!("no incomplete plans to resume");
            return Ok(Vec::new());
        }

        info!("resuming {} incomplete plan(s)", plan_ids.len());
        let mut resumed = Vec::with_capacity(plan_ids.len());
        for plan_id in plan_ids {
            let outcome = match self.core.load_plan(&plan_id).await {
                Ok(plan) => self.resume(plan).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(Some(report)) => resumed.push(report),
                Ok(None) => {}
                Err(e @ HxoError::CheckpointIo(_)) => return Err(e),
                Err(e) => warn!(plan_id = %plan_id, "failed to resume plan: {}", e),
            }
        }
        Ok(resumed)
    }

    /// Resume one plan. Terminal and already-running plans are reported as
    /// they are.
    pub async fn resume_plan(&self, plan_id: &str) -> Result<PlanStatusReport> {
        let plan = self.core.load_plan(plan_id).await?;
        match self.resume(plan).await? {
            Some(report) => Ok(report),
            None => self.core.status(plan_id).await,
        }
    }

    #[instrument(skip_all, fields(plan_id = %plan.id, status = %plan.status))]
    async fn resume(&self, mut plan: HxoPlan) -> Result<Option<PlanStatusReport>> {
        if plan.status.is_terminal() || self.core.is_live(&plan.id).await {
            return Ok(None);
        }

        let checkpointer = self.core.checkpointer();
        let mut shards = checkpointer.list_shards(&plan.id).await?;

        if plan.status == PlanStatus::Submitted {
            plan.status = plan_transition(plan.status, PlanEvent::StartPartitioning)?;
        }
        if plan.status == PlanStatus::Partitioning {
            // Shards are written in one batch, so either all exist or none do
            if shards.is_empty() {
                shards = partition_plan(self.core.env(), &mut plan);
                self.core.persist_shards(&shards).await?;
            }
            plan.status = plan_transition(plan.status, PlanEvent::Partitioned)?;
            plan.started_at.get_or_insert_with(Utc::now);
        }

        let results: HashMap<String, ShardResult> = checkpointer
            .list_results(&plan.id)
            .await?
            .into_iter()
            .map(|r| (r.shard_id.clone(), r))
            .collect();

        let mut recovered = 0usize;
        for shard in shards.iter_mut() {
            if let Some(phase) = reconcile(shard, results.get(&shard.shard_id))? {
                shard.set_phase(phase);
                self.core.persist_shard(shard).await?;
                recovered += 1;
            }
        }

        let leaves: BTreeMap<String, String> = shards
            .iter()
            .filter(|s| s.phase == ShardPhase::Done)
            .filter_map(|s| {
                results
                    .get(&s.shard_id)
                    .map(|r| (s.shard_id.clone(), r.output_hash.clone()))
            })
            .collect();

        plan.counters = ShardCounters::from_phases(shards.iter().map(|s| &s.phase));
        plan.touch();
        self.core.persist_plan(&plan).await?;

        info!(
            plan_id = %plan.id,
            status = %plan.status,
            done = plan.counters.done,
            pending = plan.counters.pending,
            recovered,
            "resuming plan"
        );
        let report = PlanStatusReport::from_plan(&plan);
        self.core.start_runner(plan, shards, leaves).await;
        Ok(Some(report))
    }
}

/// The phase a stored shard should be corrected to, if any
fn reconcile(shard: &ShardSpec, result: Option<&ShardResult>) -> Result<Option<ShardPhase>> {
    let phase = match (shard.phase, result) {
        // The result landed but the phase commit did not
        (phase, Some(r)) if !phase.is_terminal() => {
            if r.success {
                ShardPhase::Done
            } else {
                ShardPhase::Failed
            }
        }
        (ShardPhase::Claimed | ShardPhase::Running, None) => {
            shard_transition(shard.phase, ShardEvent::Recover)?
        }
        // A DONE shard must have its output; redo it otherwise
        (ShardPhase::Done, None) => ShardPhase::Pending,
        (ShardPhase::Done, Some(r)) if !r.success => ShardPhase::Pending,
        _ => return Ok(None),
    };
    Ok(Some(phase))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hxo_core::HxoStage;
    use serde_json::json;
    use std::time::Duration;

    fn shard(phase: ShardPhase) -> ShardSpec {
        let stage = HxoStage::new("s", "echo");
        let mut shard = ShardSpec::new("p1", &stage, 0, json!({ "i": 0 }), 1_000);
        shard.set_phase(phase);
        shard
    }

    #[test]
    fn test_running_without_result_goes_back_to_pending() {
        let s = shard(ShardPhase::Running);
        assert_eq!(reconcile(&s, None).unwrap(), Some(ShardPhase::Pending));
        let s = shard(ShardPhase::Claimed);
        assert_eq!(reconcile(&s, None).unwrap(), Some(ShardPhase::Pending));
    }

    #[test]
    fn test_stored_result_settles_shard() {
        let s = shard(ShardPhase::Running);
        let ok = ShardResult::success(&s, json!(1), Duration::from_millis(3));
        assert_eq!(reconcile(&s, Some(&ok)).unwrap(), Some(ShardPhase::Done));

        let bad = ShardResult::failure(&s, "boom".into(), Duration::from_millis(3));
        assert_eq!(reconcile(&s, Some(&bad)).unwrap(), Some(ShardPhase::Failed));
    }

    #[test]
    fn test_settled_shards_are_left_alone() {
        let done = shard(ShardPhase::Done);
        let ok = ShardResult::success(&done, json!(1), Duration::from_millis(3));
        assert_eq!(reconcile(&done, Some(&ok)).unwrap(), None);
        assert_eq!(reconcile(&shard(ShardPhase::Pending), None).unwrap(), None);
        assert_eq!(reconcile(&shard(ShardPhase::Failed), None).unwrap(), None);
    }

    #[test]
    fn test_done_without_output_is_redone() {
        assert_eq!(
            reconcile(&shard(ShardPhase::Done), None).unwrap(),
            Some(ShardPhase::Pending)
        );
    }
}
