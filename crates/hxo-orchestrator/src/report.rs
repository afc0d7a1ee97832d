//! Plan reports and inclusion proofs

use chrono::{DateTime, Utc};
use hxo_core::{
    HxoPlan, MerkleLeaf, MerkleProof, PlanStatusReport, ShardPhase, ShardSpec, StageStatus,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    /// The plan is still moving
    Interim,
    Final,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage_id: String,
    pub kind: String,
    pub status: StageStatus,
    #[serde(default)]
    pub error: Option<String>,
    pub generation: u32,
    pub total_shards: usize,
    pub done_shards: usize,
    pub failed_shards: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedShard {
    pub shard_id: String,
    pub stage_id: String,
    pub attempts: u32,
    #[serde(default)]
    pub error: Option<String>,
}

/// Per-stage breakdown of a plan plus every failed shard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanReport {
    pub report_type: ReportType,
    #[serde(flatten)]
    pub summary: PlanStatusReport,
    pub stages: Vec<StageReport>,
    pub failed: Vec<FailedShard>,
    /// Spot-check proofs, present once the plan is certified
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sample_proofs: Vec<ShardProof>,
    pub generated_at: DateTime<Utc>,
}

impl PlanReport {
    pub fn build(plan: &HxoPlan, shards: &[ShardSpec]) -> Self {
        let stages = plan
            .stages
            .iter()
            .map(|stage| {
                let state = plan.stage_state(&stage.id);
                let owned = shards.iter().filter(|s| s.belongs_to(&stage.id));
                let (mut total, mut done, mut failed) = (0, 0, 0);
                for shard in owned {
                    total += 1;
                    match shard.phase {
                        ShardPhase::Done => done += 1,
                        ShardPhase::Failed => failed += 1,
                        _ => {}
                    }
                }
                StageReport {
                    stage_id: stage.id.clone(),
                    kind: stage.kind.clone(),
                    status: state.map(|s| s.status).unwrap_or(StageStatus::Pending),
                    error: state.and_then(|s| s.error.clone()),
                    generation: state.map(|s| s.generation).unwrap_or(0),
                    total_shards: total,
                    done_shards: done,
                    failed_shards: failed,
                }
            })
            .collect();

        let failed = shards
            .iter()
            .filter(|s| s.phase == ShardPhase::Failed)
            .map(|s| FailedShard {
                shard_id: s.shard_id.clone(),
                stage_id: s.stage_id.clone(),
                attempts: s.attempts,
                error: s.last_error.clone(),
            })
            .collect();

        Self {
            report_type: if plan.status.is_terminal() {
                ReportType::Final
            } else {
                ReportType::Interim
            },
            summary: PlanStatusReport::from_plan(plan),
            stages,
            failed,
            sample_proofs: Vec::new(),
            generated_at: Utc::now(),
        }
    }
}

/// Inclusion proof for one shard of a certified plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardProof {
    pub plan_id: String,
    pub merkle_root: String,
    pub leaf: MerkleLeaf,
    pub proof: MerkleProof,
    pub verified: bool,
}
