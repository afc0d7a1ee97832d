//! Plan, stage and shard models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::hashing::{content_hash, sha256_hex, shard_id};

/// Default shard budget per plan
pub const DEFAULT_MAX_SHARDS: usize = 1_000_000;

/// Plan lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Submitted,
    Partitioning,
    Running,
    Certifying,
    Done,
    Failed,
    Aborted,
}

impl PlanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Partitioning => "partitioning",
            Self::Running => "running",
            Self::Certifying => "certifying",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "submitted" => Ok(Self::Submitted),
            "partitioning" => Ok(Self::Partitioning),
            "running" => Ok(Self::Running),
            "certifying" => Ok(Self::Certifying),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "aborted" => Ok(Self::Aborted),
            _ => Err(format!("Unknown plan status: {}", s)),
        }
    }
}

/// Shard lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardPhase {
    Pending,
    Claimed,
    Running,
    Done,
    Failed,
}

impl ShardPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ShardPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShardPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown shard phase: {}", s)),
        }
    }
}

/// How a stage is exploded into shards
///
/// Anything that is not a built-in name is looked up among the custom
/// partitioners registered at startup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PartitionerKind {
    #[default]
    ByCount,
    ByModule,
    ByFile,
    Explicit,
    Custom(String),
}

impl PartitionerKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::ByCount => "by_count",
            Self::ByModule => "by_module",
            Self::ByFile => "by_file",
            Self::Explicit => "explicit",
            Self::Custom(name) => name,
        }
    }
}

impl From<String> for PartitionerKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "by_count" => Self::ByCount,
            "by_module" => Self::ByModule,
            "by_file" | "by_filesize" => Self::ByFile,
            "explicit" => Self::Explicit,
            _ => Self::Custom(s),
        }
    }
}

impl From<PartitionerKind> for String {
    fn from(kind: PartitionerKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for PartitionerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch policy for a stage's shards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    #[default]
    FairRoundRobin,
    /// Caps the stage at half the global concurrency
    BackpressureAware,
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FairRoundRobin => write!(f, "fair_round_robin"),
            Self::BackpressureAware => write!(f, "backpressure_aware"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StageSafety {
    #[serde(default)]
    pub allow_non_idempotent: bool,
    #[serde(default)]
    pub require_dry_run: bool,
}

/// One phase of a plan. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HxoStage {
    pub id: String,
    /// Opaque job kind, e.g. `deploy.pack`
    pub kind: String,
    #[serde(default)]
    pub slo_ms: Option<u64>,
    #[serde(default)]
    pub partitioner: PartitionerKind,
    /// Executor kind; defaults to the job kind
    #[serde(default)]
    pub executor: Option<String>,
    #[serde(default)]
    pub scheduler: SchedulerKind,
    #[serde(default)]
    pub safety: StageSafety,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Raw input spec handed to the partitioner
    #[serde(default, alias = "config")]
    pub input: Value,
}

impl HxoStage {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            slo_ms: None,
            partitioner: PartitionerKind::default(),
            executor: None,
            scheduler: SchedulerKind::default(),
            safety: StageSafety::default(),
            depends_on: Vec::new(),
            input: Value::Null,
        }
    }

    pub fn with_partitioner(mut self, partitioner: PartitionerKind) -> Self {
        self.partitioner = partitioner;
        self
    }

    pub fn with_executor(mut self, executor: impl Into<String>) -> Self {
        self.executor = Some(executor.into());
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_slo_ms(mut self, slo_ms: u64) -> Self {
        self.slo_ms = Some(slo_ms);
        self
    }

    /// Hold this stage until `stage_id` is fully done
    pub fn after(mut self, stage_id: impl Into<String>) -> Self {
        self.depends_on.push(stage_id.into());
        self
    }

    pub fn executor_kind(&self) -> &str {
        self.executor.as_deref().unwrap_or(&self.kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanConstraints {
    #[serde(default = "default_max_shards")]
    pub max_shards: usize,
    /// Wall-clock budget for the whole plan
    #[serde(default)]
    pub timebox_ms: Option<u64>,
}

impl Default for PlanConstraints {
    fn default() -> Self {
        Self {
            max_shards: DEFAULT_MAX_SHARDS,
            timebox_ms: None,
        }
    }
}

fn default_max_shards() -> usize {
    DEFAULT_MAX_SHARDS
}

/// Submission body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRequest {
    pub name: String,
    #[serde(default)]
    pub stages: Vec<HxoStage>,
    #[serde(default)]
    pub constraints: PlanConstraints,
    #[serde(default)]
    pub submitted_by: Option<String>,
}

impl PlanRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            constraints: PlanConstraints::default(),
            submitted_by: None,
        }
    }

    pub fn with_stage(mut self, stage: HxoStage) -> Self {
        self.stages.push(stage);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Waiting on dependency stages
    Pending,
    Active,
    Done,
    Failed,
}

/// Mutable per-stage bookkeeping kept on the plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageState {
    pub stage_id: String,
    pub status: StageStatus,
    #[serde(default)]
    pub error: Option<String>,
    /// Number of autosplits applied
    #[serde(default)]
    pub generation: u32,
}

/// Shard counts by phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardCounters {
    pub pending: usize,
    pub claimed: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
}

impl ShardCounters {
    pub fn from_phases<'a>(phases: impl IntoIterator<Item = &'a ShardPhase>) -> Self {
        let mut counters = Self::default();
        for phase in phases {
            *counters.slot(*phase) += 1;
        }
        counters
    }

    pub fn total(&self) -> usize {
        self.pending + self.claimed + self.running + self.done + self.failed
    }

    /// Shards not yet DONE or FAILED
    pub fn unresolved(&self) -> usize {
        self.pending + self.claimed + self.running
    }

    pub fn get(&self, phase: ShardPhase) -> usize {
        match phase {
            ShardPhase::Pending => self.pending,
            ShardPhase::Claimed => self.claimed,
            ShardPhase::Running => self.running,
            ShardPhase::Done => self.done,
            ShardPhase::Failed => self.failed,
        }
    }

    pub fn add(&mut self, phase: ShardPhase) {
        *self.slot(phase) += 1;
    }

    pub fn remove(&mut self, phase: ShardPhase) {
        let slot = self.slot(phase);
        *slot = slot.saturating_sub(1);
    }

    /// Move one shard between phases; the total is unchanged
    pub fn shift(&mut self, from: ShardPhase, to: ShardPhase) {
        self.remove(from);
        self.add(to);
    }

    fn slot(&mut self, phase: ShardPhase) -> &mut usize {
        match phase {
            ShardPhase::Pending => &mut self.pending,
            ShardPhase::Claimed => &mut self.claimed,
            ShardPhase::Running => &mut self.running,
            ShardPhase::Done => &mut self.done,
            ShardPhase::Failed => &mut self.failed,
        }
    }
}

/// A submitted unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HxoPlan {
    pub id: String,
    pub name: String,
    pub stages: Vec<HxoStage>,
    #[serde(default)]
    pub constraints: PlanConstraints,
    pub status: PlanStatus,
    #[serde(default)]
    pub counters: ShardCounters,
    #[serde(default)]
    pub stage_states: Vec<StageState>,
    #[serde(default)]
    pub merkle_root: Option<String>,
    #[serde(default)]
    pub truth_certified: bool,
    #[serde(default)]
    pub submitted_by: Option<String>,
    #[serde(default)]
    pub replay_of: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl HxoPlan {
    /// Create a plan in SUBMITTED with a fresh id
    pub fn from_request(request: PlanRequest) -> Self {
        let now = Utc::now();
        let stage_states = request
            .stages
            .iter()
            .map(|s| StageState {
                stage_id: s.id.clone(),
                status: StageStatus::Pending,
                error: None,
                generation: 0,
            })
            .collect();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: request.name,
            stages: request.stages,
            constraints: request.constraints,
            status: PlanStatus::Submitted,
            counters: ShardCounters::default(),
            stage_states,
            merkle_root: None,
            truth_certified: false,
            submitted_by: request.submitted_by,
            replay_of: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn total_shards(&self) -> usize {
        self.counters.total()
    }

    pub fn stage(&self, stage_id: &str) -> Option<&HxoStage> {
        self.stages.iter().find(|s| s.id == stage_id)
    }

    pub fn stage_state(&self, stage_id: &str) -> Option<&StageState> {
        self.stage_states.iter().find(|s| s.stage_id == stage_id)
    }

    pub fn stage_state_mut(&mut self, stage_id: &str) -> Option<&mut StageState> {
        self.stage_states.iter_mut().find(|s| s.stage_id == stage_id)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// The smallest independently executable unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardSpec {
    pub shard_id: String,
    pub plan_id: String,
    /// Stage that first produced this shard
    pub stage_id: String,
    /// Other stages whose partition collapsed onto the same id
    #[serde(default)]
    pub aliases: Vec<String>,
    pub kind: String,
    pub executor: String,
    pub partition_index: u64,
    /// Autosplit generation that produced the shard
    #[serde(default)]
    pub generation: u32,
    /// Creation order within the plan; lower is older
    #[serde(default)]
    pub seq: u64,
    pub input_hash: String,
    pub payload: Value,
    pub phase: ShardPhase,
    #[serde(default)]
    pub attempts: u32,
    pub timeout_ms: u64,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ShardSpec {
    /// Content-addressed shard for one slice of a stage's input
    pub fn new(
        plan_id: &str,
        stage: &HxoStage,
        partition_index: u64,
        payload: Value,
        fallback_timeout_ms: u64,
    ) -> Self {
        let input_hash = content_hash(&payload);
        let executor = stage.executor_kind().to_string();
        let now = Utc::now();
        Self {
            shard_id: shard_id(&stage.kind, &executor, &input_hash),
            plan_id: plan_id.to_string(),
            stage_id: stage.id.clone(),
            aliases: Vec::new(),
            kind: stage.kind.clone(),
            executor,
            partition_index,
            generation: 0,
            seq: 0,
            input_hash,
            payload,
            phase: ShardPhase::Pending,
            attempts: 0,
            timeout_ms: stage.slo_ms.unwrap_or(fallback_timeout_ms),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Whether this shard counts toward `stage_id`
    pub fn belongs_to(&self, stage_id: &str) -> bool {
        self.stage_id == stage_id || self.aliases.iter().any(|a| a == stage_id)
    }

    pub fn stages(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.stage_id.as_str()).chain(self.aliases.iter().map(String::as_str))
    }

    pub fn set_phase(&mut self, phase: ShardPhase) {
        self.phase = phase;
        self.updated_at = Utc::now();
    }
}

/// Outcome of one shard. Written once, immutable thereafter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardResult {
    pub shard_id: String,
    pub plan_id: String,
    pub stage_id: String,
    pub success: bool,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub duration_ms: u64,
    /// Merkle leaf content for successful shards
    pub output_hash: String,
    pub attempts: u32,
    pub finished_at: DateTime<Utc>,
}

impl ShardResult {
    pub fn success(shard: &ShardSpec, output: Value, duration: Duration) -> Self {
        Self {
            shard_id: shard.shard_id.clone(),
            plan_id: shard.plan_id.clone(),
            stage_id: shard.stage_id.clone(),
            success: true,
            output_hash: content_hash(&output),
            output: Some(output),
            error: None,
            duration_ms: duration.as_millis() as u64,
            attempts: shard.attempts,
            finished_at: Utc::now(),
        }
    }

    pub fn failure(shard: &ShardSpec, error: String, duration: Duration) -> Self {
        Self {
            shard_id: shard.shard_id.clone(),
            plan_id: shard.plan_id.clone(),
            stage_id: shard.stage_id.clone(),
            success: false,
            output: None,
            output_hash: sha256_hex(error.as_bytes()),
            error: Some(error),
            duration_ms: duration.as_millis() as u64,
            attempts: shard.attempts,
            finished_at: Utc::now(),
        }
    }
}

/// Snapshot served by the status endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStatusReport {
    pub plan_id: String,
    pub plan_name: String,
    pub status: PlanStatus,
    pub total_shards: usize,
    pub pending_shards: usize,
    pub claimed_shards: usize,
    pub running_shards: usize,
    pub done_shards: usize,
    pub failed_shards: usize,
    pub merkle_root: Option<String>,
    pub truth_certified: bool,
    pub eta_seconds: Option<f64>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub replay_of: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl PlanStatusReport {
    pub fn from_plan(plan: &HxoPlan) -> Self {
        let c = plan.counters;
        Self {
            plan_id: plan.id.clone(),
            plan_name: plan.name.clone(),
            status: plan.status,
            total_shards: c.total(),
            pending_shards: c.pending,
            claimed_shards: c.claimed,
            running_shards: c.running,
            done_shards: c.done,
            failed_shards: c.failed,
            merkle_root: plan.merkle_root.clone(),
            truth_certified: plan.truth_certified,
            eta_seconds: eta_seconds(plan, Utc::now()),
            failure_reason: plan.failure_reason.clone(),
            replay_of: plan.replay_of.clone(),
            created_at: plan.created_at,
            finished_at: plan.finished_at,
        }
    }
}

/// Linear extrapolation from the resolved-shard rate so far
fn eta_seconds(plan: &HxoPlan, now: DateTime<Utc>) -> Option<f64> {
    if plan.status.is_terminal() {
        return Some(0.0);
    }
    let started = plan.started_at?;
    let resolved = plan.counters.done + plan.counters.failed;
    if resolved == 0 {
        return None;
    }
    let elapsed = (now - started).num_milliseconds().max(0) as f64 / 1000.0;
    let per_shard = elapsed / resolved as f64;
    Some(per_shard * plan.counters.unresolved() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partitioner_kind_wire_names() {
        let kinds: Vec<PartitionerKind> =
            serde_json::from_value(json!(["by_count", "by_module", "by_file", "explicit", "by_dag_depth"]))
                .unwrap();
        assert_eq!(
            kinds,
            vec![
                PartitionerKind::ByCount,
                PartitionerKind::ByModule,
                PartitionerKind::ByFile,
                PartitionerKind::Explicit,
                PartitionerKind::Custom("by_dag_depth".to_string()),
            ]
        );
        assert_eq!(serde_json::to_value(PartitionerKind::ByFile).unwrap(), json!("by_file"));
    }

    #[test]
    fn test_stage_defaults_from_minimal_json() {
        let stage: HxoStage =
            serde_json::from_value(json!({"id": "pack", "kind": "deploy.pack", "slo_ms": 120000}))
                .unwrap();
        assert_eq!(stage.partitioner, PartitionerKind::ByCount);
        assert_eq!(stage.executor_kind(), "deploy.pack");
        assert_eq!(stage.scheduler, SchedulerKind::FairRoundRobin);
        assert!(!stage.safety.allow_non_idempotent);
        assert_eq!(stage.slo_ms, Some(120_000));
    }

    #[test]
    fn test_request_constraints_default() {
        let req: PlanRequest = serde_json::from_value(json!({"name": "p", "stages": []})).unwrap();
        assert_eq!(req.constraints.max_shards, DEFAULT_MAX_SHARDS);
    }

    #[test]
    fn test_counters_conserve_total() {
        let mut c = ShardCounters::from_phases(&[ShardPhase::Pending; 4]);
        c.shift(ShardPhase::Pending, ShardPhase::Claimed);
        c.shift(ShardPhase::Claimed, ShardPhase::Running);
        c.shift(ShardPhase::Running, ShardPhase::Done);
        assert_eq!(c.total(), 4);
        assert_eq!(c.done, 1);
        assert_eq!(c.unresolved(), 3);
    }

    #[test]
    fn test_shard_timeout_prefers_slo() {
        let stage = HxoStage::new("s", "k").with_slo_ms(500);
        let shard = ShardSpec::new("plan", &stage, 0, json!({"i": 0}), 9_000);
        assert_eq!(shard.timeout(), Duration::from_millis(500));

        let stage = HxoStage::new("s", "k");
        let shard = ShardSpec::new("plan", &stage, 0, json!({"i": 0}), 9_000);
        assert_eq!(shard.timeout_ms, 9_000);
    }

    #[test]
    fn test_identical_slices_collapse_across_stages() {
        let a = HxoStage::new("a", "assets.index");
        let b = HxoStage::new("b", "assets.index");
        let x = ShardSpec::new("p", &a, 0, json!({"bucket": 1}), 1);
        let y = ShardSpec::new("p", &b, 4, json!({"bucket": 1}), 1);
        assert_eq!(x.shard_id, y.shard_id);
    }

    #[test]
    fn test_status_parse_roundtrip() {
        for s in ["submitted", "running", "certifying", "aborted"] {
            assert_eq!(s.parse::<PlanStatus>().unwrap().to_string(), s);
        }
        assert!("bogus".parse::<ShardPhase>().is_err());
    }

    #[test]
    fn test_eta_for_terminal_plan_is_zero() {
        let mut plan = HxoPlan::from_request(PlanRequest::new("p"));
        plan.status = PlanStatus::Done;
        assert_eq!(PlanStatusReport::from_plan(&plan).eta_seconds, Some(0.0));
    }
}
