//! The orchestrator facade
//!
//! `HxoCore` validates and accepts plans, partitions them, and hands each one
//! to its own `PlanRunner` task. Reads always go to the checkpoint store, so
//! status reflects the last durably committed state rather than anything
//! in flight.

use chrono::Utc;
use hxo_core::fail_open::retry_with_backoff;
use hxo_core::merkle::{self, MerkleLeaf, MerkleTree};
use hxo_core::{
    EventTopic, HxoConfig, HxoError, HxoPlan, PartitionerKind, PlanRequest, PlanStatus,
    PlanStatusReport, Result, ShardCounters, ShardPhase, ShardSpec, StageStatus,
};
use hxo_storage::Checkpointer;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::autotune::AutosplitPolicy;
use crate::executor::ExecutorRegistry;
use crate::notifier::{EventSink, Notifier, DEFAULT_EVENT_BUFFER};
use crate::partitioner::{PartitionContext, PartitionerRegistry};
use crate::report::{PlanReport, ShardProof};
use crate::runner::{is_fatal_store_error, PlanCommand, PlanRunner, RunnerEnv};
use crate::state_machine::{plan_transition, shard_transition, PlanEvent, ShardEvent};

const STORE_BACKOFF: Duration = Duration::from_millis(50);

/// Upper bound on `constraints.max_shards`; shards are held in memory per plan
pub const MAX_SHARDS_CEILING: usize = 10_000_000;

/// Handle to a plan whose runner task is alive
struct LivePlan {
    commands: mpsc::Sender<PlanCommand>,
    status: watch::Receiver<PlanStatus>,
    task: JoinHandle<()>,
}

struct CoreInner {
    env: Arc<RunnerEnv>,
    live: Mutex<HashMap<String, LivePlan>>,
    /// Cleared when the checkpoint store fails persistently
    accepting: AtomicBool,
}

/// Plan orchestrator. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct HxoCore {
    inner: Arc<CoreInner>,
}

pub struct HxoCoreBuilder {
    config: HxoConfig,
    checkpointer: Arc<dyn Checkpointer>,
    executors: Option<ExecutorRegistry>,
    partitioners: PartitionerRegistry,
    notifier: Option<Arc<dyn Notifier>>,
    event_buffer: usize,
}

impl HxoCoreBuilder {
    /// Defaults to the built-in `echo` and `command` executors
    pub fn executors(mut self, executors: ExecutorRegistry) -> Self {
        self.executors = Some(executors);
        self
    }

    pub fn partitioners(mut self, partitioners: PartitionerRegistry) -> Self {
        self.partitioners = partitioners;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    /// Must be called inside a Tokio runtime when a notifier is set
    pub fn build(self) -> HxoCore {
        let events = match self.notifier {
            Some(notifier) => EventSink::spawn(notifier, self.event_buffer),
            None => EventSink::disabled(),
        };
        let env = RunnerEnv {
            checkpointer: self.checkpointer,
            executors: self
                .executors
                .unwrap_or_else(|| ExecutorRegistry::with_builtins().build()),
            partitioners: self.partitioners,
            permits: Arc::new(Semaphore::new(self.config.max_concurrency.max(1))),
            autosplit: AutosplitPolicy::new(self.config.autosplit.clone()),
            config: self.config,
            events,
        };
        HxoCore {
            inner: Arc::new(CoreInner {
                env: Arc::new(env),
                live: Mutex::new(HashMap::new()),
                accepting: AtomicBool::new(true),
            }),
        }
    }
}

impl HxoCore {
    pub fn builder(config: HxoConfig, checkpointer: Arc<dyn Checkpointer>) -> HxoCoreBuilder {
        HxoCoreBuilder {
            config,
            checkpointer,
            executors: None,
            partitioners: PartitionerRegistry::default(),
            notifier: None,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    pub fn config(&self) -> &HxoConfig {
        &self.inner.env.config
    }

    pub fn checkpointer(&self) -> Arc<dyn Checkpointer> {
        self.inner.env.checkpointer.clone()
    }

    /// False once the checkpoint store has failed persistently
    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    pub async fn is_live(&self, plan_id: &str) -> bool {
        self.inner.live.lock().await.contains_key(plan_id)
    }

    /// Ids of plans with a running control loop
    pub async fn live_plans(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.live.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Reject malformed submissions before anything is persisted
    pub fn validate(&self, request: &PlanRequest) -> Result<()> {
        let env = &self.inner.env;
        if request.name.trim().is_empty() {
            return Err(HxoError::Validation("plan name must not be empty".into()));
        }
        if request.constraints.max_shards == 0 {
            return Err(HxoError::Validation("max_shards must be positive".into()));
        }
        if request.constraints.max_shards > MAX_SHARDS_CEILING {
            return Err(HxoError::Validation(format!(
                "max_shards must not exceed {}",
                MAX_SHARDS_CEILING
            )));
        }
        if request.constraints.timebox_ms == Some(0) {
            return Err(HxoError::Validation("timebox_ms must be positive".into()));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for stage in &request.stages {
            if stage.id.trim().is_empty() {
                return Err(HxoError::Validation("stage id must not be empty".into()));
            }
            if stage.kind.trim().is_empty() {
                return Err(HxoError::Validation(format!(
                    "stage {} has an empty kind",
                    stage.id
                )));
            }
            if stage.slo_ms == Some(0) {
                return Err(HxoError::Validation(format!(
                    "stage {} has a zero slo_ms",
                    stage.id
                )));
            }
            for dep in &stage.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(HxoError::Validation(format!(
                        "stage {} depends on {}, which is not an earlier stage",
                        stage.id, dep
                    )));
                }
            }
            if !seen.insert(stage.id.as_str()) {
                return Err(HxoError::Validation(format!(
                    "duplicate stage id: {}",
                    stage.id
                )));
            }
            if !env.partitioners.supports(&stage.partitioner) {
                return Err(HxoError::Validation(format!(
                    "stage {} uses unknown partitioner {}",
                    stage.id, stage.partitioner
                )));
            }
            let executor = env.executors.get(stage.executor_kind()).ok_or_else(|| {
                HxoError::Validation(format!(
                    "stage {} uses unknown executor {}",
                    stage.id,
                    stage.executor_kind()
                ))
            })?;
            if !executor.idempotent() && !stage.safety.allow_non_idempotent {
                return Err(HxoError::Validation(format!(
                    "executor {} is not idempotent; stage {} must set safety.allow_non_idempotent",
                    executor.kind(),
                    stage.id
                )));
            }
        }
        Ok(())
    }

    /// Validate, persist, partition and start a plan
    #[instrument(skip_all, fields(name = %request.name))]
    pub async fn submit(&self, request: PlanRequest) -> Result<PlanStatusReport> {
        self.ensure_accepting()?;
        self.validate(&request)?;
        self.start_new(HxoPlan::from_request(request)).await
    }

    fn ensure_accepting(&self) -> Result<()> {
        if !self.inner.env.config.enabled {
            return Err(HxoError::Disabled);
        }
        if !self.is_accepting() {
            return Err(HxoError::Unavailable(
                "checkpoint store failed; not accepting plans".into(),
            ));
        }
        Ok(())
    }

    async fn start_new(&self, mut plan: HxoPlan) -> Result<PlanStatusReport> {
        self.persist_plan(&plan).await?;

        plan.status = plan_transition(plan.status, PlanEvent::StartPartitioning)?;
        plan.touch();
        self.persist_plan(&plan).await?;

        let shards = partition_plan(&self.inner.env, &mut plan);
        self.persist_shards(&shards).await?;

        plan.status = plan_transition(plan.status, PlanEvent::Partitioned)?;
        plan.started_at = Some(Utc::now());
        plan.touch();
        self.persist_plan(&plan).await?;

        info!(
            plan_id = %plan.id,
            name = %plan.name,
            stages = plan.stages.len(),
            shards = shards.len(),
            "plan submitted"
        );
        self.announce(&plan, &shards);

        let report = PlanStatusReport::from_plan(&plan);
        self.start_runner(plan, shards, BTreeMap::new()).await;
        Ok(report)
    }

    /// Publish plan.created and one shard.created per stage
    fn announce(&self, plan: &HxoPlan, shards: &[ShardSpec]) {
        let env = &self.inner.env;
        env.emit(
            EventTopic::PlanCreated,
            &plan.id,
            json!({
                "name": plan.name,
                "stages": plan.stages.len(),
                "total_shards": shards.len(),
                "replay_of": plan.replay_of,
            }),
        );
        for stage in &plan.stages {
            let ids: Vec<&str> = shards
                .iter()
                .filter(|s| s.stage_id == stage.id)
                .map(|s| s.shard_id.as_str())
                .collect();
            env.emit(
                EventTopic::ShardCreated,
                &plan.id,
                json!({ "stage_id": stage.id, "count": ids.len(), "shard_ids": ids }),
            );
        }
    }

    pub(crate) async fn start_runner(
        &self,
        plan: HxoPlan,
        shards: Vec<ShardSpec>,
        leaves: BTreeMap<String, String>,
    ) {
        let plan_id = plan.id.clone();
        let (commands, command_rx) = mpsc::channel(8);
        let (status_tx, status) = watch::channel(plan.status);
        let runner = PlanRunner::new(self.inner.env.clone(), plan, shards, leaves, status_tx);

        // Hold the lock across spawn so a fast runner cannot deregister
        // before it is registered
        let mut live = self.inner.live.lock().await;
        let core = self.clone();
        let id = plan_id.clone();
        let task = tokio::spawn(async move {
            let result = runner.run(command_rx).await;
            core.runner_exited(&id, result).await;
        });
        live.insert(
            plan_id,
            LivePlan {
                commands,
                status,
                task,
            },
        );
    }

    async fn runner_exited(&self, plan_id: &str, result: Result<()>) {
        self.inner.live.lock().await.remove(plan_id);
        match result {
            Ok(()) => debug!(plan_id, "plan runner exited"),
            Err(e) if is_fatal_store_error(&e) => {
                self.inner.accepting.store(false, Ordering::SeqCst);
                error!(
                    plan_id,
                    "checkpoint store failed, halting plan and rejecting new submissions: {}", e
                );
            }
            Err(e) => error!(plan_id, "plan runner failed: {}", e),
        }
    }

    /// Current committed status
    pub async fn status(&self, plan_id: &str) -> Result<PlanStatusReport> {
        Ok(PlanStatusReport::from_plan(&self.load_plan(plan_id).await?))
    }

    pub async fn list_plans(&self) -> Result<Vec<PlanStatusReport>> {
        Ok(self
            .inner
            .env
            .checkpointer
            .list_plans()
            .await?
            .iter()
            .map(PlanStatusReport::from_plan)
            .collect())
    }

    /// Wait up to `timeout` for a live plan to reach a terminal status
    pub async fn wait(&self, plan_id: &str, timeout: Duration) -> Result<PlanStatusReport> {
        let status = self
            .inner
            .live
            .lock()
            .await
            .get(plan_id)
            .map(|live| live.status.clone());
        if let Some(mut status) = status {
            let _ = tokio::time::timeout(timeout, status.wait_for(|s| s.is_terminal())).await;
        }
        self.status(plan_id).await
    }

    /// Abort a plan. A terminal plan is returned unchanged.
    #[instrument(skip(self))]
    pub async fn abort(&self, plan_id: &str) -> Result<PlanStatusReport> {
        let commands = self
            .inner
            .live
            .lock()
            .await
            .get(plan_id)
            .map(|live| live.commands.clone());

        if let Some(commands) = commands {
            let (reply, response) = oneshot::channel();
            let command = PlanCommand::Abort {
                reason: "aborted by request".to_string(),
                reply,
            };
            if commands.send(command).await.is_ok() {
                if let Ok(plan) = response.await {
                    return Ok(PlanStatusReport::from_plan(&plan));
                }
            }
            // The runner finished before it saw the command
        }

        let plan = self.load_plan(plan_id).await?;
        if plan.status.is_terminal() {
            return Ok(PlanStatusReport::from_plan(&plan));
        }
        self.abort_stored(plan).await
    }

    /// Abort a non-terminal plan that has no runner, directly on stored state
    async fn abort_stored(&self, mut plan: HxoPlan) -> Result<PlanStatusReport> {
        let checkpointer = self.inner.env.checkpointer.as_ref();
        let mut shards = checkpointer.list_shards(&plan.id).await?;
        for shard in shards.iter_mut().filter(|s| !s.phase.is_terminal()) {
            let phase = shard_transition(shard.phase, ShardEvent::Abort)?;
            shard.set_phase(phase);
            shard.last_error = Some("aborted by request".to_string());
            self.persist_shard(shard).await?;
        }

        plan.counters = ShardCounters::from_phases(shards.iter().map(|s| &s.phase));
        plan.status = plan_transition(plan.status, PlanEvent::Abort)?;
        plan.failure_reason = Some("aborted by request".to_string());
        plan.finished_at = Some(Utc::now());
        plan.touch();
        self.persist_plan(&plan).await?;

        info!(plan_id = %plan.id, "aborted plan without a live runner");
        self.inner.env.emit(
            EventTopic::Audit,
            &plan.id,
            json!({ "action": "abort", "reason": "aborted by request" }),
        );
        Ok(PlanStatusReport::from_plan(&plan))
    }

    /// Start a new plan from the inputs of a terminal plan's failed shards
    #[instrument(skip(self))]
    pub async fn replay(&self, plan_id: &str) -> Result<PlanStatusReport> {
        self.ensure_accepting()?;
        let source = self.load_plan(plan_id).await?;
        if !source.status.is_terminal() {
            return Err(HxoError::Validation(format!(
                "plan {} is still {}",
                plan_id, source.status
            )));
        }

        let shards = self.inner.env.checkpointer.list_shards(plan_id).await?;
        let failed: Vec<&ShardSpec> = shards
            .iter()
            .filter(|s| s.phase == ShardPhase::Failed)
            .collect();
        if failed.is_empty() {
            return Err(HxoError::Validation(format!(
                "plan {} has no failed shards to replay",
                plan_id
            )));
        }

        let mut request = PlanRequest::new(format!("{}-replay", source.name));
        request.constraints = source.constraints.clone();
        request.submitted_by = source.submitted_by.clone();
        for stage in &source.stages {
            let slices: Vec<Value> = failed
                .iter()
                .filter(|s| s.stage_id == stage.id)
                .map(|s| s.payload.clone())
                .collect();
            if slices.is_empty() {
                continue;
            }

            // Keep the rest of the stage input so executors still see it
            let mut input = match &stage.input {
                Value::Object(obj) => obj.clone(),
                _ => Map::new(),
            };
            input.insert("slices".to_string(), Value::Array(slices));

            let mut replayed = stage.clone();
            replayed.partitioner = PartitionerKind::Explicit;
            replayed.input = Value::Object(input);
            let included: HashSet<&str> = request.stages.iter().map(|s| s.id.as_str()).collect();
            replayed.depends_on.retain(|d| included.contains(d.as_str()));
            request.stages.push(replayed);
        }

        self.validate(&request)?;
        let mut plan = HxoPlan::from_request(request);
        plan.replay_of = Some(source.id.clone());
        info!(
            plan_id = %plan.id,
            replay_of = %source.id,
            shards = failed.len(),
            "replaying failed shards"
        );
        self.inner.env.emit(
            EventTopic::Audit,
            &source.id,
            json!({ "action": "replay", "replay_plan_id": plan.id }),
        );
        self.start_new(plan).await
    }

    /// Status plus per-stage breakdown; certified plans carry sampled proofs
    pub async fn report(&self, plan_id: &str) -> Result<PlanReport> {
        let plan = self.load_plan(plan_id).await?;
        let shards = self.inner.env.checkpointer.list_shards(plan_id).await?;
        let mut report = PlanReport::build(&plan, &shards);
        if let Some((root, tree)) = self.certified_tree(&plan).await? {
            report.sample_proofs = tree
                .sample_proofs(self.inner.env.config.certify_sample_size)
                .into_iter()
                .map(|(leaf, proof)| ShardProof {
                    plan_id: plan.id.clone(),
                    verified: merkle::verify(&root, &leaf, &proof),
                    merkle_root: root.clone(),
                    leaf,
                    proof,
                })
                .collect();
        }
        Ok(report)
    }

    /// Inclusion proof for one shard of a certified plan
    pub async fn proof(&self, plan_id: &str, shard_id: &str) -> Result<ShardProof> {
        let plan = self.load_plan(plan_id).await?;
        let (root, tree) = self.certified_tree(&plan).await?.ok_or_else(|| {
            HxoError::Validation(format!("plan {} is not certified", plan_id))
        })?;

        let index = tree.index_of(shard_id).ok_or_else(|| {
            HxoError::Validation(format!("shard {} is not part of plan {}", shard_id, plan_id))
        })?;
        let proof = tree
            .prove(index)
            .ok_or_else(|| HxoError::Certification(format!("no proof for leaf {}", index)))?;
        let leaf = tree.leaves()[index].clone();
        let verified = merkle::verify(&root, &leaf, &proof);
        Ok(ShardProof {
            plan_id: plan_id.to_string(),
            merkle_root: root,
            leaf,
            proof,
            verified,
        })
    }

    /// Rebuild a certified plan's tree from its stored results. `None` when
    /// the plan has no root yet.
    async fn certified_tree(&self, plan: &HxoPlan) -> Result<Option<(String, MerkleTree)>> {
        let root = match (&plan.merkle_root, plan.status) {
            (Some(root), PlanStatus::Done) => root.clone(),
            _ => return Ok(None),
        };

        let checkpointer = self.inner.env.checkpointer.as_ref();
        let done: HashSet<String> = checkpointer
            .list_shards(&plan.id)
            .await?
            .into_iter()
            .filter(|s| s.phase == ShardPhase::Done)
            .map(|s| s.shard_id)
            .collect();
        let leaves = checkpointer
            .list_results(&plan.id)
            .await?
            .into_iter()
            .filter(|r| r.success && done.contains(&r.shard_id))
            .map(|r| MerkleLeaf::new(r.shard_id, r.output_hash));
        let (rebuilt, tree) = MerkleTree::build(leaves);
        if rebuilt != root {
            return Err(HxoError::Certification(format!(
                "stored results of plan {} no longer match its root",
                plan.id
            )));
        }
        Ok(Some((root, tree)))
    }

    /// Stop every runner without touching stored state and refuse new work.
    /// Stored plans stay resumable.
    pub async fn halt(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        let drained: Vec<(String, LivePlan)> = self.inner.live.lock().await.drain().collect();
        for (plan_id, live) in drained {
            live.task.abort();
            let _ = live.task.await;
            debug!(plan_id = %plan_id, "runner halted");
        }
    }

    pub(crate) fn env(&self) -> &RunnerEnv {
        &self.inner.env
    }

    pub(crate) async fn load_plan(&self, plan_id: &str) -> Result<HxoPlan> {
        self.inner
            .env
            .checkpointer
            .load_plan(plan_id)
            .await?
            .ok_or_else(|| HxoError::PlanNotFound(plan_id.to_string()))
    }

    /// Write with retries; a persistent failure stops new submissions
    async fn guard<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if is_fatal_store_error(e) {
                self.inner.accepting.store(false, Ordering::SeqCst);
                error!("checkpoint store failed, rejecting new submissions: {}", e);
            }
        }
        result
    }

    pub(crate) async fn persist_plan(&self, plan: &HxoPlan) -> Result<()> {
        let env = &self.inner.env;
        let checkpointer = env.checkpointer.as_ref();
        let result = retry_with_backoff(
            "save_plan",
            || checkpointer.save_plan(plan),
            env.config.checkpoint_retries,
            STORE_BACKOFF,
        )
        .await;
        self.guard(result).await
    }

    pub(crate) async fn persist_shard(&self, shard: &ShardSpec) -> Result<()> {
        let env = &self.inner.env;
        let checkpointer = env.checkpointer.as_ref();
        let result = retry_with_backoff(
            "save_shard",
            || checkpointer.save_shard(shard),
            env.config.checkpoint_retries,
            STORE_BACKOFF,
        )
        .await;
        self.guard(result).await
    }

    pub(crate) async fn persist_shards(&self, shards: &[ShardSpec]) -> Result<()> {
        let env = &self.inner.env;
        let checkpointer = env.checkpointer.as_ref();
        let result = retry_with_backoff(
            "save_shards",
            || checkpointer.save_shards(shards),
            env.config.checkpoint_retries,
            STORE_BACKOFF,
        )
        .await;
        self.guard(result).await
    }
}

/// Explode every stage into shards, collapsing identical work across stages
///
/// The first stage to produce a shard id owns it; later stages are recorded
/// as aliases. A stage whose partitioner fails is marked failed and produces
/// nothing.
pub(crate) fn partition_plan(env: &RunnerEnv, plan: &mut HxoPlan) -> Vec<ShardSpec> {
    let mut shards: Vec<ShardSpec> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    let max_shards = plan.constraints.max_shards;

    for stage in plan.stages.clone() {
        let ctx = PartitionContext::new(
            &plan.id,
            max_shards.saturating_sub(shards.len()),
            env.config.shard_timeout_ms,
        );
        match env.partitioners.partition(&stage, &ctx) {
            Ok(stage_shards) => {
                for mut shard in stage_shards {
                    match positions.get(&shard.shard_id) {
                        Some(&pos) => {
                            let owner = &mut shards[pos];
                            if owner.stage_id != stage.id && !owner.aliases.contains(&stage.id) {
                                owner.aliases.push(stage.id.clone());
                            }
                        }
                        None => {
                            shard.seq = shards.len() as u64;
                            positions.insert(shard.shard_id.clone(), shards.len());
                            shards.push(shard);
                        }
                    }
                }
            }
            Err(e) => {
                warn!(plan_id = %plan.id, stage_id = %stage.id, "partition failed: {}", e);
                if let Some(state) = plan.stage_state_mut(&stage.id) {
                    state.status = StageStatus::Failed;
                    state.error = Some(e.to_string());
                }
            }
        }
    }

    plan.counters = ShardCounters {
        pending: shards.len(),
        ..ShardCounters::default()
    };
    shards
}
