//! Per-plan control loop
//!
//! One `PlanRunner` task owns a live plan. It is the only writer of that
//! plan's shard phases, so transitions never race. Shard executions run as
//! worker tasks; every outcome comes back through the loop, is checkpointed,
//! and only then counts.
//!
//! Loop order per iteration:
//! 1. Dispatch ready shards while global permits are free
//! 2. Finish the plan when nothing is unresolved
//! 3. Wait for a worker outcome, a retry timer, a permit, a command or the
//!    timebox

use chrono::Utc;
use hxo_core::fail_open::{exponential_backoff, retry_with_backoff};
use hxo_core::merkle::{self, MerkleLeaf, MerkleTree};
use hxo_core::{
    EventTopic, ExecutionFailure, HxoConfig, HxoError, HxoEvent, HxoPlan, HxoStage, PlanStatus,
    Result, ShardPhase, ShardResult, ShardSpec, StageStatus,
};
use hxo_storage::Checkpointer;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::autotune::{AutosplitPolicy, LatencyWindow};
use crate::executor::{run_attempt, ExecutorRegistry, ShardContext, ShardExecutor};
use crate::notifier::EventSink;
use crate::partitioner::PartitionerRegistry;
use crate::scheduler::FairScheduler;
use crate::state_machine::{plan_transition, shard_transition, PlanEvent, ShardEvent};

const CHECKPOINT_BACKOFF: Duration = Duration::from_millis(50);

/// Everything a runner borrows from the orchestrator
pub(crate) struct RunnerEnv {
    pub checkpointer: Arc<dyn Checkpointer>,
    pub executors: ExecutorRegistry,
    pub partitioners: PartitionerRegistry,
    pub config: HxoConfig,
    /// Global in-flight cap shared by every plan
    pub permits: Arc<Semaphore>,
    pub events: EventSink,
    pub autosplit: AutosplitPolicy,
}

impl RunnerEnv {
    pub fn emit(&self, topic: EventTopic, plan_id: &str, payload: Value) {
        self.events.emit(HxoEvent::new(topic, plan_id, payload));
    }
}

pub(crate) enum PlanCommand {
    Abort {
        reason: String,
        reply: oneshot::Sender<HxoPlan>,
    },
}

struct WorkerOutcome {
    shard_id: String,
    result: std::result::Result<Value, ExecutionFailure>,
    duration: Duration,
}

/// Aborts the wrapped task when dropped, so aborting a worker also stops the
/// executor call it is waiting on
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct StageProgress {
    total: usize,
    done: usize,
    failed: usize,
}

pub(crate) struct PlanRunner {
    env: Arc<RunnerEnv>,
    plan: HxoPlan,
    shards: HashMap<String, ShardSpec>,
    /// shard id -> output hash for every DONE shard
    leaves: BTreeMap<String, String>,
    progress: HashMap<String, StageProgress>,
    scheduler: FairScheduler,
    /// Pending shards of stages whose dependencies are not done yet
    held: BTreeMap<String, Vec<ShardSpec>>,
    windows: HashMap<String, LatencyWindow>,
    spare: Option<OwnedSemaphorePermit>,
    status_tx: watch::Sender<PlanStatus>,
    /// Flipped on abort; every worker watches it
    cancel: watch::Sender<bool>,
}

impl PlanRunner {
    /// `shards` must already be free of CLAIMED/RUNNING entries
    pub fn new(
        env: Arc<RunnerEnv>,
        plan: HxoPlan,
        shards: Vec<ShardSpec>,
        leaves: BTreeMap<String, String>,
        status_tx: watch::Sender<PlanStatus>,
    ) -> Self {
        let mut scheduler = FairScheduler::new();
        let mut progress: HashMap<String, StageProgress> = HashMap::new();
        for stage in &plan.stages {
            scheduler.configure_stage(&stage.id, stage.scheduler, env.config.max_concurrency);
            progress.insert(stage.id.clone(), StageProgress::default());
        }

        let mut held: BTreeMap<String, Vec<ShardSpec>> = BTreeMap::new();
        let mut map = HashMap::with_capacity(shards.len());
        for shard in shards {
            for stage_id in shard.stages() {
                let p = progress.entry(stage_id.to_string()).or_default();
                p.total += 1;
                match shard.phase {
                    ShardPhase::Done => p.done += 1,
                    ShardPhase::Failed => p.failed += 1,
                    _ => {}
                }
            }
            if shard.phase == ShardPhase::Pending {
                held.entry(shard.stage_id.clone())
                    .or_default()
                    .push(shard.clone());
            }
            map.insert(shard.shard_id.clone(), shard);
        }

        Self {
            env,
            plan,
            shards: map,
            leaves,
            progress,
            scheduler,
            held,
            windows: HashMap::new(),
            spare: None,
            status_tx,
            cancel: watch::channel(false).0,
        }
    }

    pub async fn run(mut self, mut commands: mpsc::Receiver<PlanCommand>) -> Result<()> {
        match self.plan.status {
            PlanStatus::Running => {}
            PlanStatus::Certifying => return self.certify().await,
            _ => return Ok(()),
        }

        let deadline = self.deadline();
        let mut workers: JoinSet<WorkerOutcome> = JoinSet::new();
        let mut timers: JoinSet<String> = JoinSet::new();
        let mut commands_open = true;

        self.refresh_stages().await?;
        info!(
            plan_id = %self.plan.id,
            shards = self.shards.len(),
            "plan running"
        );

        while !self.plan.status.is_terminal() {
            self.dispatch(&mut workers).await?;

            if workers.is_empty() && self.plan.counters.unresolved() == 0 {
                self.finish().await?;
                break;
            }
            if workers.is_empty() && timers.is_empty() && self.scheduler.is_empty() {
                error!(
                    plan_id = %self.plan.id,
                    unresolved = self.plan.counters.unresolved(),
                    "plan stalled with nothing in flight"
                );
                self.fail("scheduler stalled").await?;
                break;
            }

            let starved = self.spare.is_none() && self.scheduler.has_ready();
            let permits = self.env.permits.clone();

            tokio::select! {
                Some(joined) = workers.join_next(), if !workers.is_empty() => match joined {
                    Ok(outcome) => self.handle_outcome(outcome, &mut timers).await?,
                    Err(e) => warn!(plan_id = %self.plan.id, "shard worker lost: {}", e),
                },
                Some(fired) = timers.join_next(), if !timers.is_empty() => {
                    if let Ok(shard_id) = fired {
                        self.requeue(&shard_id);
                    }
                }
                permit = permits.acquire_owned(), if starved => {
                    if let Ok(permit) = permit {
                        self.spare = Some(permit);
                    }
                }
                command = commands.recv(), if commands_open => match command {
                    Some(PlanCommand::Abort { reason, reply }) => {
                        self.abort(&reason, &mut workers).await?;
                        let _ = reply.send(self.plan.clone());
                    }
                    None => commands_open = false,
                },
                _ = sleep_until(deadline) => {
                    warn!(plan_id = %self.plan.id, "timebox exceeded");
                    self.abort("timebox exceeded", &mut workers).await?;
                }
            }
        }
        Ok(())
    }

    fn deadline(&self) -> Option<Instant> {
        let budget = Duration::from_millis(self.plan.constraints.timebox_ms?);
        let started = self.plan.started_at.unwrap_or(self.plan.created_at);
        let elapsed = (Utc::now() - started).to_std().unwrap_or_default();
        Some(Instant::now() + budget.saturating_sub(elapsed))
    }

    async fn dispatch(&mut self, workers: &mut JoinSet<WorkerOutcome>) -> Result<()> {
        if self.plan.status != PlanStatus::Running || !self.scheduler.has_ready() {
            return Ok(());
        }

        let mut permits: Vec<OwnedSemaphorePermit> = self.spare.take().into_iter().collect();
        while permits.len() < self.scheduler.len() {
            match self.env.permits.clone().try_acquire_owned() {
                Ok(permit) => permits.push(permit),
                Err(_) => break,
            }
        }
        if permits.is_empty() {
            return Ok(());
        }

        // Unused permits drop back into the semaphore
        let batch = self.scheduler.next_batch(permits.len());
        for (queued, permit) in batch.into_iter().zip(permits) {
            self.launch(queued, permit, workers).await?;
        }
        Ok(())
    }

    async fn launch(
        &mut self,
        queued: ShardSpec,
        permit: OwnedSemaphorePermit,
        workers: &mut JoinSet<WorkerOutcome>,
    ) -> Result<()> {
        let mut shard = match self.shards.get(&queued.shard_id) {
            Some(shard) if shard.phase == ShardPhase::Pending => shard.clone(),
            _ => {
                self.scheduler.complete(&queued.stage_id);
                return Ok(());
            }
        };

        shard.attempts += 1;
        self.transition(&mut shard, ShardEvent::Claim)?;
        self.commit(shard.clone()).await?;
        self.transition(&mut shard, ShardEvent::Start)?;
        self.commit(shard.clone()).await?;
        debug!(
            plan_id = %self.plan.id,
            shard_id = %shard.shard_id,
            attempt = shard.attempts,
            "shard dispatched"
        );

        let executor = self.env.executors.get(&shard.executor);
        let stage = self.plan.stage(&shard.stage_id).cloned();
        let cancel = self.cancel.subscribe();
        workers.spawn(run_worker(shard, stage, executor, permit, cancel));
        Ok(())
    }

    async fn handle_outcome(
        &mut self,
        outcome: WorkerOutcome,
        timers: &mut JoinSet<String>,
    ) -> Result<()> {
        let Some(shard) = self.shards.get(&outcome.shard_id).cloned() else {
            return Ok(());
        };
        self.scheduler.complete(&shard.stage_id);

        if self.plan.status.is_terminal() || shard.phase != ShardPhase::Running {
            debug!(shard_id = %shard.shard_id, "discarding late result");
            return Ok(());
        }

        // Timeouts and failures count toward the tail too; cancellation does not
        let latency_ms = match &outcome.result {
            Err(ExecutionFailure::Cancelled) => None,
            _ => Some(outcome.duration.as_millis() as u64),
        };
        let stage_id = shard.stage_id.clone();

        match outcome.result {
            Ok(output) => self.complete_shard(shard, output, outcome.duration).await?,
            Err(failure)
                if failure.is_retryable() && shard.attempts < self.env.config.max_attempts =>
            {
                self.retry_shard(shard, failure, timers).await?
            }
            Err(failure) => {
                self.fail_shard(shard, failure.to_string(), outcome.duration)
                    .await?
            }
        }

        match latency_ms {
            Some(ms) if self.plan.status == PlanStatus::Running => {
                self.observe_latency(&stage_id, ms).await
            }
            _ => Ok(()),
        }
    }

    async fn complete_shard(
        &mut self,
        mut shard: ShardSpec,
        output: Value,
        duration: Duration,
    ) -> Result<()> {
        let result = ShardResult::success(&shard, output, duration);
        self.save_result(&result).await?;

        shard.last_error = None;
        self.transition(&mut shard, ShardEvent::Succeed)?;
        self.commit(shard.clone()).await?;
        self.leaves
            .insert(shard.shard_id.clone(), result.output_hash.clone());

        self.env.emit(
            EventTopic::ShardDone,
            &self.plan.id,
            json!({
                "shard_id": shard.shard_id,
                "stage_id": shard.stage_id,
                "attempts": shard.attempts,
                "duration_ms": result.duration_ms,
                "output_hash": result.output_hash,
            }),
        );

        self.refresh_stages().await
    }

    async fn retry_shard(
        &mut self,
        mut shard: ShardSpec,
        failure: ExecutionFailure,
        timers: &mut JoinSet<String>,
    ) -> Result<()> {
        shard.last_error = Some(failure.to_string());
        self.transition(&mut shard, ShardEvent::Fail)?;
        self.transition(&mut shard, ShardEvent::Retry)?;
        self.commit(shard.clone()).await?;

        let config = &self.env.config;
        let delay =
            exponential_backoff(shard.attempts, config.retry_backoff(), config.retry_backoff_max());
        warn!(
            plan_id = %self.plan.id,
            shard_id = %shard.shard_id,
            attempt = shard.attempts,
            "shard failed, retrying in {:?}: {}",
            delay,
            failure
        );

        let shard_id = shard.shard_id;
        timers.spawn(async move {
            tokio::time::sleep(delay).await;
            shard_id
        });
        Ok(())
    }

    fn requeue(&mut self, shard_id: &str) {
        if self.plan.status != PlanStatus::Running {
            return;
        }
        if let Some(shard) = self.shards.get(shard_id) {
            if shard.phase == ShardPhase::Pending {
                self.scheduler.enqueue(shard.clone());
            }
        }
    }

    /// Permanent failure of a RUNNING shard
    async fn fail_shard(
        &mut self,
        mut shard: ShardSpec,
        error: String,
        duration: Duration,
    ) -> Result<()> {
        let result = ShardResult::failure(&shard, error.clone(), duration);
        self.save_result(&result).await?;

        shard.last_error = Some(error.clone());
        self.transition(&mut shard, ShardEvent::Fail)?;
        self.commit(shard.clone()).await?;
        warn!(
            plan_id = %self.plan.id,
            shard_id = %shard.shard_id,
            attempts = shard.attempts,
            "shard failed permanently: {}",
            error
        );
        self.env.emit(
            EventTopic::ShardFailed,
            &self.plan.id,
            json!({
                "shard_id": shard.shard_id,
                "stage_id": shard.stage_id,
                "attempts": shard.attempts,
                "error": error,
            }),
        );

        if self.env.config.fail_fast {
            self.fail_all_pending("fail fast").await?;
        }
        self.refresh_stages().await
    }

    /// Fail a PENDING shard without running it
    async fn fail_pending(&mut self, shard_id: &str, reason: &str) -> Result<()> {
        let mut shard = match self.shards.get(shard_id) {
            Some(shard) if shard.phase == ShardPhase::Pending => shard.clone(),
            _ => return Ok(()),
        };
        self.scheduler.remove(shard_id);

        let result = ShardResult::failure(&shard, reason.to_string(), Duration::ZERO);
        self.save_result(&result).await?;

        shard.last_error = Some(reason.to_string());
        self.transition(&mut shard, ShardEvent::Abort)?;
        self.commit(shard.clone()).await?;
        self.env.emit(
            EventTopic::ShardFailed,
            &self.plan.id,
            json!({
                "shard_id": shard.shard_id,
                "stage_id": shard.stage_id,
                "attempts": shard.attempts,
                "error": reason,
            }),
        );
        Ok(())
    }

    async fn fail_all_pending(&mut self, reason: &str) -> Result<()> {
        self.scheduler.drain();
        self.held.clear();
        let mut pending: Vec<(u64, String)> = self
            .shards
            .values()
            .filter(|s| s.phase == ShardPhase::Pending)
            .map(|s| (s.seq, s.shard_id.clone()))
            .collect();
        pending.sort();
        for (_, shard_id) in pending {
            self.fail_pending(&shard_id, reason).await?;
        }
        Ok(())
    }

    async fn observe_latency(&mut self, stage_id: &str, latency_ms: u64) -> Result<()> {
        let window = self
            .windows
            .entry(stage_id.to_string())
            .or_insert_with(|| self.env.autosplit.window());
        window.record(latency_ms);

        let generation = self
            .plan
            .stage_state(stage_id)
            .map(|s| s.generation)
            .unwrap_or(0);
        match self.env.autosplit.should_split(window, generation) {
            Some(p95) => self.autosplit(stage_id, p95).await,
            None => Ok(()),
        }
    }

    /// Refine the stage's untouched PENDING shards into finer ones
    async fn autosplit(&mut self, stage_id: &str, p95_ms: u64) -> Result<()> {
        if let Some(window) = self.windows.get_mut(stage_id) {
            window.reset();
        }
        let Some(stage) = self.plan.stage(stage_id).cloned() else {
            return Ok(());
        };
        let factor = self.env.autosplit.factor();

        let shards = &self.shards;
        let candidates = self.scheduler.remove_where(|s| {
            s.stage_id == stage_id
                && shards
                    .get(&s.shard_id)
                    .is_some_and(|s| s.phase == ShardPhase::Pending && s.attempts == 0)
        });

        let budget = self.plan.constraints.max_shards;
        let mut seen: HashSet<String> = HashSet::new();
        let mut removed: Vec<ShardSpec> = Vec::new();
        let mut added: Vec<ShardSpec> = Vec::new();
        for parent in candidates {
            let children: Vec<ShardSpec> = self
                .env
                .partitioners
                .refine(&stage, &parent, factor)
                .into_iter()
                .filter(|c| !self.shards.contains_key(&c.shard_id) && seen.insert(c.shard_id.clone()))
                .map(|mut c| {
                    c.aliases = parent.aliases.clone();
                    c
                })
                .collect();

            let projected = self.plan.counters.total() + added.len() + children.len();
            if children.is_empty() || projected > budget + removed.len() + 1 {
                self.scheduler.enqueue(parent);
                continue;
            }
            removed.push(parent);
            added.extend(children);
        }
        if removed.is_empty() {
            return Ok(());
        }

        for parent in &removed {
            self.plan.counters.remove(ShardPhase::Pending);
            for id in parent.stages() {
                if let Some(p) = self.progress.get_mut(id) {
                    p.total = p.total.saturating_sub(1);
                }
            }
        }
        for child in &added {
            self.plan.counters.add(ShardPhase::Pending);
            for id in child.stages() {
                self.progress.entry(id.to_string()).or_default().total += 1;
            }
        }
        if let Some(state) = self.plan.stage_state_mut(stage_id) {
            state.generation += 1;
        }
        self.plan.touch();

        let removed_ids: Vec<String> = removed.iter().map(|s| s.shard_id.clone()).collect();
        let checkpointer: &dyn Checkpointer = self.env.checkpointer.as_ref();
        let plan = &self.plan;
        retry_with_backoff(
            "replace_shards",
            || checkpointer.replace_shards(plan, &removed_ids, &added),
            self.env.config.checkpoint_retries,
            CHECKPOINT_BACKOFF,
        )
        .await?;

        for id in &removed_ids {
            self.shards.remove(id);
        }
        for child in &added {
            self.shards.insert(child.shard_id.clone(), child.clone());
            self.scheduler.enqueue(child.clone());
        }
        self.status_tx.send_replace(self.plan.status);

        let signal = self
            .env
            .autosplit
            .signal(&self.plan.id, stage_id, p95_ms, removed_ids.len());
        info!(
            plan_id = %self.plan.id,
            stage_id,
            p95_ms,
            removed = removed_ids.len(),
            added = added.len(),
            "autosplit applied"
        );
        self.env.emit(
            EventTopic::AutotuneSignal,
            &self.plan.id,
            serde_json::to_value(&signal)?,
        );
        Ok(())
    }

    /// Advance stage statuses; stages are ordered so dependencies come first
    async fn refresh_stages(&mut self) -> Result<()> {
        let mut changed = false;
        let stages: Vec<(String, Vec<String>)> = self
            .plan
            .stages
            .iter()
            .map(|s| (s.id.clone(), s.depends_on.clone()))
            .collect();

        for (stage_id, deps) in stages {
            let Some(status) = self.plan.stage_state(&stage_id).map(|s| s.status) else {
                continue;
            };
            match status {
                StageStatus::Done => continue,
                // A failed stage still drains what it already owns
                StageStatus::Failed => {
                    self.release_held(&stage_id);
                    continue;
                }
                StageStatus::Active => self.release_held(&stage_id),
                StageStatus::Pending => {
                    let dep_status: Vec<Option<StageStatus>> = deps
                        .iter()
                        .map(|d| self.plan.stage_state(d).map(|s| s.status))
                        .collect();
                    if dep_status.contains(&Some(StageStatus::Failed)) {
                        self.set_stage(&stage_id, StageStatus::Failed, Some("dependency failed"));
                        for shard in self.held.remove(&stage_id).unwrap_or_default() {
                            self.fail_pending(&shard.shard_id, "dependency failed")
                                .await?;
                        }
                        changed = true;
                        continue;
                    }
                    if !dep_status.iter().all(|s| *s == Some(StageStatus::Done)) {
                        continue;
                    }
                    self.set_stage(&stage_id, StageStatus::Active, None);
                    self.release_held(&stage_id);
                    changed = true;
                }
            }

            let p = self.progress.get(&stage_id).copied().unwrap_or_default();
            if p.failed > 0 {
                let reason = format!("{} shard(s) failed", p.failed);
                self.set_stage(&stage_id, StageStatus::Failed, Some(&reason));
                changed = true;
            } else if p.done == p.total {
                self.set_stage(&stage_id, StageStatus::Done, None);
                changed = true;
            }
        }

        if changed {
            self.save_plan().await?;
        }
        Ok(())
    }

    /// Hand a stage's held shards to the scheduler. Resumed plans start
    /// with every pending shard held, including those of active stages.
    fn release_held(&mut self, stage_id: &str) {
        for shard in self.held.remove(stage_id).unwrap_or_default() {
            self.scheduler.enqueue(shard);
        }
    }

    fn set_stage(&mut self, stage_id: &str, status: StageStatus, error: Option<&str>) {
        if let Some(state) = self.plan.stage_state_mut(stage_id) {
            state.status = status;
            state.error = error.map(str::to_string);
        }
        debug!(plan_id = %self.plan.id, stage_id, ?status, "stage status changed");
    }

    async fn finish(&mut self) -> Result<()> {
        let failed_stage = self
            .plan
            .stage_states
            .iter()
            .find(|s| s.status == StageStatus::Failed)
            .map(|s| {
                format!(
                    "stage {}: {}",
                    s.stage_id,
                    s.error.as_deref().unwrap_or("failed")
                )
            });
        let any_failed = self.plan.counters.failed > 0 || failed_stage.is_some();
        self.plan.status =
            plan_transition(self.plan.status, PlanEvent::ShardsResolved { any_failed })?;

        if self.plan.status == PlanStatus::Failed {
            let reason = failed_stage
                .unwrap_or_else(|| format!("{} shard(s) failed", self.plan.counters.failed));
            warn!(plan_id = %self.plan.id, "plan failed: {}", reason);
            self.plan.failure_reason = Some(reason);
            self.plan.finished_at = Some(Utc::now());
            return self.save_plan().await;
        }

        self.save_plan().await?;
        self.certify().await
    }

    /// Rebuild the tree from stored results and check it against the leaves
    /// folded while the plan ran
    async fn certify(&mut self) -> Result<()> {
        let checkpointer: &dyn Checkpointer = self.env.checkpointer.as_ref();
        let plan_id = self.plan.id.as_str();
        let results = retry_with_backoff(
            "list_results",
            || checkpointer.list_results(plan_id),
            self.env.config.checkpoint_retries,
            CHECKPOINT_BACKOFF,
        )
        .await?;

        let stored = results
            .iter()
            .filter(|r| {
                r.success
                    && self
                        .shards
                        .get(&r.shard_id)
                        .is_some_and(|s| s.phase == ShardPhase::Done)
            })
            .map(|r| MerkleLeaf::new(&r.shard_id, &r.output_hash));
        let (root, tree) = MerkleTree::build(stored);
        let (folded, _) =
            MerkleTree::build(self.leaves.iter().map(|(id, hash)| MerkleLeaf::new(id, hash)));

        let sample = tree.sample_proofs(self.env.config.certify_sample_size);
        let verdict = if root != folded {
            Err(format!("stored root {} does not match folded root {}", root, folded))
        } else if tree.len() != self.plan.counters.done {
            Err(format!(
                "{} stored results for {} done shards",
                tree.len(),
                self.plan.counters.done
            ))
        } else if !sample.iter().all(|(leaf, proof)| merkle::verify(&root, leaf, proof)) {
            Err("sampled inclusion proof did not verify".to_string())
        } else {
            Ok(())
        };

        match verdict {
            Ok(()) => {
                self.plan.status = plan_transition(self.plan.status, PlanEvent::Certified)?;
                self.plan.merkle_root = Some(root.clone());
                self.plan.truth_certified = true;
                self.plan.finished_at = Some(Utc::now());
                self.save_plan().await?;
                info!(
                    plan_id = %self.plan.id,
                    merkle_root = %root,
                    leaves = tree.len(),
                    "plan certified"
                );
                self.env.emit(
                    EventTopic::AggregateCertify,
                    &self.plan.id,
                    json!({
                        "merkle_root": root,
                        "leaves": tree.len(),
                        "sampled_proofs": sample.len(),
                    }),
                );
            }
            Err(reason) => {
                error!(plan_id = %self.plan.id, "certification failed: {}", reason);
                self.plan.status =
                    plan_transition(self.plan.status, PlanEvent::CertificationFailed)?;
                self.plan.failure_reason = Some(format!("certification: {}", reason));
                self.plan.finished_at = Some(Utc::now());
                self.save_plan().await?;
            }
        }
        Ok(())
    }

    /// Stop claiming, cancel in-flight work and fail every unresolved shard
    async fn abort(&mut self, reason: &str, workers: &mut JoinSet<WorkerOutcome>) -> Result<()> {
        self.cancel.send_replace(true);
        workers.shutdown().await;
        self.scheduler.drain();
        self.held.clear();

        let mut unresolved: Vec<ShardSpec> = self
            .shards
            .values()
            .filter(|s| !s.phase.is_terminal())
            .cloned()
            .collect();
        unresolved.sort_by_key(|s| s.seq);
        for mut shard in unresolved {
            shard.last_error = Some(reason.to_string());
            self.transition(&mut shard, ShardEvent::Abort)?;
            self.commit(shard).await?;
        }

        self.plan.status = plan_transition(self.plan.status, PlanEvent::Abort)?;
        self.plan.failure_reason = Some(reason.to_string());
        self.plan.finished_at = Some(Utc::now());
        self.save_plan().await?;
        info!(plan_id = %self.plan.id, "plan aborted: {}", reason);
        self.env.emit(
            EventTopic::Audit,
            &self.plan.id,
            json!({ "action": "abort", "reason": reason }),
        );
        Ok(())
    }

    async fn fail(&mut self, reason: &str) -> Result<()> {
        self.plan.status = plan_transition(self.plan.status, PlanEvent::Fatal)?;
        self.plan.failure_reason = Some(reason.to_string());
        self.plan.finished_at = Some(Utc::now());
        self.save_plan().await
    }

    /// Apply a shard event, keeping plan counters and stage tallies in step
    fn transition(&mut self, shard: &mut ShardSpec, event: ShardEvent) -> Result<()> {
        let from = shard.phase;
        let to = shard_transition(from, event)?;
        shard.set_phase(to);
        self.plan.counters.shift(from, to);
        for stage_id in shard.stages() {
            let p = self.progress.entry(stage_id.to_string()).or_default();
            match from {
                ShardPhase::Done => p.done = p.done.saturating_sub(1),
                ShardPhase::Failed => p.failed = p.failed.saturating_sub(1),
                _ => {}
            }
            match to {
                ShardPhase::Done => p.done += 1,
                ShardPhase::Failed => p.failed += 1,
                _ => {}
            }
        }
        Ok(())
    }

    async fn commit(&mut self, shard: ShardSpec) -> Result<()> {
        self.plan.touch();
        let checkpointer: &dyn Checkpointer = self.env.checkpointer.as_ref();
        let plan = &self.plan;
        retry_with_backoff(
            "commit_shard",
            || checkpointer.commit_shard(plan, &shard),
            self.env.config.checkpoint_retries,
            CHECKPOINT_BACKOFF,
        )
        .await?;
        self.shards.insert(shard.shard_id.clone(), shard);
        Ok(())
    }

    async fn save_result(&self, result: &ShardResult) -> Result<()> {
        let checkpointer: &dyn Checkpointer = self.env.checkpointer.as_ref();
        retry_with_backoff(
            "save_result",
            || checkpointer.save_result(result),
            self.env.config.checkpoint_retries,
            CHECKPOINT_BACKOFF,
        )
        .await
    }

    async fn save_plan(&mut self) -> Result<()> {
        self.plan.touch();
        let checkpointer: &dyn Checkpointer = self.env.checkpointer.as_ref();
        let plan = &self.plan;
        retry_with_backoff(
            "save_plan",
            || checkpointer.save_plan(plan),
            self.env.config.checkpoint_retries,
            CHECKPOINT_BACKOFF,
        )
        .await?;
        self.status_tx.send_replace(self.plan.status);
        Ok(())
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run_worker(
    shard: ShardSpec,
    stage: Option<HxoStage>,
    executor: Option<Arc<dyn ShardExecutor>>,
    permit: OwnedSemaphorePermit,
    mut cancel: watch::Receiver<bool>,
) -> WorkerOutcome {
    let _permit = permit;
    let started = std::time::Instant::now();
    let shard_id = shard.shard_id.clone();

    let result = match (stage, executor) {
        (Some(stage), Some(executor)) => {
            let mut task = AbortOnDrop(tokio::spawn(async move {
                let ctx = ShardContext::new(&shard, &stage);
                run_attempt(executor.as_ref(), &ctx, shard.timeout()).await
            }));
            tokio::select! {
                joined = &mut task.0 => match joined {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => {
                        Err(ExecutionFailure::Permanent("executor panicked".to_string()))
                    }
                    Err(_) => Err(ExecutionFailure::Cancelled),
                },
                _ = cancel.wait_for(|cancelled| *cancelled) => Err(ExecutionFailure::Cancelled),
            }
        }
        (None, _) => Err(ExecutionFailure::Permanent(format!(
            "stage {} is not part of the plan",
            shard.stage_id
        ))),
        (_, None) => Err(ExecutionFailure::UnknownExecutor(shard.executor.clone())),
    };

    WorkerOutcome {
        shard_id,
        result,
        duration: started.elapsed(),
    }
}

/// Map a runner exit to what the orchestrator should do with the plan
pub(crate) fn is_fatal_store_error(err: &HxoError) -> bool {
    matches!(err, HxoError::CheckpointIo(_))
}
