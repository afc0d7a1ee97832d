//! Executors and helpers shared by the orchestrator integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use hxo_core::{ExecutionFailure, HxoConfig, PlanStatusReport};
use hxo_orchestrator::{ExecutorRegistry, HxoCore, ShardContext, ShardExecutor};
use hxo_storage::{Checkpointer, MemoryCheckpointer};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

pub const WAIT: Duration = Duration::from_secs(20);

/// Echoes its payload and records every call
#[derive(Default)]
pub struct SpyExecutor {
    kind: String,
    calls: AtomicUsize,
    shard_ids: Mutex<Vec<String>>,
    /// Payload index that always fails with a transient error
    fail_index: Option<u64>,
    /// Fail every call permanently while set
    broken: AtomicBool,
    delay: Duration,
}

impl SpyExecutor {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            ..Self::default()
        }
    }

    pub fn failing_at(mut self, index: u64) -> Self {
        self.fail_index = Some(index);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_broken(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn shard_ids(&self) -> Vec<String> {
        self.shard_ids.lock().unwrap().clone()
    }

    pub fn calls_for(&self, shard_id: &str) -> usize {
        self.shard_ids
            .lock()
            .unwrap()
            .iter()
            .filter(|id| id.as_str() == shard_id)
            .count()
    }
}

#[async_trait]
impl ShardExecutor for SpyExecutor {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn execute(&self, ctx: &ShardContext<'_>) -> Result<Value, ExecutionFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.shard_ids
            .lock()
            .unwrap()
            .push(ctx.shard.shard_id.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.broken.load(Ordering::SeqCst) {
            return Err(ExecutionFailure::Permanent("broken".into()));
        }
        if let Some(index) = self.fail_index {
            if ctx.payload().get("index").and_then(Value::as_u64) == Some(index) {
                return Err(ExecutionFailure::Transient(format!("shard {} is flaky", index)));
            }
        }
        Ok(json!({ "echo": ctx.payload() }))
    }
}

/// Echo executor that lets a fixed number of calls through and parks the
/// rest forever
pub struct GatedExecutor {
    kind: String,
    gate: Semaphore,
    started: AtomicUsize,
}

impl GatedExecutor {
    pub fn new(kind: &str, open_calls: usize) -> Self {
        Self {
            kind: kind.to_string(),
            gate: Semaphore::new(open_calls),
            started: AtomicUsize::new(0),
        }
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ShardExecutor for GatedExecutor {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn execute(&self, ctx: &ShardContext<'_>) -> Result<Value, ExecutionFailure> {
        self.started.fetch_add(1, Ordering::SeqCst);
        match self.gate.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => return Err(ExecutionFailure::Cancelled),
        }
        Ok(json!({ "echo": ctx.payload() }))
    }
}

pub fn fast_config() -> HxoConfig {
    HxoConfig::default()
        .with_max_concurrency(4)
        .with_retry_backoff_ms(1)
}

pub fn core_with(
    config: HxoConfig,
    store: Arc<dyn Checkpointer>,
    executor: Arc<dyn ShardExecutor>,
) -> HxoCore {
    let registry = ExecutorRegistry::with_builtins().register(executor).build();
    HxoCore::builder(config, store).executors(registry).build()
}

pub fn memory_store() -> Arc<MemoryCheckpointer> {
    Arc::new(MemoryCheckpointer::new())
}

/// Block until the plan reaches a terminal status
pub async fn finish(core: &HxoCore, plan_id: &str) -> PlanStatusReport {
    let report = core.wait(plan_id, WAIT).await.expect("status");
    assert!(
        report.status.is_terminal(),
        "plan {} still {} after {:?}",
        plan_id,
        report.status,
        WAIT
    );
    report
}

/// Poll until `check` holds for the stored status
pub async fn poll_until<F>(core: &HxoCore, plan_id: &str, check: F) -> PlanStatusReport
where
    F: Fn(&PlanStatusReport) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let report = core.status(plan_id).await.expect("status");
        if check(&report) {
            return report;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached, last status {:?}",
            report
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn unique(ids: &[String]) -> HashSet<String> {
    ids.iter().cloned().collect()
}
