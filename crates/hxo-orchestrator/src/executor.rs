//! Shard executors
//!
//! The orchestrator knows nothing about what a shard does. Each stage names an
//! executor kind; the registry resolves it to a `ShardExecutor` at dispatch
//! time. Executors must be safe to call concurrently and should be
//! idempotent, since a crash between execution and checkpoint replays the
//! shard.

use async_trait::async_trait;
use hxo_core::{ExecutionFailure, HxoStage, ShardSpec};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::instrument;

/// What an executor sees for one attempt
#[derive(Debug, Clone, Copy)]
pub struct ShardContext<'a> {
    pub shard: &'a ShardSpec,
    pub stage: &'a HxoStage,
}

impl<'a> ShardContext<'a> {
    pub fn new(shard: &'a ShardSpec, stage: &'a HxoStage) -> Self {
        Self { shard, stage }
    }

    pub fn payload(&self) -> &Value {
        &self.shard.payload
    }

    /// 1-based attempt number
    pub fn attempt(&self) -> u32 {
        self.shard.attempts
    }
}

/// Executes one kind of shard
#[async_trait]
pub trait ShardExecutor: Send + Sync {
    /// Kind this executor is registered under
    fn kind(&self) -> &str;

    /// Whether re-running a shard with the same payload is harmless
    ///
    /// Stages using a non-idempotent executor must opt in through
    /// `safety.allow_non_idempotent`.
    fn idempotent(&self) -> bool {
        true
    }

    /// Validate a shard without side effects. Called before `execute` when
    /// the stage sets `safety.require_dry_run`.
    async fn dry_run(&self, _ctx: &ShardContext<'_>) -> Result<(), ExecutionFailure> {
        Ok(())
    }

    async fn execute(&self, ctx: &ShardContext<'_>) -> Result<Value, ExecutionFailure>;
}

/// Immutable kind -> executor table
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn ShardExecutor>>,
}

#[derive(Default)]
pub struct ExecutorRegistryBuilder {
    executors: HashMap<String, Arc<dyn ShardExecutor>>,
}

impl ExecutorRegistryBuilder {
    /// Register an executor under its own kind; a later registration for the
    /// same kind replaces the earlier one
    pub fn register(mut self, executor: Arc<dyn ShardExecutor>) -> Self {
        self.executors.insert(executor.kind().to_string(), executor);
        self
    }

    pub fn build(self) -> ExecutorRegistry {
        ExecutorRegistry {
            executors: self.executors,
        }
    }
}

impl ExecutorRegistry {
    pub fn builder() -> ExecutorRegistryBuilder {
        ExecutorRegistryBuilder::default()
    }

    /// Registry with the built-in `echo` and `command` executors
    pub fn with_builtins() -> ExecutorRegistryBuilder {
        Self::builder()
            .register(Arc::new(EchoExecutor))
            .register(Arc::new(CommandExecutor::default()))
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn ShardExecutor>> {
        self.executors.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.executors.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.executors.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

/// Returns the shard payload unchanged. Deterministic.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoExecutor;

#[async_trait]
impl ShardExecutor for EchoExecutor {
    fn kind(&self) -> &str {
        "echo"
    }

    async fn execute(&self, ctx: &ShardContext<'_>) -> Result<Value, ExecutionFailure> {
        Ok(json!({ "echo": ctx.payload() }))
    }
}

/// Runs an external program once per shard
///
/// The program comes from the stage input: `{"command": "...", "args": [...]}`.
/// The shard id and JSON payload are passed as `HXO_SHARD_ID` and
/// `HXO_SHARD_PAYLOAD`. Exit code 0 succeeds; exit code 75 (`EX_TEMPFAIL`)
/// is transient; any other exit is permanent.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    max_output: usize,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self { max_output: 4000 }
    }
}

const EX_TEMPFAIL: i32 = 75;

impl CommandExecutor {
    fn program<'a>(stage: &'a HxoStage) -> Result<(&'a str, Vec<String>), ExecutionFailure> {
        let program = stage
            .input
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| ExecutionFailure::Permanent("stage input has no command".into()))?;
        let args = stage
            .input
            .get("args")
            .and_then(Value::as_array)
            .map(|args| {
                args.iter()
                    .map(|a| match a {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok((program, args))
    }

    fn truncate(&self, s: &str) -> String {
        if s.len() > self.max_output {
            let mut end = self.max_output;
            while !s.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...[truncated]", &s[..end])
        } else {
            s.to_string()
        }
    }
}

#[async_trait]
impl ShardExecutor for CommandExecutor {
    fn kind(&self) -> &str {
        "command"
    }

    fn idempotent(&self) -> bool {
        false
    }

    async fn dry_run(&self, ctx: &ShardContext<'_>) -> Result<(), ExecutionFailure> {
        Self::program(ctx.stage).map(|_| ())
    }

    async fn execute(&self, ctx: &ShardContext<'_>) -> Result<Value, ExecutionFailure> {
        let (program, args) = Self::program(ctx.stage)?;
        let payload = serde_json::to_string(ctx.payload())
            .map_err(|e| ExecutionFailure::Permanent(e.to_string()))?;

        let output = Command::new(program)
            .args(&args)
            .env("HXO_SHARD_ID", &ctx.shard.shard_id)
            .env("HXO_SHARD_PAYLOAD", payload)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ExecutionFailure::Permanent(format!("failed to run {}: {}", program, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if output.status.success() {
            // Structured output when the program prints JSON, raw text otherwise.
            // Only program output goes in; the hash must not depend on timing.
            let stdout = stdout.trim();
            let value = serde_json::from_str(stdout)
                .unwrap_or_else(|_| Value::String(self.truncate(stdout)));
            return Ok(json!({ "stdout": value }));
        }

        let message = format!(
            "{} {} failed ({}):\n\nSTDERR:\n{}",
            program,
            args.join(" "),
            output.status,
            self.truncate(stderr.trim())
        );
        match output.status.code() {
            Some(EX_TEMPFAIL) => Err(ExecutionFailure::Transient(message)),
            _ => Err(ExecutionFailure::Permanent(message)),
        }
    }
}

/// Run one attempt with a deadline, honouring the dry-run gate
#[instrument(
    skip_all,
    fields(shard_id = %ctx.shard.shard_id, kind = %executor.kind(), attempt = ctx.attempt())
)]
pub(crate) async fn run_attempt(
    executor: &dyn ShardExecutor,
    ctx: &ShardContext<'_>,
    deadline: Duration,
) -> Result<Value, ExecutionFailure> {
    let attempt = async {
        if ctx.stage.safety.require_dry_run {
            executor.dry_run(ctx).await.map_err(|e| match e {
                ExecutionFailure::Permanent(m) | ExecutionFailure::Transient(m) => {
                    ExecutionFailure::Permanent(format!("dry run rejected: {}", m))
                }
                other => other,
            })?;
        }
        executor.execute(ctx).await
    };
    match tokio::time::timeout(deadline, attempt).await {
        Ok(result) => result,
        Err(_) => Err(ExecutionFailure::Timeout(deadline)),
    }
}
