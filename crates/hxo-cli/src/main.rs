//! HXO CLI - sharded plan orchestration with Merkle-certified results
//!
//! Usage:
//!   hxo init                      Write a default `.hxo/config.toml`
//!   hxo serve                     Resume unfinished plans and serve the HTTP API
//!   hxo run <plan.json>           Submit a plan and wait for it to finish
//!   hxo status <plan-id>          Show plan progress
//!   hxo list                      List every known plan
//!   hxo resume                    Resume unfinished plans and drive them to completion
//!   hxo prove <plan-id> <shard>   Print an inclusion proof for one shard

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hxo_core::{HxoConfig, PlanRequest, PlanStatusReport};
use hxo_orchestrator::{BroadcastNotifier, HxoCore, Rehydrator, TracingNotifier};
use hxo_storage::TursoCheckpointer;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "hxo")]
#[command(author, version, about = "Sharded plan orchestration with certified results")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory holding `.hxo/`
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Serve the HTTP API
    Serve {
        /// Bind address (overrides `server.bind`)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Submit a plan from a JSON file and wait for it
    Run {
        /// Plan request file
        plan: PathBuf,

        /// Seconds to wait before leaving the plan to a later `resume`
        #[arg(long, default_value = "3600")]
        timeout: u64,
    },

    /// Show plan status
    Status {
        plan_id: String,
    },

    /// List all plans
    List,

    /// Resume every unfinished plan
    Resume {
        /// Seconds to wait for the resumed plans
        #[arg(long, default_value = "3600")]
        timeout: u64,
    },

    /// Abort a plan
    Abort {
        plan_id: String,
    },

    /// Re-run the failed shards of a finished plan
    Replay {
        plan_id: String,

        #[arg(long, default_value = "3600")]
        timeout: u64,
    },

    /// Print the final report of a plan
    Report {
        plan_id: String,
    },

    /// Print the inclusion proof of one shard in a certified plan
    Prove {
        plan_id: String,
        shard_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let root = cli.root;
    match cli.command {
        Commands::Init { force } => cmd_init(&root, force),
        Commands::Serve { bind } => cmd_serve(&root, bind).await,
        Commands::Run { plan, timeout } => cmd_run(&root, plan, timeout).await,
        Commands::Status { plan_id } => cmd_status(&root, &plan_id).await,
        Commands::List => cmd_list(&root).await,
        Commands::Resume { timeout } => cmd_resume(&root, timeout).await,
        Commands::Abort { plan_id } => cmd_abort(&root, &plan_id).await,
        Commands::Replay { plan_id, timeout } => cmd_replay(&root, &plan_id, timeout).await,
        Commands::Report { plan_id } => cmd_report(&root, &plan_id).await,
        Commands::Prove { plan_id, shard_id } => cmd_prove(&root, &plan_id, &shard_id).await,
    }
}

fn load_config(root: &Path) -> Result<HxoConfig> {
    HxoConfig::load_or_default(root)
        .with_context(|| format!("Failed to load {}", HxoConfig::path_in(root).display()))
}

async fn open_store(root: &Path, config: &HxoConfig) -> Result<Arc<TursoCheckpointer>> {
    let path = root.join(&config.store.path);
    let store = TursoCheckpointer::open(&path)
        .await
        .with_context(|| format!("Failed to open checkpoint store {}", path.display()))?;
    Ok(Arc::new(store))
}

/// Core for one-shot commands; events go to the log
async fn open_core(root: &Path) -> Result<HxoCore> {
    let config = load_config(root)?;
    let store = open_store(root, &config).await?;
    Ok(HxoCore::builder(config, store)
        .notifier(Arc::new(TracingNotifier))
        .build())
}

fn print_status(report: &PlanStatusReport) {
    println!("{} ({})", report.plan_name, report.plan_id);
    println!("  status:    {}", report.status);
    println!(
        "  shards:    {} total, {} done, {} failed, {} pending, {} running",
        report.total_shards,
        report.done_shards,
        report.failed_shards,
        report.pending_shards,
        report.claimed_shards + report.running_shards
    );
    if let Some(root) = &report.merkle_root {
        println!("  root:      {}", root);
    }
    println!("  certified: {}", report.truth_certified);
    if let Some(eta) = report.eta_seconds {
        println!("  eta:       {:.1}s", eta);
    }
    if let Some(reason) = &report.failure_reason {
        println!("  reason:    {}", reason);
    }
    if let Some(original) = &report.replay_of {
        println!("  replay of: {}", original);
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<()> {
    let path = HxoConfig::path_in(root);
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let written = HxoConfig::default().save(root)?;
    println!("Initialized HXO in {:?}", root);
    println!("Created:");
    println!("  {}", written.display());
    Ok(())
}

async fn cmd_serve(root: &Path, bind: Option<String>) -> Result<()> {
    let mut config = load_config(root)?;
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    let store = open_store(root, &config).await?;
    let events = BroadcastNotifier::new(1024);
    let server_config = config.server.clone();
    let core = HxoCore::builder(config, store)
        .notifier(Arc::new(events.clone()))
        .build();

    let resumed = Rehydrator::new(core.clone()).resume_all().await?;
    if !resumed.is_empty() {
        info!("Resumed {} unfinished plan(s)", resumed.len());
    }

    hxo_server::run(core, Some(events), &server_config).await
}

async fn cmd_run(root: &Path, plan: PathBuf, timeout: u64) -> Result<()> {
    let content = tokio::fs::read_to_string(&plan)
        .await
        .with_context(|| format!("Failed to read {}", plan.display()))?;
    let request: PlanRequest =
        serde_json::from_str(&content).context("Failed to parse plan JSON")?;

    let core = open_core(root).await?;
    let submitted = core.submit(request).await?;
    println!(
        "Submitted {} ({} shards)",
        submitted.plan_id, submitted.total_shards
    );

    let report = finish(&core, &submitted.plan_id, timeout).await?;
    print_status(&report);
    Ok(())
}

/// Wait for a plan; on timeout the runner is halted and the plan stays resumable
async fn finish(core: &HxoCore, plan_id: &str, timeout: u64) -> Result<PlanStatusReport> {
    let report = core.wait(plan_id, Duration::from_secs(timeout)).await?;
    if !report.status.is_terminal() {
        warn!(
            "Plan {} still {} after {}s; halting (run `hxo resume` to continue)",
            plan_id, report.status, timeout
        );
    }
    core.halt().await;
    Ok(core.status(plan_id).await?)
}

async fn cmd_status(root: &Path, plan_id: &str) -> Result<()> {
    let core = open_core(root).await?;
    print_status(&core.status(plan_id).await?);
    Ok(())
}

async fn cmd_list(root: &Path) -> Result<()> {
    let core = open_core(root).await?;
    let plans = core.list_plans().await?;
    if plans.is_empty() {
        println!("No plans");
        return Ok(());
    }
    println!("{:<34} {:<12} {:>8} {:>8} {:>8}  NAME", "PLAN", "STATUS", "TOTAL", "DONE", "FAILED");
    for p in plans {
        println!(
            "{:<34} {:<12} {:>8} {:>8} {:>8}  {}",
            p.plan_id,
            p.status.to_string(),
            p.total_shards,
            p.done_shards,
            p.failed_shards,
            p.plan_name
        );
    }
    Ok(())
}

async fn cmd_resume(root: &Path, timeout: u64) -> Result<()> {
    let core = open_core(root).await?;
    let resumed = Rehydrator::new(core.clone()).resume_all().await?;
    if resumed.is_empty() {
        println!("Nothing to resume");
        return Ok(());
    }
    println!("Resumed {} plan(s)", resumed.len());

    let deadline = Duration::from_secs(timeout);
    for plan in &resumed {
        let report = core.wait(&plan.plan_id, deadline).await?;
        print_status(&report);
    }
    core.halt().await;
    Ok(())
}

async fn cmd_abort(root: &Path, plan_id: &str) -> Result<()> {
    let core = open_core(root).await?;
    let report = core.abort(plan_id).await?;
    println!("{} {}", report.plan_id, report.status);
    Ok(())
}

async fn cmd_replay(root: &Path, plan_id: &str, timeout: u64) -> Result<()> {
    let core = open_core(root).await?;
    let replay = core.replay(plan_id).await?;
    println!(
        "Replaying {} as {} ({} shards)",
        plan_id, replay.plan_id, replay.total_shards
    );
    let report = finish(&core, &replay.plan_id, timeout).await?;
    print_status(&report);
    Ok(())
}

async fn cmd_report(root: &Path, plan_id: &str) -> Result<()> {
    let core = open_core(root).await?;
    let report = core.report(plan_id).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn cmd_prove(root: &Path, plan_id: &str, shard_id: &str) -> Result<()> {
    let core = open_core(root).await?;
    let proof = core.proof(plan_id, shard_id).await?;
    println!("{}", serde_json::to_string_pretty(&proof)?);
    if !proof.verified {
        anyhow::bail!("proof for shard {} does not verify", shard_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_prove() {
        let cli = Cli::parse_from(["hxo", "--root", "/tmp/x", "prove", "plan-1", "abc"]);
        assert_eq!(cli.root, PathBuf::from("/tmp/x"));
        match cli.command {
            Commands::Prove { plan_id, shard_id } => {
                assert_eq!(plan_id, "plan-1");
                assert_eq!(shard_id, "abc");
            }
            _ => panic!("expected prove"),
        }
    }

    #[test]
    fn test_init_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        cmd_init(dir.path(), false).unwrap();
        assert!(cmd_init(dir.path(), false).is_err());
        cmd_init(dir.path(), true).unwrap();
        assert!(HxoConfig::load_or_default(dir.path()).is_ok());
    }
}
