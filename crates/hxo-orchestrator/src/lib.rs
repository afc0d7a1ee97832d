//! # hxo-orchestrator
//!
//! Sharding and certification engine for HXO.
//!
//! This crate provides:
//! - Partitioners that explode stages into content-addressed shards
//! - Executor registry and the built-in `echo` and `command` executors
//! - Fair round-robin scheduling across executor kinds
//! - Retry, autosplit and abort handling in a per-plan control loop
//! - Merkle certification of shard outputs
//! - Rehydration of interrupted plans from the checkpoint store

pub mod autotune;
pub mod executor;
pub mod notifier;
pub mod orchestrator;
pub mod partitioner;
pub mod recovery;
pub mod report;
mod runner;
pub mod scheduler;
pub mod state_machine;

pub use autotune::{AutosplitPolicy, LatencyWindow};
pub use executor::{
    CommandExecutor, EchoExecutor, ExecutorRegistry, ExecutorRegistryBuilder, ShardContext,
    ShardExecutor,
};
pub use notifier::{BroadcastNotifier, EventSink, NoopNotifier, Notifier, TracingNotifier};
pub use orchestrator::{HxoCore, HxoCoreBuilder};
pub use partitioner::{
    refine_payload, Partition, PartitionContext, PartitionerRegistry, PartitionerRegistryBuilder,
};
pub use recovery::Rehydrator;
pub use report::{FailedShard, PlanReport, ReportType, ShardProof, StageReport};
pub use scheduler::FairScheduler;
pub use state_machine::{plan_transition, shard_transition, PlanEvent, ShardEvent};
