//! HXO Storage - checkpoint persistence for the Hypshard-X orchestrator
//!
//! The checkpoint store is the single persisted truth for orchestration
//! state. The orchestrator's in-memory maps are a cache over it, and the
//! rehydrator rebuilds everything from it after a restart.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │         HXO Core / Rehydrator               │
//! └─────────────────┬───────────────────────────┘
//!                   │  Checkpointer trait
//! ┌─────────────────▼───────────────────────────┐
//! │  TursoCheckpointer      MemoryCheckpointer  │
//! │  (.hxo/checkpoints.db)  (tests, embedding)  │
//! │  • plans    keyed by plan_id                │
//! │  • shards   keyed by (plan_id, shard_id)    │
//! │  • results  keyed by (plan_id, shard_id)    │
//! └─────────────────────────────────────────────┘
//! ```

pub mod checkpointer;
pub mod db;
pub mod memory;

pub use checkpointer::Checkpointer;
pub use db::{StorageError, TursoCheckpointer};
pub use memory::MemoryCheckpointer;
