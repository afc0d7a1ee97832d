//! # hxo-core
//!
//! Core types for the Hypshard-X Orchestrator (HXO).
//!
//! HXO decomposes a plan into content-addressed shards, executes them under
//! bounded concurrency, checkpoints every transition, and certifies the
//! aggregate result with a Merkle root.
//!
//! ## Core Paradigm
//!
//! - Shard ids ARE content hashes (identical work collapses to one id)
//! - The checkpoint store IS the truth (memory is a cache over it)
//! - Certification IS a Merkle root over sorted shard results

pub mod config;
mod error;
pub mod events;
pub mod fail_open;
pub mod hashing;
pub mod merkle;
mod types;

pub use config::{AutosplitConfig, HxoConfig, ServerConfig, StoreConfig};
pub use error::{ExecutionFailure, HxoError, PartitionError, Result};
pub use events::{AutotuneSignal, EventTopic, HxoEvent, SignalType};
pub use merkle::{MerkleLeaf, MerkleNode, MerkleProof, MerkleTree};
pub use types::*;
