//! Pure state machines for plans and shards
//!
//! No async, no I/O. The runner asks these functions for the next state and
//! checkpoints the answer; an invalid transition comes back as an error and
//! never panics.

use hxo_core::{HxoError, PlanStatus, Result, ShardPhase};

/// Events that move a plan through its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanEvent {
    /// Stages are being exploded into shards
    StartPartitioning,
    /// All shards are checkpointed PENDING
    Partitioned,
    /// Every shard reached DONE or FAILED
    ShardsResolved { any_failed: bool },
    Certified,
    CertificationFailed,
    Abort,
    /// Unrecoverable control-loop error or timebox expiry
    Fatal,
}

/// Events that move one shard through its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardEvent {
    Claim,
    Start,
    Succeed,
    Fail,
    /// Bounded retry loop back to PENDING
    Retry,
    Abort,
    /// In-flight shard found after a restart
    Recover,
}

/// Next plan status for `event`
///
/// Abort on a terminal plan is idempotent and returns the status unchanged.
pub fn plan_transition(status: PlanStatus, event: PlanEvent) -> Result<PlanStatus> {
    use PlanEvent as E;
    use PlanStatus as S;

    let next = match (status, event) {
        (S::Submitted, E::StartPartitioning) => S::Partitioning,
        (S::Partitioning, E::Partitioned) => S::Running,

        (S::Running, E::ShardsResolved { any_failed: false }) => S::Certifying,
        (S::Running, E::ShardsResolved { any_failed: true }) => S::Failed,

        (S::Certifying, E::Certified) => S::Done,
        (S::Certifying, E::CertificationFailed) => S::Failed,

        (s, E::Abort) if s.is_terminal() => s,
        (_, E::Abort) => S::Aborted,

        (s, E::Fatal) if !s.is_terminal() => S::Failed,

        (s, e) => {
            return Err(HxoError::InvalidTransition(format!(
                "plan in {} cannot handle {:?}",
                s, e
            )))
        }
    };
    Ok(next)
}

/// Next shard phase for `event`
pub fn shard_transition(phase: ShardPhase, event: ShardEvent) -> Result<ShardPhase> {
    use ShardEvent as E;
    use ShardPhase as P;

    let next = match (phase, event) {
        (P::Pending, E::Claim) => P::Claimed,
        (P::Claimed, E::Start) => P::Running,
        (P::Running, E::Succeed) => P::Done,
        (P::Claimed | P::Running, E::Fail) => P::Failed,
        (P::Failed, E::Retry) => P::Pending,
        (P::Pending | P::Claimed | P::Running, E::Abort) => P::Failed,
        (P::Claimed | P::Running, E::Recover) => P::Pending,

        (p, e) => {
            return Err(HxoError::InvalidTransition(format!(
                "shard in {} cannot handle {:?}",
                p, e
            )))
        }
    };
    Ok(next)
}
