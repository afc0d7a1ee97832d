//! Fair dispatch of ready shards
//!
//! Ready shards are queued per executor kind. Dispatch walks the kinds
//! round-robin, resuming after the last kind served, so a stage with ten
//! thousand shards cannot starve one with ten. Within a kind the oldest shard
//! (lowest `seq`) goes first.

use hxo_core::{SchedulerKind, ShardSpec};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Per-kind FIFO queues with round-robin dispatch
#[derive(Debug, Default)]
pub struct FairScheduler {
    queues: BTreeMap<String, VecDeque<ShardSpec>>,
    /// Queued shard count per kind, then per stage
    queued: HashMap<String, HashMap<String, usize>>,
    last_served: Option<String>,
    /// Max in-flight shards per stage, for stages that are capped
    stage_limits: HashMap<String, usize>,
    in_flight: HashMap<String, usize>,
    len: usize,
}

impl FairScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a stage's dispatch policy against the global concurrency cap
    pub fn configure_stage(&mut self, stage_id: &str, kind: SchedulerKind, max_concurrency: usize) {
        match kind {
            SchedulerKind::FairRoundRobin => {
                self.stage_limits.remove(stage_id);
            }
            SchedulerKind::BackpressureAware => {
                self.stage_limits
                    .insert(stage_id.to_string(), (max_concurrency / 2).max(1));
            }
        }
    }

    /// Queue a ready shard behind older shards of the same kind
    pub fn enqueue(&mut self, shard: ShardSpec) {
        let queue = self.queues.entry(shard.executor.clone()).or_default();
        let pos = queue.partition_point(|s| s.seq <= shard.seq);
        *self
            .queued
            .entry(shard.executor.clone())
            .or_default()
            .entry(shard.stage_id.clone())
            .or_default() += 1;
        queue.insert(pos, shard);
        self.len += 1;
    }

    fn forget(&mut self, shard: &ShardSpec) {
        if let Some(stages) = self.queued.get_mut(&shard.executor) {
            if let Some(n) = stages.get_mut(&shard.stage_id) {
                *n -= 1;
                if *n == 0 {
                    stages.remove(&shard.stage_id);
                }
            }
            if stages.is_empty() {
                self.queued.remove(&shard.executor);
            }
        }
    }

    /// Whether a kind has a queued shard whose stage is below its cap
    fn kind_ready(&self, kind: &str) -> bool {
        self.queued.get(kind).is_some_and(|stages| {
            stages
                .keys()
                .any(|stage_id| stage_open(&self.stage_limits, &self.in_flight, stage_id))
        })
    }

    /// Take up to `capacity` shards for dispatch
    pub fn next_batch(&mut self, capacity: usize) -> Vec<ShardSpec> {
        let mut batch = Vec::with_capacity(capacity.min(self.len));
        while batch.len() < capacity {
            match self.next_shard() {
                Some(shard) => batch.push(shard),
                None => break,
            }
        }
        batch
    }

    fn next_shard(&mut self) -> Option<ShardSpec> {
        let kinds: Vec<String> = self.queues.keys().cloned().collect();
        if kinds.is_empty() {
            return None;
        }
        let start = self
            .last_served
            .as_ref()
            .and_then(|last| kinds.iter().position(|k| k > last))
            .unwrap_or(0);

        for offset in 0..kinds.len() {
            let kind = &kinds[(start + offset) % kinds.len()];
            if !self.kind_ready(kind) {
                continue;
            }
            let Some(queue) = self.queues.get_mut(kind) else {
                continue;
            };
            let (limits, in_flight) = (&self.stage_limits, &self.in_flight);
            let Some(pos) = queue
                .iter()
                .position(|s| stage_open(limits, in_flight, &s.stage_id))
            else {
                continue;
            };
            let shard = queue.remove(pos)?;
            if queue.is_empty() {
                self.queues.remove(kind);
            }
            self.forget(&shard);
            *self.in_flight.entry(shard.stage_id.clone()).or_default() += 1;
            self.last_served = Some(kind.clone());
            self.len -= 1;
            return Some(shard);
        }
        None
    }

    /// Release the in-flight slot a dispatched shard held
    pub fn complete(&mut self, stage_id: &str) {
        if let Some(n) = self.in_flight.get_mut(stage_id) {
            *n = n.saturating_sub(1);
        }
    }

    /// Whether `next_batch` would return anything
    pub fn has_ready(&self) -> bool {
        self.queued.keys().any(|kind| self.kind_ready(kind))
    }

    pub fn remove(&mut self, shard_id: &str) -> Option<ShardSpec> {
        self.remove_where(|s| s.shard_id == shard_id).into_iter().next()
    }

    /// Pull every queued shard matching `pred`, oldest first per kind
    pub fn remove_where<F>(&mut self, mut pred: F) -> Vec<ShardSpec>
    where
        F: FnMut(&ShardSpec) -> bool,
    {
        let mut removed = Vec::new();
        for queue in self.queues.values_mut() {
            let mut kept = VecDeque::with_capacity(queue.len());
            for shard in queue.drain(..) {
                if pred(&shard) {
                    removed.push(shard);
                } else {
                    kept.push_back(shard);
                }
            }
            *queue = kept;
        }
        self.queues.retain(|_, q| !q.is_empty());
        for shard in &removed {
            self.forget(shard);
        }
        self.len -= removed.len();
        removed
    }

    /// Empty every queue
    pub fn drain(&mut self) -> Vec<ShardSpec> {
        self.remove_where(|_| true)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

fn stage_open(
    limits: &HashMap<String, usize>,
    in_flight: &HashMap<String, usize>,
    stage_id: &str,
) -> bool {
    match limits.get(stage_id) {
        Some(limit) => in_flight.get(stage_id).copied().unwrap_or(0) < *limit,
        None => true,
    }
}
