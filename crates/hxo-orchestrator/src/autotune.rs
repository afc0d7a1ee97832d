//! Hot-shard detection
//!
//! Each stage keeps a rolling window of shard latencies. When the window's
//! p95 crosses the configured threshold the stage's still-pending shards are
//! refined into smaller ones. Shards already in flight are left alone.

use chrono::Utc;
use hxo_core::{AutosplitConfig, AutotuneSignal, SignalType};
use std::collections::VecDeque;

/// Rolling window of the most recent latencies, in milliseconds
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: VecDeque<u64>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, latency_ms: u64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Nearest-rank 95th percentile
    pub fn p95(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let rank = (sorted.len() as f64 * 0.95).ceil() as usize;
        sorted.get(rank.saturating_sub(1)).copied()
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

/// Decides when a stage should be split further
#[derive(Debug, Clone)]
pub struct AutosplitPolicy {
    config: AutosplitConfig,
}

impl AutosplitPolicy {
    pub fn new(config: AutosplitConfig) -> Self {
        Self { config }
    }

    pub fn window(&self) -> LatencyWindow {
        LatencyWindow::new(self.config.window)
    }

    pub fn factor(&self) -> u32 {
        self.config.factor
    }

    /// The p95 that justifies a split, if any
    pub fn should_split(&self, window: &LatencyWindow, generation: u32) -> Option<u64> {
        if !self.config.enabled()
            || generation >= self.config.max_generations
            || window.len() < self.config.min_samples
        {
            return None;
        }
        window.p95().filter(|p95| *p95 > self.config.p95_ms)
    }

    pub fn signal(&self, plan_id: &str, stage_id: &str, p95_ms: u64, refined: usize) -> AutotuneSignal {
        AutotuneSignal {
            plan_id: plan_id.to_string(),
            stage_id: stage_id.to_string(),
            signal_type: SignalType::HighLatency,
            metric_value: p95_ms as f64,
            suggested_action: format!(
                "split {} pending shards by factor {}",
                refined, self.config.factor
            ),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(p95_ms: u64) -> AutosplitConfig {
        AutosplitConfig {
            p95_ms,
            factor: 2,
            window: 20,
            min_samples: 5,
            max_generations: 2,
        }
    }

    #[test]
    fn test_p95_nearest_rank() {
        let mut w = LatencyWindow::new(100);
        for ms in 1..=100 {
            w.record(ms);
        }
        assert_eq!(w.p95(), Some(95));
        assert_eq!(LatencyWindow::new(4).p95(), None);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut w = LatencyWindow::new(3);
        for ms in [900, 1, 2, 3] {
            w.record(ms);
        }
        assert_eq!(w.len(), 3);
        assert_eq!(w.p95(), Some(3));
    }

    #[test]
    fn test_split_needs_samples_and_threshold() {
        let policy = AutosplitPolicy::new(config(100));
        let mut w = policy.window();
        for _ in 0..4 {
            w.record(500);
        }
        assert_eq!(policy.should_split(&w, 0), None);
        w.record(500);
        assert_eq!(policy.should_split(&w, 0), Some(500));
        assert_eq!(policy.should_split(&w, 2), None);

        w.reset();
        for _ in 0..10 {
            w.record(50);
        }
        assert_eq!(policy.should_split(&w, 0), None);
    }

    #[test]
    fn test_disabled_policy_never_splits() {
        let policy = AutosplitPolicy::new(config(0));
        let mut w = policy.window();
        for _ in 0..10 {
            w.record(u64::MAX / 2);
        }
        assert_eq!(policy.should_split(&w, 0), None);
    }
}
