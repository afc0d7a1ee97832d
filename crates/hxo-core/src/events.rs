//! Telemetry events published on the best-effort side channel

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventTopic {
    #[serde(rename = "hxo.plan.created")]
    PlanCreated,
    #[serde(rename = "hxo.shard.created")]
    ShardCreated,
    #[serde(rename = "hxo.shard.done")]
    ShardDone,
    #[serde(rename = "hxo.shard.failed")]
    ShardFailed,
    #[serde(rename = "hxo.autotune.signal")]
    AutotuneSignal,
    #[serde(rename = "hxo.aggregate.certify")]
    AggregateCertify,
    #[serde(rename = "hxo.audit")]
    Audit,
}

impl fmt::Display for EventTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PlanCreated => "hxo.plan.created",
            Self::ShardCreated => "hxo.shard.created",
            Self::ShardDone => "hxo.shard.done",
            Self::ShardFailed => "hxo.shard.failed",
            Self::AutotuneSignal => "hxo.autotune.signal",
            Self::AggregateCertify => "hxo.aggregate.certify",
            Self::Audit => "hxo.audit",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HxoEvent {
    pub topic: EventTopic,
    pub plan_id: String,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

impl HxoEvent {
    pub fn new(topic: EventTopic, plan_id: impl Into<String>, payload: Value) -> Self {
        Self {
            topic,
            plan_id: plan_id.into(),
            payload,
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    HighLatency,
    Hotspot,
    TimeoutRisk,
    QueueDepth,
}

/// Recommendation raised when a stage's observed latency drifts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutotuneSignal {
    pub plan_id: String,
    pub stage_id: String,
    pub signal_type: SignalType,
    pub metric_value: f64,
    pub suggested_action: String,
    pub timestamp: DateTime<Utc>,
}
