//! Best-effort event publication
//!
//! Orchestration never waits on a notifier. Events go through a bounded
//! queue to a background task; a full queue drops the event with a warning
//! and a failed publish is logged and forgotten.

use async_trait::async_trait;
use hxo_core::fail_open::fail_open;
use hxo_core::{HxoEvent, Result};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Default depth of the event queue
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

/// Sink for lifecycle events
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, event: HxoEvent) -> Result<()>;
}

/// Discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn publish(&self, _event: HxoEvent) -> Result<()> {
        Ok(())
    }
}

/// Writes events to the tracing log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn publish(&self, event: HxoEvent) -> Result<()> {
        info!(topic = %event.topic, plan_id = %event.plan_id, payload = %event.payload, "event");
        Ok(())
    }
}

/// Fans events out to in-process subscribers
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<HxoEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HxoEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn publish(&self, event: HxoEvent) -> Result<()> {
        // No subscribers is not an error
        let _ = self.tx.send(event);
        Ok(())
    }
}

/// Non-blocking handle the control loop emits events through
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<HxoEvent>>,
}

impl EventSink {
    /// Start the publishing task. Must be called inside a Tokio runtime.
    pub fn spawn(notifier: Arc<dyn Notifier>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<HxoEvent>(capacity.max(1));
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let topic = event.topic;
                if fail_open("notifier", || notifier.publish(event)).await.is_none() {
                    debug!("dropped {} after publish failure", topic);
                }
            }
        });
        Self { tx: Some(tx) }
    }

    /// Sink that drops everything
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: HxoEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!("event queue full, dropping {} for {}", event.topic, event.plan_id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("event queue closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hxo_core::{EventTopic, HxoError};
    use serde_json::json;
    use std::time::Duration;

    struct Broken;

    #[async_trait]
    impl Notifier for Broken {
        async fn publish(&self, _event: HxoEvent) -> Result<()> {
            Err(HxoError::Other("bus down".into()))
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscriber() {
        let notifier = Arc::new(BroadcastNotifier::new(16));
        let mut rx = notifier.subscribe();
        let sink = EventSink::spawn(notifier.clone(), 16);

        sink.emit(HxoEvent::new(EventTopic::PlanCreated, "p1", json!({})));
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.topic, EventTopic::PlanCreated);
        assert_eq!(event.plan_id, "p1");
    }

    #[tokio::test]
    async fn test_failing_notifier_does_not_stop_sink() {
        let sink = EventSink::spawn(Arc::new(Broken), 4);
        for _ in 0..32 {
            sink.emit(HxoEvent::new(EventTopic::ShardDone, "p1", json!({})));
        }
    }

    #[test]
    fn test_disabled_sink_is_noop() {
        EventSink::disabled().emit(HxoEvent::new(EventTopic::Audit, "p1", json!({})));
    }
}
