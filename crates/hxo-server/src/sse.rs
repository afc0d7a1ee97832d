//! Server-Sent Events stream of orchestrator lifecycle events

use crate::error::ApiError;
use crate::server::SharedState;
use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

#[derive(Debug, Default, Deserialize)]
pub struct EventFilter {
    /// Only forward events of this plan
    pub plan_id: Option<String>,
}

/// GET /api/hxo/events
pub async fn sse_handler(
    State(app): State<SharedState>,
    Query(filter): Query<EventFilter>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let mut rx = app
        .events
        .as_ref()
        .ok_or(ApiError::EventsDisabled)?
        .subscribe();

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if filter.plan_id.as_deref().is_some_and(|id| id != event.plan_id) {
                        continue;
                    }
                    if let Ok(json) = serde_json::to_string(&event) {
                        yield Ok(Event::default().event(event.topic.to_string()).data(json));
                    }
                }
                // Slow client; tell it how much it missed and keep going
                Err(RecvError::Lagged(skipped)) => {
                    yield Ok(Event::default().event("lagged").data(skipped.to_string()));
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    ))
}
