//! # hxo-server
//!
//! Thin HTTP surface for the Hypshard-X orchestrator: submission, status,
//! abort, replay, reports, inclusion proofs and a live event stream.

mod auth;
mod error;
mod server;
mod sse;

pub use auth::{PermissionChecker, PrivilegedAction, StaticTokenChecker};
pub use error::ApiError;
pub use server::{router, serve, AbortResponse, AppState, SharedState, SubmitResponse};
pub use sse::EventFilter;

use hxo_core::ServerConfig;
use hxo_orchestrator::{BroadcastNotifier, HxoCore};
use std::sync::Arc;
use tracing::info;

/// Serve `core` on `config.bind` until Ctrl+C, then halt every plan runner.
/// Halted plans resume on the next start.
pub async fn run(
    core: HxoCore,
    events: Option<BroadcastNotifier>,
    config: &ServerConfig,
) -> anyhow::Result<()> {
    let mut state = AppState::new(core.clone());
    if let Some(token) = &config.admin_token {
        state = state.with_permissions(Arc::new(StaticTokenChecker::new(token.clone())));
    }
    if let Some(events) = events {
        state = state.with_events(events);
    }

    println!("HXO API running at http://{}", config.bind);
    println!("Press Ctrl+C to stop");

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
    };
    let served = serve(Arc::new(state), &config.bind, shutdown).await;
    core.halt().await;
    served
}
