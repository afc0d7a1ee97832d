//! Axum routes over `HxoCore`
//!
//! Handlers only translate between HTTP and core calls; every behavioural
//! decision lives in the orchestrator.

use crate::auth::{PermissionChecker, PrivilegedAction};
use crate::error::ApiError;
use crate::sse;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use hxo_core::{PlanRequest, PlanStatus, PlanStatusReport};
use hxo_orchestrator::{BroadcastNotifier, HxoCore, PlanReport, ShardProof};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

/// Shared application state
pub struct AppState {
    pub core: HxoCore,
    pub permissions: Option<Arc<dyn PermissionChecker>>,
    /// Source for the event stream; `None` disables `/api/hxo/events`
    pub events: Option<BroadcastNotifier>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(core: HxoCore) -> Self {
        Self {
            core,
            permissions: None,
            events: None,
        }
    }

    pub fn with_permissions(mut self, checker: Arc<dyn PermissionChecker>) -> Self {
        self.permissions = Some(checker);
        self
    }

    pub fn with_events(mut self, events: BroadcastNotifier) -> Self {
        self.events = Some(events);
        self
    }

    async fn authorize(&self, action: PrivilegedAction, headers: &HeaderMap) -> Result<(), ApiError> {
        match &self.permissions {
            Some(checker) => checker.check(action, headers).await,
            None => Ok(()),
        }
    }
}

pub fn router(state: SharedState) -> Router {
    let api = Router::new()
        .route("/plan", post(create_plan))
        .route("/create-and-submit", post(create_and_submit))
        .route("/status/:plan_id", get(status))
        .route("/abort/:plan_id", post(abort))
        .route("/replay/:plan_id", post(replay))
        .route("/report/:plan_id", get(report))
        .route("/proof/:plan_id/:shard_id", get(proof))
        .route("/plans", get(list_plans))
        .route("/events", get(sse::sse_handler));

    Router::new()
        .nest("/api/hxo", api)
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until the listener fails or `shutdown` resolves
pub async fn serve(
    state: SharedState,
    addr: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HXO API listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub plan_id: String,
    pub name: String,
    pub status: &'static str,
    /// Always null at submission; the root exists only after certification
    pub merkle_seed: Option<String>,
    pub total_shards: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay_of: Option<String>,
}

impl From<PlanStatusReport> for SubmitResponse {
    fn from(report: PlanStatusReport) -> Self {
        Self {
            plan_id: report.plan_id,
            name: report.plan_name,
            status: "submitted",
            merkle_seed: None,
            total_shards: report.total_shards,
            replay_of: report.replay_of,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CreateResponse {
    pub name: String,
    pub stages: usize,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct AbortResponse {
    pub plan_id: String,
    pub status: PlanStatus,
}

/// POST /api/hxo/plan
///
/// Checks a request without persisting it. Nothing is stored between this
/// and a later submission; plans start through create-and-submit.
async fn create_plan(
    State(app): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<PlanRequest>,
) -> Result<Json<CreateResponse>, ApiError> {
    app.authorize(PrivilegedAction::Submit, &headers).await?;
    app.core.validate(&request)?;
    Ok(Json(CreateResponse {
        name: request.name,
        stages: request.stages.len(),
        status: "validated",
    }))
}

/// POST /api/hxo/create-and-submit
async fn create_and_submit(
    State(app): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<PlanRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    app.authorize(PrivilegedAction::Submit, &headers).await?;
    let report = app.core.submit(request).await?;
    Ok((StatusCode::CREATED, Json(report.into())))
}

/// GET /api/hxo/status/:plan_id
async fn status(
    State(app): State<SharedState>,
    Path(plan_id): Path<String>,
) -> Result<Json<PlanStatusReport>, ApiError> {
    Ok(Json(app.core.status(&plan_id).await?))
}

/// POST /api/hxo/abort/:plan_id
async fn abort(
    State(app): State<SharedState>,
    headers: HeaderMap,
    Path(plan_id): Path<String>,
) -> Result<Json<AbortResponse>, ApiError> {
    app.authorize(PrivilegedAction::Abort, &headers).await?;
    let report = app.core.abort(&plan_id).await?;
    Ok(Json(AbortResponse {
        plan_id: report.plan_id,
        status: report.status,
    }))
}

/// POST /api/hxo/replay/:plan_id
async fn replay(
    State(app): State<SharedState>,
    headers: HeaderMap,
    Path(plan_id): Path<String>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    app.authorize(PrivilegedAction::Replay, &headers).await?;
    let report = app.core.replay(&plan_id).await?;
    Ok((StatusCode::CREATED, Json(report.into())))
}

/// GET /api/hxo/report/:plan_id
async fn report(
    State(app): State<SharedState>,
    Path(plan_id): Path<String>,
) -> Result<Json<PlanReport>, ApiError> {
    Ok(Json(app.core.report(&plan_id).await?))
}

/// GET /api/hxo/proof/:plan_id/:shard_id
async fn proof(
    State(app): State<SharedState>,
    Path((plan_id, shard_id)): Path<(String, String)>,
) -> Result<Json<ShardProof>, ApiError> {
    Ok(Json(app.core.proof(&plan_id, &shard_id).await?))
}

/// GET /api/hxo/plans
async fn list_plans(
    State(app): State<SharedState>,
) -> Result<Json<Vec<PlanStatusReport>>, ApiError> {
    Ok(Json(app.core.list_plans().await?))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    accepting: bool,
    enabled: bool,
    live_plans: usize,
}

/// GET /health
async fn health(State(app): State<SharedState>) -> (StatusCode, Json<HealthResponse>) {
    let accepting = app.core.is_accepting();
    let status = if accepting {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            status: if accepting { "ok" } else { "degraded" },
            service: "hxo",
            accepting,
            enabled: app.core.config().enabled,
            live_plans: app.core.live_plans().await.len(),
        }),
    )
}
