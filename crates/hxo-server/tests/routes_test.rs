//! Route tests driven through `tower::ServiceExt::oneshot`
//!
//! The router is exercised in-process against a core backed by the memory
//! checkpoint store.

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use hxo_core::HxoConfig;
use hxo_orchestrator::HxoCore;
use hxo_server::{router, AppState, StaticTokenChecker};
use hxo_storage::MemoryCheckpointer;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn test_core() -> HxoCore {
    HxoCore::builder(HxoConfig::default(), Arc::new(MemoryCheckpointer::new())).build()
}

fn app(core: HxoCore) -> Router {
    router(Arc::new(AppState::new(core)))
}

fn secured_app(core: HxoCore, token: &str) -> Router {
    let state = AppState::new(core).with_permissions(Arc::new(StaticTokenChecker::new(token)));
    router(Arc::new(state))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn plan_body(count: u64) -> Value {
    json!({
        "name": "api-plan",
        "stages": [
            { "id": "lint", "kind": "echo", "partitioner": "by_count", "input": { "count": count } }
        ],
        "constraints": { "max_shards": 1000 }
    })
}

#[tokio::test]
async fn test_health() {
    let app = app(test_core());
    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["accepting"], true);
}

#[tokio::test]
async fn test_submit_then_status() {
    let core = test_core();
    let app = app(core.clone());

    let (status, body) = send(&app, post_json("/api/hxo/create-and-submit", plan_body(5))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "submitted");
    assert_eq!(body["name"], "api-plan");
    assert_eq!(body["total_shards"], 5);
    assert!(body["merkle_seed"].is_null());

    let plan_id = body["plan_id"].as_str().unwrap().to_string();
    core.wait(&plan_id, Duration::from_secs(10)).await.unwrap();

    let (status, body) = send(&app, get(&format!("/api/hxo/status/{}", plan_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["plan_id"], plan_id.as_str());
    assert_eq!(body["done_shards"], 5);
    assert_eq!(body["truth_certified"], true);
    assert!(body["merkle_root"].is_string());

    let (status, body) = send(&app, get(&format!("/api/hxo/report/{}", plan_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["report_type"], "final");
    assert_eq!(body["stages"][0]["done_shards"], 5);

    let (status, body) = send(&app, get("/api/hxo/plans")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_plan_route_validates_without_storing() {
    let core = test_core();
    let app = app(core.clone());

    let (status, body) = send(&app, post_json("/api/hxo/plan", plan_body(5))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "validated");
    assert_eq!(body["name"], "api-plan");
    assert_eq!(body["stages"], 1);
    assert!(core.checkpointer().list_plans().await.unwrap().is_empty());

    let mut bad = plan_body(5);
    bad["constraints"]["max_shards"] = json!(0);
    let (status, _) = send(&app, post_json("/api/hxo/plan", bad)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_proof_route() {
    let core = test_core();
    let app = app(core.clone());
    let (_, body) = send(&app, post_json("/api/hxo/create-and-submit", plan_body(3))).await;
    let plan_id = body["plan_id"].as_str().unwrap().to_string();
    core.wait(&plan_id, Duration::from_secs(10)).await.unwrap();

    let shard_id = core.checkpointer().list_shards(&plan_id).await.unwrap()[0]
        .shard_id
        .clone();
    let (status, body) =
        send(&app, get(&format!("/api/hxo/proof/{}/{}", plan_id, shard_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["verified"], true);
    assert_eq!(body["leaf"]["shard_id"], shard_id.as_str());
}

#[tokio::test]
async fn test_unknown_plan_is_404() {
    let app = app(test_core());
    let (status, body) = send(&app, get("/api/hxo/status/missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");

    let (status, _) = send(&app, post("/api/hxo/abort/missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_submission_is_400() {
    let app = app(test_core());
    let body = json!({
        "name": "bad",
        "stages": [ { "id": "a", "kind": "no-such-executor", "input": { "count": 1 } } ]
    });
    let (status, body) = send(&app, post_json("/api/hxo/create-and-submit", body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation");
}

#[tokio::test]
async fn test_abort_finished_plan_reports_its_status() {
    let core = test_core();
    let app = app(core.clone());
    let (_, body) = send(&app, post_json("/api/hxo/create-and-submit", plan_body(2))).await;
    let plan_id = body["plan_id"].as_str().unwrap().to_string();
    core.wait(&plan_id, Duration::from_secs(10)).await.unwrap();

    let (status, body) = send(&app, post(&format!("/api/hxo/abort/{}", plan_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["plan_id"], plan_id.as_str());
    assert_eq!(body["status"], "done");
}

#[tokio::test]
async fn test_replay_without_failures_is_rejected() {
    let core = test_core();
    let app = app(core.clone());
    let (_, body) = send(&app, post_json("/api/hxo/create-and-submit", plan_body(2))).await;
    let plan_id = body["plan_id"].as_str().unwrap().to_string();
    core.wait(&plan_id, Duration::from_secs(10)).await.unwrap();

    let (status, _) = send(&app, post(&format!("/api/hxo/replay/{}", plan_id))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_privileged_routes_require_token() {
    let app = secured_app(test_core(), "s3cret");

    let (status, _) = send(&app, post_json("/api/hxo/create-and-submit", plan_body(1))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let mut request = post_json("/api/hxo/create-and-submit", plan_body(1));
    request
        .headers_mut()
        .insert(header::AUTHORIZATION, "Bearer wrong".parse().unwrap());
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let mut request = post_json("/api/hxo/create-and-submit", plan_body(1));
    request
        .headers_mut()
        .insert(header::AUTHORIZATION, "Bearer s3cret".parse().unwrap());
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::CREATED);

    // Reads stay open
    let (status, _) = send(&app, get("/api/hxo/plans")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_events_route_disabled_without_source() {
    let app = app(test_core());
    let (status, body) = send(&app, get("/api/hxo/events")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "events_disabled");
}
