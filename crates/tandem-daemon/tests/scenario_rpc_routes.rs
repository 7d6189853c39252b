//! In-process scenario tests for the tandem-daemon HTTP surface.
//!
//! These tests spin up the Axum router **without** binding a TCP socket.
//! Each test calls `routes::build_router` and drives it via
//! `tower::ServiceExt::oneshot`; no network I/O required.

use std::sync::Arc;

use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt; // oneshot

use tandem_daemon::{routes, state};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Fresh AppState over a temp SQLite file, pool disabled.
async fn make_state() -> (tempfile::TempDir, Arc<state::AppState>) {
    let dir = tempfile::tempdir().unwrap();
    let pool = tandem_db::connect(&dir.path().join("tandem.db")).await.unwrap();
    tandem_db::ensure_schema(&pool).await.unwrap();
    let ctx = tandem_broker::BrokerCtx::new(pool, None);
    (dir, state::AppState::new(ctx, None))
}

/// Drive the router with a single request and return (status, json body).
async fn call(router: axum::Router, req: Request<axum::body::Body>) -> (StatusCode, Value) {
    let resp = router.oneshot(req).await.expect("oneshot failed");
    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .expect("body collect failed")
        .to_bytes();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

fn rpc(op: &str, args: Value) -> Request<axum::body::Body> {
    Request::builder()
        .method("POST")
        .uri("/rpc")
        .header("content-type", "application/json")
        .header("x-tandem-session", "test-session")
        .body(axum::body::Body::from(
            serde_json::to_vec(&json!({"op": op, "args": args})).unwrap(),
        ))
        .unwrap()
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_returns_200_ok_true() {
    let (_dir, st) = make_state().await;
    let req = Request::builder()
        .method("GET")
        .uri("/v1/health")
        .body(axum::body::Body::empty())
        .unwrap();

    let (status, json) = call(routes::build_router(st), req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["ok"], true);
    assert_eq!(json["service"], "tandem-daemon");
    assert_eq!(json["pool_enabled"], false);
}

// ---------------------------------------------------------------------------
// POST /rpc: the tool surface
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_claim_verdict_over_the_wire() {
    let (_dir, st) = make_state().await;

    let (status, created) = call(
        routes::build_router(Arc::clone(&st)),
        rpc(
            "create_review",
            json!({
                "intent": "Add feature X",
                "agent_type": "gsd-executor",
                "agent_role": "proposer",
                "phase": "3",
                "category": "code_change",
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["status"], "pending");
    let review_id = created["review_id"].as_str().unwrap().to_string();

    let (status, list) = call(
        routes::build_router(Arc::clone(&st)),
        rpc("list_reviews", json!({"status": "pending"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(list
        .as_array()
        .unwrap()
        .iter()
        .any(|r| r["review_id"] == review_id.as_str()));

    let (status, claim) = call(
        routes::build_router(Arc::clone(&st)),
        rpc(
            "claim_review",
            json!({"review_id": review_id, "reviewer_id": "reviewer-1"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(claim["claim_generation"], 1);
    assert_eq!(claim["has_diff"], false);

    let (status, verdict) = call(
        routes::build_router(Arc::clone(&st)),
        rpc(
            "submit_verdict",
            json!({
                "review_id": review_id,
                "verdict": "approved",
                "claim_generation": 1,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(verdict["status"], "approved");

    let (status, timeline) = call(
        routes::build_router(Arc::clone(&st)),
        rpc("get_review_timeline", json!({"review_id": review_id})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let types: Vec<&str> = timeline
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["event_type"].as_str().unwrap())
        .collect();
    assert_eq!(types, vec!["review_created", "review_claimed", "verdict_submitted"]);
}

#[tokio::test]
async fn operation_errors_are_200_with_error_envelope() {
    let (_dir, st) = make_state().await;

    let (status, body) = call(
        routes::build_router(Arc::clone(&st)),
        rpc("get_proposal", json!({"review_id": "missing"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "app errors are not transport errors");
    assert!(body["error"].as_str().unwrap().contains("not found"));

    // Stale claim surfaces through the same envelope.
    let (_, created) = call(
        routes::build_router(Arc::clone(&st)),
        rpc(
            "create_review",
            json!({
                "intent": "x",
                "agent_type": "gsd-executor",
                "agent_role": "proposer",
                "phase": "1",
            }),
        ),
    )
    .await;
    let id = created["review_id"].as_str().unwrap();
    let _ = call(
        routes::build_router(Arc::clone(&st)),
        rpc("claim_review", json!({"review_id": id, "reviewer_id": "r1"})),
    )
    .await;
    let (status, body) = call(
        routes::build_router(Arc::clone(&st)),
        rpc(
            "submit_verdict",
            json!({"review_id": id, "verdict": "approved", "claim_generation": 7}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["error"].as_str().unwrap().starts_with("Stale claim"));
}

#[tokio::test]
async fn unknown_op_and_bad_args_are_rejected() {
    let (_dir, st) = make_state().await;

    let (status, body) = call(
        routes::build_router(Arc::clone(&st)),
        rpc("not_a_real_op", json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("unknown operation"));

    // Missing required fields: argument error in the envelope.
    let (status, body) = call(
        routes::build_router(Arc::clone(&st)),
        rpc("claim_review", json!({"review_id": "only-half"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("invalid arguments for claim_review"));
}

#[tokio::test]
async fn pool_ops_refused_when_pool_disabled() {
    let (_dir, st) = make_state().await;

    let (status, body) = call(
        routes::build_router(Arc::clone(&st)),
        rpc("spawn_reviewer", json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["error"].as_str().unwrap().contains("pool is disabled"));

    // list_reviewers still works (read view over the store).
    let (status, body) = call(
        routes::build_router(Arc::clone(&st)),
        rpc("list_reviewers", json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

// ---------------------------------------------------------------------------
// Dashboard
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dashboard_overview_is_read_only_json() {
    let (_dir, st) = make_state().await;

    let req = Request::builder()
        .method("GET")
        .uri("/dashboard/api/overview")
        .body(axum::body::Body::empty())
        .unwrap();
    let (status, json) = call(routes::build_router(Arc::clone(&st)), req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["service"], "tandem-daemon");
    assert_eq!(json["stats"]["total_reviews"], 0);
    assert!(json["activity"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn dashboard_page_is_served() {
    let (_dir, st) = make_state().await;

    let req = Request::builder()
        .method("GET")
        .uri("/dashboard")
        .body(axum::body::Body::empty())
        .unwrap();
    let resp = routes::build_router(st).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("tandem review broker"));
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let (_dir, st) = make_state().await;
    let req = Request::builder()
        .method("GET")
        .uri("/v1/does_not_exist")
        .body(axum::body::Body::empty())
        .unwrap();
    let (status, _) = call(routes::build_router(st), req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
