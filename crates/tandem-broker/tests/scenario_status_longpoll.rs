//! Scenario: long-polling get_review_status.
//!
//! A waiting poller wakes as soon as a verdict lands, well before its
//! timeout; with no event the wait returns within the timeout bound; the
//! timeout itself is capped below the transport budget.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tandem_broker as broker;
use tandem_broker::BrokerCtx;
use tandem_schemas::{ClaimReviewArgs, CreateReviewArgs, GetReviewStatusArgs, SubmitVerdictArgs};

async fn ctx() -> (tempfile::TempDir, Arc<BrokerCtx>) {
    let dir = tempfile::tempdir().unwrap();
    let pool = tandem_db::connect(&dir.path().join("tandem.db")).await.unwrap();
    tandem_db::ensure_schema(&pool).await.unwrap();
    (dir, BrokerCtx::new(pool, None))
}

async fn new_review(ctx: &BrokerCtx) -> String {
    broker::create_review(
        ctx,
        CreateReviewArgs {
            intent: "Long-poll test".to_string(),
            agent_type: "gsd-executor".to_string(),
            agent_role: "proposer".to_string(),
            phase: "1".to_string(),
            plan: None,
            task: None,
            description: None,
            diff: None,
            category: None,
            review_id: None,
            skip_diff_validation: false,
        },
    )
    .await
    .unwrap()
    .review_id
}

#[tokio::test]
async fn waiter_wakes_on_state_change() {
    let (_dir, ctx) = ctx().await;
    let id = new_review(&ctx).await;
    broker::claim_review(
        &ctx,
        ClaimReviewArgs {
            review_id: id.clone(),
            reviewer_id: "reviewer-1".to_string(),
        },
    )
    .await
    .unwrap();

    let waiter = {
        let ctx = Arc::clone(&ctx);
        let id = id.clone();
        tokio::spawn(async move {
            let start = Instant::now();
            let status = broker::get_review_status(
                &ctx,
                GetReviewStatusArgs {
                    review_id: id,
                    wait: true,
                    timeout_seconds: 20.0,
                },
            )
            .await
            .unwrap();
            (status, start.elapsed())
        })
    };

    // Let the waiter park, then approve.
    tokio::time::sleep(Duration::from_millis(100)).await;
    broker::submit_verdict(
        &ctx,
        SubmitVerdictArgs {
            review_id: id.clone(),
            verdict: "approved".to_string(),
            reason: None,
            counter_patch: None,
            reviewer_id: None,
            claim_generation: Some(1),
        },
    )
    .await
    .unwrap();

    let (status, elapsed) = waiter.await.unwrap();
    assert_eq!(status.status, "approved");
    assert!(
        elapsed < Duration::from_secs(5),
        "waiter should wake on notify, took {elapsed:?}"
    );
}

#[tokio::test]
async fn wait_returns_within_timeout_when_nothing_happens() {
    let (_dir, ctx) = ctx().await;
    let id = new_review(&ctx).await;

    let start = Instant::now();
    let status = broker::get_review_status(
        &ctx,
        GetReviewStatusArgs {
            review_id: id,
            wait: true,
            timeout_seconds: 0.2,
        },
    )
    .await
    .unwrap();
    let elapsed = start.elapsed();

    assert_eq!(status.status, "pending");
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(2));
}

#[tokio::test]
async fn polling_fallback_returns_immediately() {
    let (_dir, ctx) = ctx().await;
    let id = new_review(&ctx).await;

    let start = Instant::now();
    let status = broker::get_review_status(
        &ctx,
        GetReviewStatusArgs {
            review_id: id,
            wait: false,
            timeout_seconds: 25.0,
        },
    )
    .await
    .unwrap();
    assert_eq!(status.status, "pending");
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(status.last_message.is_none());
}

#[tokio::test]
async fn unknown_review_is_an_error_not_a_hang() {
    let (_dir, ctx) = ctx().await;
    let start = Instant::now();
    let err = broker::get_review_status(
        &ctx,
        GetReviewStatusArgs {
            review_id: "missing".to_string(),
            wait: true,
            timeout_seconds: 25.0,
        },
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("not found"));
    assert!(start.elapsed() < Duration::from_secs(1));
}
