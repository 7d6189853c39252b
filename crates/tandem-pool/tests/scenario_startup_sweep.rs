//! Scenario: pool recovery after a broker restart.
//!
//! The broker died while a review was claimed by a previous session's
//! reviewer. On restart with a fresh session token, the recovery pass marks
//! prior-session reviewer rows terminated, observes the claim holder is not
//! in the live set, and reclaims the review to pending with the fence
//! advanced and a review_reclaimed audit row.

use std::sync::Arc;

use tandem_broker::BrokerCtx;
use tandem_config::PoolConfig;
use tandem_db as db;
use tandem_pool::ReviewerPool;
use tandem_schemas::{ClaimReviewArgs, CreateReviewArgs};

const TEMPLATE: &str = "You are {reviewer_id}. Broker: {broker_url}.";

fn cfg() -> PoolConfig {
    PoolConfig {
        model: "gpt-5-codex".to_string(),
        reasoning_effort: "medium".to_string(),
        max_pool_size: 3,
        idle_timeout_seconds: 300,
        max_ttl_seconds: 3600,
        claim_timeout_seconds: 600,
        spawn_cooldown_seconds: 10,
        scale_check_seconds: 30,
        workspace: None,
    }
}

async fn ctx() -> (tempfile::TempDir, Arc<BrokerCtx>) {
    let dir = tempfile::tempdir().unwrap();
    let pool = db::connect(&dir.path().join("tandem.db")).await.unwrap();
    db::ensure_schema(&pool).await.unwrap();
    (dir, BrokerCtx::new(pool, None))
}

#[tokio::test]
async fn restart_sweep_reclaims_orphaned_claims() {
    let (_dir, ctx) = ctx().await;

    // Previous session: reviewer row + a claim held by it.
    let old_reviewer = "codex-r1-deadbeef";
    {
        let mut tx = db::WriteTx::begin(&ctx.pool).await.unwrap();
        db::insert_reviewer(
            tx.conn(),
            &db::NewReviewer {
                id: old_reviewer.to_string(),
                display_name: "codex-r1".to_string(),
                session_token: "deadbeef".to_string(),
                pid: Some(4242),
                spawned_at: db::now_legacy(),
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
    }

    let review_id = tandem_broker::create_review(
        &ctx,
        CreateReviewArgs {
            intent: "Stuck review".to_string(),
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
    .review_id;

    tandem_broker::claim_review(
        &ctx,
        ClaimReviewArgs {
            review_id: review_id.clone(),
            reviewer_id: old_reviewer.to_string(),
        },
    )
    .await
    .unwrap();

    // New broker session.
    let pool = ReviewerPool::new(
        Arc::clone(&ctx),
        cfg(),
        "cafe0123".to_string(),
        "http://127.0.0.1:8321".to_string(),
        TEMPLATE.to_string(),
    )
    .unwrap();
    pool.startup_recovery().await.unwrap();

    // The stale reviewer row is terminated.
    let row = db::fetch_reviewer(&ctx.pool, old_reviewer)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, tandem_schemas::ReviewerStatus::Terminated);
    assert!(row.terminated_at.is_some());

    // The review is back in pending with the fence advanced.
    let review = tandem_broker::get_proposal(&ctx, &review_id).await.unwrap();
    assert_eq!(review.status, "pending");
    assert_eq!(review.claim_generation, 2);
    assert!(review.claimed_by.is_none());

    let timeline = tandem_broker::get_review_timeline(&ctx, &review_id)
        .await
        .unwrap();
    assert!(timeline.iter().any(|e| e.event_type == "review_reclaimed"));

    // A late verdict from the dead reviewer's generation is refused.
    let err = tandem_broker::submit_verdict(
        &ctx,
        tandem_schemas::SubmitVerdictArgs {
            review_id: review_id.clone(),
            verdict: "approved".to_string(),
            reason: None,
            counter_patch: None,
            reviewer_id: Some(old_reviewer.to_string()),
            claim_generation: Some(1),
        },
    )
    .await
    .unwrap_err();
    assert!(err.to_string().starts_with("Stale claim"), "{err}");
}

#[tokio::test]
async fn recovery_on_a_clean_store_is_a_no_op() {
    let (_dir, ctx) = ctx().await;
    let pool = ReviewerPool::new(
        Arc::clone(&ctx),
        cfg(),
        "cafe0123".to_string(),
        "http://127.0.0.1:8321".to_string(),
        TEMPLATE.to_string(),
    )
    .unwrap();
    pool.startup_recovery().await.unwrap();

    let events = db::list_events(&ctx.pool, None).await.unwrap();
    assert!(events.is_empty());
}

#[tokio::test]
async fn pool_construction_rejects_bad_templates() {
    let (_dir, ctx) = ctx().await;
    let err = ReviewerPool::new(
        Arc::clone(&ctx),
        cfg(),
        "cafe0123".to_string(),
        "http://127.0.0.1:8321".to_string(),
        "no placeholders here".to_string(),
    )
    .map(|_| ())
    .unwrap_err();
    assert!(err.to_string().contains("placeholder"), "{err}");
}
