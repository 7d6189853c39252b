//! Scenario: fenced reclaim.
//!
//! Reviewer A claims at generation 1 and goes silent. The reclaim sweep
//! returns the review to pending at generation 2. Reviewer B claims at
//! generation 3 and approves. A's delayed verdict carrying generation 1 is
//! refused with a stale-claim error and changes nothing.

use std::sync::Arc;

use tandem_broker as broker;
use tandem_broker::BrokerCtx;
use tandem_schemas::{ClaimReviewArgs, CreateReviewArgs, SubmitVerdictArgs};

async fn ctx() -> (tempfile::TempDir, Arc<BrokerCtx>) {
    let dir = tempfile::tempdir().unwrap();
    let pool = tandem_db::connect(&dir.path().join("tandem.db")).await.unwrap();
    tandem_db::ensure_schema(&pool).await.unwrap();
    (dir, BrokerCtx::new(pool, None))
}

fn create_args() -> CreateReviewArgs {
    CreateReviewArgs {
        intent: "Refactor the parser".to_string(),
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
    }
}

#[tokio::test]
async fn late_verdict_from_previous_holder_is_refused() {
    let (_dir, ctx) = ctx().await;

    let id = broker::create_review(&ctx, create_args())
        .await
        .unwrap()
        .review_id;

    let a = broker::claim_review(
        &ctx,
        ClaimReviewArgs {
            review_id: id.clone(),
            reviewer_id: "reviewer-A".to_string(),
        },
    )
    .await
    .unwrap();
    assert_eq!(a.claim_generation, 1);

    // Claim timeout elapsed; the sweep reclaims.
    let reclaimed = broker::reclaim_review(&ctx, &id, "claim timeout").await.unwrap();
    assert!(reclaimed);

    let status = broker::get_proposal(&ctx, &id).await.unwrap();
    assert_eq!(status.status, "pending");
    assert_eq!(status.claim_generation, 2);
    assert!(status.claimed_by.is_none());

    let b = broker::claim_review(
        &ctx,
        ClaimReviewArgs {
            review_id: id.clone(),
            reviewer_id: "reviewer-B".to_string(),
        },
    )
    .await
    .unwrap();
    assert_eq!(b.claim_generation, 3);

    broker::submit_verdict(
        &ctx,
        SubmitVerdictArgs {
            review_id: id.clone(),
            verdict: "approved".to_string(),
            reason: None,
            counter_patch: None,
            reviewer_id: None,
            claim_generation: Some(3),
        },
    )
    .await
    .unwrap();

    // A wakes up and submits with its remembered generation.
    let err = broker::submit_verdict(
        &ctx,
        SubmitVerdictArgs {
            review_id: id.clone(),
            verdict: "changes_requested".to_string(),
            reason: Some("too late".to_string()),
            counter_patch: None,
            reviewer_id: None,
            claim_generation: Some(1),
        },
    )
    .await
    .unwrap_err();
    assert!(
        err.to_string().starts_with("Stale claim"),
        "unexpected: {err}"
    );

    // State unchanged by the refused verdict.
    let after = broker::get_proposal(&ctx, &id).await.unwrap();
    assert_eq!(after.status, "approved");
    assert_eq!(after.claim_generation, 3);
    assert_eq!(after.verdict_reason, None);

    let timeline = broker::get_review_timeline(&ctx, &id).await.unwrap();
    let types: Vec<&str> = timeline.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(
        types,
        vec![
            "review_created",
            "review_claimed",
            "review_reclaimed",
            "review_claimed",
            "verdict_submitted",
        ]
    );
}

#[tokio::test]
async fn reclaim_is_a_no_op_on_non_claimed_reviews() {
    let (_dir, ctx) = ctx().await;
    let id = broker::create_review(&ctx, create_args())
        .await
        .unwrap()
        .review_id;

    assert!(!broker::reclaim_review(&ctx, &id, "sweep").await.unwrap());
    let row = broker::get_proposal(&ctx, &id).await.unwrap();
    assert_eq!(row.status, "pending");
    assert_eq!(row.claim_generation, 0, "no-op reclaim must not advance the fence");
}

#[tokio::test]
async fn stale_claim_leaves_messages_and_audit_untouched() {
    let (_dir, ctx) = ctx().await;
    let id = broker::create_review(&ctx, create_args())
        .await
        .unwrap()
        .review_id;

    broker::claim_review(
        &ctx,
        ClaimReviewArgs {
            review_id: id.clone(),
            reviewer_id: "reviewer-A".to_string(),
        },
    )
    .await
    .unwrap();

    let before = broker::get_review_timeline(&ctx, &id).await.unwrap().len();

    let err = broker::submit_verdict(
        &ctx,
        SubmitVerdictArgs {
            review_id: id.clone(),
            verdict: "approved".to_string(),
            reason: None,
            counter_patch: None,
            reviewer_id: None,
            claim_generation: Some(99),
        },
    )
    .await
    .unwrap_err();
    assert!(err.to_string().starts_with("Stale claim"));

    let after = broker::get_review_timeline(&ctx, &id).await.unwrap().len();
    assert_eq!(before, after, "refused verdict must not append audit rows");
}
