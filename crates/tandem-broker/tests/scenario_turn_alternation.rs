//! Scenario: strict global turn alternation in the discussion thread.

use std::sync::Arc;

use tandem_broker as broker;
use tandem_broker::BrokerCtx;
use tandem_schemas::{AddMessageArgs, CreateReviewArgs, GetDiscussionArgs};

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
            intent: "Discussion test".to_string(),
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

fn msg(review_id: &str, role: &str, body: &str) -> AddMessageArgs {
    AddMessageArgs {
        review_id: review_id.to_string(),
        sender_role: role.to_string(),
        body: body.to_string(),
        metadata: None,
    }
}

#[tokio::test]
async fn either_party_may_open_then_roles_alternate() {
    let (_dir, ctx) = ctx().await;
    let id = new_review(&ctx).await;

    // Reviewer opens this thread.
    broker::add_message(&ctx, msg(&id, "reviewer", "why this approach?"))
        .await
        .unwrap();

    // Same sender again: refused.
    let err = broker::add_message(&ctx, msg(&id, "reviewer", "also..."))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("turn alternation"), "{err}");

    broker::add_message(&ctx, msg(&id, "proposer", "simpler rollback"))
        .await
        .unwrap();
    broker::add_message(&ctx, msg(&id, "reviewer", "fair enough"))
        .await
        .unwrap();

    let thread = broker::get_discussion(
        &ctx,
        GetDiscussionArgs {
            review_id: id.clone(),
            round: None,
        },
    )
    .await
    .unwrap();
    let roles: Vec<&str> = thread.iter().map(|m| m.sender_role.as_str()).collect();
    assert_eq!(roles, vec!["reviewer", "proposer", "reviewer"]);

    for pair in thread.windows(2) {
        assert_ne!(
            pair[0].sender_role, pair[1].sender_role,
            "consecutive messages must alternate"
        );
    }
}

#[tokio::test]
async fn invalid_inputs_are_argument_errors() {
    let (_dir, ctx) = ctx().await;
    let id = new_review(&ctx).await;

    let err = broker::add_message(&ctx, msg(&id, "observer", "hi"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("invalid sender_role"), "{err}");

    let err = broker::add_message(&ctx, msg(&id, "proposer", "   "))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("non-empty"), "{err}");

    let err = broker::add_message(&ctx, msg("missing", "proposer", "hi"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not found"), "{err}");
}

#[tokio::test]
async fn discussion_round_filter() {
    let (_dir, ctx) = ctx().await;
    let id = new_review(&ctx).await;

    broker::add_message(&ctx, msg(&id, "proposer", "round one message"))
        .await
        .unwrap();

    // Push the review to round 2 via changes_requested + revision.
    broker::claim_review(
        &ctx,
        tandem_schemas::ClaimReviewArgs {
            review_id: id.clone(),
            reviewer_id: "reviewer-1".to_string(),
        },
    )
    .await
    .unwrap();
    broker::submit_verdict(
        &ctx,
        tandem_schemas::SubmitVerdictArgs {
            review_id: id.clone(),
            verdict: "changes_requested".to_string(),
            reason: Some("split it".to_string()),
            counter_patch: None,
            reviewer_id: None,
            claim_generation: Some(1),
        },
    )
    .await
    .unwrap();
    broker::create_review(
        &ctx,
        CreateReviewArgs {
            intent: "Discussion test v2".to_string(),
            agent_type: "gsd-executor".to_string(),
            agent_role: "proposer".to_string(),
            phase: "1".to_string(),
            plan: None,
            task: None,
            description: None,
            diff: None,
            category: None,
            review_id: Some(id.clone()),
            skip_diff_validation: false,
        },
    )
    .await
    .unwrap();

    broker::add_message(&ctx, msg(&id, "reviewer", "round two message"))
        .await
        .unwrap();

    let round1 = broker::get_discussion(
        &ctx,
        GetDiscussionArgs {
            review_id: id.clone(),
            round: Some(1),
        },
    )
    .await
    .unwrap();
    assert_eq!(round1.len(), 1);
    assert_eq!(round1[0].body, "round one message");

    let round2 = broker::get_discussion(
        &ctx,
        GetDiscussionArgs {
            review_id: id.clone(),
            round: Some(2),
        },
    )
    .await
    .unwrap();
    assert_eq!(round2.len(), 1);
    assert_eq!(round2[0].round, 2);
}
