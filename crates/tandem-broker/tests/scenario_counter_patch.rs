//! Scenario: the counter-patch path.
//!
//! Reviewer rejects with an alternative diff; the proposer either accepts it
//! (diff replaced, affected files re-derived, round incremented, back to
//! pending) or rejects it (content cleared). Requires git on PATH.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use tandem_broker as broker;
use tandem_broker::BrokerCtx;
use tandem_schemas::{ClaimReviewArgs, CreateReviewArgs, SubmitVerdictArgs};

fn git(dir: &Path, args: &[&str]) {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", "test")
        .env("GIT_AUTHOR_EMAIL", "test@localhost")
        .env("GIT_COMMITTER_NAME", "test")
        .env("GIT_COMMITTER_EMAIL", "test@localhost")
        .output()
        .expect("run git");
    assert!(out.status.success(), "git {args:?} failed");
}

fn git_available() -> bool {
    Command::new("git").arg("--version").output().is_ok()
}

const PROPOSED_DIFF: &str = "\
--- a/hello.txt
+++ b/hello.txt
@@ -1,3 +1,4 @@
 one
 two
 three
+four
";

const ALT_DIFF: &str = "\
--- a/hello.txt
+++ b/hello.txt
@@ -1,3 +1,4 @@
 one
 two
 three
+FOUR
";

async fn ctx_with_repo() -> (tempfile::TempDir, Arc<BrokerCtx>) {
    let dir = tempfile::tempdir().unwrap();
    git(dir.path(), &["init", "-q"]);
    std::fs::write(dir.path().join("hello.txt"), "one\ntwo\nthree\n").unwrap();
    git(dir.path(), &["add", "."]);
    git(dir.path(), &["commit", "-q", "-m", "seed"]);

    let pool = tandem_db::connect(&dir.path().join("tandem.db")).await.unwrap();
    tandem_db::ensure_schema(&pool).await.unwrap();
    let ctx = BrokerCtx::new(pool, Some(dir.path().to_path_buf()));
    (dir, ctx)
}

async fn review_with_counter_patch(ctx: &BrokerCtx) -> String {
    let id = broker::create_review(
        ctx,
        CreateReviewArgs {
            intent: "Append a line".to_string(),
            agent_type: "gsd-executor".to_string(),
            agent_role: "proposer".to_string(),
            phase: "1".to_string(),
            plan: None,
            task: None,
            description: None,
            diff: Some(PROPOSED_DIFF.to_string()),
            category: Some("code_change".to_string()),
            review_id: None,
            skip_diff_validation: false,
        },
    )
    .await
    .unwrap()
    .review_id;

    broker::claim_review(
        ctx,
        ClaimReviewArgs {
            review_id: id.clone(),
            reviewer_id: "reviewer-1".to_string(),
        },
    )
    .await
    .unwrap();

    broker::submit_verdict(
        ctx,
        SubmitVerdictArgs {
            review_id: id.clone(),
            verdict: "changes_requested".to_string(),
            reason: Some("prefer uppercase".to_string()),
            counter_patch: Some(ALT_DIFF.to_string()),
            reviewer_id: None,
            claim_generation: Some(1),
        },
    )
    .await
    .unwrap();
    id
}

#[tokio::test]
async fn accept_replaces_diff_and_reopens_the_review() {
    if !git_available() {
        eprintln!("git not on PATH; skipping");
        return;
    }
    let (_dir, ctx) = ctx_with_repo().await;
    let id = review_with_counter_patch(&ctx).await;

    let before = broker::get_proposal(&ctx, &id).await.unwrap();
    assert_eq!(before.counter_patch.as_deref(), Some(ALT_DIFF));
    assert_eq!(before.counter_patch_status.as_deref(), Some("pending"));

    let accepted = broker::accept_counter_patch(&ctx, &id).await.unwrap();
    assert_eq!(accepted.status, "pending");
    assert_eq!(accepted.counter_patch_status, "accepted");
    assert_eq!(accepted.current_round, 2);

    let after = broker::get_proposal(&ctx, &id).await.unwrap();
    assert_eq!(after.diff.as_deref(), Some(ALT_DIFF));
    assert_eq!(after.affected_files.len(), 1);
    assert_eq!(after.current_round, 2);
    assert!(after.claimed_by.is_none());

    // The new round re-validates the accepted patch at claim time.
    let claim = broker::claim_review(
        &ctx,
        ClaimReviewArgs {
            review_id: id.clone(),
            reviewer_id: "reviewer-2".to_string(),
        },
    )
    .await
    .unwrap();
    assert_eq!(claim.claim_generation, 2);

    let timeline = broker::get_review_timeline(&ctx, &id).await.unwrap();
    assert!(timeline
        .iter()
        .any(|e| e.event_type == "counter_patch_accepted"));
}

#[tokio::test]
async fn reject_clears_the_patch_content() {
    if !git_available() {
        eprintln!("git not on PATH; skipping");
        return;
    }
    let (_dir, ctx) = ctx_with_repo().await;
    let id = review_with_counter_patch(&ctx).await;

    let rejected = broker::reject_counter_patch(&ctx, &id).await.unwrap();
    assert_eq!(rejected.counter_patch_status, "rejected");
    assert_eq!(rejected.status, "changes_requested");

    let after = broker::get_proposal(&ctx, &id).await.unwrap();
    assert!(after.counter_patch.is_none());
    assert_eq!(after.counter_patch_status.as_deref(), Some("rejected"));

    // Accepting after rejection is an error.
    let err = broker::accept_counter_patch(&ctx, &id).await.unwrap_err();
    assert!(err.to_string().contains("no pending counter-patch"), "{err}");
}

#[tokio::test]
async fn counter_patch_refused_with_approval() {
    if !git_available() {
        eprintln!("git not on PATH; skipping");
        return;
    }
    let (_dir, ctx) = ctx_with_repo().await;
    let id = broker::create_review(
        &ctx,
        CreateReviewArgs {
            intent: "Append a line".to_string(),
            agent_type: "gsd-executor".to_string(),
            agent_role: "proposer".to_string(),
            phase: "1".to_string(),
            plan: None,
            task: None,
            description: None,
            diff: Some(PROPOSED_DIFF.to_string()),
            category: None,
            review_id: None,
            skip_diff_validation: false,
        },
    )
    .await
    .unwrap()
    .review_id;

    broker::claim_review(
        &ctx,
        ClaimReviewArgs {
            review_id: id.clone(),
            reviewer_id: "reviewer-1".to_string(),
        },
    )
    .await
    .unwrap();

    let err = broker::submit_verdict(
        &ctx,
        SubmitVerdictArgs {
            review_id: id,
            verdict: "approved".to_string(),
            reason: None,
            counter_patch: Some(ALT_DIFF.to_string()),
            reviewer_id: None,
            claim_generation: Some(1),
        },
    )
    .await
    .unwrap_err();
    assert!(
        err.to_string().contains("changes_requested or comment"),
        "{err}"
    );
}
