//! Review lifecycle operations: create, revise, claim, close, counter-patch
//! decisions, and the fenced reclaim used by the pool manager.

use anyhow::{anyhow, Result};
use serde_json::json;
use tracing::{info, warn};

use tandem_db as db;
use tandem_diff::affected_files_json;
use tandem_schemas::{
    events, infer_priority, ClaimReviewArgs, ClaimReviewResponse, CloseReviewResponse,
    CounterPatchResponse, CreateReviewArgs, CreateReviewResponse,
};
use tandem_state::{assert_transition, next_generation, ReviewStatus};

use crate::views::parse_affected;
use crate::{BrokerCtx, PoolSignal};

/// Create a new review, or revise an existing one when `review_id` is set.
pub async fn create_review(
    ctx: &BrokerCtx,
    args: CreateReviewArgs,
) -> Result<CreateReviewResponse> {
    if args.intent.trim().is_empty() {
        return Err(anyhow!("intent must be a non-empty string"));
    }
    if let Some(review_id) = args.review_id.clone() {
        return revise_review(ctx, &review_id, args).await;
    }

    // Validate before any row exists; an unappliable diff never enters the
    // queue unless the proposer explicitly opted out (post-commit review).
    let affected_files = match &args.diff {
        Some(diff) => {
            if !args.skip_diff_validation {
                ctx.ensure_diff_applies(diff).await?;
            }
            Some(affected_files_json(diff))
        }
        None => None,
    };

    let id = db::new_id();
    let now = db::now_legacy();
    let priority = infer_priority(&args.agent_type, Some(&args.phase));

    let review = db::NewReview {
        id: id.clone(),
        intent: args.intent.clone(),
        description: args.description.clone(),
        diff: args.diff.clone(),
        affected_files,
        agent_type: args.agent_type.clone(),
        agent_role: args.agent_role.clone(),
        phase: args.phase.clone(),
        plan: args.plan.clone(),
        task: args.task.clone(),
        category: args.category.clone(),
        priority,
        parent_id: None,
        created_at: now.clone(),
        updated_at: now,
    };

    {
        let _guard = ctx.write_lock.lock().await;
        let mut tx = db::WriteTx::begin(&ctx.pool).await?;
        db::insert_review(tx.conn(), &review).await?;
        db::record_event(
            tx.conn(),
            Some(&id),
            events::REVIEW_CREATED,
            &args.agent_type,
            None,
            Some("pending"),
            Some(&json!({
                "category": args.category,
                "priority": priority.as_str(),
                "has_diff": args.diff.is_some(),
            })),
        )
        .await?;
        tx.commit().await?;
    }

    info!(review_id = %id, priority = priority.as_str(), "review created");
    ctx.bus.notify(&id);
    ctx.signal(PoolSignal::ReviewCreated);

    Ok(CreateReviewResponse {
        review_id: id,
        status: "pending".to_string(),
        priority: priority.as_str().to_string(),
        category: args.category,
        current_round: 1,
    })
}

/// Revision path: the review must be awaiting changes; content is replaced
/// atomically and the review re-enters the queue as a new round.
async fn revise_review(
    ctx: &BrokerCtx,
    review_id: &str,
    args: CreateReviewArgs,
) -> Result<CreateReviewResponse> {
    if let Some(diff) = &args.diff {
        if !args.skip_diff_validation {
            ctx.ensure_diff_applies(diff).await?;
        }
    }
    let affected_files = args.diff.as_deref().map(affected_files_json);
    let now = db::now_legacy();

    let (round, priority, category) = {
        let _guard = ctx.write_lock.lock().await;
        let mut tx = db::WriteTx::begin(&ctx.pool).await?;
        let row = db::fetch_review(tx.conn(), review_id)
            .await?
            .ok_or_else(|| anyhow!("review not found: {}", review_id))?;

        if row.status != ReviewStatus::ChangesRequested {
            return Err(anyhow!(
                "revision requires status changes_requested (review {} is {})",
                review_id,
                row.status
            ));
        }

        let round = row.current_round + 1;
        db::apply_revision(
            tx.conn(),
            review_id,
            &args.intent,
            args.description.as_deref(),
            args.diff.as_deref(),
            affected_files.as_deref(),
            round,
            &now,
        )
        .await?;
        db::record_event(
            tx.conn(),
            Some(review_id),
            events::REVIEW_REVISED,
            &args.agent_type,
            Some("changes_requested"),
            Some("pending"),
            Some(&json!({ "round": round })),
        )
        .await?;
        tx.commit().await?;
        (round, row.priority, row.category)
    };

    info!(review_id, round, "review revised");
    ctx.bus.notify(review_id);
    ctx.signal(PoolSignal::ReviewCreated);

    Ok(CreateReviewResponse {
        review_id: review_id.to_string(),
        status: "pending".to_string(),
        priority: priority.as_str().to_string(),
        category,
        current_round: round,
    })
}

/// Claim a pending review for a reviewer.
///
/// The diff is re-validated under the write mutex to catch working-tree
/// drift between submission and claim; a failure auto-rejects the review
/// instead of handing the reviewer a diff that no longer applies.
pub async fn claim_review(ctx: &BrokerCtx, args: ClaimReviewArgs) -> Result<ClaimReviewResponse> {
    let now = db::now_legacy();

    let (response, managed) = {
        let _guard = ctx.write_lock.lock().await;
        let mut tx = db::WriteTx::begin(&ctx.pool).await?;
        let row = db::fetch_review(tx.conn(), &args.review_id)
            .await?
            .ok_or_else(|| anyhow!("review not found: {}", args.review_id))?;

        assert_transition(row.status, ReviewStatus::Claimed)?;

        if let Some(diff) = &row.diff {
            let root = ctx
                .repo_root
                .as_ref()
                .ok_or_else(|| anyhow!("repository root unavailable; cannot validate diff"))?;
            let check = tandem_diff::validate_diff(diff, root).await?;
            if !check.valid {
                let reason = format!(
                    "Auto-rejected: diff does not apply cleanly.\n\n{}",
                    check.detail
                );
                db::set_auto_rejected(tx.conn(), &row.id, &reason, &now).await?;
                db::record_event(
                    tx.conn(),
                    Some(&row.id),
                    events::REVIEW_AUTO_REJECTED,
                    "broker",
                    Some(row.status.as_str()),
                    Some("changes_requested"),
                    Some(&json!({ "detail": check.detail })),
                )
                .await?;
                tx.commit().await?;
                warn!(review_id = %row.id, "claim auto-rejected: diff no longer applies");
                ctx.bus.notify(&row.id);
                return Err(anyhow!("{}", reason));
            }
        }

        let generation = next_generation(row.claim_generation);
        db::mark_claimed(tx.conn(), &row.id, &args.reviewer_id, generation, &now).await?;
        db::record_event(
            tx.conn(),
            Some(&row.id),
            events::REVIEW_CLAIMED,
            &args.reviewer_id,
            Some(row.status.as_str()),
            Some("claimed"),
            Some(&json!({ "claim_generation": generation })),
        )
        .await?;
        let managed = db::fetch_reviewer(tx.conn(), &args.reviewer_id)
            .await?
            .is_some();
        tx.commit().await?;

        (
            ClaimReviewResponse {
                review_id: row.id.clone(),
                status: "claimed".to_string(),
                intent: row.intent.clone(),
                description: row.description.clone(),
                affected_files: parse_affected(row.affected_files.as_deref()),
                category: row.category.clone(),
                claim_generation: generation,
                has_diff: row.diff.is_some(),
            },
            managed,
        )
    };

    if managed {
        db::touch_last_active(&ctx.pool, &args.reviewer_id, &now).await?;
    }

    info!(
        review_id = %response.review_id,
        reviewer = %args.reviewer_id,
        generation = response.claim_generation,
        "review claimed"
    );
    ctx.bus.notify(&response.review_id);
    Ok(response)
}

/// Close an approved or changes-requested review. Terminal.
pub async fn close_review(ctx: &BrokerCtx, review_id: &str) -> Result<CloseReviewResponse> {
    let now = db::now_legacy();
    {
        let _guard = ctx.write_lock.lock().await;
        let mut tx = db::WriteTx::begin(&ctx.pool).await?;
        let row = db::fetch_review(tx.conn(), review_id)
            .await?
            .ok_or_else(|| anyhow!("review not found: {}", review_id))?;

        assert_transition(row.status, ReviewStatus::Closed)?;
        db::set_closed(tx.conn(), review_id, &now).await?;
        db::record_event(
            tx.conn(),
            Some(review_id),
            events::REVIEW_CLOSED,
            "proposer",
            Some(row.status.as_str()),
            Some("closed"),
            None,
        )
        .await?;
        tx.commit().await?;
    }

    info!(review_id, "review closed");
    ctx.bus.notify(review_id);
    ctx.bus.remove(review_id);

    Ok(CloseReviewResponse {
        review_id: review_id.to_string(),
        status: "closed".to_string(),
    })
}

/// Proposer takes the reviewer's patch: it becomes the review diff and the
/// review re-enters the queue as a new round.
pub async fn accept_counter_patch(
    ctx: &BrokerCtx,
    review_id: &str,
) -> Result<CounterPatchResponse> {
    let now = db::now_legacy();

    let round = {
        let _guard = ctx.write_lock.lock().await;
        let mut tx = db::WriteTx::begin(&ctx.pool).await?;
        let row = db::fetch_review(tx.conn(), review_id)
            .await?
            .ok_or_else(|| anyhow!("review not found: {}", review_id))?;

        if row.counter_patch_status.as_deref() != Some("pending") {
            return Err(anyhow!("no pending counter-patch on review {}", review_id));
        }
        let patch = row
            .counter_patch
            .clone()
            .ok_or_else(|| anyhow!("no pending counter-patch on review {}", review_id))?;

        assert_transition(row.status, ReviewStatus::Pending)?;

        // Re-validate under the mutex; a stale counter-patch is an error
        // with no state change.
        let root = ctx
            .repo_root
            .as_ref()
            .ok_or_else(|| anyhow!("repository root unavailable; cannot validate diff"))?;
        let check = tandem_diff::validate_diff(&patch, root).await?;
        if !check.valid {
            return Err(anyhow!(
                "counter-patch no longer applies: {}",
                check.detail
            ));
        }

        let affected = affected_files_json(&patch);
        let round = row.current_round + 1;
        db::mark_counter_patch_accepted(tx.conn(), review_id, &patch, &affected, round, &now)
            .await?;
        db::record_event(
            tx.conn(),
            Some(review_id),
            events::COUNTER_PATCH_ACCEPTED,
            "proposer",
            Some(row.status.as_str()),
            Some("pending"),
            Some(&json!({ "round": round })),
        )
        .await?;
        tx.commit().await?;
        round
    };

    info!(review_id, round, "counter-patch accepted");
    ctx.bus.notify(review_id);

    Ok(CounterPatchResponse {
        review_id: review_id.to_string(),
        status: "pending".to_string(),
        counter_patch_status: "accepted".to_string(),
        current_round: round,
    })
}

/// Proposer declines the counter-patch; the content is cleared.
pub async fn reject_counter_patch(
    ctx: &BrokerCtx,
    review_id: &str,
) -> Result<CounterPatchResponse> {
    let now = db::now_legacy();

    let (status, round) = {
        let _guard = ctx.write_lock.lock().await;
        let mut tx = db::WriteTx::begin(&ctx.pool).await?;
        let row = db::fetch_review(tx.conn(), review_id)
            .await?
            .ok_or_else(|| anyhow!("review not found: {}", review_id))?;

        if row.counter_patch_status.as_deref() != Some("pending") {
            return Err(anyhow!("no pending counter-patch on review {}", review_id));
        }

        db::mark_counter_patch_rejected(tx.conn(), review_id, &now).await?;
        db::record_event(
            tx.conn(),
            Some(review_id),
            events::COUNTER_PATCH_REJECTED,
            "proposer",
            None,
            None,
            None,
        )
        .await?;
        tx.commit().await?;
        (row.status, row.current_round)
    };

    ctx.bus.notify(review_id);

    Ok(CounterPatchResponse {
        review_id: review_id.to_string(),
        status: status.as_str().to_string(),
        counter_patch_status: "rejected".to_string(),
        current_round: round,
    })
}

/// Fenced reclaim: return a stuck `claimed` review to `pending` and advance
/// the fence so any late verdict from the previous holder is refused.
///
/// Used by the claim-timeout sweep and the startup ownership sweep. A review
/// that is no longer `claimed` when the sweep reaches it is left alone.
pub async fn reclaim_review(ctx: &BrokerCtx, review_id: &str, reason: &str) -> Result<bool> {
    let now = db::now_legacy();

    let reclaimed = {
        let _guard = ctx.write_lock.lock().await;
        let mut tx = db::WriteTx::begin(&ctx.pool).await?;
        let row = db::fetch_review(tx.conn(), review_id)
            .await?
            .ok_or_else(|| anyhow!("review not found: {}", review_id))?;

        if row.status != ReviewStatus::Claimed {
            return Ok(false);
        }

        let generation = next_generation(row.claim_generation);
        db::reclaim_to_pending(tx.conn(), review_id, generation, &now).await?;
        db::record_event(
            tx.conn(),
            Some(review_id),
            events::REVIEW_RECLAIMED,
            "broker",
            Some("claimed"),
            Some("pending"),
            Some(&json!({
                "reason": reason,
                "previous_reviewer": row.claimed_by,
                "claim_generation": generation,
            })),
        )
        .await?;
        tx.commit().await?;
        true
    };

    if reclaimed {
        warn!(review_id, reason, "review reclaimed");
        ctx.bus.notify(review_id);
    }
    Ok(reclaimed)
}
