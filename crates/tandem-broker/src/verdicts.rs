//! Verdict submission: the fence check, managed-reviewer authorization, the
//! three verdict kinds, and reviewer statistics.

use anyhow::{anyhow, Result};
use serde_json::json;
use tracing::info;

use tandem_db as db;
use tandem_db::messages::preview;
use tandem_schemas::{events, SenderRole, SubmitVerdictArgs, Verdict, VerdictResponse};
use tandem_state::{assert_transition, ReviewStatus};

use crate::{BrokerCtx, PoolSignal};

pub async fn submit_verdict(ctx: &BrokerCtx, args: SubmitVerdictArgs) -> Result<VerdictResponse> {
    let verdict = Verdict::parse(&args.verdict)?;

    let reason = args
        .reason
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    if reason.is_none() && matches!(verdict, Verdict::ChangesRequested | Verdict::Comment) {
        return Err(anyhow!(
            "reason is required for verdict '{}'",
            verdict.as_str()
        ));
    }
    if args.counter_patch.is_some() && verdict == Verdict::Approved {
        return Err(anyhow!(
            "counter_patch is only accepted with changes_requested or comment"
        ));
    }
    // Validate before storage; an unappliable counter-patch never lands on
    // the row.
    if let Some(cp) = &args.counter_patch {
        ctx.ensure_diff_applies(cp).await?;
    }

    let now = db::now_legacy();

    let (final_status, holder, holder_managed) = {
        let _guard = ctx.write_lock.lock().await;
        let mut tx = db::WriteTx::begin(&ctx.pool).await?;
        let row = db::fetch_review(tx.conn(), &args.review_id)
            .await?
            .ok_or_else(|| anyhow!("review not found: {}", args.review_id))?;

        // Fence first: a caller with a stale generation gets the dedicated
        // error even when the review has since moved on entirely.
        if let Some(g) = args.claim_generation {
            if g != row.claim_generation {
                return Err(anyhow!(
                    "Stale claim: review {} is at generation {}, caller supplied generation {}; re-claim before submitting a verdict",
                    row.id,
                    row.claim_generation,
                    g
                ));
            }
        }

        let holder_managed = match &row.claimed_by {
            Some(holder) => db::fetch_reviewer(tx.conn(), holder).await?.is_some(),
            None => false,
        };
        if holder_managed {
            if let (Some(holder), Some(caller)) = (&row.claimed_by, &args.reviewer_id) {
                if holder != caller {
                    return Err(anyhow!(
                        "reviewer {} does not hold the claim on review {}",
                        caller,
                        row.id
                    ));
                }
            }
        }

        if !row.status.accepts_verdict() {
            return Err(anyhow!(
                "verdict requires a claimed review (review {} is {})",
                row.id,
                row.status
            ));
        }

        let actor = row
            .claimed_by
            .clone()
            .unwrap_or_else(|| "reviewer".to_string());

        let final_status = match verdict {
            Verdict::Comment => {
                let reason = reason.as_deref().expect("comment reason checked above");
                db::set_comment_reason(tx.conn(), &row.id, reason, &now).await?;
                if let Some(cp) = &args.counter_patch {
                    db::set_counter_patch(tx.conn(), &row.id, cp, &now).await?;
                }
                db::record_event(
                    tx.conn(),
                    Some(&row.id),
                    events::VERDICT_COMMENT,
                    &actor,
                    None,
                    None,
                    Some(&json!({
                        "preview": preview(reason),
                        "has_counter_patch": args.counter_patch.is_some(),
                    })),
                )
                .await?;

                // Comment wiring: surface the comment in the discussion so
                // the proposer can respond. Skipped when the reviewer already
                // holds the last turn; alternation is a hard invariant.
                let last = db::last_message_role(tx.conn(), &row.id).await?;
                if last.as_deref() != Some(SenderRole::Reviewer.as_str()) {
                    let msg = db::NewMessage {
                        id: db::new_id(),
                        review_id: row.id.clone(),
                        sender_role: SenderRole::Reviewer,
                        round: row.current_round,
                        body: reason.to_string(),
                        metadata: None,
                        created_at: now.clone(),
                    };
                    db::insert_message(tx.conn(), &msg).await?;
                    db::record_event(
                        tx.conn(),
                        Some(&row.id),
                        events::MESSAGE_SENT,
                        &actor,
                        None,
                        None,
                        Some(&json!({
                            "preview": preview(reason),
                            "round": row.current_round,
                            "sender_role": "reviewer",
                        })),
                    )
                    .await?;
                }
                row.status
            }
            Verdict::Approved | Verdict::ChangesRequested => {
                let to = if verdict == Verdict::Approved {
                    ReviewStatus::Approved
                } else {
                    ReviewStatus::ChangesRequested
                };
                assert_transition(row.status, to)?;
                db::set_verdict_status(tx.conn(), &row.id, to, reason.as_deref(), &now).await?;
                if let Some(cp) = &args.counter_patch {
                    db::set_counter_patch(tx.conn(), &row.id, cp, &now).await?;
                }
                db::record_event(
                    tx.conn(),
                    Some(&row.id),
                    events::VERDICT_SUBMITTED,
                    &actor,
                    Some(row.status.as_str()),
                    Some(to.as_str()),
                    Some(&json!({
                        "verdict": verdict.as_str(),
                        "has_counter_patch": args.counter_patch.is_some(),
                    })),
                )
                .await?;

                if holder_managed {
                    if let Some(holder) = &row.claimed_by {
                        let seconds = row
                            .claimed_at
                            .as_deref()
                            .and_then(db::legacy_age_seconds)
                            .unwrap_or(0.0)
                            .max(0.0);
                        db::record_verdict_outcome(
                            tx.conn(),
                            holder,
                            verdict == Verdict::Approved,
                            seconds,
                            &now,
                        )
                        .await?;
                    }
                }
                to
            }
        };

        tx.commit().await?;
        (final_status, row.claimed_by, holder_managed)
    };

    info!(
        review_id = %args.review_id,
        verdict = verdict.as_str(),
        status = final_status.as_str(),
        "verdict submitted"
    );
    ctx.bus.notify(&args.review_id);

    // A draining managed reviewer with no remaining claim can now be
    // retired; the pool makes that call.
    if holder_managed && verdict != Verdict::Comment {
        if let Some(holder) = holder {
            ctx.signal(PoolSignal::ReviewerIdle(holder));
        }
    }

    Ok(VerdictResponse {
        review_id: args.review_id,
        status: final_status.as_str().to_string(),
        verdict: verdict.as_str().to_string(),
    })
}
