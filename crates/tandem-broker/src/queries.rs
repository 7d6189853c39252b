//! Read-only tool operations: listing, status long-poll, audit views, stats.

use std::time::Duration;

use anyhow::{anyhow, Result};

use tandem_db as db;
use tandem_schemas::{
    ActivityItem, AuditEventView, GetAuditLogArgs, GetReviewStatusArgs, ListReviewsArgs,
    ReviewDetail, ReviewStats, ReviewStatusResponse, ReviewSummary, ReviewerView,
};

use crate::views::{
    activity_item, audit_view, review_detail, review_summary, reviewer_view, status_response,
};
use crate::{BrokerCtx, MAX_LONG_POLL_SECONDS};

/// List reviews, critical first, oldest first within a priority band.
pub async fn list_reviews(ctx: &BrokerCtx, args: ListReviewsArgs) -> Result<Vec<ReviewSummary>> {
    let rows = db::list_reviews(&ctx.pool, args.status.as_deref(), args.category.as_deref())
        .await?;
    Ok(rows.iter().map(review_summary).collect())
}

/// Full record including the diff text. The only operation that inlines it.
pub async fn get_proposal(ctx: &BrokerCtx, review_id: &str) -> Result<ReviewDetail> {
    let row = db::fetch_review(&ctx.pool, review_id)
        .await?
        .ok_or_else(|| anyhow!("review not found: {}", review_id))?;
    Ok(review_detail(&row))
}

/// Current status, long-polling the notification bus when `wait` is set.
///
/// The wait ends at the earliest of a notification or the (capped) timeout;
/// either way the row is re-read afterwards, so a poller never observes
/// pre-notification state.
pub async fn get_review_status(
    ctx: &BrokerCtx,
    args: GetReviewStatusArgs,
) -> Result<ReviewStatusResponse> {
    if db::fetch_review(&ctx.pool, &args.review_id).await?.is_none() {
        return Err(anyhow!("review not found: {}", args.review_id));
    }

    if args.wait {
        let capped = args.timeout_seconds.clamp(0.0, MAX_LONG_POLL_SECONDS);
        ctx.bus
            .wait_for_change(&args.review_id, Duration::from_secs_f64(capped))
            .await;
    }

    let row = db::fetch_review(&ctx.pool, &args.review_id)
        .await?
        .ok_or_else(|| anyhow!("review not found: {}", args.review_id))?;
    let last = db::last_message_summary(&ctx.pool, &args.review_id).await?;
    Ok(status_response(&row, last))
}

/// All reviews with message counts and last-message previews, most recently
/// updated first.
pub async fn get_activity_feed(
    ctx: &BrokerCtx,
    args: ListReviewsArgs,
) -> Result<Vec<ActivityItem>> {
    let rows = db::activity_feed(&ctx.pool, args.status.as_deref(), args.category.as_deref())
        .await?;
    Ok(rows.iter().map(activity_item).collect())
}

/// Every audit event, optionally scoped to one review.
pub async fn get_audit_log(ctx: &BrokerCtx, args: GetAuditLogArgs) -> Result<Vec<AuditEventView>> {
    let rows = db::list_events(&ctx.pool, args.review_id.as_deref()).await?;
    Ok(rows.iter().map(audit_view).collect())
}

pub async fn get_review_stats(ctx: &BrokerCtx) -> Result<ReviewStats> {
    db::review_stats(&ctx.pool).await
}

/// Chronological audit events for one review.
pub async fn get_review_timeline(
    ctx: &BrokerCtx,
    review_id: &str,
) -> Result<Vec<AuditEventView>> {
    if db::fetch_review(&ctx.pool, review_id).await?.is_none() {
        return Err(anyhow!("review not found: {}", review_id));
    }
    let rows = db::review_timeline(&ctx.pool, review_id).await?;
    Ok(rows.iter().map(audit_view).collect())
}

/// All reviewer rows, live and historical.
pub async fn list_reviewers(ctx: &BrokerCtx) -> Result<Vec<ReviewerView>> {
    let rows = db::list_reviewers(&ctx.pool).await?;
    Ok(rows.iter().map(reviewer_view).collect())
}
