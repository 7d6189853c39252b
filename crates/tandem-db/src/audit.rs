//! Append-only audit event stream and its derived read views.
//!
//! `record_event` runs on the caller's write transaction so the event commits
//! or rolls back with the operation that produced it. Rows are never updated
//! or deleted.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::{Row, SqliteConnection, SqlitePool};

use tandem_schemas::ReviewStats;

use crate::now_iso_millis;

#[derive(Debug, Clone)]
pub struct AuditEventRow {
    pub id: i64,
    pub review_id: Option<String>,
    pub event_type: String,
    pub actor: String,
    pub old_status: Option<String>,
    pub new_status: Option<String>,
    pub metadata: Option<String>,
    pub created_at: String,
}

/// Append one audit event within the caller's transaction.
pub async fn record_event(
    conn: &mut SqliteConnection,
    review_id: Option<&str>,
    event_type: &str,
    actor: &str,
    old_status: Option<&str>,
    new_status: Option<&str>,
    metadata: Option<&Value>,
) -> Result<()> {
    let metadata_text = metadata
        .map(serde_json::to_string)
        .transpose()
        .context("serialize audit metadata")?;

    sqlx::query(
        r#"
        INSERT INTO audit_events
            (review_id, event_type, actor, old_status, new_status, metadata, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(review_id)
    .bind(event_type)
    .bind(actor)
    .bind(old_status)
    .bind(new_status)
    .bind(&metadata_text)
    .bind(now_iso_millis())
    .execute(conn)
    .await
    .context("record_event failed")?;
    Ok(())
}

/// Chronological event list, optionally scoped to one review.
pub async fn list_events(
    pool: &SqlitePool,
    review_id: Option<&str>,
) -> Result<Vec<AuditEventRow>> {
    let rows = match review_id {
        Some(id) => sqlx::query(
            r#"
            SELECT id, review_id, event_type, actor, old_status, new_status, metadata, created_at
              FROM audit_events
             WHERE review_id = ?
             ORDER BY id ASC
            "#,
        )
        .bind(id)
        .fetch_all(pool)
        .await,
        None => sqlx::query(
            r#"
            SELECT id, review_id, event_type, actor, old_status, new_status, metadata, created_at
              FROM audit_events
             ORDER BY id ASC
            "#,
        )
        .fetch_all(pool)
        .await,
    }
    .context("list_events failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        out.push(AuditEventRow {
            id: row.try_get("id")?,
            review_id: row.try_get("review_id")?,
            event_type: row.try_get("event_type")?,
            actor: row.try_get("actor")?,
            old_status: row.try_get("old_status")?,
            new_status: row.try_get("new_status")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
        });
    }
    Ok(out)
}

/// Per-review timeline is the scoped event list; kept as its own entry point
/// so the tool surface reads naturally.
pub async fn review_timeline(pool: &SqlitePool, review_id: &str) -> Result<Vec<AuditEventRow>> {
    list_events(pool, Some(review_id)).await
}

/// Aggregate statistics. All divisions are null-safe: a zero denominator
/// yields `null`, not zero.
pub async fn review_stats(pool: &SqlitePool) -> Result<ReviewStats> {
    let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM reviews")
        .fetch_one(pool)
        .await
        .context("review_stats total failed")?;

    let status_rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM reviews GROUP BY status")
            .fetch_all(pool)
            .await
            .context("review_stats by_status failed")?;
    let by_status: serde_json::Map<String, Value> = status_rows
        .into_iter()
        .map(|(k, v)| (k, Value::from(v)))
        .collect();

    let category_rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT COALESCE(category, 'uncategorized'), COUNT(*) FROM reviews GROUP BY 1",
    )
    .fetch_all(pool)
    .await
    .context("review_stats by_category failed")?;
    let by_category: serde_json::Map<String, Value> = category_rows
        .into_iter()
        .map(|(k, v)| (k, Value::from(v)))
        .collect();

    // Approval rate from verdict_submitted events; metadata.verdict carries
    // the outcome. SUM CASE keeps it one pass.
    let (verdicts, approvals): (i64, i64) = sqlx::query_as(
        r#"
        SELECT COUNT(*),
               COALESCE(SUM(CASE WHEN json_extract(metadata, '$.verdict') = 'approved'
                                 THEN 1 ELSE 0 END), 0)
          FROM audit_events
         WHERE event_type = 'verdict_submitted'
        "#,
    )
    .fetch_one(pool)
    .await
    .context("review_stats verdict aggregate failed")?;

    let approval_rate_pct = if verdicts > 0 {
        Some(approvals as f64 * 100.0 / verdicts as f64)
    } else {
        None
    };

    // Latency aggregates: julianday deltas are fractional days; x 86400 for
    // seconds. Both sides come from audit rows, so the timestamp format is
    // uniform.
    let (avg_to_first_verdict,): (Option<f64>,) = sqlx::query_as(
        r#"
        SELECT AVG((julianday(fv.ts) - julianday(cr.ts)) * 86400.0)
          FROM (SELECT review_id, MIN(created_at) AS ts
                  FROM audit_events WHERE event_type = 'verdict_submitted'
                 GROUP BY review_id) fv
          JOIN (SELECT review_id, MIN(created_at) AS ts
                  FROM audit_events WHERE event_type = 'review_created'
                 GROUP BY review_id) cr
            ON cr.review_id = fv.review_id
        "#,
    )
    .fetch_one(pool)
    .await
    .context("review_stats first-verdict latency failed")?;

    let (avg_to_close,): (Option<f64>,) = sqlx::query_as(
        r#"
        SELECT AVG((julianday(cl.ts) - julianday(cr.ts)) * 86400.0)
          FROM (SELECT review_id, MIN(created_at) AS ts
                  FROM audit_events WHERE event_type = 'review_closed'
                 GROUP BY review_id) cl
          JOIN (SELECT review_id, MIN(created_at) AS ts
                  FROM audit_events WHERE event_type = 'review_created'
                 GROUP BY review_id) cr
            ON cr.review_id = cl.review_id
        "#,
    )
    .fetch_one(pool)
    .await
    .context("review_stats close latency failed")?;

    Ok(ReviewStats {
        total_reviews: total,
        by_status: Value::Object(by_status),
        by_category: Value::Object(by_category),
        approval_rate_pct,
        avg_seconds_to_first_verdict: avg_to_first_verdict,
        avg_seconds_to_close: avg_to_close,
    })
}
