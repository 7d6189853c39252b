//! Review row queries.
//!
//! Write helpers take a `&mut SqliteConnection` so they compose inside one
//! [`crate::WriteTx`]; read helpers are executor-generic or take the pool.

use anyhow::{Context, Result};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};

use tandem_schemas::Priority;
use tandem_state::ReviewStatus;

#[derive(Debug, Clone)]
pub struct NewReview {
    pub id: String,
    pub intent: String,
    pub description: Option<String>,
    pub diff: Option<String>,
    pub affected_files: Option<String>,
    pub agent_type: String,
    pub agent_role: String,
    pub phase: String,
    pub plan: Option<String>,
    pub task: Option<String>,
    pub category: Option<String>,
    pub priority: Priority,
    pub parent_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct ReviewRow {
    pub id: String,
    pub status: ReviewStatus,
    pub intent: String,
    pub description: Option<String>,
    pub diff: Option<String>,
    pub affected_files: Option<String>,
    pub agent_type: String,
    pub agent_role: String,
    pub phase: String,
    pub plan: Option<String>,
    pub task: Option<String>,
    pub category: Option<String>,
    pub priority: Priority,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<String>,
    pub claim_generation: i64,
    pub verdict_reason: Option<String>,
    pub current_round: i64,
    pub counter_patch: Option<String>,
    pub counter_patch_status: Option<String>,
    pub parent_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

const REVIEW_COLUMNS: &str = "\
    id, status, intent, description, diff, affected_files, agent_type, \
    agent_role, phase, plan, task, category, priority, claimed_by, \
    claimed_at, claim_generation, verdict_reason, current_round, \
    counter_patch, counter_patch_status, parent_id, created_at, updated_at";

fn map_review(row: &sqlx::sqlite::SqliteRow) -> Result<ReviewRow> {
    Ok(ReviewRow {
        id: row.try_get("id")?,
        status: ReviewStatus::parse(&row.try_get::<String, _>("status")?)?,
        intent: row.try_get("intent")?,
        description: row.try_get("description")?,
        diff: row.try_get("diff")?,
        affected_files: row.try_get("affected_files")?,
        agent_type: row.try_get("agent_type")?,
        agent_role: row.try_get("agent_role")?,
        phase: row.try_get("phase")?,
        plan: row.try_get("plan")?,
        task: row.try_get("task")?,
        category: row.try_get("category")?,
        priority: Priority::parse(&row.try_get::<String, _>("priority")?)?,
        claimed_by: row.try_get("claimed_by")?,
        claimed_at: row.try_get("claimed_at")?,
        claim_generation: row.try_get("claim_generation")?,
        verdict_reason: row.try_get("verdict_reason")?,
        current_round: row.try_get("current_round")?,
        counter_patch: row.try_get("counter_patch")?,
        counter_patch_status: row.try_get("counter_patch_status")?,
        parent_id: row.try_get("parent_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn insert_review(conn: &mut SqliteConnection, r: &NewReview) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO reviews (
            id, status, intent, description, diff, affected_files, agent_type,
            agent_role, phase, plan, task, category, priority, parent_id,
            created_at, updated_at
        ) VALUES (?, 'pending', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&r.id)
    .bind(&r.intent)
    .bind(&r.description)
    .bind(&r.diff)
    .bind(&r.affected_files)
    .bind(&r.agent_type)
    .bind(&r.agent_role)
    .bind(&r.phase)
    .bind(&r.plan)
    .bind(&r.task)
    .bind(&r.category)
    .bind(r.priority.as_str())
    .bind(&r.parent_id)
    .bind(&r.created_at)
    .bind(&r.updated_at)
    .execute(conn)
    .await
    .context("insert_review failed")?;
    Ok(())
}

pub async fn fetch_review<'e, E>(ex: E, id: &str) -> Result<Option<ReviewRow>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(&format!(
        "SELECT {REVIEW_COLUMNS} FROM reviews WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(ex)
    .await
    .context("fetch_review failed")?;

    row.as_ref().map(map_review).transpose()
}

/// Dynamic condition builder. Ordered by priority (critical first), then
/// creation time ascending so the oldest urgent work surfaces first.
pub async fn list_reviews(
    pool: &SqlitePool,
    status: Option<&str>,
    category: Option<&str>,
) -> Result<Vec<ReviewRow>> {
    let mut qb: QueryBuilder<Sqlite> =
        QueryBuilder::new(format!("SELECT {REVIEW_COLUMNS} FROM reviews WHERE 1=1"));
    if let Some(s) = status {
        qb.push(" AND status = ").push_bind(s);
    }
    if let Some(c) = category {
        qb.push(" AND category = ").push_bind(c);
    }
    qb.push(
        " ORDER BY CASE priority \
            WHEN 'critical' THEN 0 \
            WHEN 'normal' THEN 1 \
            WHEN 'low' THEN 2 \
            ELSE 1 END, created_at ASC",
    );

    let rows = qb
        .build()
        .fetch_all(pool)
        .await
        .context("list_reviews failed")?;
    rows.iter().map(map_review).collect()
}

/// Every review currently in `claimed`, for the reclaim sweeps.
pub async fn list_claimed(pool: &SqlitePool) -> Result<Vec<ReviewRow>> {
    let rows = sqlx::query(&format!(
        "SELECT {REVIEW_COLUMNS} FROM reviews WHERE status = 'claimed' ORDER BY created_at ASC"
    ))
    .fetch_all(pool)
    .await
    .context("list_claimed failed")?;
    rows.iter().map(map_review).collect()
}

pub async fn count_by_status<'e, E>(ex: E, status: &str) -> Result<i64>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM reviews WHERE status = ?")
        .bind(status)
        .fetch_one(ex)
        .await
        .context("count_by_status failed")?;
    Ok(n)
}

/// Open claims held by one reviewer (0 or 1 in practice; the schema does not
/// forbid more, the claim protocol does).
pub async fn claimed_count_for_reviewer<'e, E>(ex: E, reviewer_id: &str) -> Result<i64>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let (n,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM reviews WHERE status = 'claimed' AND claimed_by = ?")
            .bind(reviewer_id)
            .fetch_one(ex)
            .await
            .context("claimed_count_for_reviewer failed")?;
    Ok(n)
}

/// `pending -> claimed` with the fence advanced to `generation`.
pub async fn mark_claimed(
    conn: &mut SqliteConnection,
    id: &str,
    reviewer_id: &str,
    generation: i64,
    now: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE reviews
           SET status = 'claimed',
               claimed_by = ?,
               claimed_at = ?,
               claim_generation = ?,
               updated_at = ?
         WHERE id = ?
        "#,
    )
    .bind(reviewer_id)
    .bind(now)
    .bind(generation)
    .bind(now)
    .bind(id)
    .execute(conn)
    .await
    .context("mark_claimed failed")?;
    Ok(())
}

/// Revision: replace content, reset claim/verdict/counter-patch state, bump
/// the round, return to `pending`. One statement so the replacement is atomic.
#[allow(clippy::too_many_arguments)]
pub async fn apply_revision(
    conn: &mut SqliteConnection,
    id: &str,
    intent: &str,
    description: Option<&str>,
    diff: Option<&str>,
    affected_files: Option<&str>,
    round: i64,
    now: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE reviews
           SET status = 'pending',
               intent = ?,
               description = ?,
               diff = ?,
               affected_files = ?,
               claimed_by = NULL,
               claimed_at = NULL,
               verdict_reason = NULL,
               counter_patch = NULL,
               counter_patch_status = NULL,
               current_round = ?,
               updated_at = ?
         WHERE id = ?
        "#,
    )
    .bind(intent)
    .bind(description)
    .bind(diff)
    .bind(affected_files)
    .bind(round)
    .bind(now)
    .bind(id)
    .execute(conn)
    .await
    .context("apply_revision failed")?;
    Ok(())
}

/// Verdict transition (`approved` / `changes_requested`).
pub async fn set_verdict_status(
    conn: &mut SqliteConnection,
    id: &str,
    status: ReviewStatus,
    verdict_reason: Option<&str>,
    now: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE reviews SET status = ?, verdict_reason = ?, updated_at = ? WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(verdict_reason)
    .bind(now)
    .bind(id)
    .execute(conn)
    .await
    .context("set_verdict_status failed")?;
    Ok(())
}

/// `comment` verdict: reason lands on the row, status is untouched.
pub async fn set_comment_reason(
    conn: &mut SqliteConnection,
    id: &str,
    reason: &str,
    now: &str,
) -> Result<()> {
    sqlx::query("UPDATE reviews SET verdict_reason = ?, updated_at = ? WHERE id = ?")
        .bind(reason)
        .bind(now)
        .bind(id)
        .execute(conn)
        .await
        .context("set_comment_reason failed")?;
    Ok(())
}

/// Fenced reclaim: `claimed -> pending`, fence advanced, claim cleared.
pub async fn reclaim_to_pending(
    conn: &mut SqliteConnection,
    id: &str,
    generation: i64,
    now: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE reviews
           SET status = 'pending',
               claimed_by = NULL,
               claimed_at = NULL,
               claim_generation = ?,
               updated_at = ?
         WHERE id = ?
        "#,
    )
    .bind(generation)
    .bind(now)
    .bind(id)
    .execute(conn)
    .await
    .context("reclaim_to_pending failed")?;
    Ok(())
}

/// Attach a reviewer counter-patch awaiting the proposer's decision.
pub async fn set_counter_patch(
    conn: &mut SqliteConnection,
    id: &str,
    patch: &str,
    now: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE reviews
           SET counter_patch = ?,
               counter_patch_status = 'pending',
               updated_at = ?
         WHERE id = ?
        "#,
    )
    .bind(patch)
    .bind(now)
    .bind(id)
    .execute(conn)
    .await
    .context("set_counter_patch failed")?;
    Ok(())
}

/// Proposer accepted the counter-patch: it becomes the review diff and the
/// review re-enters the queue as a new round.
pub async fn mark_counter_patch_accepted(
    conn: &mut SqliteConnection,
    id: &str,
    diff: &str,
    affected_files: &str,
    round: i64,
    now: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE reviews
           SET status = 'pending',
               diff = ?,
               affected_files = ?,
               counter_patch_status = 'accepted',
               claimed_by = NULL,
               claimed_at = NULL,
               verdict_reason = NULL,
               current_round = ?,
               updated_at = ?
         WHERE id = ?
        "#,
    )
    .bind(diff)
    .bind(affected_files)
    .bind(round)
    .bind(now)
    .bind(id)
    .execute(conn)
    .await
    .context("mark_counter_patch_accepted failed")?;
    Ok(())
}

/// Proposer rejected the counter-patch: content cleared, status recorded.
pub async fn mark_counter_patch_rejected(
    conn: &mut SqliteConnection,
    id: &str,
    now: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE reviews
           SET counter_patch = NULL,
               counter_patch_status = 'rejected',
               updated_at = ?
         WHERE id = ?
        "#,
    )
    .bind(now)
    .bind(id)
    .execute(conn)
    .await
    .context("mark_counter_patch_rejected failed")?;
    Ok(())
}

pub async fn set_closed(conn: &mut SqliteConnection, id: &str, now: &str) -> Result<()> {
    sqlx::query("UPDATE reviews SET status = 'closed', updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(id)
        .execute(conn)
        .await
        .context("set_closed failed")?;
    Ok(())
}

/// Claim-time validation failure: straight to `changes_requested` with the
/// broker-generated reason.
pub async fn set_auto_rejected(
    conn: &mut SqliteConnection,
    id: &str,
    reason: &str,
    now: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE reviews
           SET status = 'changes_requested',
               verdict_reason = ?,
               claimed_by = NULL,
               claimed_at = NULL,
               updated_at = ?
         WHERE id = ?
        "#,
    )
    .bind(reason)
    .bind(now)
    .bind(id)
    .execute(conn)
    .await
    .context("set_auto_rejected failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Activity feed
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ActivityRow {
    pub id: String,
    pub status: String,
    pub intent: String,
    pub category: Option<String>,
    pub priority: String,
    pub message_count: i64,
    pub last_sender: Option<String>,
    pub last_body: Option<String>,
    pub last_round: Option<i64>,
    pub last_message_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// All reviews with message-count and last-message subqueries, most recently
/// updated first.
pub async fn activity_feed(
    pool: &SqlitePool,
    status: Option<&str>,
    category: Option<&str>,
) -> Result<Vec<ActivityRow>> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
        r#"
        SELECT r.id, r.status, r.intent, r.category, r.priority,
               r.created_at, r.updated_at,
               (SELECT COUNT(*) FROM messages m WHERE m.review_id = r.id) AS message_count,
               (SELECT m.sender_role FROM messages m WHERE m.review_id = r.id
                 ORDER BY m.rowid DESC LIMIT 1) AS last_sender,
               (SELECT m.body FROM messages m WHERE m.review_id = r.id
                 ORDER BY m.rowid DESC LIMIT 1) AS last_body,
               (SELECT m.round FROM messages m WHERE m.review_id = r.id
                 ORDER BY m.rowid DESC LIMIT 1) AS last_round,
               (SELECT m.created_at FROM messages m WHERE m.review_id = r.id
                 ORDER BY m.rowid DESC LIMIT 1) AS last_message_at
          FROM reviews r
         WHERE 1=1
        "#,
    );
    if let Some(s) = status {
        qb.push(" AND r.status = ").push_bind(s);
    }
    if let Some(c) = category {
        qb.push(" AND r.category = ").push_bind(c);
    }
    qb.push(" ORDER BY r.updated_at DESC");

    let rows = qb
        .build()
        .fetch_all(pool)
        .await
        .context("activity_feed failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        out.push(ActivityRow {
            id: row.try_get("id")?,
            status: row.try_get("status")?,
            intent: row.try_get("intent")?,
            category: row.try_get("category")?,
            priority: row.try_get("priority")?,
            message_count: row.try_get("message_count")?,
            last_sender: row.try_get("last_sender")?,
            last_body: row.try_get("last_body")?,
            last_round: row.try_get("last_round")?,
            last_message_at: row.try_get("last_message_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        });
    }
    Ok(out)
}
