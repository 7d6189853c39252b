//! Reviewer subprocess rows. Historical rows are retained after termination
//! so stats and audit correlation survive restarts.

use anyhow::{Context, Result};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};

use tandem_schemas::ReviewerStatus;

#[derive(Debug, Clone)]
pub struct NewReviewer {
    pub id: String,
    pub display_name: String,
    pub session_token: String,
    pub pid: Option<i64>,
    pub spawned_at: String,
}

#[derive(Debug, Clone)]
pub struct ReviewerRow {
    pub id: String,
    pub display_name: String,
    pub session_token: String,
    pub status: ReviewerStatus,
    pub pid: Option<i64>,
    pub spawned_at: String,
    pub last_active_at: Option<String>,
    pub terminated_at: Option<String>,
    pub exit_code: Option<i64>,
    pub reviews_completed: i64,
    pub total_review_seconds: f64,
    pub approvals: i64,
    pub rejections: i64,
}

const REVIEWER_COLUMNS: &str = "\
    id, display_name, session_token, status, pid, spawned_at, last_active_at, \
    terminated_at, exit_code, reviews_completed, total_review_seconds, \
    approvals, rejections";

fn map_reviewer(row: &sqlx::sqlite::SqliteRow) -> Result<ReviewerRow> {
    Ok(ReviewerRow {
        id: row.try_get("id")?,
        display_name: row.try_get("display_name")?,
        session_token: row.try_get("session_token")?,
        status: ReviewerStatus::parse(&row.try_get::<String, _>("status")?)?,
        pid: row.try_get("pid")?,
        spawned_at: row.try_get("spawned_at")?,
        last_active_at: row.try_get("last_active_at")?,
        terminated_at: row.try_get("terminated_at")?,
        exit_code: row.try_get("exit_code")?,
        reviews_completed: row.try_get("reviews_completed")?,
        total_review_seconds: row.try_get("total_review_seconds")?,
        approvals: row.try_get("approvals")?,
        rejections: row.try_get("rejections")?,
    })
}

pub async fn insert_reviewer(conn: &mut SqliteConnection, r: &NewReviewer) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO reviewers (id, display_name, session_token, status, pid, spawned_at)
        VALUES (?, ?, ?, 'active', ?, ?)
        "#,
    )
    .bind(&r.id)
    .bind(&r.display_name)
    .bind(&r.session_token)
    .bind(r.pid)
    .bind(&r.spawned_at)
    .execute(conn)
    .await
    .context("insert_reviewer failed")?;
    Ok(())
}

pub async fn fetch_reviewer<'e, E>(ex: E, id: &str) -> Result<Option<ReviewerRow>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(&format!(
        "SELECT {REVIEWER_COLUMNS} FROM reviewers WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(ex)
    .await
    .context("fetch_reviewer failed")?;
    row.as_ref().map(map_reviewer).transpose()
}

pub async fn list_reviewers(pool: &SqlitePool) -> Result<Vec<ReviewerRow>> {
    let rows = sqlx::query(&format!(
        "SELECT {REVIEWER_COLUMNS} FROM reviewers ORDER BY spawned_at ASC"
    ))
    .fetch_all(pool)
    .await
    .context("list_reviewers failed")?;
    rows.iter().map(map_reviewer).collect()
}

pub async fn set_reviewer_status(
    pool: &SqlitePool,
    id: &str,
    status: ReviewerStatus,
) -> Result<()> {
    sqlx::query("UPDATE reviewers SET status = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(id)
        .execute(pool)
        .await
        .context("set_reviewer_status failed")?;
    Ok(())
}

pub async fn mark_terminated(
    pool: &SqlitePool,
    id: &str,
    exit_code: Option<i64>,
    terminated_at: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE reviewers
           SET status = 'terminated',
               terminated_at = ?,
               exit_code = ?
         WHERE id = ?
        "#,
    )
    .bind(terminated_at)
    .bind(exit_code)
    .bind(id)
    .execute(pool)
    .await
    .context("mark_terminated failed")?;
    Ok(())
}

/// Startup recovery step 1: every reviewer row from a different broker
/// session is dead by definition. Returns the number of rows affected.
pub async fn terminate_previous_sessions(
    pool: &SqlitePool,
    current_token: &str,
    now: &str,
) -> Result<u64> {
    let res = sqlx::query(
        r#"
        UPDATE reviewers
           SET status = 'terminated',
               terminated_at = COALESCE(terminated_at, ?)
         WHERE session_token != ?
           AND status != 'terminated'
        "#,
    )
    .bind(now)
    .bind(current_token)
    .execute(pool)
    .await
    .context("terminate_previous_sessions failed")?;
    Ok(res.rows_affected())
}

pub async fn touch_last_active(pool: &SqlitePool, id: &str, now: &str) -> Result<()> {
    sqlx::query("UPDATE reviewers SET last_active_at = ? WHERE id = ?")
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .context("touch_last_active failed")?;
    Ok(())
}

/// Stats bump on verdict submission, within the verdict's transaction.
pub async fn record_verdict_outcome(
    conn: &mut SqliteConnection,
    id: &str,
    approved: bool,
    review_seconds: f64,
    now: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE reviewers
           SET reviews_completed = reviews_completed + 1,
               total_review_seconds = total_review_seconds + ?,
               approvals = approvals + ?,
               rejections = rejections + ?,
               last_active_at = ?
         WHERE id = ?
        "#,
    )
    .bind(review_seconds)
    .bind(if approved { 1 } else { 0 })
    .bind(if approved { 0 } else { 1 })
    .bind(now)
    .bind(id)
    .execute(conn)
    .await
    .context("record_verdict_outcome failed")?;
    Ok(())
}

/// Active reviewers in the current session; the scaling ratio denominator.
pub async fn active_count(pool: &SqlitePool, session_token: &str) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM reviewers WHERE session_token = ? AND status = 'active'",
    )
    .bind(session_token)
    .fetch_one(pool)
    .await
    .context("active_count failed")?;
    Ok(n)
}
