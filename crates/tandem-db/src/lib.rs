//! Embedded store for the tandem review broker.
//!
//! One SQLite file under the project's planning directory. WAL journaling,
//! foreign keys on, 5 s busy wait. All multi-statement writes go through
//! [`WriteTx`] (`BEGIN IMMEDIATE`) under the broker's process-wide write
//! mutex; reads run straight off the pool.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, SqlitePool};
use tracing::{debug, warn};

pub mod audit;
pub mod messages;
pub mod reviewers;
pub mod reviews;

pub use audit::{list_events, record_event, review_stats, review_timeline, AuditEventRow};
pub use messages::{
    insert_message, last_message_role, last_message_summary, list_messages, MessageRow, NewMessage,
};
pub use reviewers::{
    active_count, fetch_reviewer, insert_reviewer, list_reviewers, mark_terminated,
    record_verdict_outcome, set_reviewer_status, terminate_previous_sessions, touch_last_active,
    NewReviewer, ReviewerRow,
};
pub use reviews::{
    activity_feed, apply_revision, claimed_count_for_reviewer, count_by_status, fetch_review,
    insert_review, list_claimed, list_reviews, mark_claimed, mark_counter_patch_accepted,
    mark_counter_patch_rejected, reclaim_to_pending, set_auto_rejected, set_closed,
    set_comment_reason, set_counter_patch, set_verdict_status, ActivityRow, NewReview, ReviewRow,
};

pub const ENV_DB_PATH: &str = "TANDEM_DB_PATH";

/// Open (creating if missing) the broker database file.
pub async fn connect(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create db directory {:?}", parent))?;
    }

    let opts = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(opts)
        .await
        .with_context(|| format!("open sqlite database {:?}", path))?;

    Ok(pool)
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Idempotent schema statements, applied in order at every startup.
///
/// New tables land as `CREATE TABLE IF NOT EXISTS`; columns added after the
/// initial release land as `ALTER TABLE ... ADD COLUMN` and rely on the
/// duplicate-column tolerance in [`ensure_schema`].
const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS reviews (
        id               TEXT PRIMARY KEY,
        status           TEXT NOT NULL DEFAULT 'pending'
                         CHECK (status IN ('pending','claimed','in_review','approved','changes_requested','closed')),
        intent           TEXT NOT NULL,
        description      TEXT,
        diff             TEXT,
        affected_files   TEXT,
        agent_type       TEXT NOT NULL,
        agent_role       TEXT NOT NULL,
        phase            TEXT NOT NULL DEFAULT '',
        plan             TEXT,
        task             TEXT,
        category         TEXT,
        priority         TEXT NOT NULL DEFAULT 'normal'
                         CHECK (priority IN ('critical','normal','low')),
        claimed_by       TEXT,
        claimed_at       TEXT,
        claim_generation INTEGER NOT NULL DEFAULT 0,
        verdict_reason   TEXT,
        current_round    INTEGER NOT NULL DEFAULT 1,
        created_at       TEXT NOT NULL,
        updated_at       TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id          TEXT PRIMARY KEY,
        review_id   TEXT NOT NULL REFERENCES reviews(id),
        sender_role TEXT NOT NULL CHECK (sender_role IN ('proposer','reviewer')),
        round       INTEGER NOT NULL DEFAULT 1,
        body        TEXT NOT NULL,
        metadata    TEXT,
        created_at  TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS audit_events (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        review_id   TEXT,
        event_type  TEXT NOT NULL,
        actor       TEXT NOT NULL,
        old_status  TEXT,
        new_status  TEXT,
        metadata    TEXT,
        created_at  TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS reviewers (
        id                   TEXT PRIMARY KEY,
        display_name         TEXT NOT NULL,
        session_token        TEXT NOT NULL,
        status               TEXT NOT NULL DEFAULT 'active'
                             CHECK (status IN ('active','draining','terminated')),
        pid                  INTEGER,
        spawned_at           TEXT NOT NULL,
        last_active_at       TEXT,
        terminated_at        TEXT,
        reviews_completed    INTEGER NOT NULL DEFAULT 0,
        total_review_seconds REAL NOT NULL DEFAULT 0,
        approvals            INTEGER NOT NULL DEFAULT 0,
        rejections           INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_reviews_status ON reviews(status)",
    "CREATE INDEX IF NOT EXISTS idx_messages_review ON messages(review_id)",
    "CREATE INDEX IF NOT EXISTS idx_audit_review ON audit_events(review_id)",
    // Counter-patch support shipped after the initial schema.
    "ALTER TABLE reviews ADD COLUMN counter_patch TEXT",
    "ALTER TABLE reviews ADD COLUMN counter_patch_status TEXT",
    // Revision lineage for historical resubmissions.
    "ALTER TABLE reviews ADD COLUMN parent_id TEXT",
    // Reviewer exit codes for premature-death diagnostics.
    "ALTER TABLE reviewers ADD COLUMN exit_code INTEGER",
];

/// Apply the schema statement list.
///
/// `ALTER TABLE ADD COLUMN` on an up-to-date table fails with a
/// "duplicate column" signature; that exact failure is tolerated so the list
/// stays append-only. Any other error is a fatal startup failure.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    for stmt in SCHEMA_STATEMENTS {
        match sqlx::query(stmt).execute(pool).await {
            Ok(_) => {}
            Err(e) if is_duplicate_column(&e) => {
                debug!("schema statement already applied: {}", first_line(stmt));
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("schema statement failed: {}", first_line(stmt))));
            }
        }
    }
    Ok(())
}

fn is_duplicate_column(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.message().contains("duplicate column"),
        _ => false,
    }
}

fn first_line(stmt: &str) -> String {
    stmt.trim()
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .to_string()
}

// ---------------------------------------------------------------------------
// Write transactions
// ---------------------------------------------------------------------------

/// A `BEGIN IMMEDIATE` transaction on a dedicated pool connection.
///
/// SQLite's deferred transactions only take the write lock at the first
/// mutating statement, which allows a concurrent writer to slip between the
/// SELECT and the UPDATE of a read-modify-write. Immediate acquisition plus
/// the broker's write mutex makes `SELECT -> validate -> UPDATE` atomic.
///
/// Dropping an uncommitted `WriteTx` rolls the transaction back on a spawned
/// task before the connection returns to the pool.
pub struct WriteTx {
    conn: Option<PoolConnection<Sqlite>>,
    done: bool,
}

impl WriteTx {
    pub async fn begin(pool: &SqlitePool) -> Result<Self> {
        let mut conn = pool.acquire().await.context("acquire write connection")?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .context("begin immediate transaction")?;
        Ok(Self {
            conn: Some(conn),
            done: false,
        })
    }

    /// The connection to run statements on. Valid until commit/rollback.
    pub fn conn(&mut self) -> &mut SqliteConnection {
        self.conn
            .as_mut()
            .expect("WriteTx connection taken after finish")
    }

    pub async fn commit(mut self) -> Result<()> {
        let mut conn = self.conn.take().expect("WriteTx already finished");
        self.done = true;
        if let Err(e) = sqlx::query("COMMIT").execute(&mut *conn).await {
            // Leave the connection clean before it returns to the pool.
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            return Err(anyhow::Error::new(e).context("commit transaction"));
        }
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<()> {
        let mut conn = self.conn.take().expect("WriteTx already finished");
        self.done = true;
        sqlx::query("ROLLBACK")
            .execute(&mut *conn)
            .await
            .context("rollback transaction")?;
        Ok(())
    }
}

impl Drop for WriteTx {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            if !self.done {
                warn!("write transaction dropped without commit; rolling back");
                tokio::spawn(async move {
                    let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------
//
// Review/message/reviewer rows carry the legacy space-separated local form;
// audit rows carry ISO-8601 UTC with millisecond precision. Legacy values are
// normalized to ISO on output only.

pub const LEGACY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const ISO_MILLIS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Current instant in the legacy review-row form.
pub fn now_legacy() -> String {
    Local::now().format(LEGACY_FORMAT).to_string()
}

/// Current instant in the audit-event form.
pub fn now_iso_millis() -> String {
    Utc::now().format(ISO_MILLIS_FORMAT).to_string()
}

/// Convert a legacy local timestamp to ISO-8601 UTC. Values that do not
/// parse (including values already in ISO form) pass through unchanged.
pub fn legacy_to_iso(ts: &str) -> String {
    match parse_legacy(ts) {
        Some(utc) => utc.format(ISO_MILLIS_FORMAT).to_string(),
        None => ts.to_string(),
    }
}

/// Seconds elapsed since a legacy local timestamp. `None` when unparseable.
pub fn legacy_age_seconds(ts: &str) -> Option<f64> {
    let then = parse_legacy(ts)?;
    let delta = Utc::now().signed_duration_since(then);
    Some(delta.num_milliseconds() as f64 / 1000.0)
}

fn parse_legacy(ts: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(ts, LEGACY_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(ts, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()?;
    Local
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Fresh row id. Reviews, messages, and reviewers are all keyed by opaque
/// textual UUIDs.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
