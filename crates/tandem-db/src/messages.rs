//! Discussion thread rows. Append-only; insertion order (rowid) defines the
//! turn sequence, independent of wall-clock.

use anyhow::{Context, Result};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};

use tandem_schemas::{LastMessageSummary, SenderRole};

/// Length of the body preview carried in audit metadata and feed summaries.
pub const PREVIEW_CHARS: usize = 100;

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: String,
    pub review_id: String,
    pub sender_role: SenderRole,
    pub round: i64,
    pub body: String,
    pub metadata: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: String,
    pub review_id: String,
    pub sender_role: String,
    pub round: i64,
    pub body: String,
    pub metadata: Option<String>,
    pub created_at: String,
}

pub async fn insert_message(conn: &mut SqliteConnection, m: &NewMessage) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO messages (id, review_id, sender_role, round, body, metadata, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&m.id)
    .bind(&m.review_id)
    .bind(m.sender_role.as_str())
    .bind(m.round)
    .bind(&m.body)
    .bind(&m.metadata)
    .bind(&m.created_at)
    .execute(conn)
    .await
    .context("insert_message failed")?;
    Ok(())
}

/// Sender of the most recent message, if any. Turn alternation compares the
/// incoming sender against this value across all rounds.
pub async fn last_message_role<'e, E>(ex: E, review_id: &str) -> Result<Option<String>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row: Option<(String,)> = sqlx::query_as(
        "SELECT sender_role FROM messages WHERE review_id = ? ORDER BY rowid DESC LIMIT 1",
    )
    .bind(review_id)
    .fetch_optional(ex)
    .await
    .context("last_message_role failed")?;
    Ok(row.map(|(r,)| r))
}

pub async fn list_messages(
    pool: &SqlitePool,
    review_id: &str,
    round: Option<i64>,
) -> Result<Vec<MessageRow>> {
    let rows = match round {
        Some(n) => sqlx::query(
            r#"
            SELECT id, review_id, sender_role, round, body, metadata, created_at
              FROM messages
             WHERE review_id = ? AND round = ?
             ORDER BY rowid ASC
            "#,
        )
        .bind(review_id)
        .bind(n)
        .fetch_all(pool)
        .await,
        None => sqlx::query(
            r#"
            SELECT id, review_id, sender_role, round, body, metadata, created_at
              FROM messages
             WHERE review_id = ?
             ORDER BY rowid ASC
            "#,
        )
        .bind(review_id)
        .fetch_all(pool)
        .await,
    }
    .context("list_messages failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        out.push(MessageRow {
            id: row.try_get("id")?,
            review_id: row.try_get("review_id")?,
            sender_role: row.try_get("sender_role")?,
            round: row.try_get("round")?,
            body: row.try_get("body")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
        });
    }
    Ok(out)
}

/// Truncate a message body to the preview length on a char boundary.
pub fn preview(body: &str) -> String {
    if body.chars().count() <= PREVIEW_CHARS {
        body.to_string()
    } else {
        let mut p: String = body.chars().take(PREVIEW_CHARS).collect();
        p.push('…');
        p
    }
}

/// Compact summary of the most recent message for status/feed responses.
pub async fn last_message_summary<'e, E>(
    ex: E,
    review_id: &str,
) -> Result<Option<LastMessageSummary>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row: Option<(String, String, i64, String)> = sqlx::query_as(
        r#"
        SELECT sender_role, body, round, created_at
          FROM messages
         WHERE review_id = ?
         ORDER BY rowid DESC
         LIMIT 1
        "#,
    )
    .bind(review_id)
    .fetch_optional(ex)
    .await
    .context("last_message_summary failed")?;

    Ok(row.map(|(sender_role, body, round, created_at)| LastMessageSummary {
        sender_role,
        preview: preview(&body),
        round,
        created_at: crate::legacy_to_iso(&created_at),
    }))
}
