//! Discussion thread operations.

use anyhow::{anyhow, Result};
use serde_json::json;

use tandem_db as db;
use tandem_db::messages::preview;
use tandem_schemas::{
    events, AddMessageArgs, AddMessageResponse, GetDiscussionArgs, MessageView, SenderRole,
};

use crate::views::message_view;
use crate::BrokerCtx;

/// Append one turn to a review's discussion.
///
/// Turn alternation is global across rounds: the sender must differ from the
/// last appended message's sender; the first message may come from either
/// party.
pub async fn add_message(ctx: &BrokerCtx, args: AddMessageArgs) -> Result<AddMessageResponse> {
    let role = SenderRole::parse(&args.sender_role)?;
    if args.body.trim().is_empty() {
        return Err(anyhow!("body must be a non-empty string"));
    }
    let metadata = args
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| anyhow!("metadata must be JSON-serializable: {e}"))?;

    let now = db::now_legacy();
    let (message_id, round) = {
        let _guard = ctx.write_lock.lock().await;
        let mut tx = db::WriteTx::begin(&ctx.pool).await?;
        let row = db::fetch_review(tx.conn(), &args.review_id)
            .await?
            .ok_or_else(|| anyhow!("review not found: {}", args.review_id))?;
        if row.status.is_terminal() {
            return Err(anyhow!("review {} is closed", args.review_id));
        }

        let last = db::last_message_role(tx.conn(), &args.review_id).await?;
        if last.as_deref() == Some(role.as_str()) {
            return Err(anyhow!(
                "turn alternation: last message was from {}; awaiting the other party",
                role.as_str()
            ));
        }

        let msg = db::NewMessage {
            id: db::new_id(),
            review_id: args.review_id.clone(),
            sender_role: role,
            round: row.current_round,
            body: args.body.clone(),
            metadata,
            created_at: now.clone(),
        };
        db::insert_message(tx.conn(), &msg).await?;
        db::record_event(
            tx.conn(),
            Some(&args.review_id),
            events::MESSAGE_SENT,
            role.as_str(),
            None,
            None,
            Some(&json!({
                "preview": preview(&args.body),
                "round": row.current_round,
                "sender_role": role.as_str(),
            })),
        )
        .await?;
        tx.commit().await?;
        (msg.id, row.current_round)
    };

    ctx.bus.notify(&args.review_id);

    Ok(AddMessageResponse {
        message_id,
        review_id: args.review_id,
        round,
    })
}

/// Ordered message list, optionally filtered to one round.
pub async fn get_discussion(
    ctx: &BrokerCtx,
    args: GetDiscussionArgs,
) -> Result<Vec<MessageView>> {
    let exists = db::fetch_review(&ctx.pool, &args.review_id).await?.is_some();
    if !exists {
        return Err(anyhow!("review not found: {}", args.review_id));
    }
    let rows = db::list_messages(&ctx.pool, &args.review_id, args.round).await?;
    Ok(rows.iter().map(message_view).collect())
}
