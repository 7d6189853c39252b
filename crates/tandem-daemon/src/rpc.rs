//! The `/rpc` call endpoint: one POST per tool operation.
//!
//! Application-level failures are always HTTP 200 with `{"error": "..."}` so
//! clients branch on the payload, never on the status code. Transport-level
//! problems (malformed JSON, unknown operation) are 400s.

use std::sync::Arc;

use anyhow::anyhow;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use tandem_broker as broker;
use tandem_schemas::{
    AddMessageArgs, ClaimReviewArgs, CreateReviewArgs, GetAuditLogArgs, GetDiscussionArgs,
    GetReviewStatusArgs, KillReviewerArgs, ListReviewsArgs, ReviewIdArgs, SubmitVerdictArgs,
};

use crate::state::AppState;

/// Header carrying the caller's session identity.
pub const SESSION_HEADER: &str = "x-tandem-session";

#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    pub op: String,
    #[serde(default)]
    pub args: Value,
}

enum DispatchError {
    /// The operation name itself is not part of the protocol: 400.
    UnknownOp(String),
    /// The operation ran and refused: 200 + error envelope.
    Op(anyhow::Error),
}

pub(crate) async fn rpc_call(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RpcRequest>,
) -> Response {
    if let Some(session) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
        st.touch_session(session);
    }
    info!(op = %req.op, "rpc call");

    match dispatch(&st, &req.op, req.args).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(DispatchError::Op(e)) => (
            StatusCode::OK,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
        Err(DispatchError::UnknownOp(op)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("unknown operation: {op}") })),
        )
            .into_response(),
    }
}

fn parse<T: DeserializeOwned>(op: &str, args: Value) -> Result<T, DispatchError> {
    serde_json::from_value(args)
        .map_err(|e| DispatchError::Op(anyhow!("invalid arguments for {op}: {e}")))
}

fn shape<T: Serialize>(v: T) -> Result<Value, DispatchError> {
    serde_json::to_value(v).map_err(|e| DispatchError::Op(anyhow!("response shaping failed: {e}")))
}

fn op_err(e: anyhow::Error) -> DispatchError {
    DispatchError::Op(e)
}

async fn dispatch(st: &AppState, op: &str, args: Value) -> Result<Value, DispatchError> {
    let ctx = &st.ctx;
    match op {
        "create_review" => {
            let a: CreateReviewArgs = parse(op, args)?;
            shape(broker::create_review(ctx, a).await.map_err(op_err)?)
        }
        "list_reviews" => {
            let a: ListReviewsArgs = parse(op, args)?;
            shape(broker::list_reviews(ctx, a).await.map_err(op_err)?)
        }
        "claim_review" => {
            let a: ClaimReviewArgs = parse(op, args)?;
            shape(broker::claim_review(ctx, a).await.map_err(op_err)?)
        }
        "get_proposal" => {
            let a: ReviewIdArgs = parse(op, args)?;
            shape(broker::get_proposal(ctx, &a.review_id).await.map_err(op_err)?)
        }
        "submit_verdict" => {
            let a: SubmitVerdictArgs = parse(op, args)?;
            shape(broker::submit_verdict(ctx, a).await.map_err(op_err)?)
        }
        "accept_counter_patch" => {
            let a: ReviewIdArgs = parse(op, args)?;
            shape(
                broker::accept_counter_patch(ctx, &a.review_id)
                    .await
                    .map_err(op_err)?,
            )
        }
        "reject_counter_patch" => {
            let a: ReviewIdArgs = parse(op, args)?;
            shape(
                broker::reject_counter_patch(ctx, &a.review_id)
                    .await
                    .map_err(op_err)?,
            )
        }
        "add_message" => {
            let a: AddMessageArgs = parse(op, args)?;
            shape(broker::add_message(ctx, a).await.map_err(op_err)?)
        }
        "get_discussion" => {
            let a: GetDiscussionArgs = parse(op, args)?;
            shape(broker::get_discussion(ctx, a).await.map_err(op_err)?)
        }
        "close_review" => {
            let a: ReviewIdArgs = parse(op, args)?;
            shape(broker::close_review(ctx, &a.review_id).await.map_err(op_err)?)
        }
        "get_review_status" => {
            let a: GetReviewStatusArgs = parse(op, args)?;
            shape(broker::get_review_status(ctx, a).await.map_err(op_err)?)
        }
        "get_activity_feed" => {
            let a: ListReviewsArgs = parse(op, args)?;
            shape(broker::get_activity_feed(ctx, a).await.map_err(op_err)?)
        }
        "get_audit_log" => {
            let a: GetAuditLogArgs = parse(op, args)?;
            shape(broker::get_audit_log(ctx, a).await.map_err(op_err)?)
        }
        "get_review_stats" => shape(broker::get_review_stats(ctx).await.map_err(op_err)?),
        "get_review_timeline" => {
            let a: ReviewIdArgs = parse(op, args)?;
            shape(
                broker::get_review_timeline(ctx, &a.review_id)
                    .await
                    .map_err(op_err)?,
            )
        }
        "list_reviewers" => shape(broker::list_reviewers(ctx).await.map_err(op_err)?),
        "spawn_reviewer" => match &st.pool_mgr {
            Some(pool) => {
                let id = pool.spawn_reviewer().await.map_err(op_err)?;
                Ok(json!({ "reviewer_id": id }))
            }
            None => Err(op_err(anyhow!("reviewer pool is disabled"))),
        },
        "kill_reviewer" => match &st.pool_mgr {
            Some(pool) => {
                let a: KillReviewerArgs = parse(op, args)?;
                pool.kill_reviewer(&a.reviewer_id).await.map_err(op_err)?;
                Ok(json!({ "reviewer_id": a.reviewer_id, "draining": true }))
            }
            None => Err(op_err(anyhow!("reviewer pool is disabled"))),
        },
        other => Err(DispatchError::UnknownOp(other.to_string())),
    }
}
