//! Read-only dashboard: embedded static page, initial-overview API, and the
//! server-sent-events stream. Nothing in here mutates broker state.

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        Html, IntoResponse, Response,
    },
    Json,
};
use futures_util::{Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use tandem_broker as broker;
use tandem_schemas::ListReviewsArgs;

use crate::state::{AppState, DashMsg};

const INDEX_HTML: &str = include_str!("../assets/dashboard.html");

/// Activity rows inlined in the overview; the dashboard paginates by asking
/// again, keeping the payload small.
const OVERVIEW_ACTIVITY_LIMIT: usize = 20;

pub(crate) async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// Initial data for the dashboard: stats, a recent-activity slice, and the
/// reviewer table.
pub async fn overview_payload(state: &AppState) -> Result<Value> {
    let stats = broker::get_review_stats(&state.ctx).await?;
    let mut activity = broker::get_activity_feed(&state.ctx, ListReviewsArgs::default()).await?;
    activity.truncate(OVERVIEW_ACTIVITY_LIMIT);
    let reviewers = broker::list_reviewers(&state.ctx).await?;

    Ok(json!({
        "service": state.build.service,
        "version": state.build.version,
        "stats": stats,
        "activity": activity,
        "reviewers": reviewers,
        "generated_at": tandem_db::now_iso_millis(),
    }))
}

pub(crate) async fn overview_api(State(st): State<Arc<AppState>>) -> Response {
    match overview_payload(&st).await {
        Ok(v) => (StatusCode::OK, Json(v)).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// GET /dashboard/api/stream  (SSE)
// ---------------------------------------------------------------------------

pub(crate) async fn stream(State(st): State<Arc<AppState>>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let rx = st.bus.subscribe();
    let events = broadcast_to_sse(rx);

    (headers, Sse::new(events).keep_alive(KeepAlive::new())).into_response()
}

fn broadcast_to_sse(
    rx: broadcast::Receiver<DashMsg>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(m) => {
                let event_name = match &m {
                    DashMsg::Heartbeat { .. } => "heartbeat",
                    DashMsg::OverviewUpdate(_) => "overview_update",
                };
                let data = serde_json::to_string(&m).ok()?;
                Some(Ok(Event::default().event(event_name).data(data)))
            }
            Err(_) => None, // lagged / closed
        }
    })
}
