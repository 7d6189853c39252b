//! Shared runtime state for tandem-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. The broker context is
//! the single application context value; this module only adds the
//! transport-level extras (dashboard bus, session tracking, build info).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use tandem_broker::BrokerCtx;
use tandem_pool::ReviewerPool;

// ---------------------------------------------------------------------------
// DashMsg: SSE event bus payload
// ---------------------------------------------------------------------------

/// Messages broadcast over the dashboard bus and surfaced as SSE events.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashMsg {
    Heartbeat { ts_millis: i64 },
    OverviewUpdate(Value),
}

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

/// Static build metadata included in health responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

/// Cloneable (Arc) handle shared across all Axum handlers.
pub struct AppState {
    pub ctx: Arc<BrokerCtx>,
    /// Present only when the pool section is configured.
    pub pool_mgr: Option<Arc<ReviewerPool>>,
    /// Broadcast bus for the dashboard SSE stream.
    pub bus: broadcast::Sender<DashMsg>,
    pub build: BuildInfo,
    /// Session header value -> last-seen ISO timestamp. Observability only;
    /// sessions carry no authority (loopback-only transport).
    pub sessions: Mutex<HashMap<String, String>>,
}

impl AppState {
    pub fn new(ctx: Arc<BrokerCtx>, pool_mgr: Option<Arc<ReviewerPool>>) -> Arc<Self> {
        let (bus, _rx) = broadcast::channel::<DashMsg>(256);
        Arc::new(Self {
            ctx,
            pool_mgr,
            bus,
            build: BuildInfo {
                service: "tandem-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn touch_session(&self, session: &str) {
        let mut map = self.sessions.lock().expect("session map poisoned");
        map.insert(session.to_string(), tandem_db::now_iso_millis());
    }
}

// ---------------------------------------------------------------------------
// Dashboard feed
// ---------------------------------------------------------------------------

/// Spawn the background task feeding the SSE bus: a heartbeat every ~2 s and
/// an overview payload every ~15 s. Errors are logged and skipped; the feed
/// never kills the daemon.
pub fn spawn_dashboard_feed(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(Duration::from_secs(2));
        let mut overview = tokio::time::interval(Duration::from_secs(15));
        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let ts = chrono::Utc::now().timestamp_millis();
                    let _ = state.bus.send(DashMsg::Heartbeat { ts_millis: ts });
                }
                _ = overview.tick() => {
                    match crate::dashboard::overview_payload(&state).await {
                        Ok(v) => { let _ = state.bus.send(DashMsg::OverviewUpdate(v)); }
                        Err(e) => debug!(error = %e, "overview computation failed"),
                    }
                }
            }
        }
    });
}
