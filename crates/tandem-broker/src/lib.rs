//! Core broker: shared context and the tool surface.
//!
//! One [`BrokerCtx`] value is threaded through every handler: the store
//! pool, the process-wide write mutex, the notification bus, and the
//! repository root for diff validation. There is no ambient global state.
//!
//! The reviewer pool is decoupled behind [`PoolSignal`]: the broker emits
//! signals over an unbounded channel the daemon wires up; it never calls the
//! pool directly.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, Result};
use sqlx::SqlitePool;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

pub mod messages;
pub mod notify;
pub mod queries;
pub mod reviews;
pub mod verdicts;
pub mod views;

pub use messages::{add_message, get_discussion};
pub use notify::NotifyBus;
pub use queries::{
    get_activity_feed, get_audit_log, get_proposal, get_review_stats, get_review_status,
    get_review_timeline, list_reviewers, list_reviews,
};
pub use reviews::{
    accept_counter_patch, claim_review, close_review, create_review, reclaim_review,
    reject_counter_patch,
};
pub use verdicts::submit_verdict;

/// Long-poll ceiling; kept below the transport's 30 s request budget.
pub const MAX_LONG_POLL_SECONDS: f64 = 28.0;

/// Signals from the broker core to the reviewer pool manager.
#[derive(Debug, Clone)]
pub enum PoolSignal {
    /// A review entered `pending` (create or revision); the pool may scale up.
    ReviewCreated,
    /// A managed reviewer finished a verdict; if it is draining and holds no
    /// other claim, the pool terminates it.
    ReviewerIdle(String),
}

/// Shared broker context, one per process.
pub struct BrokerCtx {
    pub pool: SqlitePool,
    /// Serializes every multi-statement write so SELECT -> validate -> UPDATE
    /// is atomic against concurrent writers. Reads do not take it.
    pub write_lock: Mutex<()>,
    pub bus: NotifyBus,
    /// Working directory for `git apply --check`; `None` when repository
    /// discovery failed at startup (validation then errors cleanly).
    pub repo_root: Option<PathBuf>,
    pool_signals: OnceLock<mpsc::UnboundedSender<PoolSignal>>,
}

impl BrokerCtx {
    pub fn new(pool: SqlitePool, repo_root: Option<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            write_lock: Mutex::new(()),
            bus: NotifyBus::new(),
            repo_root,
            pool_signals: OnceLock::new(),
        })
    }

    /// Wire the reviewer pool's signal channel. At most once per process.
    pub fn register_pool_signals(&self, tx: mpsc::UnboundedSender<PoolSignal>) {
        let _ = self.pool_signals.set(tx);
    }

    pub(crate) fn signal(&self, s: PoolSignal) {
        if let Some(tx) = self.pool_signals.get() {
            if tx.send(s).is_err() {
                debug!("pool signal receiver gone; dropping signal");
            }
        }
    }

    /// Validate a diff against the discovered repository root. Errors when
    /// discovery failed or when the diff does not apply.
    pub(crate) async fn ensure_diff_applies(&self, diff: &str) -> Result<()> {
        let root = self
            .repo_root
            .as_ref()
            .ok_or_else(|| anyhow!("repository root unavailable; cannot validate diff"))?;
        let check = tandem_diff::validate_diff(diff, root).await?;
        if !check.valid {
            return Err(anyhow!("diff validation failed: {}", check.detail));
        }
        Ok(())
    }
}
