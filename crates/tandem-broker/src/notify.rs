//! Per-review notification bus.
//!
//! One `tokio::sync::Notify` per review id, created lazily when the first
//! waiter or notifier touches the id. `notify` is always called after the
//! enclosing write transaction commits, so a woken poller reads the new
//! state; the map entry is dropped when a review reaches its terminal state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

#[derive(Default)]
pub struct NotifyBus {
    inner: Mutex<HashMap<String, Arc<Notify>>>,
}

impl NotifyBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, review_id: &str) -> Arc<Notify> {
        let mut map = self.inner.lock().expect("notify bus poisoned");
        map.entry(review_id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Wake every task currently waiting on this review.
    pub fn notify(&self, review_id: &str) {
        let existing = {
            let map = self.inner.lock().expect("notify bus poisoned");
            map.get(review_id).cloned()
        };
        if let Some(n) = existing {
            n.notify_waiters();
        }
    }

    /// Wait until the review changes or `timeout` elapses. Returns `true`
    /// when notified, `false` on timeout.
    pub async fn wait_for_change(&self, review_id: &str, timeout: Duration) -> bool {
        let n = self.handle(review_id);
        let notified = n.notified();
        tokio::time::timeout(timeout, notified).await.is_ok()
    }

    /// Drop the entry for a terminated review. Waiters already parked keep
    /// their own `Arc` and still time out normally.
    pub fn remove(&self, review_id: &str) {
        let mut map = self.inner.lock().expect("notify bus poisoned");
        map.remove(review_id);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}
