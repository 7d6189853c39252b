//! Audit event type names.
//!
//! One table so the recorder, the read views, and the tests all agree on
//! spelling. Audit rows are append-only; renaming an event type is a schema
//! change, not an edit.

pub const REVIEW_CREATED: &str = "review_created";
pub const REVIEW_REVISED: &str = "review_revised";
pub const REVIEW_CLAIMED: &str = "review_claimed";
pub const REVIEW_AUTO_REJECTED: &str = "review_auto_rejected";
pub const VERDICT_SUBMITTED: &str = "verdict_submitted";
pub const VERDICT_COMMENT: &str = "verdict_comment";
pub const REVIEW_CLOSED: &str = "review_closed";
pub const REVIEW_RECLAIMED: &str = "review_reclaimed";
pub const COUNTER_PATCH_ACCEPTED: &str = "counter_patch_accepted";
pub const COUNTER_PATCH_REJECTED: &str = "counter_patch_rejected";
pub const MESSAGE_SENT: &str = "message_sent";
pub const REVIEWER_SPAWNED: &str = "reviewer_spawned";
pub const REVIEWER_DRAIN_START: &str = "reviewer_drain_start";
pub const REVIEWER_TERMINATED: &str = "reviewer_terminated";
