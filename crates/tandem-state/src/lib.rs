//! Review lifecycle state machine.
//!
//! Pure deterministic logic. No I/O, no wall-clock. The store layer owns the
//! rows; this crate owns which status changes are legal and how the claim
//! fence behaves. Every write path in the broker goes through
//! [`assert_transition`] before touching the database.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Review status. `Closed` is terminal.
///
/// `InReview` is a legal intermediate between `Claimed` and a verdict; the
/// current tool surface never drives the `Claimed -> InReview` edge, but the
/// machine accepts it so a future reviewer protocol can distinguish "claimed
/// but not yet started" from "actively reviewing" without a schema change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Claimed,
    InReview,
    Approved,
    ChangesRequested,
    Closed,
}

/// All statuses, in display order.
pub const ALL_STATUSES: [ReviewStatus; 6] = [
    ReviewStatus::Pending,
    ReviewStatus::Claimed,
    ReviewStatus::InReview,
    ReviewStatus::Approved,
    ReviewStatus::ChangesRequested,
    ReviewStatus::Closed,
];

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Claimed => "claimed",
            ReviewStatus::InReview => "in_review",
            ReviewStatus::Approved => "approved",
            ReviewStatus::ChangesRequested => "changes_requested",
            ReviewStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ReviewStatus::Pending),
            "claimed" => Ok(ReviewStatus::Claimed),
            "in_review" => Ok(ReviewStatus::InReview),
            "approved" => Ok(ReviewStatus::Approved),
            "changes_requested" => Ok(ReviewStatus::ChangesRequested),
            "closed" => Ok(ReviewStatus::Closed),
            other => Err(anyhow!("invalid review status: {}", other)),
        }
    }

    /// Legal sinks for this status.
    ///
    /// `Claimed -> Pending` is the reclaim path; `ChangesRequested -> Pending`
    /// is the revision path.
    pub fn allowed_transitions(&self) -> &'static [ReviewStatus] {
        match self {
            ReviewStatus::Pending => &[ReviewStatus::Claimed],
            ReviewStatus::Claimed => &[
                ReviewStatus::InReview,
                ReviewStatus::Approved,
                ReviewStatus::ChangesRequested,
                ReviewStatus::Pending,
            ],
            ReviewStatus::InReview => {
                &[ReviewStatus::Approved, ReviewStatus::ChangesRequested]
            }
            ReviewStatus::Approved => &[ReviewStatus::Closed],
            ReviewStatus::ChangesRequested => {
                &[ReviewStatus::Closed, ReviewStatus::Pending]
            }
            ReviewStatus::Closed => &[],
        }
    }

    pub fn can_transition(&self, to: ReviewStatus) -> bool {
        self.allowed_transitions().contains(&to)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ReviewStatus::Closed)
    }

    /// True for the two statuses from which a verdict may be submitted.
    pub fn accepts_verdict(&self) -> bool {
        matches!(self, ReviewStatus::Claimed | ReviewStatus::InReview)
    }
}

impl std::fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fail unless `from -> to` is in the transition table. State is untouched on
/// failure; the caller returns the error to the client as-is.
pub fn assert_transition(from: ReviewStatus, to: ReviewStatus) -> Result<()> {
    if from.can_transition(to) {
        Ok(())
    } else {
        Err(anyhow!("invalid transition: {} -> {}", from, to))
    }
}

/// The generation a review moves to when a claim (or reclaim) succeeds.
/// Strictly monotone: every entry into `claimed`, and every reclaim back to
/// `pending`, advances the fence by exactly one.
pub fn next_generation(current: i64) -> i64 {
    current + 1
}
