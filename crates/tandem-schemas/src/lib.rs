//! Shared wire and record types for the tandem review broker.
//!
//! Everything here is `Serialize + Deserialize` so it can cross the RPC
//! boundary and be decoded by tests. No I/O lives in this crate.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod events;

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Review priority, inferred once at creation and immutable thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "critical" => Ok(Priority::Critical),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(anyhow!("invalid priority: {}", other)),
        }
    }
}

/// Priority inference from proposer identity.
///
/// The mapping is deliberately a single visible table:
///   agent_type containing "planner"  -> critical (plan gates everything else)
///   agent_type containing "verifier" -> low      (post-hoc, nothing blocks on it)
///   anything else                    -> normal
pub fn infer_priority(agent_type: &str, _phase: Option<&str>) -> Priority {
    let t = agent_type.to_ascii_lowercase();
    if t.contains("planner") {
        Priority::Critical
    } else if t.contains("verifier") {
        Priority::Low
    } else {
        Priority::Normal
    }
}

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// Reviewer verdict. `Comment` never transitions review state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approved,
    ChangesRequested,
    Comment,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Approved => "approved",
            Verdict::ChangesRequested => "changes_requested",
            Verdict::Comment => "comment",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "approved" => Ok(Verdict::Approved),
            "changes_requested" => Ok(Verdict::ChangesRequested),
            "comment" => Ok(Verdict::Comment),
            other => Err(anyhow!(
                "invalid verdict: {} (expected approved | changes_requested | comment)",
                other
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// SenderRole
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    Proposer,
    Reviewer,
}

impl SenderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderRole::Proposer => "proposer",
            SenderRole::Reviewer => "reviewer",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "proposer" => Ok(SenderRole::Proposer),
            "reviewer" => Ok(SenderRole::Reviewer),
            other => Err(anyhow!(
                "invalid sender_role: {} (expected proposer | reviewer)",
                other
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Counter-patch status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterPatchStatus {
    Pending,
    Accepted,
    Rejected,
}

impl CounterPatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CounterPatchStatus::Pending => "pending",
            CounterPatchStatus::Accepted => "accepted",
            CounterPatchStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(CounterPatchStatus::Pending),
            "accepted" => Ok(CounterPatchStatus::Accepted),
            "rejected" => Ok(CounterPatchStatus::Rejected),
            other => Err(anyhow!("invalid counter_patch_status: {}", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Reviewer status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewerStatus {
    Active,
    Draining,
    Terminated,
}

impl ReviewerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewerStatus::Active => "active",
            ReviewerStatus::Draining => "draining",
            ReviewerStatus::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(ReviewerStatus::Active),
            "draining" => Ok(ReviewerStatus::Draining),
            "terminated" => Ok(ReviewerStatus::Terminated),
            other => Err(anyhow!("invalid reviewer status: {}", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Affected files
// ---------------------------------------------------------------------------

/// Per-file operation derived from a unified diff header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    Create,
    Modify,
    Delete,
}

/// One entry of a review's derived `affected_files` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffectedFile {
    pub path: String,
    pub operation: FileOperation,
    pub added: i64,
    pub removed: i64,
}

// ---------------------------------------------------------------------------
// Tool arguments
// ---------------------------------------------------------------------------

fn default_timeout_seconds() -> f64 {
    25.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateReviewArgs {
    pub intent: String,
    pub agent_type: String,
    pub agent_role: String,
    pub phase: String,
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub diff: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    /// When present, this call is a revision of an existing review in
    /// `changes_requested`.
    #[serde(default)]
    pub review_id: Option<String>,
    /// Opt-in for post-commit review of diffs already applied to the tree.
    #[serde(default)]
    pub skip_diff_validation: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListReviewsArgs {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimReviewArgs {
    pub review_id: String,
    pub reviewer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitVerdictArgs {
    pub review_id: String,
    pub verdict: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub counter_patch: Option<String>,
    #[serde(default)]
    pub reviewer_id: Option<String>,
    #[serde(default)]
    pub claim_generation: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewIdArgs {
    pub review_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddMessageArgs {
    pub review_id: String,
    pub sender_role: String,
    pub body: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetDiscussionArgs {
    pub review_id: String,
    #[serde(default)]
    pub round: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetReviewStatusArgs {
    pub review_id: String,
    #[serde(default)]
    pub wait: bool,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetAuditLogArgs {
    #[serde(default)]
    pub review_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillReviewerArgs {
    pub reviewer_id: String,
}

// ---------------------------------------------------------------------------
// Tool responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateReviewResponse {
    pub review_id: String,
    pub status: String,
    pub priority: String,
    pub category: Option<String>,
    pub current_round: i64,
}

/// Claim success payload. The diff body is intentionally absent; clients
/// fetch it via `get_proposal` so list/claim responses stay small.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimReviewResponse {
    pub review_id: String,
    pub status: String,
    pub intent: String,
    pub description: Option<String>,
    pub affected_files: Vec<AffectedFile>,
    pub category: Option<String>,
    pub claim_generation: i64,
    pub has_diff: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerdictResponse {
    pub review_id: String,
    pub status: String,
    pub verdict: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterPatchResponse {
    pub review_id: String,
    pub status: String,
    pub counter_patch_status: String,
    pub current_round: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddMessageResponse {
    pub message_id: String,
    pub review_id: String,
    pub round: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseReviewResponse {
    pub review_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewSummary {
    pub review_id: String,
    pub status: String,
    pub intent: String,
    pub agent_type: String,
    pub agent_role: String,
    pub phase: String,
    pub category: Option<String>,
    pub priority: String,
    pub claimed_by: Option<String>,
    pub claim_generation: i64,
    pub current_round: i64,
    pub has_diff: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Full review record, returned only by `get_proposal`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewDetail {
    pub review_id: String,
    pub status: String,
    pub intent: String,
    pub description: Option<String>,
    pub diff: Option<String>,
    pub affected_files: Vec<AffectedFile>,
    pub agent_type: String,
    pub agent_role: String,
    pub phase: String,
    pub plan: Option<String>,
    pub task: Option<String>,
    pub category: Option<String>,
    pub priority: String,
    pub claimed_by: Option<String>,
    pub claim_generation: i64,
    pub verdict_reason: Option<String>,
    pub current_round: i64,
    pub counter_patch: Option<String>,
    pub counter_patch_status: Option<String>,
    pub parent_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageView {
    pub message_id: String,
    pub review_id: String,
    pub sender_role: String,
    pub round: i64,
    pub body: String,
    pub metadata: Option<Value>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastMessageSummary {
    pub sender_role: String,
    pub preview: String,
    pub round: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewStatusResponse {
    pub review_id: String,
    pub status: String,
    pub priority: String,
    pub category: Option<String>,
    pub claim_generation: i64,
    pub current_round: i64,
    pub verdict_reason: Option<String>,
    pub counter_patch_status: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub last_message: Option<LastMessageSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEventView {
    pub event_id: i64,
    pub review_id: Option<String>,
    pub event_type: String,
    pub actor: String,
    pub old_status: Option<String>,
    pub new_status: Option<String>,
    pub metadata: Option<Value>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityItem {
    pub review_id: String,
    pub status: String,
    pub intent: String,
    pub category: Option<String>,
    pub priority: String,
    pub message_count: i64,
    pub last_message: Option<LastMessageSummary>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewStats {
    pub total_reviews: i64,
    pub by_status: Value,
    pub by_category: Value,
    /// Null when no verdicts have ever been submitted.
    pub approval_rate_pct: Option<f64>,
    pub avg_seconds_to_first_verdict: Option<f64>,
    pub avg_seconds_to_close: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewerView {
    pub reviewer_id: String,
    pub display_name: String,
    pub status: String,
    pub pid: Option<i64>,
    pub spawned_at: String,
    pub last_active_at: Option<String>,
    pub terminated_at: Option<String>,
    pub exit_code: Option<i64>,
    pub reviews_completed: i64,
    pub total_review_seconds: f64,
    pub approvals: i64,
    pub rejections: i64,
}
