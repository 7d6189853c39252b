//! Row -> wire-view mapping. Legacy row timestamps are normalized to ISO
//! here, at the output boundary only.

use serde_json::Value;

use tandem_db::{
    legacy_to_iso, ActivityRow, AuditEventRow, MessageRow, ReviewRow, ReviewerRow,
};
use tandem_schemas::{
    ActivityItem, AffectedFile, AuditEventView, LastMessageSummary, MessageView, ReviewDetail,
    ReviewStatusResponse, ReviewSummary, ReviewerView,
};

/// Parse the stored affected-files JSON; an unreadable value is an empty
/// list, mirroring the extraction fallback.
pub fn parse_affected(raw: Option<&str>) -> Vec<AffectedFile> {
    raw.and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default()
}

fn parse_metadata(raw: Option<&str>) -> Option<Value> {
    raw.and_then(|s| serde_json::from_str(s).ok())
}

pub fn review_summary(r: &ReviewRow) -> ReviewSummary {
    ReviewSummary {
        review_id: r.id.clone(),
        status: r.status.as_str().to_string(),
        intent: r.intent.clone(),
        agent_type: r.agent_type.clone(),
        agent_role: r.agent_role.clone(),
        phase: r.phase.clone(),
        category: r.category.clone(),
        priority: r.priority.as_str().to_string(),
        claimed_by: r.claimed_by.clone(),
        claim_generation: r.claim_generation,
        current_round: r.current_round,
        has_diff: r.diff.is_some(),
        created_at: legacy_to_iso(&r.created_at),
        updated_at: legacy_to_iso(&r.updated_at),
    }
}

pub fn review_detail(r: &ReviewRow) -> ReviewDetail {
    ReviewDetail {
        review_id: r.id.clone(),
        status: r.status.as_str().to_string(),
        intent: r.intent.clone(),
        description: r.description.clone(),
        diff: r.diff.clone(),
        affected_files: parse_affected(r.affected_files.as_deref()),
        agent_type: r.agent_type.clone(),
        agent_role: r.agent_role.clone(),
        phase: r.phase.clone(),
        plan: r.plan.clone(),
        task: r.task.clone(),
        category: r.category.clone(),
        priority: r.priority.as_str().to_string(),
        claimed_by: r.claimed_by.clone(),
        claim_generation: r.claim_generation,
        verdict_reason: r.verdict_reason.clone(),
        current_round: r.current_round,
        counter_patch: r.counter_patch.clone(),
        counter_patch_status: r.counter_patch_status.clone(),
        parent_id: r.parent_id.clone(),
        created_at: legacy_to_iso(&r.created_at),
        updated_at: legacy_to_iso(&r.updated_at),
    }
}

pub fn status_response(
    r: &ReviewRow,
    last_message: Option<LastMessageSummary>,
) -> ReviewStatusResponse {
    ReviewStatusResponse {
        review_id: r.id.clone(),
        status: r.status.as_str().to_string(),
        priority: r.priority.as_str().to_string(),
        category: r.category.clone(),
        claim_generation: r.claim_generation,
        current_round: r.current_round,
        verdict_reason: r.verdict_reason.clone(),
        counter_patch_status: r.counter_patch_status.clone(),
        created_at: legacy_to_iso(&r.created_at),
        updated_at: legacy_to_iso(&r.updated_at),
        last_message,
    }
}

pub fn message_view(m: &MessageRow) -> MessageView {
    MessageView {
        message_id: m.id.clone(),
        review_id: m.review_id.clone(),
        sender_role: m.sender_role.clone(),
        round: m.round,
        body: m.body.clone(),
        metadata: parse_metadata(m.metadata.as_deref()),
        created_at: legacy_to_iso(&m.created_at),
    }
}

pub fn audit_view(e: &AuditEventRow) -> AuditEventView {
    AuditEventView {
        event_id: e.id,
        review_id: e.review_id.clone(),
        event_type: e.event_type.clone(),
        actor: e.actor.clone(),
        old_status: e.old_status.clone(),
        new_status: e.new_status.clone(),
        metadata: parse_metadata(e.metadata.as_deref()),
        created_at: e.created_at.clone(),
    }
}

pub fn reviewer_view(r: &ReviewerRow) -> ReviewerView {
    ReviewerView {
        reviewer_id: r.id.clone(),
        display_name: r.display_name.clone(),
        status: r.status.as_str().to_string(),
        pid: r.pid,
        spawned_at: legacy_to_iso(&r.spawned_at),
        last_active_at: r.last_active_at.as_deref().map(legacy_to_iso),
        terminated_at: r.terminated_at.as_deref().map(legacy_to_iso),
        exit_code: r.exit_code,
        reviews_completed: r.reviews_completed,
        total_review_seconds: r.total_review_seconds,
        approvals: r.approvals,
        rejections: r.rejections,
    }
}

pub fn activity_item(a: &ActivityRow) -> ActivityItem {
    let last_message = match (&a.last_sender, &a.last_body) {
        (Some(sender), Some(body)) => Some(LastMessageSummary {
            sender_role: sender.clone(),
            preview: tandem_db::messages::preview(body),
            round: a.last_round.unwrap_or(1),
            created_at: a
                .last_message_at
                .as_deref()
                .map(legacy_to_iso)
                .unwrap_or_default(),
        }),
        _ => None,
    };
    ActivityItem {
        review_id: a.id.clone(),
        status: a.status.clone(),
        intent: a.intent.clone(),
        category: a.category.clone(),
        priority: a.priority.clone(),
        message_count: a.message_count,
        last_message,
        created_at: legacy_to_iso(&a.created_at),
        updated_at: legacy_to_iso(&a.updated_at),
    }
}
