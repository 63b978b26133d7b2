//! Learning session lifecycle.
//!
//! A session is one closed-loop improvement cycle for one agent. Its status
//! only ever moves along the edges in [`SessionStatus::can_transition_to`];
//! the coordinator is the only writer and every write goes through
//! [`LearningSession::apply_transition`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::LearningError;

pub const MAX_TRIGGER_REASON_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Collecting,
    Analyzing,
    Proposing,
    Testing,
    AwaitingApproval,
    Approved,
    Promoted,
    Rejected,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub const ALL: [SessionStatus; 10] = [
        SessionStatus::Collecting,
        SessionStatus::Analyzing,
        SessionStatus::Proposing,
        SessionStatus::Testing,
        SessionStatus::AwaitingApproval,
        SessionStatus::Approved,
        SessionStatus::Promoted,
        SessionStatus::Rejected,
        SessionStatus::Failed,
        SessionStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Collecting => "COLLECTING",
            SessionStatus::Analyzing => "ANALYZING",
            SessionStatus::Proposing => "PROPOSING",
            SessionStatus::Testing => "TESTING",
            SessionStatus::AwaitingApproval => "AWAITING_APPROVAL",
            SessionStatus::Approved => "APPROVED",
            SessionStatus::Promoted => "PROMOTED",
            SessionStatus::Rejected => "REJECTED",
            SessionStatus::Failed => "FAILED",
            SessionStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Promoted
                | SessionStatus::Rejected
                | SessionStatus::Failed
                | SessionStatus::Cancelled
        )
    }

    /// States in which a background component is working. Dashboards poll
    /// these; AWAITING_APPROVAL and APPROVED wait on a decision instead.
    pub fn is_working(&self) -> bool {
        matches!(
            self,
            SessionStatus::Collecting
                | SessionStatus::Analyzing
                | SessionStatus::Proposing
                | SessionStatus::Testing
        )
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Failed | Cancelled) {
            return true;
        }
        matches!(
            (self, next),
            (Collecting, Analyzing)
                | (Analyzing, Proposing)
                | (Proposing, Testing)
                | (Testing, AwaitingApproval)
                | (Testing, Rejected)
                | (AwaitingApproval, Approved)
                | (AwaitingApproval, Rejected)
                | (Approved, Promoted)
        )
    }

    pub fn non_terminal() -> Vec<SessionStatus> {
        Self::ALL
            .into_iter()
            .filter(|status| !status.is_terminal())
            .collect()
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = LearningError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| {
                LearningError::validation(format!("unknown session status '{raw}'"), "status")
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Scheduled,
    Threshold,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Manual => "manual",
            TriggerType::Scheduled => "scheduled",
            TriggerType::Threshold => "threshold",
        }
    }
}

/// Why a session was started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub reason: String,
    pub trigger_type: TriggerType,
}

impl Trigger {
    pub fn new(reason: &str, trigger_type: TriggerType) -> Result<Self, LearningError> {
        let trimmed = reason.trim();
        if trimmed.is_empty() {
            return Err(LearningError::validation(
                "triggerReason must not be empty",
                "triggerReason",
            ));
        }
        if trimmed.chars().count() > MAX_TRIGGER_REASON_CHARS {
            return Err(LearningError::validation(
                format!("triggerReason must be <= {MAX_TRIGGER_REASON_CHARS} characters"),
                "triggerReason",
            ));
        }
        Ok(Self {
            reason: trimmed.to_string(),
            trigger_type,
        })
    }
}

/// Free-form session metadata. The named keys are the ones the engine writes;
/// anything else round-trips untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_type: Option<TriggerType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(flatten)]
    #[schema(value_type = Object)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LearningSession {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub status: SessionStatus,
    pub run_count: i64,
    pub dataset_hash: Option<String>,
    pub baseline_version: i32,
    pub baseline_version_id: Uuid,
    pub scorer_config: BTreeSet<String>,
    pub metadata: SessionMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl LearningSession {
    pub fn new(
        agent_id: Uuid,
        baseline_version: i32,
        baseline_version_id: Uuid,
        scorer_config: BTreeSet<String>,
        trigger: &Trigger,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            agent_id,
            status: SessionStatus::Collecting,
            run_count: 0,
            dataset_hash: None,
            baseline_version,
            baseline_version_id,
            scorer_config,
            metadata: SessionMetadata {
                trigger_reason: Some(trigger.reason.clone()),
                trigger_type: Some(trigger.trigger_type),
                ..SessionMetadata::default()
            },
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Move to `next`, stamping `updatedAt` and, for terminal states, `completedAt`.
    pub fn apply_transition(
        &mut self,
        next: SessionStatus,
        now: DateTime<Utc>,
    ) -> Result<(), LearningError> {
        if !self.status.can_transition_to(next) {
            return Err(LearningError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// Time spent in the current status.
    pub fn dwell(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.updated_at)
    }
}
