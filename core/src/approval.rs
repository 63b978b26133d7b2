//! Approval decisions. Human approve/reject calls, auto-approval and gating
//! rejections all go through [`ApprovalRequest::into_approval`], so they share
//! validation and the one-approval-per-session rule.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::LearningError;
use crate::session::{LearningSession, SessionStatus};

pub const MAX_RATIONALE_CHARS: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
    AutoApproved,
}

impl ApprovalDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalDecision::Approved => "approved",
            ApprovalDecision::Rejected => "rejected",
            ApprovalDecision::AutoApproved => "auto_approved",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "approved" => Some(ApprovalDecision::Approved),
            "rejected" => Some(ApprovalDecision::Rejected),
            "auto_approved" => Some(ApprovalDecision::AutoApproved),
            _ => None,
        }
    }

    pub fn is_approval(&self) -> bool {
        !matches!(self, ApprovalDecision::Rejected)
    }

    /// Session status this decision moves the session to.
    pub fn target_status(&self) -> SessionStatus {
        if self.is_approval() {
            SessionStatus::Approved
        } else {
            SessionStatus::Rejected
        }
    }
}

/// Who is deciding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApprovalSource {
    Human { actor: String },
    Auto,
    Gating,
}

impl ApprovalSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalSource::Human { .. } => "human",
            ApprovalSource::Auto => "auto",
            ApprovalSource::Gating => "gating",
        }
    }

    fn actor(&self) -> Option<String> {
        match self {
            ApprovalSource::Human { actor } => Some(actor.clone()),
            ApprovalSource::Auto => Some("auto".to_string()),
            ApprovalSource::Gating => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    pub id: Uuid,
    pub session_id: Uuid,
    pub decision: ApprovalDecision,
    pub rationale: Option<String>,
    pub approved_by: Option<String>,
    /// Set only once promotion succeeded
    pub promoted_version_id: Option<Uuid>,
    pub auto_approved: bool,
    pub source: String,
    pub reviewed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub decision: ApprovalDecision,
    pub source: ApprovalSource,
    pub rationale: Option<String>,
}

impl ApprovalRequest {
    pub fn human(approve: bool, actor: &str, rationale: Option<String>) -> Self {
        Self {
            decision: if approve {
                ApprovalDecision::Approved
            } else {
                ApprovalDecision::Rejected
            },
            source: ApprovalSource::Human {
                actor: actor.trim().to_string(),
            },
            rationale,
        }
    }

    pub fn auto(rationale: String) -> Self {
        Self {
            decision: ApprovalDecision::AutoApproved,
            source: ApprovalSource::Auto,
            rationale: Some(rationale),
        }
    }

    pub fn gating_rejection(rationale: String) -> Self {
        Self {
            decision: ApprovalDecision::Rejected,
            source: ApprovalSource::Gating,
            rationale: Some(rationale),
        }
    }

    fn validate(&self) -> Result<(), LearningError> {
        match (&self.source, self.decision) {
            (ApprovalSource::Human { actor }, decision) => {
                let field = if decision.is_approval() {
                    "approvedBy"
                } else {
                    "rejectedBy"
                };
                if actor.is_empty() {
                    return Err(LearningError::validation(
                        format!("{field} must not be empty"),
                        field,
                    ));
                }
                if decision == ApprovalDecision::AutoApproved {
                    return Err(LearningError::validation(
                        "humans cannot record auto_approved decisions",
                        "decision",
                    ));
                }
            }
            (ApprovalSource::Auto, ApprovalDecision::AutoApproved) => {}
            (ApprovalSource::Gating, ApprovalDecision::Rejected) => {}
            (source, decision) => {
                return Err(LearningError::Internal(format!(
                    "{} source cannot record {} decisions",
                    source.as_str(),
                    decision.as_str()
                )));
            }
        }
        if let Some(rationale) = &self.rationale {
            if rationale.chars().count() > MAX_RATIONALE_CHARS {
                return Err(LearningError::validation(
                    format!("rationale must be <= {MAX_RATIONALE_CHARS} characters"),
                    "rationale",
                ));
            }
        }
        Ok(())
    }

    /// Status the session must be in for this request to apply.
    pub fn required_status(&self) -> SessionStatus {
        match self.source {
            ApprovalSource::Gating => SessionStatus::Testing,
            _ => SessionStatus::AwaitingApproval,
        }
    }

    /// Validate against the session and any existing approval, then build the record.
    pub fn into_approval(
        self,
        session: &LearningSession,
        existing: Option<&Approval>,
        now: DateTime<Utc>,
    ) -> Result<Approval, LearningError> {
        self.validate()?;
        if existing.is_some() {
            return Err(LearningError::ApprovalExists {
                session_id: session.id,
            });
        }
        let required = self.required_status();
        if session.status != required {
            return Err(LearningError::InvalidTransition {
                from: session.status,
                to: self.decision.target_status(),
            });
        }
        Ok(Approval {
            id: Uuid::now_v7(),
            session_id: session.id,
            decision: self.decision,
            rationale: self
                .rationale
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty()),
            approved_by: self.source.actor(),
            promoted_version_id: None,
            auto_approved: self.decision == ApprovalDecision::AutoApproved,
            source: self.source.as_str().to_string(),
            reviewed_at: now,
            created_at: now,
        })
    }
}
