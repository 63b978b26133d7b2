//! Persistence seams of the learning engine.
//!
//! `LearningStore` owns sessions and everything hanging off them, `RunSource`
//! reads agent runs produced by the execution subsystem, `VersionRegistry`
//! owns agents and their versions. Postgres and in-memory backends implement
//! all three.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use learnloop_core::approval::Approval;
use learnloop_core::dataset::{Dataset, RunRecord};
use learnloop_core::error::{DenialReason, LearningError};
use learnloop_core::experiment::{Experiment, Sample};
use learnloop_core::policy::LearningPolicy;
use learnloop_core::proposals::Proposal;
use learnloop_core::session::{LearningSession, SessionStatus};
use learnloop_core::signals::Signal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("agent {agent_id} already has an active learning session")]
    ActiveSessionExists { agent_id: Uuid },
    #[error("session {session_id} already has an approval")]
    ApprovalExists { session_id: Uuid },
    #[error("sample for run {run_id} already recorded on this arm")]
    DuplicateSample { run_id: String },
    #[error("{0} not found")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<StoreError> for LearningError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ActiveSessionExists { .. } => {
                LearningError::PolicyDenied(DenialReason::AlreadyActiveSession)
            }
            StoreError::ApprovalExists { session_id } => LearningError::ApprovalExists { session_id },
            StoreError::NotFound(resource) => LearningError::NotFound { resource },
            err @ StoreError::DuplicateSample { .. } => {
                LearningError::validation(err.to_string(), "runId")
            }
            other => LearningError::Storage(other.to_string()),
        }
    }
}

/// Rows written atomically together with a status change.
#[derive(Debug, Default, Clone)]
pub struct StageWrites {
    pub dataset: Option<Dataset>,
    pub signals: Vec<Signal>,
    pub proposals: Vec<Proposal>,
    /// Inserted or replaced
    pub experiment: Option<Experiment>,
    /// Inserted; fails with `ApprovalExists` when the session already has one
    pub approval: Option<Approval>,
    /// (approval id, promoted version id)
    pub promoted_version: Option<(Uuid, Uuid)>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionCounts {
    pub signals: i64,
    pub proposals: i64,
    pub experiments: i64,
}

#[async_trait]
pub trait LearningStore: Send + Sync {
    /// Backend name reported by /health.
    fn backend(&self) -> &'static str;

    async fn ping(&self) -> Result<(), StoreError>;

    /// Insert a new session. Fails with `ActiveSessionExists` when the agent
    /// already has a non-terminal session; the check and the insert are atomic.
    async fn create_session(&self, session: &LearningSession) -> Result<(), StoreError>;

    async fn get_session(&self, id: Uuid) -> Result<Option<LearningSession>, StoreError>;

    async fn active_session(&self, agent_id: Uuid) -> Result<Option<LearningSession>, StoreError>;

    /// Newest first.
    async fn list_sessions(&self, agent_id: Uuid) -> Result<Vec<LearningSession>, StoreError>;

    /// Non-terminal sessions across all agents.
    async fn list_active_sessions(&self) -> Result<Vec<LearningSession>, StoreError>;

    /// Persist `session` (already moved to its new status) only if the stored
    /// status still equals `expected`, together with `writes`. Returns false
    /// when another writer changed the status first; nothing is written then.
    async fn commit_transition(
        &self,
        expected: SessionStatus,
        session: &LearningSession,
        writes: StageWrites,
    ) -> Result<bool, StoreError>;

    async fn get_dataset(&self, session_id: Uuid) -> Result<Option<Dataset>, StoreError>;

    async fn list_signals(&self, session_id: Uuid) -> Result<Vec<Signal>, StoreError>;

    async fn list_proposals(&self, session_id: Uuid) -> Result<Vec<Proposal>, StoreError>;

    async fn list_experiments(&self, session_id: Uuid) -> Result<Vec<Experiment>, StoreError>;

    async fn list_agent_experiments(&self, agent_id: Uuid) -> Result<Vec<Experiment>, StoreError>;

    async fn get_experiment(&self, id: Uuid) -> Result<Option<Experiment>, StoreError>;

    /// Replace the experiment row. Refuses to overwrite a terminal experiment.
    async fn save_experiment(&self, experiment: &Experiment) -> Result<bool, StoreError>;

    /// Insert the sample and store the experiment's updated arm metrics in one
    /// step. Returns false when the experiment is not running; fails with
    /// `DuplicateSample` when the run already has a sample on that arm.
    async fn record_sample(&self, experiment: &Experiment, sample: &Sample)
    -> Result<bool, StoreError>;

    async fn list_samples(&self, experiment_id: Uuid) -> Result<Vec<Sample>, StoreError>;

    async fn get_approval(&self, session_id: Uuid) -> Result<Option<Approval>, StoreError>;

    async fn list_agent_approvals(&self, agent_id: Uuid) -> Result<Vec<Approval>, StoreError>;

    async fn session_counts(
        &self,
        session_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, SessionCounts>, StoreError>;

    async fn get_policy(&self, agent_id: Uuid) -> Result<Option<LearningPolicy>, StoreError>;

    async fn save_policy(&self, policy: &LearningPolicy) -> Result<(), StoreError>;
}

#[async_trait]
pub trait RunSource: Send + Sync {
    /// Runs of `agent_id` completed inside `[from, to]`.
    async fn runs_between(
        &self,
        agent_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RunRecord>, StoreError>;

    /// Completed runs since `since` with negative feedback or a failed tool call.
    async fn count_negative_runs(
        &self,
        agent_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    Draft,
    Active,
    Archived,
    Discarded,
}

impl VersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionStatus::Draft => "draft",
            VersionStatus::Active => "active",
            VersionStatus::Archived => "archived",
            VersionStatus::Discarded => "discarded",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "draft" => Some(VersionStatus::Draft),
            "active" => Some(VersionStatus::Active),
            "archived" => Some(VersionStatus::Archived),
            "discarded" => Some(VersionStatus::Discarded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentVersion {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub version: i32,
    pub status: VersionStatus,
    #[schema(value_type = Object)]
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait VersionRegistry: Send + Sync {
    async fn find_agent(&self, slug: &str) -> Result<Option<Agent>, StoreError>;

    async fn list_agents(&self) -> Result<Vec<Agent>, StoreError>;

    async fn active_version(&self, agent_id: Uuid) -> Result<Option<AgentVersion>, StoreError>;

    /// New draft version numbered after the agent's highest version.
    async fn create_draft(
        &self,
        agent_id: Uuid,
        config: serde_json::Value,
    ) -> Result<AgentVersion, StoreError>;

    /// Archive the active version and activate `candidate_id`.
    async fn promote(&self, agent_id: Uuid, candidate_id: Uuid)
    -> Result<AgentVersion, StoreError>;

    /// Mark a draft as discarded. No-op for non-draft versions.
    async fn discard_draft(&self, version_id: Uuid) -> Result<(), StoreError>;

    /// Discard every draft of the agent created before `cutoff`; returns how
    /// many were discarded.
    async fn discard_stale_drafts(
        &self,
        agent_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}
