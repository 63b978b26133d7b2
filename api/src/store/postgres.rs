//! Postgres backend. Schema lives in `migrations/`.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use learnloop_core::approval::{Approval, ApprovalDecision};
use learnloop_core::dataset::{
    Dataset, RunFeedback, RunRecord, RunStatus, SelectionCriteria, ToolCallOutcome,
};
use learnloop_core::experiment::{
    ArmMetrics, Arm, Experiment, ExperimentMode, ExperimentStatus, Sample,
};
use learnloop_core::gating::{ConfidenceInterval, GatingResult, RiskTier};
use learnloop_core::policy::LearningPolicy;
use learnloop_core::proposals::{Proposal, ProposalChange};
use learnloop_core::session::{LearningSession, SessionMetadata, SessionStatus};
use learnloop_core::signals::{Evidence, Severity, Signal, SignalType};
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{
    Agent, AgentVersion, LearningStore, RunSource, SessionCounts, StageWrites, StoreError,
    VersionRegistry, VersionStatus,
};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}

fn decode<T: DeserializeOwned>(value: Value, what: &str) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Corrupt(format!("{what}: {e}")))
}

fn encode<T: serde::Serialize>(value: &T, what: &str) -> Result<Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Corrupt(format!("{what}: {e}")))
}

fn corrupt(what: &str, raw: &str) -> StoreError {
    StoreError::Corrupt(format!("unknown {what} '{raw}'"))
}

const SESSION_COLUMNS: &str = "id, agent_id, status, run_count, dataset_hash, baseline_version, \
     baseline_version_id, scorer_config, metadata, created_at, updated_at, completed_at";

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: Uuid,
    agent_id: Uuid,
    status: String,
    run_count: i64,
    dataset_hash: Option<String>,
    baseline_version: i32,
    baseline_version_id: Uuid,
    scorer_config: Value,
    metadata: Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl SessionRow {
    fn into_session(self) -> Result<LearningSession, StoreError> {
        Ok(LearningSession {
            id: self.id,
            agent_id: self.agent_id,
            status: self
                .status
                .parse::<SessionStatus>()
                .map_err(|_| corrupt("session status", &self.status))?,
            run_count: self.run_count,
            dataset_hash: self.dataset_hash,
            baseline_version: self.baseline_version,
            baseline_version_id: self.baseline_version_id,
            scorer_config: decode::<BTreeSet<String>>(self.scorer_config, "scorer_config")?,
            metadata: decode::<SessionMetadata>(self.metadata, "metadata")?,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DatasetRow {
    id: Uuid,
    session_id: Uuid,
    run_count: i64,
    avg_score: Option<f64>,
    dataset_hash: String,
    from_date: DateTime<Utc>,
    to_date: DateTime<Utc>,
    selection_criteria: Value,
    run_ids: Value,
    created_at: DateTime<Utc>,
}

impl DatasetRow {
    fn into_dataset(self) -> Result<Dataset, StoreError> {
        Ok(Dataset {
            id: self.id,
            session_id: self.session_id,
            run_count: self.run_count,
            avg_score: self.avg_score,
            dataset_hash: self.dataset_hash,
            from_date: self.from_date,
            to_date: self.to_date,
            selection_criteria: decode::<SelectionCriteria>(
                self.selection_criteria,
                "selection_criteria",
            )?,
            run_ids: decode::<Vec<Uuid>>(self.run_ids, "run_ids")?,
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SignalRow {
    id: Uuid,
    session_id: Uuid,
    #[sqlx(rename = "type")]
    signal_type: String,
    severity: Option<String>,
    subject: String,
    pattern: String,
    frequency: i64,
    impact: Option<f64>,
    evidence: Value,
    created_at: DateTime<Utc>,
}

impl SignalRow {
    fn into_signal(self) -> Result<Signal, StoreError> {
        let severity = match self.severity {
            Some(raw) => Some(Severity::parse(&raw).ok_or_else(|| corrupt("severity", &raw))?),
            None => None,
        };
        Ok(Signal {
            id: self.id,
            session_id: self.session_id,
            signal_type: SignalType::parse(&self.signal_type)
                .ok_or_else(|| corrupt("signal type", &self.signal_type))?,
            severity,
            subject: self.subject,
            pattern: self.pattern,
            frequency: self.frequency,
            impact: self.impact,
            evidence: decode::<Vec<Evidence>>(self.evidence, "evidence")?,
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ProposalRow {
    id: Uuid,
    session_id: Uuid,
    proposal_type: String,
    title: String,
    description: String,
    change: Value,
    expected_impact: String,
    confidence_score: Option<f64>,
    generated_by: String,
    risk_tier: String,
    addressed_signal_ids: Value,
    candidate_version_id: Option<Uuid>,
    is_selected: bool,
    created_at: DateTime<Utc>,
}

impl ProposalRow {
    fn into_proposal(self) -> Result<Proposal, StoreError> {
        Ok(Proposal {
            id: self.id,
            session_id: self.session_id,
            proposal_type: self.proposal_type,
            title: self.title,
            description: self.description,
            change: decode::<ProposalChange>(self.change, "change")?,
            expected_impact: self.expected_impact,
            confidence_score: self.confidence_score,
            generated_by: self.generated_by,
            risk_tier: RiskTier::parse(&self.risk_tier)
                .ok_or_else(|| corrupt("risk tier", &self.risk_tier))?,
            addressed_signal_ids: decode::<Vec<Uuid>>(
                self.addressed_signal_ids,
                "addressed_signal_ids",
            )?,
            candidate_version_id: self.candidate_version_id,
            is_selected: self.is_selected,
            created_at: self.created_at,
        })
    }
}

const EXPERIMENT_COLUMNS: &str = "id, session_id, proposal_id, status, mode, baseline_version_id, \
     candidate_version_id, traffic_split, risk_tier, baseline_metrics, candidate_metrics, \
     gating_threshold, min_samples, win_rate, confidence_interval, gating_result, auto_eligible, \
     failure_reason, started_at, completed_at, created_at";

#[derive(sqlx::FromRow)]
struct ExperimentRow {
    id: Uuid,
    session_id: Uuid,
    proposal_id: Uuid,
    status: String,
    mode: String,
    baseline_version_id: Uuid,
    candidate_version_id: Uuid,
    traffic_split: f64,
    risk_tier: String,
    baseline_metrics: Value,
    candidate_metrics: Value,
    gating_threshold: f64,
    min_samples: i64,
    win_rate: Option<f64>,
    confidence_interval: Option<Value>,
    gating_result: Option<String>,
    auto_eligible: bool,
    failure_reason: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl ExperimentRow {
    fn into_experiment(self) -> Result<Experiment, StoreError> {
        let confidence_interval = match self.confidence_interval {
            Some(value) => Some(decode::<ConfidenceInterval>(value, "confidence_interval")?),
            None => None,
        };
        let gating_result = match self.gating_result {
            Some(raw) => {
                Some(GatingResult::parse(&raw).ok_or_else(|| corrupt("gating result", &raw))?)
            }
            None => None,
        };
        Ok(Experiment {
            id: self.id,
            session_id: self.session_id,
            proposal_id: self.proposal_id,
            status: ExperimentStatus::parse(&self.status)
                .ok_or_else(|| corrupt("experiment status", &self.status))?,
            mode: ExperimentMode::parse(&self.mode)
                .ok_or_else(|| corrupt("experiment mode", &self.mode))?,
            baseline_version_id: self.baseline_version_id,
            candidate_version_id: self.candidate_version_id,
            traffic_split: self.traffic_split,
            risk_tier: RiskTier::parse(&self.risk_tier)
                .ok_or_else(|| corrupt("risk tier", &self.risk_tier))?,
            baseline_metrics: decode::<ArmMetrics>(self.baseline_metrics, "baseline_metrics")?,
            candidate_metrics: decode::<ArmMetrics>(self.candidate_metrics, "candidate_metrics")?,
            gating_threshold: self.gating_threshold,
            min_samples: self.min_samples,
            win_rate: self.win_rate,
            confidence_interval,
            gating_result,
            auto_eligible: self.auto_eligible,
            failure_reason: self.failure_reason,
            started_at: self.started_at,
            completed_at: self.completed_at,
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SampleRow {
    id: Uuid,
    experiment_id: Uuid,
    run_id: String,
    arm: String,
    score: f64,
    success: bool,
    pair_key: Option<String>,
    recorded_at: DateTime<Utc>,
}

impl SampleRow {
    fn into_sample(self) -> Result<Sample, StoreError> {
        Ok(Sample {
            id: self.id,
            experiment_id: self.experiment_id,
            arm: Arm::parse(&self.arm).ok_or_else(|| corrupt("arm", &self.arm))?,
            run_id: self.run_id,
            score: self.score,
            success: self.success,
            pair_key: self.pair_key,
            recorded_at: self.recorded_at,
        })
    }
}

const APPROVAL_COLUMNS: &str = "id, session_id, decision, rationale, approved_by, \
     promoted_version_id, auto_approved, source, reviewed_at, created_at";

#[derive(sqlx::FromRow)]
struct ApprovalRow {
    id: Uuid,
    session_id: Uuid,
    decision: String,
    rationale: Option<String>,
    approved_by: Option<String>,
    promoted_version_id: Option<Uuid>,
    auto_approved: bool,
    source: String,
    reviewed_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl ApprovalRow {
    fn into_approval(self) -> Result<Approval, StoreError> {
        Ok(Approval {
            id: self.id,
            session_id: self.session_id,
            decision: ApprovalDecision::parse(&self.decision)
                .ok_or_else(|| corrupt("decision", &self.decision))?,
            rationale: self.rationale,
            approved_by: self.approved_by,
            promoted_version_id: self.promoted_version_id,
            auto_approved: self.auto_approved,
            source: self.source,
            reviewed_at: self.reviewed_at,
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PolicyRow {
    agent_id: Uuid,
    enabled: bool,
    auto_promotion_enabled: bool,
    scheduled_enabled: bool,
    threshold_enabled: bool,
    paused: bool,
    paused_until: Option<DateTime<Utc>>,
    paused_reason: Option<String>,
    paused_by: Option<String>,
    signal_threshold: i64,
    signal_window_minutes: i64,
    schedule_interval_minutes: i64,
    traffic_split_candidate: f64,
    min_confidence_for_auto: f64,
    min_win_rate_for_auto: f64,
    updated_at: Option<DateTime<Utc>>,
}

impl From<PolicyRow> for LearningPolicy {
    fn from(row: PolicyRow) -> Self {
        LearningPolicy {
            agent_id: row.agent_id,
            enabled: row.enabled,
            auto_promotion_enabled: row.auto_promotion_enabled,
            scheduled_enabled: row.scheduled_enabled,
            threshold_enabled: row.threshold_enabled,
            paused: row.paused,
            paused_until: row.paused_until,
            paused_reason: row.paused_reason,
            paused_by: row.paused_by,
            signal_threshold: row.signal_threshold,
            signal_window_minutes: row.signal_window_minutes,
            schedule_interval_minutes: row.schedule_interval_minutes,
            traffic_split_candidate: row.traffic_split_candidate,
            min_confidence_for_auto: row.min_confidence_for_auto,
            min_win_rate_for_auto: row.min_win_rate_for_auto,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    agent_id: Uuid,
    version_id: Option<Uuid>,
    status: String,
    scores: Value,
    tool_calls: Value,
    feedback: Option<Value>,
    completed_at: Option<DateTime<Utc>>,
}

impl RunRow {
    fn into_run(self) -> Result<RunRecord, StoreError> {
        let feedback = match self.feedback {
            Some(value) if !value.is_null() => Some(decode::<RunFeedback>(value, "feedback")?),
            _ => None,
        };
        Ok(RunRecord {
            id: self.id,
            agent_id: self.agent_id,
            version_id: self.version_id,
            status: RunStatus::parse(&self.status)
                .ok_or_else(|| corrupt("run status", &self.status))?,
            scores: decode::<BTreeMap<String, f64>>(self.scores, "scores")?,
            tool_calls: decode::<Vec<ToolCallOutcome>>(self.tool_calls, "tool_calls")?,
            feedback,
            completed_at: self.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AgentRow {
    id: Uuid,
    slug: String,
    name: String,
    created_at: DateTime<Utc>,
}

impl From<AgentRow> for Agent {
    fn from(row: AgentRow) -> Self {
        Agent {
            id: row.id,
            slug: row.slug,
            name: row.name,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct VersionRow {
    id: Uuid,
    agent_id: Uuid,
    version: i32,
    status: String,
    config: Value,
    created_at: DateTime<Utc>,
}

impl VersionRow {
    fn into_version(self) -> Result<AgentVersion, StoreError> {
        Ok(AgentVersion {
            id: self.id,
            agent_id: self.agent_id,
            version: self.version,
            status: VersionStatus::parse(&self.status)
                .ok_or_else(|| corrupt("version status", &self.status))?,
            config: self.config,
            created_at: self.created_at,
        })
    }
}

async fn upsert_experiment(
    tx: &mut Transaction<'_, Postgres>,
    experiment: &Experiment,
) -> Result<u64, StoreError> {
    let confidence_interval = match &experiment.confidence_interval {
        Some(ci) => Some(encode(ci, "confidence_interval")?),
        None => None,
    };
    let result = sqlx::query(
        r#"
        INSERT INTO learning_experiments (
            id, session_id, proposal_id, status, mode, baseline_version_id,
            candidate_version_id, traffic_split, risk_tier, baseline_metrics, candidate_metrics,
            gating_threshold, min_samples, win_rate, confidence_interval, gating_result,
            auto_eligible, failure_reason, started_at, completed_at, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
        ON CONFLICT (id) DO UPDATE SET
            status = EXCLUDED.status,
            baseline_metrics = EXCLUDED.baseline_metrics,
            candidate_metrics = EXCLUDED.candidate_metrics,
            win_rate = EXCLUDED.win_rate,
            confidence_interval = EXCLUDED.confidence_interval,
            gating_result = EXCLUDED.gating_result,
            auto_eligible = EXCLUDED.auto_eligible,
            failure_reason = EXCLUDED.failure_reason,
            started_at = EXCLUDED.started_at,
            completed_at = EXCLUDED.completed_at
        WHERE learning_experiments.status NOT IN ('COMPLETED', 'FAILED')
        "#,
    )
    .bind(experiment.id)
    .bind(experiment.session_id)
    .bind(experiment.proposal_id)
    .bind(experiment.status.as_str())
    .bind(experiment.mode.as_str())
    .bind(experiment.baseline_version_id)
    .bind(experiment.candidate_version_id)
    .bind(experiment.traffic_split)
    .bind(experiment.risk_tier.as_str())
    .bind(encode(&experiment.baseline_metrics, "baseline_metrics")?)
    .bind(encode(&experiment.candidate_metrics, "candidate_metrics")?)
    .bind(experiment.gating_threshold)
    .bind(experiment.min_samples)
    .bind(experiment.win_rate)
    .bind(confidence_interval)
    .bind(experiment.gating_result.map(|r| r.as_str()))
    .bind(experiment.auto_eligible)
    .bind(experiment.failure_reason.as_deref())
    .bind(experiment.started_at)
    .bind(experiment.completed_at)
    .bind(experiment.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected())
}

async fn insert_stage_writes(
    tx: &mut Transaction<'_, Postgres>,
    session_id: Uuid,
    writes: StageWrites,
) -> Result<(), StoreError> {
    if let Some(dataset) = &writes.dataset {
        sqlx::query(
            r#"
            INSERT INTO learning_datasets (
                id, session_id, run_count, avg_score, dataset_hash, from_date, to_date,
                selection_criteria, run_ids, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(dataset.id)
        .bind(dataset.session_id)
        .bind(dataset.run_count)
        .bind(dataset.avg_score)
        .bind(&dataset.dataset_hash)
        .bind(dataset.from_date)
        .bind(dataset.to_date)
        .bind(encode(&dataset.selection_criteria, "selection_criteria")?)
        .bind(encode(&dataset.run_ids, "run_ids")?)
        .bind(dataset.created_at)
        .execute(&mut **tx)
        .await?;
    }

    for signal in &writes.signals {
        sqlx::query(
            r#"
            INSERT INTO learning_signals (
                id, session_id, type, severity, subject, pattern, frequency, impact, evidence, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(signal.id)
        .bind(signal.session_id)
        .bind(signal.signal_type.as_str())
        .bind(signal.severity.map(|s| s.as_str()))
        .bind(&signal.subject)
        .bind(&signal.pattern)
        .bind(signal.frequency)
        .bind(signal.impact)
        .bind(encode(&signal.evidence, "evidence")?)
        .bind(signal.created_at)
        .execute(&mut **tx)
        .await?;
    }

    for proposal in &writes.proposals {
        sqlx::query(
            r#"
            INSERT INTO learning_proposals (
                id, session_id, proposal_type, title, description, change, expected_impact,
                confidence_score, generated_by, risk_tier, addressed_signal_ids,
                candidate_version_id, is_selected, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(proposal.id)
        .bind(proposal.session_id)
        .bind(&proposal.proposal_type)
        .bind(&proposal.title)
        .bind(&proposal.description)
        .bind(encode(&proposal.change, "change")?)
        .bind(&proposal.expected_impact)
        .bind(proposal.confidence_score)
        .bind(&proposal.generated_by)
        .bind(proposal.risk_tier.as_str())
        .bind(encode(&proposal.addressed_signal_ids, "addressed_signal_ids")?)
        .bind(proposal.candidate_version_id)
        .bind(proposal.is_selected)
        .bind(proposal.created_at)
        .execute(&mut **tx)
        .await?;
    }

    if let Some(experiment) = &writes.experiment {
        upsert_experiment(tx, experiment).await?;
    }

    if let Some(approval) = &writes.approval {
        let inserted = sqlx::query(&format!(
            "INSERT INTO learning_approvals ({APPROVAL_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        ))
        .bind(approval.id)
        .bind(approval.session_id)
        .bind(approval.decision.as_str())
        .bind(approval.rationale.as_deref())
        .bind(approval.approved_by.as_deref())
        .bind(approval.promoted_version_id)
        .bind(approval.auto_approved)
        .bind(&approval.source)
        .bind(approval.reviewed_at)
        .bind(approval.created_at)
        .execute(&mut **tx)
        .await;
        if let Err(err) = inserted {
            if is_unique_violation(&err) {
                return Err(StoreError::ApprovalExists { session_id });
            }
            return Err(err.into());
        }
    }

    if let Some((approval_id, version_id)) = writes.promoted_version {
        sqlx::query("UPDATE learning_approvals SET promoted_version_id = $2 WHERE id = $1")
            .bind(approval_id)
            .bind(version_id)
            .execute(&mut **tx)
            .await?;
    }

    Ok(())
}

#[async_trait]
impl LearningStore for PgStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_session(&self, session: &LearningSession) -> Result<(), StoreError> {
        let inserted = sqlx::query(&format!(
            "INSERT INTO learning_sessions ({SESSION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        ))
        .bind(session.id)
        .bind(session.agent_id)
        .bind(session.status.as_str())
        .bind(session.run_count)
        .bind(session.dataset_hash.as_deref())
        .bind(session.baseline_version)
        .bind(session.baseline_version_id)
        .bind(encode(&session.scorer_config, "scorer_config")?)
        .bind(encode(&session.metadata, "metadata")?)
        .bind(session.created_at)
        .bind(session.updated_at)
        .bind(session.completed_at)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(StoreError::ActiveSessionExists {
                agent_id: session.agent_id,
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<LearningSession>, StoreError> {
        sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM learning_sessions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(SessionRow::into_session)
        .transpose()
    }

    async fn active_session(&self, agent_id: Uuid) -> Result<Option<LearningSession>, StoreError> {
        sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM learning_sessions \
             WHERE agent_id = $1 AND status NOT IN ('PROMOTED', 'REJECTED', 'FAILED', 'CANCELLED')"
        ))
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?
        .map(SessionRow::into_session)
        .transpose()
    }

    async fn list_sessions(&self, agent_id: Uuid) -> Result<Vec<LearningSession>, StoreError> {
        sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM learning_sessions \
             WHERE agent_id = $1 ORDER BY created_at DESC, id DESC"
        ))
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(SessionRow::into_session)
        .collect()
    }

    async fn list_active_sessions(&self) -> Result<Vec<LearningSession>, StoreError> {
        sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM learning_sessions \
             WHERE status NOT IN ('PROMOTED', 'REJECTED', 'FAILED', 'CANCELLED') \
             ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(SessionRow::into_session)
        .collect()
    }

    async fn commit_transition(
        &self,
        expected: SessionStatus,
        session: &LearningSession,
        writes: StageWrites,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE learning_sessions
            SET status = $2,
                run_count = $3,
                dataset_hash = $4,
                metadata = $5,
                updated_at = $6,
                completed_at = $7
            WHERE id = $1 AND status = $8
            "#,
        )
        .bind(session.id)
        .bind(session.status.as_str())
        .bind(session.run_count)
        .bind(session.dataset_hash.as_deref())
        .bind(encode(&session.metadata, "metadata")?)
        .bind(session.updated_at)
        .bind(session.completed_at)
        .bind(expected.as_str())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        insert_stage_writes(&mut tx, session.id, writes).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn get_dataset(&self, session_id: Uuid) -> Result<Option<Dataset>, StoreError> {
        sqlx::query_as::<_, DatasetRow>(
            r#"
            SELECT id, session_id, run_count, avg_score, dataset_hash, from_date, to_date,
                   selection_criteria, run_ids, created_at
            FROM learning_datasets
            WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?
        .map(DatasetRow::into_dataset)
        .transpose()
    }

    async fn list_signals(&self, session_id: Uuid) -> Result<Vec<Signal>, StoreError> {
        sqlx::query_as::<_, SignalRow>(
            r#"
            SELECT id, session_id, type, severity, subject, pattern, frequency, impact, evidence, created_at
            FROM learning_signals
            WHERE session_id = $1
            ORDER BY impact DESC NULLS LAST, id ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(SignalRow::into_signal)
        .collect()
    }

    async fn list_proposals(&self, session_id: Uuid) -> Result<Vec<Proposal>, StoreError> {
        sqlx::query_as::<_, ProposalRow>(
            r#"
            SELECT id, session_id, proposal_type, title, description, change, expected_impact,
                   confidence_score, generated_by, risk_tier, addressed_signal_ids,
                   candidate_version_id, is_selected, created_at
            FROM learning_proposals
            WHERE session_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(ProposalRow::into_proposal)
        .collect()
    }

    async fn list_experiments(&self, session_id: Uuid) -> Result<Vec<Experiment>, StoreError> {
        sqlx::query_as::<_, ExperimentRow>(&format!(
            "SELECT {EXPERIMENT_COLUMNS} FROM learning_experiments \
             WHERE session_id = $1 ORDER BY created_at ASC"
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(ExperimentRow::into_experiment)
        .collect()
    }

    async fn list_agent_experiments(&self, agent_id: Uuid) -> Result<Vec<Experiment>, StoreError> {
        sqlx::query_as::<_, ExperimentRow>(&format!(
            "SELECT {} FROM learning_experiments e \
             JOIN learning_sessions s ON s.id = e.session_id \
             WHERE s.agent_id = $1 ORDER BY e.created_at DESC",
            EXPERIMENT_COLUMNS
                .split(", ")
                .map(|c| format!("e.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(ExperimentRow::into_experiment)
        .collect()
    }

    async fn get_experiment(&self, id: Uuid) -> Result<Option<Experiment>, StoreError> {
        sqlx::query_as::<_, ExperimentRow>(&format!(
            "SELECT {EXPERIMENT_COLUMNS} FROM learning_experiments WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(ExperimentRow::into_experiment)
        .transpose()
    }

    async fn save_experiment(&self, experiment: &Experiment) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let affected = upsert_experiment(&mut tx, experiment).await?;
        tx.commit().await?;
        Ok(affected > 0)
    }

    async fn record_sample(
        &self,
        experiment: &Experiment,
        sample: &Sample,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE learning_experiments
            SET baseline_metrics = $2, candidate_metrics = $3
            WHERE id = $1 AND status = 'RUNNING'
            "#,
        )
        .bind(experiment.id)
        .bind(encode(&experiment.baseline_metrics, "baseline_metrics")?)
        .bind(encode(&experiment.candidate_metrics, "candidate_metrics")?)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO learning_experiment_samples (
                id, experiment_id, run_id, arm, score, success, pair_key, recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(sample.id)
        .bind(sample.experiment_id)
        .bind(&sample.run_id)
        .bind(sample.arm.as_str())
        .bind(sample.score)
        .bind(sample.success)
        .bind(sample.pair_key.as_deref())
        .bind(sample.recorded_at)
        .execute(&mut *tx)
        .await;
        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                tx.rollback().await?;
                return Err(StoreError::DuplicateSample {
                    run_id: sample.run_id.clone(),
                });
            }
            Err(err) => return Err(err.into()),
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn list_samples(&self, experiment_id: Uuid) -> Result<Vec<Sample>, StoreError> {
        sqlx::query_as::<_, SampleRow>(
            r#"
            SELECT id, experiment_id, run_id, arm, score, success, pair_key, recorded_at
            FROM learning_experiment_samples
            WHERE experiment_id = $1
            ORDER BY recorded_at ASC, id ASC
            "#,
        )
        .bind(experiment_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(SampleRow::into_sample)
        .collect()
    }

    async fn get_approval(&self, session_id: Uuid) -> Result<Option<Approval>, StoreError> {
        sqlx::query_as::<_, ApprovalRow>(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM learning_approvals WHERE session_id = $1"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?
        .map(ApprovalRow::into_approval)
        .transpose()
    }

    async fn list_agent_approvals(&self, agent_id: Uuid) -> Result<Vec<Approval>, StoreError> {
        sqlx::query_as::<_, ApprovalRow>(
            r#"
            SELECT a.id, a.session_id, a.decision, a.rationale, a.approved_by,
                   a.promoted_version_id, a.auto_approved, a.source, a.reviewed_at, a.created_at
            FROM learning_approvals a
            JOIN learning_sessions s ON s.id = a.session_id
            WHERE s.agent_id = $1
            "#,
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(ApprovalRow::into_approval)
        .collect()
    }

    async fn session_counts(
        &self,
        session_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, SessionCounts>, StoreError> {
        let rows = sqlx::query_as::<_, (Uuid, i64, i64, i64)>(
            r#"
            SELECT ids.id,
                   (SELECT count(*) FROM learning_signals WHERE session_id = ids.id),
                   (SELECT count(*) FROM learning_proposals WHERE session_id = ids.id),
                   (SELECT count(*) FROM learning_experiments WHERE session_id = ids.id)
            FROM unnest($1::uuid[]) AS ids(id)
            "#,
        )
        .bind(session_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, signals, proposals, experiments)| {
                (
                    id,
                    SessionCounts {
                        signals,
                        proposals,
                        experiments,
                    },
                )
            })
            .collect())
    }

    async fn get_policy(&self, agent_id: Uuid) -> Result<Option<LearningPolicy>, StoreError> {
        let row = sqlx::query_as::<_, PolicyRow>(
            r#"
            SELECT agent_id, enabled, auto_promotion_enabled, scheduled_enabled, threshold_enabled,
                   paused, paused_until, paused_reason, paused_by, signal_threshold,
                   signal_window_minutes, schedule_interval_minutes, traffic_split_candidate,
                   min_confidence_for_auto, min_win_rate_for_auto, updated_at
            FROM learning_policies
            WHERE agent_id = $1
            "#,
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(LearningPolicy::from))
    }

    async fn save_policy(&self, policy: &LearningPolicy) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO learning_policies (
                agent_id, enabled, auto_promotion_enabled, scheduled_enabled, threshold_enabled,
                paused, paused_until, paused_reason, paused_by, signal_threshold,
                signal_window_minutes, schedule_interval_minutes, traffic_split_candidate,
                min_confidence_for_auto, min_win_rate_for_auto, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (agent_id) DO UPDATE SET
                enabled = EXCLUDED.enabled,
                auto_promotion_enabled = EXCLUDED.auto_promotion_enabled,
                scheduled_enabled = EXCLUDED.scheduled_enabled,
                threshold_enabled = EXCLUDED.threshold_enabled,
                paused = EXCLUDED.paused,
                paused_until = EXCLUDED.paused_until,
                paused_reason = EXCLUDED.paused_reason,
                paused_by = EXCLUDED.paused_by,
                signal_threshold = EXCLUDED.signal_threshold,
                signal_window_minutes = EXCLUDED.signal_window_minutes,
                schedule_interval_minutes = EXCLUDED.schedule_interval_minutes,
                traffic_split_candidate = EXCLUDED.traffic_split_candidate,
                min_confidence_for_auto = EXCLUDED.min_confidence_for_auto,
                min_win_rate_for_auto = EXCLUDED.min_win_rate_for_auto,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(policy.agent_id)
        .bind(policy.enabled)
        .bind(policy.auto_promotion_enabled)
        .bind(policy.scheduled_enabled)
        .bind(policy.threshold_enabled)
        .bind(policy.paused)
        .bind(policy.paused_until)
        .bind(policy.paused_reason.as_deref())
        .bind(policy.paused_by.as_deref())
        .bind(policy.signal_threshold)
        .bind(policy.signal_window_minutes)
        .bind(policy.schedule_interval_minutes)
        .bind(policy.traffic_split_candidate)
        .bind(policy.min_confidence_for_auto)
        .bind(policy.min_win_rate_for_auto)
        .bind(policy.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RunSource for PgStore {
    async fn runs_between(
        &self,
        agent_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RunRecord>, StoreError> {
        sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, agent_id, version_id, status, scores, tool_calls, feedback, completed_at
            FROM agent_runs
            WHERE agent_id = $1 AND completed_at BETWEEN $2 AND $3
            ORDER BY completed_at DESC, id ASC
            "#,
        )
        .bind(agent_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(RunRow::into_run)
        .collect()
    }

    async fn count_negative_runs(
        &self,
        agent_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT count(*)
            FROM agent_runs r
            WHERE r.agent_id = $1
              AND r.status = 'completed'
              AND r.completed_at >= $2
              AND (
                r.feedback->>'sentiment' = 'negative'
                OR EXISTS (
                    SELECT 1 FROM jsonb_array_elements(r.tool_calls) AS call
                    WHERE (call->>'success')::boolean IS FALSE
                )
              )
            "#,
        )
        .bind(agent_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

const VERSION_COLUMNS: &str = "id, agent_id, version, status, config, created_at";

#[async_trait]
impl VersionRegistry for PgStore {
    async fn find_agent(&self, slug: &str) -> Result<Option<Agent>, StoreError> {
        let row = sqlx::query_as::<_, AgentRow>(
            "SELECT id, slug, name, created_at FROM agents WHERE slug = $1",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Agent::from))
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, StoreError> {
        let rows = sqlx::query_as::<_, AgentRow>(
            "SELECT id, slug, name, created_at FROM agents ORDER BY slug ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Agent::from).collect())
    }

    async fn active_version(&self, agent_id: Uuid) -> Result<Option<AgentVersion>, StoreError> {
        sqlx::query_as::<_, VersionRow>(&format!(
            "SELECT {VERSION_COLUMNS} FROM agent_versions WHERE agent_id = $1 AND status = 'active'"
        ))
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?
        .map(VersionRow::into_version)
        .transpose()
    }

    async fn create_draft(
        &self,
        agent_id: Uuid,
        config: Value,
    ) -> Result<AgentVersion, StoreError> {
        let mut tx = self.pool.begin().await?;
        // Serializes version numbering per agent.
        sqlx::query("SELECT id FROM agents WHERE id = $1 FOR UPDATE")
            .bind(agent_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("agent {agent_id}")))?;

        let row = sqlx::query_as::<_, VersionRow>(&format!(
            "INSERT INTO agent_versions (id, agent_id, version, status, config, created_at) \
             SELECT $1, $2, COALESCE(MAX(version), 0) + 1, 'draft', $3, now() \
             FROM agent_versions WHERE agent_id = $2 \
             RETURNING {VERSION_COLUMNS}"
        ))
        .bind(Uuid::now_v7())
        .bind(agent_id)
        .bind(config)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        row.into_version()
    }

    async fn promote(
        &self,
        agent_id: Uuid,
        candidate_id: Uuid,
    ) -> Result<AgentVersion, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT id FROM agents WHERE id = $1 FOR UPDATE")
            .bind(agent_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("agent {agent_id}")))?;

        sqlx::query(
            "UPDATE agent_versions SET status = 'archived' WHERE agent_id = $1 AND status = 'active'",
        )
        .bind(agent_id)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, VersionRow>(&format!(
            "UPDATE agent_versions SET status = 'active' \
             WHERE id = $1 AND agent_id = $2 AND status = 'draft' \
             RETURNING {VERSION_COLUMNS}"
        ))
        .bind(candidate_id)
        .bind(agent_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Err(StoreError::NotFound(format!("draft version {candidate_id}")));
        };
        tx.commit().await?;
        row.into_version()
    }

    async fn discard_draft(&self, version_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE agent_versions SET status = 'discarded' WHERE id = $1 AND status = 'draft'")
            .bind(version_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn discard_stale_drafts(
        &self,
        agent_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE agent_versions SET status = 'discarded' \
             WHERE agent_id = $1 AND status = 'draft' AND created_at <= $2",
        )
        .bind(agent_id)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
