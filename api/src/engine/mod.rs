//! Session coordinator.
//!
//! Each session is advanced by one background driver task at a time (per-session
//! lock). Every status change goes through `LearningStore::commit_transition`,
//! a compare-and-set on the previous status, so a cancel or a human decision
//! racing the driver leaves exactly one winner. Stage outputs are written in
//! the same commit as the transition that follows them.

pub mod events;
pub mod locks;
pub mod policy;
pub mod proposer;
pub mod runner;
pub mod scheduler;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use learnloop_core::approval::{Approval, ApprovalRequest};
use learnloop_core::dataset::{Dataset, DatasetBuilder, DatasetSnapshot, RunRecord, SelectionCriteria};
use learnloop_core::error::LearningError;
use learnloop_core::experiment::{Experiment, ExperimentMode, ExperimentStatus, NewExperiment};
use learnloop_core::metrics::MetricsSummary;
use learnloop_core::policy::{Admission, is_auto_promotion_allowed, is_session_creation_allowed};
use learnloop_core::proposals::{Proposal, mark_selected, select_proposal};
use learnloop_core::session::{LearningSession, SessionMetadata, SessionStatus, Trigger};
use learnloop_core::signals::{DetectorConfig, Signal, SignalDetector, sort_by_impact};
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::store::{Agent, LearningStore, RunSource, StageWrites, VersionRegistry};
use events::{EventHub, SessionEvent};
use locks::KeyedLocks;
use policy::PolicyEngine;
use proposer::{ProposalModel, with_retry};
use runner::{ExperimentRunner, Replayer};

const MAX_CANCEL_REASON_CHARS: usize = 1000;
const CANCEL_ATTEMPTS: usize = 3;

/// Cooperative cancellation, checked by stages between steps.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn checkpoint(&self) -> Result<(), LearningError> {
        if self.is_cancelled() {
            Err(LearningError::Cancelled)
        } else {
            Ok(())
        }
    }
}

pub struct EngineDeps {
    pub store: Arc<dyn LearningStore>,
    pub runs: Arc<dyn RunSource>,
    pub versions: Arc<dyn VersionRegistry>,
    pub proposer: Arc<dyn ProposalModel>,
    pub replayer: Option<Arc<dyn Replayer>>,
    pub config: EngineConfig,
}

pub struct Coordinator {
    store: Arc<dyn LearningStore>,
    runs: Arc<dyn RunSource>,
    versions: Arc<dyn VersionRegistry>,
    proposer: Arc<dyn ProposalModel>,
    policies: PolicyEngine,
    runner: ExperimentRunner,
    events: EventHub,
    config: Arc<EngineConfig>,
    session_locks: KeyedLocks<Uuid>,
    promotion_locks: KeyedLocks<Uuid>,
    cancel_flags: Mutex<HashMap<Uuid, CancelFlag>>,
}

impl Coordinator {
    pub fn new(deps: EngineDeps) -> Arc<Self> {
        let config = Arc::new(deps.config);
        Arc::new(Self {
            policies: PolicyEngine::new(deps.store.clone()),
            runner: ExperimentRunner::new(deps.store.clone(), deps.replayer, config.clone()),
            store: deps.store,
            runs: deps.runs,
            versions: deps.versions,
            proposer: deps.proposer,
            events: EventHub::default(),
            config,
            session_locks: KeyedLocks::new(),
            promotion_locks: KeyedLocks::new(),
            cancel_flags: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &Arc<dyn LearningStore> {
        &self.store
    }

    pub fn runs(&self) -> &Arc<dyn RunSource> {
        &self.runs
    }

    pub fn versions(&self) -> &Arc<dyn VersionRegistry> {
        &self.versions
    }

    pub fn policies(&self) -> &PolicyEngine {
        &self.policies
    }

    pub fn runner(&self) -> &ExperimentRunner {
        &self.runner
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn load_session(&self, session_id: Uuid) -> Result<LearningSession, LearningError> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| LearningError::NotFound {
                resource: format!("session {session_id}"),
            })
    }

    /// Admit a trigger and create a COLLECTING session, then return while a
    /// background task drives it.
    pub async fn create_session(
        self: &Arc<Self>,
        agent: &Agent,
        trigger: Trigger,
    ) -> Result<LearningSession, LearningError> {
        let session = {
            let _agent_guard = self.policies.lock_agent(agent.id).await;
            let now = Utc::now();
            let policy = self.policies.load(agent.id).await?;
            let has_active = self.store.active_session(agent.id).await?.is_some();
            if let Admission::Denied(reason) =
                is_session_creation_allowed(&policy, has_active, trigger.trigger_type, now)
            {
                tracing::info!(
                    agent_id = %agent.id,
                    agent = %agent.slug,
                    trigger_type = trigger.trigger_type.as_str(),
                    reason = reason.code(),
                    "learning session denied"
                );
                return Err(LearningError::PolicyDenied(reason));
            }

            let baseline = self
                .versions
                .active_version(agent.id)
                .await?
                .ok_or_else(|| LearningError::NotFound {
                    resource: format!("active version of agent {}", agent.slug),
                })?;
            // Left behind by a crash mid-proposal.
            self.discard_stale_drafts(agent.id, now).await;
            let session = LearningSession::new(
                agent.id,
                baseline.version,
                baseline.id,
                self.config.scorers.clone(),
                &trigger,
                now,
            );
            self.store.create_session(&session).await?;
            session
        };

        tracing::info!(
            session_id = %session.id,
            agent_id = %agent.id,
            agent = %agent.slug,
            trigger_type = trigger.trigger_type.as_str(),
            trigger_reason = %trigger.reason,
            baseline_version = session.baseline_version,
            "learning session created"
        );
        self.events.publish(SessionEvent::transition(None, &session));
        self.spawn_drive(session.id);
        Ok(session)
    }

    pub fn spawn_drive(self: &Arc<Self>, session_id: Uuid) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = this.drive(session_id).await {
                tracing::error!(session_id = %session_id, error = %err, "learning session driver stopped");
            }
        });
    }

    /// Advance the session until it is terminal or waits on a decision. A no-op
    /// when another task is already driving it.
    pub async fn drive(&self, session_id: Uuid) -> Result<(), LearningError> {
        let Some(_session_guard) = self.session_locks.try_lock(&session_id).await else {
            tracing::debug!(session_id = %session_id, "session already being driven");
            return Ok(());
        };
        let flag = CancelFlag::default();
        self.cancel_flags.lock().await.insert(session_id, flag.clone());
        let result = self.drive_locked(session_id, &flag).await;
        self.cancel_flags.lock().await.remove(&session_id);
        result
    }

    async fn drive_locked(&self, session_id: Uuid, flag: &CancelFlag) -> Result<(), LearningError> {
        loop {
            let session = self.load_session(session_id).await?;
            if flag.is_cancelled() || session.status.is_terminal() {
                return Ok(());
            }
            if session.status == SessionStatus::Approved {
                return self.finish_promotion(session.id).await;
            }
            let Some(budget) = self.config.stage_timeout(session.status) else {
                return Ok(());
            };

            let stage = session.status;
            let dwell = session.dwell(Utc::now()).to_std().unwrap_or_default();
            let remaining = budget.saturating_sub(dwell);
            let deadline = Instant::now() + remaining;

            match tokio::time::timeout(remaining, self.run_stage(&session, flag, deadline)).await {
                Ok(Ok(())) => {}
                Ok(Err(LearningError::Cancelled)) => return Ok(()),
                Ok(Err(LearningError::ConcurrencyConflict { .. })) => {
                    tracing::debug!(
                        session_id = %session_id,
                        stage = stage.as_str(),
                        "session changed while its stage ran"
                    );
                    return Ok(());
                }
                Ok(Err(err)) => return self.fail_stage(session_id, stage, &err).await,
                Err(_) => {
                    // Collecting only ever waits on data.
                    let err = if stage == SessionStatus::Collecting {
                        LearningError::InsufficientData {
                            run_count: 0,
                            minimum: self.config.min_dataset_runs,
                        }
                    } else {
                        LearningError::ComponentTimeout { stage }
                    };
                    return self.fail_stage(session_id, stage, &err).await;
                }
            }
        }
    }

    async fn run_stage(
        &self,
        session: &LearningSession,
        flag: &CancelFlag,
        deadline: Instant,
    ) -> Result<(), LearningError> {
        match session.status {
            SessionStatus::Collecting => self.collect(session, flag, deadline).await,
            SessionStatus::Analyzing => self.analyze(session, flag).await,
            SessionStatus::Proposing => self.propose(session, flag).await,
            SessionStatus::Testing => self.test(session, flag).await,
            _ => Ok(()),
        }
    }

    async fn collect(
        &self,
        session: &LearningSession,
        flag: &CancelFlag,
        deadline: Instant,
    ) -> Result<(), LearningError> {
        let lookback = chrono::Duration::from_std(self.config.lookback)
            .unwrap_or_else(|_| chrono::Duration::hours(168));
        loop {
            flag.checkpoint()?;
            let to = Utc::now();
            let from = to - lookback;
            let builder = DatasetBuilder::new(SelectionCriteria {
                from_date: from,
                to_date: to,
                min_runs: self.config.min_dataset_runs,
                max_runs: self.config.max_dataset_runs,
                version_id: Some(session.baseline_version_id),
                scorers: session.scorer_config.clone(),
            })?;
            let runs = self.runs.runs_between(session.agent_id, from, to).await?;

            match builder.build(session.id, runs, to) {
                Ok(snapshot) => {
                    flag.checkpoint()?;
                    let dataset = snapshot.dataset;
                    let mut next = session.clone();
                    next.run_count = dataset.run_count;
                    next.dataset_hash = Some(dataset.dataset_hash.clone());
                    next.apply_transition(SessionStatus::Analyzing, Utc::now())?;
                    tracing::info!(
                        session_id = %session.id,
                        run_count = dataset.run_count,
                        avg_score = ?dataset.avg_score,
                        dataset_hash = %dataset.dataset_hash,
                        "dataset collected"
                    );
                    let writes = StageWrites {
                        dataset: Some(dataset),
                        ..StageWrites::default()
                    };
                    return self.commit(SessionStatus::Collecting, &next, writes).await;
                }
                Err(err @ LearningError::InsufficientData { .. }) => {
                    let retry = self.config.collect_retry_interval;
                    if Instant::now() + retry >= deadline {
                        return Err(err);
                    }
                    tracing::debug!(
                        session_id = %session.id,
                        error = %err,
                        retry_ms = retry.as_millis() as u64,
                        "waiting for more runs"
                    );
                    tokio::time::sleep(retry).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// The dataset's runs as they are stored now, restricted to its run ids.
    async fn snapshot(
        &self,
        agent_id: Uuid,
        dataset: Dataset,
    ) -> Result<DatasetSnapshot, LearningError> {
        let ids: HashSet<Uuid> = dataset.run_ids.iter().copied().collect();
        let mut runs: Vec<RunRecord> = self
            .runs
            .runs_between(agent_id, dataset.from_date, dataset.to_date)
            .await?
            .into_iter()
            .filter(|run| ids.contains(&run.id))
            .collect();
        runs.sort_by_key(|run| run.id);
        Ok(DatasetSnapshot { dataset, runs })
    }

    async fn session_snapshot(
        &self,
        session: &LearningSession,
    ) -> Result<DatasetSnapshot, LearningError> {
        let dataset = self
            .store
            .get_dataset(session.id)
            .await?
            .ok_or_else(|| LearningError::Internal(format!("session {} has no dataset", session.id)))?;
        self.snapshot(session.agent_id, dataset).await
    }

    async fn analyze(&self, session: &LearningSession, flag: &CancelFlag) -> Result<(), LearningError> {
        let snapshot = self.session_snapshot(session).await?;
        let detector = SignalDetector::new(DetectorConfig {
            max_evidence: self.config.max_evidence,
            ..DetectorConfig::default()
        });
        let drafts = detector.detect(&snapshot, &session.scorer_config);
        flag.checkpoint()?;

        if drafts.is_empty() {
            tracing::info!(
                session_id = %session.id,
                run_count = snapshot.runs.len(),
                "no signals detected"
            );
            return self
                .fail_with(session, "no signals", StageWrites::default())
                .await;
        }

        let now = Utc::now();
        let mut signals: Vec<Signal> = drafts
            .into_iter()
            .map(|draft| Signal::from_draft(session.id, draft, now))
            .collect();
        sort_by_impact(&mut signals);

        let mut next = session.clone();
        next.apply_transition(SessionStatus::Proposing, now)?;
        tracing::info!(
            session_id = %session.id,
            signal_count = signals.len(),
            top_signal = %signals[0].pattern,
            "signals detected"
        );
        let writes = StageWrites {
            signals,
            ..StageWrites::default()
        };
        self.commit(SessionStatus::Analyzing, &next, writes).await
    }

    async fn propose(&self, session: &LearningSession, flag: &CancelFlag) -> Result<(), LearningError> {
        let mut signals = self.store.list_signals(session.id).await?;
        sort_by_impact(&mut signals);

        let proposer = &self.proposer;
        let signal_refs = &signals;
        let run_count = session.run_count;
        let drafts = with_retry(self.config.retry, proposer.name(), move || {
            proposer.generate(signal_refs, run_count)
        })
        .await?;
        flag.checkpoint()?;

        let now = Utc::now();
        let mut proposals = Vec::with_capacity(drafts.len());
        for draft in drafts {
            match draft.validate() {
                Ok(()) => proposals.push(Proposal::from_draft(session.id, draft, now)),
                Err(err) => {
                    tracing::warn!(session_id = %session.id, error = %err, "dropping invalid proposal");
                }
            }
        }

        let floor = self.config.proposal_confidence_floor;
        let Some(selected_id) = select_proposal(&proposals, floor) else {
            tracing::info!(
                session_id = %session.id,
                proposal_count = proposals.len(),
                floor,
                "no proposal met the confidence floor"
            );
            let writes = StageWrites {
                proposals,
                ..StageWrites::default()
            };
            return self.fail_with(session, "no viable proposal", writes).await;
        };
        mark_selected(&mut proposals, selected_id)?;

        let baseline = self
            .versions
            .active_version(session.agent_id)
            .await?
            .filter(|version| version.id == session.baseline_version_id)
            .ok_or_else(|| {
                LearningError::Internal("baseline version is no longer active".to_string())
            })?;
        let policy = self.policies.load(session.agent_id).await?;

        let selected = proposals
            .iter_mut()
            .find(|proposal| proposal.id == selected_id)
            .ok_or_else(|| LearningError::Internal("selected proposal vanished".to_string()))?;
        let candidate = self
            .versions
            .create_draft(session.agent_id, selected.change.apply_to(&baseline.config))
            .await?;
        selected.candidate_version_id = Some(candidate.id);
        let spec = NewExperiment {
            session_id: session.id,
            proposal_id: selected.id,
            mode: self.runner.mode(),
            baseline_version_id: baseline.id,
            candidate_version_id: candidate.id,
            traffic_split: policy.traffic_split_candidate,
            risk_tier: selected.risk_tier,
            gating_threshold: self.config.gating_threshold,
            min_samples: self.config.min_samples_per_arm,
        };
        tracing::info!(
            session_id = %session.id,
            proposal_id = %selected.id,
            proposal_type = %selected.proposal_type,
            confidence = ?selected.confidence_score,
            risk_tier = selected.risk_tier.as_str(),
            candidate_version = candidate.version,
            "proposal selected"
        );

        let committed = async move {
            let mut experiment = Experiment::new(spec, Utc::now())?;
            experiment.start(Utc::now());
            flag.checkpoint()?;
            let mut next = session.clone();
            next.apply_transition(SessionStatus::Testing, Utc::now())?;
            let writes = StageWrites {
                proposals,
                experiment: Some(experiment),
                ..StageWrites::default()
            };
            self.commit(SessionStatus::Proposing, &next, writes).await
        }
        .await;

        if committed.is_err() {
            if let Err(err) = self.versions.discard_draft(candidate.id).await {
                tracing::warn!(version_id = %candidate.id, error = %err, "failed to discard candidate draft");
            }
        }
        committed
    }

    async fn test(&self, session: &LearningSession, flag: &CancelFlag) -> Result<(), LearningError> {
        let experiment = self
            .store
            .list_experiments(session.id)
            .await?
            .into_iter()
            .find(|e| e.status == ExperimentStatus::Running)
            .ok_or_else(|| {
                LearningError::Internal(format!("session {} has no running experiment", session.id))
            })?;
        let held_out = if experiment.mode == ExperimentMode::Replay {
            self.session_snapshot(session).await?.runs
        } else {
            Vec::new()
        };
        self.runner.collect(&experiment, &held_out, flag).await?;
        flag.checkpoint()?;

        let experiment_guard = self.runner.lock(experiment.id).await;
        let mut experiment = self
            .store
            .get_experiment(experiment.id)
            .await?
            .ok_or_else(|| LearningError::NotFound {
                resource: format!("experiment {}", experiment.id),
            })?;
        if experiment.status != ExperimentStatus::Running {
            return Err(LearningError::Cancelled);
        }
        let samples = self.store.list_samples(experiment.id).await?;
        let now = Utc::now();
        let decision = experiment.finalize(&samples, now)?;
        tracing::info!(
            session_id = %session.id,
            experiment_id = %experiment.id,
            win_rate = ?experiment.win_rate,
            ci_lower = ?experiment.confidence_interval.map(|ci| ci.lower),
            threshold = experiment.gating_threshold,
            baseline_samples = experiment.baseline_metrics.sample_count,
            candidate_samples = experiment.candidate_metrics.sample_count,
            result = decision.result.as_str(),
            auto_eligible = decision.auto_eligible,
            reason_codes = ?decision.reason_codes,
            "experiment gated"
        );

        let writes = StageWrites {
            experiment: Some(experiment.clone()),
            ..StageWrites::default()
        };
        if !decision.passed() {
            let request = ApprovalRequest::gating_rejection(experiment.summary());
            self.record_approval(session.clone(), request, writes).await?;
            return Ok(());
        }

        let mut next = session.clone();
        next.apply_transition(SessionStatus::AwaitingApproval, now)?;
        self.commit(SessionStatus::Testing, &next, writes).await?;
        drop(experiment_guard);

        let policy = self.policies.load(session.agent_id).await?;
        let confidence = self
            .store
            .list_proposals(session.id)
            .await?
            .into_iter()
            .find(|proposal| proposal.is_selected)
            .and_then(|proposal| proposal.confidence_score);
        let auto = decision.auto_eligible
            && is_auto_promotion_allowed(&policy, confidence, experiment.win_rate, experiment.risk_tier);
        tracing::info!(
            session_id = %session.id,
            auto_promotion_enabled = policy.auto_promotion_enabled,
            confidence = ?confidence,
            auto,
            "auto-promotion decision"
        );
        if auto {
            let request = ApprovalRequest::auto(format!("auto-approved: {}", experiment.summary()));
            if let Err(err) = self.record_approval(next, request, StageWrites::default()).await {
                tracing::warn!(
                    session_id = %session.id,
                    error = %err,
                    "auto-approval not recorded, session left awaiting approval"
                );
            }
        }
        Ok(())
    }

    pub async fn approve(
        &self,
        session_id: Uuid,
        approved_by: &str,
        rationale: Option<String>,
    ) -> Result<Approval, LearningError> {
        let session = self.load_session(session_id).await?;
        self.record_approval(
            session,
            ApprovalRequest::human(true, approved_by, rationale),
            StageWrites::default(),
        )
        .await
    }

    pub async fn reject(
        &self,
        session_id: Uuid,
        rejected_by: &str,
        rationale: Option<String>,
    ) -> Result<Approval, LearningError> {
        let session = self.load_session(session_id).await?;
        self.record_approval(
            session,
            ApprovalRequest::human(false, rejected_by, rationale),
            StageWrites::default(),
        )
        .await
    }

    /// The single place an Approval is written, for human, auto and gating
    /// decisions alike. Approvals continue straight into promotion.
    async fn record_approval(
        &self,
        session: LearningSession,
        request: ApprovalRequest,
        mut writes: StageWrites,
    ) -> Result<Approval, LearningError> {
        let now = Utc::now();
        let existing = self.store.get_approval(session.id).await?;
        let approval = request.into_approval(&session, existing.as_ref(), now)?;

        let mut next = session.clone();
        if !approval.decision.is_approval() {
            next.metadata.rejection_reason = Some(
                approval
                    .rationale
                    .clone()
                    .unwrap_or_else(|| "rejected".to_string()),
            );
        }
        next.apply_transition(approval.decision.target_status(), now)?;
        writes.approval = Some(approval.clone());

        if !self
            .store
            .commit_transition(session.status, &next, writes)
            .await?
        {
            if self.store.get_approval(session.id).await?.is_some() {
                return Err(LearningError::ApprovalExists {
                    session_id: session.id,
                });
            }
            return Err(LearningError::ConcurrencyConflict {
                session_id: session.id,
            });
        }
        self.announce(session.status, &next);
        tracing::info!(
            session_id = %session.id,
            decision = approval.decision.as_str(),
            source = %approval.source,
            approved_by = approval.approved_by.as_deref().unwrap_or("<none>"),
            "approval recorded"
        );

        if !approval.decision.is_approval() {
            self.discard_candidates(session.id).await;
            return Ok(approval);
        }
        self.finish_promotion(next.id).await?;
        Ok(self
            .store
            .get_approval(session.id)
            .await?
            .unwrap_or(approval))
    }

    /// APPROVED -> PROMOTED. A failed promotion fails the session.
    ///
    /// The approving caller and a resumed driver may both get here; the
    /// promotion lock lets exactly one of them promote, and the other finds
    /// the session already past APPROVED.
    async fn finish_promotion(&self, session_id: Uuid) -> Result<(), LearningError> {
        let _promotion_guard = self.promotion_locks.lock(&session_id).await;
        let session = self.load_session(session_id).await?;
        match session.status {
            SessionStatus::Approved => {}
            SessionStatus::Promoted => return Ok(()),
            SessionStatus::Failed => {
                return Err(LearningError::Internal(
                    session
                        .metadata
                        .failure_reason
                        .unwrap_or_else(|| "promotion failed".to_string()),
                ));
            }
            other => {
                return Err(LearningError::InvalidTransition {
                    from: other,
                    to: SessionStatus::Promoted,
                });
            }
        }

        let approval = self
            .store
            .get_approval(session.id)
            .await?
            .ok_or_else(|| LearningError::Internal(format!("session {} approved without approval", session.id)))?;

        let promoted = match self.selected_candidate(session.id).await {
            Ok(candidate_id) => self.promote_candidate(session.agent_id, candidate_id).await,
            Err(err) => Err(err),
        };

        match promoted {
            Ok(version) => {
                let mut next = session.clone();
                next.apply_transition(SessionStatus::Promoted, Utc::now())?;
                let writes = StageWrites {
                    promoted_version: Some((approval.id, version.id)),
                    ..StageWrites::default()
                };
                self.commit(SessionStatus::Approved, &next, writes).await?;
                tracing::info!(
                    session_id = %session.id,
                    agent_id = %session.agent_id,
                    version = version.version,
                    version_id = %version.id,
                    "candidate promoted"
                );
                self.discard_stale_drafts(session.agent_id, Utc::now()).await;
                Ok(())
            }
            Err(err) => {
                tracing::error!(session_id = %session.id, error = %err, "promotion failed");
                let reason = format!("promotion failed: {}", err.failure_reason());
                self.terminate(
                    session,
                    SessionStatus::Failed,
                    |metadata| metadata.failure_reason = Some(reason),
                    StageWrites::default(),
                )
                .await?;
                Err(err)
            }
        }
    }

    async fn selected_candidate(&self, session_id: Uuid) -> Result<Uuid, LearningError> {
        self.store
            .list_proposals(session_id)
            .await?
            .into_iter()
            .find(|proposal| proposal.is_selected)
            .and_then(|proposal| proposal.candidate_version_id)
            .ok_or_else(|| {
                LearningError::Internal(format!("session {session_id} has no candidate version"))
            })
    }

    async fn promote_candidate(
        &self,
        agent_id: Uuid,
        candidate_id: Uuid,
    ) -> Result<crate::store::AgentVersion, LearningError> {
        // Already active when a previous attempt promoted but did not commit.
        if let Some(active) = self.versions.active_version(agent_id).await? {
            if active.id == candidate_id {
                return Ok(active);
            }
        }
        match self.versions.promote(agent_id, candidate_id).await {
            Ok(version) => Ok(version),
            Err(err) => match self.versions.active_version(agent_id).await? {
                Some(active) if active.id == candidate_id => Ok(active),
                _ => Err(err.into()),
            },
        }
    }

    /// Cancel a session. Cancelling a terminal session returns it unchanged.
    pub async fn cancel(
        &self,
        session_id: Uuid,
        reason: Option<String>,
    ) -> Result<LearningSession, LearningError> {
        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());
        if reason
            .as_ref()
            .is_some_and(|r| r.chars().count() > MAX_CANCEL_REASON_CHARS)
        {
            return Err(LearningError::validation(
                format!("reason must be <= {MAX_CANCEL_REASON_CHARS} characters"),
                "reason",
            ));
        }

        for _ in 0..CANCEL_ATTEMPTS {
            let session = self.load_session(session_id).await?;
            if session.status.is_terminal() {
                tracing::debug!(
                    session_id = %session_id,
                    status = session.status.as_str(),
                    "cancel on terminal session ignored"
                );
                return Ok(session);
            }
            if let Some(flag) = self.cancel_flags.lock().await.get(&session_id) {
                flag.cancel();
            }
            let cancel_reason = reason.clone().unwrap_or_else(|| "cancelled".to_string());
            if let Some(cancelled) = self
                .terminate(
                    session,
                    SessionStatus::Cancelled,
                    |metadata| metadata.cancel_reason = Some(cancel_reason),
                    StageWrites::default(),
                )
                .await?
            {
                return Ok(cancelled);
            }
        }
        Err(LearningError::ConcurrencyConflict { session_id })
    }

    async fn fail_stage(
        &self,
        session_id: Uuid,
        stage: SessionStatus,
        err: &LearningError,
    ) -> Result<(), LearningError> {
        let session = self.load_session(session_id).await?;
        if session.status != stage {
            return Ok(());
        }
        let reason = err.failure_reason();
        tracing::warn!(
            session_id = %session_id,
            stage = stage.as_str(),
            error_code = err.code(),
            reason = %reason,
            "learning stage failed"
        );
        self.terminate(
            session,
            SessionStatus::Failed,
            |metadata| metadata.failure_reason = Some(reason),
            StageWrites::default(),
        )
        .await?;
        Ok(())
    }

    /// FAILED with a reason that is an outcome of the stage, not an error.
    async fn fail_with(
        &self,
        session: &LearningSession,
        reason: &str,
        writes: StageWrites,
    ) -> Result<(), LearningError> {
        let failed = self
            .terminate(
                session.clone(),
                SessionStatus::Failed,
                |metadata| metadata.failure_reason = Some(reason.to_string()),
                writes,
            )
            .await?;
        match failed {
            Some(_) => Ok(()),
            None => Err(LearningError::ConcurrencyConflict {
                session_id: session.id,
            }),
        }
    }

    /// Move to a terminal status, failing the running experiment and
    /// discarding candidate drafts. `None` when the status changed first.
    async fn terminate(
        &self,
        session: LearningSession,
        to: SessionStatus,
        annotate: impl FnOnce(&mut SessionMetadata),
        mut writes: StageWrites,
    ) -> Result<Option<LearningSession>, LearningError> {
        let from = session.status;
        let now = Utc::now();
        let mut next = session;
        annotate(&mut next.metadata);
        next.apply_transition(to, now)?;

        let mut _experiment_guard = None;
        if writes.experiment.is_none() {
            let running = self
                .store
                .list_experiments(next.id)
                .await?
                .into_iter()
                .find(|e| !e.status.is_terminal());
            if let Some(running) = running {
                _experiment_guard = Some(self.runner.lock(running.id).await);
                if let Some(mut current) = self.store.get_experiment(running.id).await? {
                    if !current.status.is_terminal() {
                        current.fail(format!("session {}", to.as_str().to_lowercase()), now);
                        writes.experiment = Some(current);
                    }
                }
            }
        }

        if !self.store.commit_transition(from, &next, writes).await? {
            return Ok(None);
        }
        self.announce(from, &next);
        self.discard_candidates(next.id).await;
        // Also catches a draft whose proposal never got committed.
        self.discard_stale_drafts(next.agent_id, now).await;
        Ok(Some(next))
    }

    /// Drafts created before `cutoff` can only belong to sessions that are
    /// already over: an agent has at most one active session.
    async fn discard_stale_drafts(&self, agent_id: Uuid, cutoff: chrono::DateTime<Utc>) {
        match self.versions.discard_stale_drafts(agent_id, cutoff).await {
            Ok(0) => {}
            Ok(discarded) => {
                tracing::info!(agent_id = %agent_id, discarded, "discarded orphaned draft versions");
            }
            Err(err) => {
                tracing::warn!(agent_id = %agent_id, error = %err, "failed to discard orphaned drafts");
            }
        }
    }

    async fn discard_candidates(&self, session_id: Uuid) {
        let proposals = match self.store.list_proposals(session_id).await {
            Ok(proposals) => proposals,
            Err(err) => {
                tracing::warn!(session_id = %session_id, error = %err, "could not list proposals to discard");
                return;
            }
        };
        for version_id in proposals.iter().filter_map(|p| p.candidate_version_id) {
            if let Err(err) = self.versions.discard_draft(version_id).await {
                tracing::warn!(version_id = %version_id, error = %err, "failed to discard candidate draft");
            }
        }
    }

    async fn commit(
        &self,
        from: SessionStatus,
        next: &LearningSession,
        writes: StageWrites,
    ) -> Result<(), LearningError> {
        if !self.store.commit_transition(from, next, writes).await? {
            return Err(LearningError::ConcurrencyConflict { session_id: next.id });
        }
        self.announce(from, next);
        Ok(())
    }

    fn announce(&self, from: SessionStatus, next: &LearningSession) {
        tracing::info!(
            session_id = %next.id,
            agent_id = %next.agent_id,
            from = from.as_str(),
            to = next.status.as_str(),
            failure_reason = next.metadata.failure_reason.as_deref(),
            "learning session transition"
        );
        self.events.publish(SessionEvent::transition(Some(from), next));
    }

    pub async fn metrics(&self, agent_id: Uuid) -> Result<MetricsSummary, LearningError> {
        let sessions = self.store.list_sessions(agent_id).await?;
        let experiments = self.store.list_agent_experiments(agent_id).await?;
        let approvals = self.store.list_agent_approvals(agent_id).await?;
        let ids: Vec<Uuid> = sessions.iter().map(|s| s.id).collect();
        let counts = self.store.session_counts(&ids).await?;
        let signals = counts.values().map(|c| c.signals).sum();
        let proposals = counts.values().map(|c| c.proposals).sum();
        Ok(MetricsSummary::compute(
            &sessions,
            &experiments,
            &approvals,
            signals,
            proposals,
        ))
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use learnloop_core::approval::ApprovalDecision;
    use learnloop_core::error::DenialReason;
    use learnloop_core::experiment::ExperimentStatus;
    use learnloop_core::gating::GatingResult;
    use learnloop_core::policy::PolicyUpdate;
    use learnloop_core::session::TriggerType;

    use super::testing::*;
    use super::*;
    use crate::store::VersionStatus;

    fn manual() -> Trigger {
        Trigger::new("operator request", TriggerType::Manual).expect("valid trigger")
    }

    #[tokio::test]
    async fn session_without_signals_fails_with_no_signals() {
        let h = harness(fast_config()).await;
        seed_healthy_runs(&h).await;

        let session = h
            .coordinator
            .create_session(&h.agent, manual())
            .await
            .expect("session admitted");
        assert_eq!(session.status, SessionStatus::Collecting);

        let done = wait_for(&h, session.id, |s| s.is_terminal()).await;
        assert_eq!(done.status, SessionStatus::Failed);
        assert_eq!(done.metadata.failure_reason.as_deref(), Some("no signals"));
        assert_eq!(done.run_count, 50);
        assert!(done.dataset_hash.is_some());
        assert!(done.completed_at.is_some());
        let dataset = h
            .store
            .get_dataset(session.id)
            .await
            .expect("read")
            .expect("dataset stored");
        assert_eq!(dataset.run_count, 50);
    }

    #[tokio::test]
    async fn concurrent_creates_admit_exactly_one() {
        let h = harness(fast_config()).await;
        let (a, b) = tokio::join!(
            h.coordinator.create_session(&h.agent, manual()),
            h.coordinator.create_session(&h.agent, manual())
        );
        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let err = results
            .into_iter()
            .find_map(Result::err)
            .expect("one create must be refused");
        assert_eq!(
            err,
            LearningError::PolicyDenied(DenialReason::AlreadyActiveSession)
        );
    }

    #[tokio::test]
    async fn paused_policy_denies_creation() {
        let h = harness(fast_config()).await;
        h.coordinator
            .policies()
            .set_paused(h.agent.id, true, Some("ops".to_string()), None, None)
            .await
            .expect("pause");
        let err = h
            .coordinator
            .create_session(&h.agent, manual())
            .await
            .expect_err("paused agents start no sessions");
        assert_eq!(err, LearningError::PolicyDenied(DenialReason::PolicyPaused));
    }

    #[tokio::test]
    async fn collecting_times_out_as_insufficient_data() {
        let config = EngineConfig {
            collecting_timeout: Duration::from_millis(80),
            ..fast_config()
        };
        let h = harness(config).await;
        let session = h
            .coordinator
            .create_session(&h.agent, manual())
            .await
            .expect("admitted");
        let done = wait_for(&h, session.id, |s| s.is_terminal()).await;
        assert_eq!(done.status, SessionStatus::Failed);
        assert_eq!(done.metadata.failure_reason.as_deref(), Some("insufficient data"));
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let h = harness(fast_config()).await;
        let session = h
            .coordinator
            .create_session(&h.agent, manual())
            .await
            .expect("admitted");

        let cancelled = h
            .coordinator
            .cancel(session.id, Some("wrong agent".to_string()))
            .await
            .expect("cancel succeeds");
        assert_eq!(cancelled.status, SessionStatus::Cancelled);
        assert_eq!(cancelled.metadata.cancel_reason.as_deref(), Some("wrong agent"));

        let again = h
            .coordinator
            .cancel(session.id, None)
            .await
            .expect("second cancel is a no-op");
        assert_eq!(again.status, SessionStatus::Cancelled);
        assert_eq!(again.metadata.cancel_reason.as_deref(), Some("wrong agent"));
    }

    #[tokio::test]
    async fn cancel_discards_draft_left_by_uncommitted_proposal() {
        let h = harness(fast_config()).await;
        let session = h
            .coordinator
            .create_session(&h.agent, manual())
            .await
            .expect("admitted");
        // A draft whose proposal commit never landed.
        let orphan = h
            .store
            .create_draft(h.agent.id, serde_json::json!({"instructions": "Be terse."}))
            .await
            .expect("draft");

        h.coordinator.cancel(session.id, None).await.expect("cancel");

        let orphan = h.store.version(orphan.id).await.expect("version exists");
        assert_eq!(orphan.status, VersionStatus::Discarded);
        let baseline = h.store.version(h.baseline.id).await.expect("baseline exists");
        assert_eq!(baseline.status, VersionStatus::Active);
    }

    #[tokio::test]
    async fn new_session_discards_drafts_of_finished_sessions() {
        let h = harness(fast_config()).await;
        let orphan = h
            .store
            .create_draft(h.agent.id, serde_json::json!({"instructions": "Be terse."}))
            .await
            .expect("draft");

        h.coordinator
            .create_session(&h.agent, manual())
            .await
            .expect("admitted");

        let orphan = h.store.version(orphan.id).await.expect("version exists");
        assert_eq!(orphan.status, VersionStatus::Discarded);
    }

    #[tokio::test]
    async fn no_viable_proposal_fails_session() {
        let config = EngineConfig {
            proposal_confidence_floor: 1.01,
            ..fast_config()
        };
        let h = harness(config).await;
        seed_low_quality_runs(&h).await;
        let session = h
            .coordinator
            .create_session(&h.agent, manual())
            .await
            .expect("admitted");
        let done = wait_for(&h, session.id, |s| s.is_terminal()).await;
        assert_eq!(done.metadata.failure_reason.as_deref(), Some("no viable proposal"));
        let proposals = h.store.list_proposals(session.id).await.expect("read");
        assert!(!proposals.is_empty());
        assert!(proposals.iter().all(|p| !p.is_selected));
    }

    #[tokio::test]
    async fn passing_experiment_waits_for_human_approval_then_promotes() {
        let h = harness(fast_config()).await;
        seed_low_quality_runs(&h).await;
        let session = h
            .coordinator
            .create_session(&h.agent, manual())
            .await
            .expect("admitted");

        feed_samples(&h, session.id, 10, 0.3, 0.9).await;
        let waiting = wait_for(&h, session.id, |s| {
            s == SessionStatus::AwaitingApproval || s.is_terminal()
        })
        .await;
        assert_eq!(waiting.status, SessionStatus::AwaitingApproval);

        let proposals = h.store.list_proposals(session.id).await.expect("read");
        assert_eq!(proposals.iter().filter(|p| p.is_selected).count(), 1);
        let candidate = proposals
            .iter()
            .find(|p| p.is_selected)
            .and_then(|p| p.candidate_version_id)
            .expect("candidate version");

        let approval = h
            .coordinator
            .approve(session.id, "alice@example.com", Some("looks good".to_string()))
            .await
            .expect("approve");
        assert_eq!(approval.decision, ApprovalDecision::Approved);
        assert_eq!(approval.promoted_version_id, Some(candidate));

        let promoted = h
            .store
            .get_session(session.id)
            .await
            .expect("read")
            .expect("exists");
        assert_eq!(promoted.status, SessionStatus::Promoted);
        let version = h.store.version(candidate).await.expect("candidate exists");
        assert_eq!(version.status, VersionStatus::Active);
        assert_eq!(version.version, 2);
        assert_eq!(
            h.store.version(h.baseline.id).await.expect("baseline").status,
            VersionStatus::Archived
        );

        let again = h
            .coordinator
            .approve(session.id, "bob@example.com", None)
            .await
            .expect_err("one approval per session");
        assert!(matches!(again, LearningError::ApprovalExists { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn approval_racing_resumed_drivers_promotes_exactly_once() {
        let h = harness(fast_config()).await;
        seed_low_quality_runs(&h).await;
        let session = h
            .coordinator
            .create_session(&h.agent, manual())
            .await
            .expect("admitted");
        feed_samples(&h, session.id, 10, 0.3, 0.9).await;
        wait_for(&h, session.id, |s| s == SessionStatus::AwaitingApproval).await;
        let candidate = h
            .coordinator
            .selected_candidate(session.id)
            .await
            .expect("candidate version");

        let drivers: Vec<_> = (0..4)
            .map(|_| {
                let coordinator = h.coordinator.clone();
                let id = session.id;
                tokio::spawn(async move {
                    loop {
                        match coordinator.finish_promotion(id).await {
                            Err(LearningError::InvalidTransition {
                                from: SessionStatus::AwaitingApproval,
                                ..
                            }) => tokio::task::yield_now().await,
                            other => return other,
                        }
                    }
                })
            })
            .collect();
        let approval = h
            .coordinator
            .approve(session.id, "alice@example.com", None)
            .await
            .expect("approve succeeds despite concurrent drivers");
        for driver in drivers {
            driver
                .await
                .expect("driver task")
                .expect("driver sees the promotion");
        }

        assert_eq!(approval.promoted_version_id, Some(candidate));
        let done = h
            .store
            .get_session(session.id)
            .await
            .expect("read")
            .expect("exists");
        assert_eq!(done.status, SessionStatus::Promoted);
        let active = h
            .store
            .active_version(h.agent.id)
            .await
            .expect("read")
            .expect("active version");
        assert_eq!(active.id, candidate);
    }

    #[tokio::test]
    async fn auto_promotion_skips_human_approval() {
        let h = harness(fast_config()).await;
        h.coordinator
            .policies()
            .update(
                h.agent.id,
                &PolicyUpdate {
                    auto_promotion_enabled: Some(true),
                    min_confidence_for_auto: Some(0.5),
                    ..PolicyUpdate::default()
                },
            )
            .await
            .expect("policy update");
        seed_low_quality_runs(&h).await;
        let session = h
            .coordinator
            .create_session(&h.agent, manual())
            .await
            .expect("admitted");

        feed_samples(&h, session.id, 10, 0.3, 0.9).await;
        let done = wait_for(&h, session.id, |s| s.is_terminal()).await;
        assert_eq!(done.status, SessionStatus::Promoted);

        let approval = h
            .store
            .get_approval(session.id)
            .await
            .expect("read")
            .expect("approval written");
        assert_eq!(approval.decision, ApprovalDecision::AutoApproved);
        assert!(approval.auto_approved);
        assert!(approval.promoted_version_id.is_some());
    }

    #[tokio::test]
    async fn failing_experiment_rejects_and_discards_candidate() {
        let h = harness(fast_config()).await;
        seed_low_quality_runs(&h).await;
        let session = h
            .coordinator
            .create_session(&h.agent, manual())
            .await
            .expect("admitted");

        let experiment_id = feed_samples(&h, session.id, 10, 0.9, 0.2).await;
        let done = wait_for(&h, session.id, |s| s.is_terminal()).await;
        assert_eq!(done.status, SessionStatus::Rejected);

        let experiment = h
            .store
            .get_experiment(experiment_id)
            .await
            .expect("read")
            .expect("exists");
        assert_eq!(experiment.status, ExperimentStatus::Completed);
        assert_eq!(experiment.gating_result, Some(GatingResult::Failed));

        let approval = h
            .store
            .get_approval(session.id)
            .await
            .expect("read")
            .expect("gating writes the approval");
        assert_eq!(approval.decision, ApprovalDecision::Rejected);
        assert_eq!(approval.source, "gating");
        assert!(approval.approved_by.is_none());
        assert!(approval.rationale.is_some());

        let candidate = h
            .store
            .version(experiment.candidate_version_id)
            .await
            .expect("candidate exists");
        assert_eq!(candidate.status, VersionStatus::Discarded);
    }

    #[tokio::test]
    async fn cancel_during_testing_fails_running_experiment() {
        let h = harness(fast_config()).await;
        seed_low_quality_runs(&h).await;
        let session = h
            .coordinator
            .create_session(&h.agent, manual())
            .await
            .expect("admitted");
        wait_for(&h, session.id, |s| s == SessionStatus::Testing || s.is_terminal()).await;

        h.coordinator
            .cancel(session.id, Some("superseded".to_string()))
            .await
            .expect("cancel");
        let experiment = h
            .store
            .list_experiments(session.id)
            .await
            .expect("read")
            .into_iter()
            .next()
            .expect("experiment exists");
        assert_eq!(experiment.status, ExperimentStatus::Failed);
        assert_eq!(
            h.store
                .version(experiment.candidate_version_id)
                .await
                .expect("candidate")
                .status,
            VersionStatus::Discarded
        );
    }

    #[tokio::test]
    async fn metrics_count_failed_sessions_by_reason() {
        let h = harness(fast_config()).await;
        seed_healthy_runs(&h).await;
        let session = h
            .coordinator
            .create_session(&h.agent, manual())
            .await
            .expect("admitted");
        wait_for(&h, session.id, |s| s.is_terminal()).await;

        let metrics = h.coordinator.metrics(h.agent.id).await.expect("metrics");
        assert_eq!(metrics.total_sessions, 1);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.failure_reasons.get("no signals"), Some(&1));
    }
}
