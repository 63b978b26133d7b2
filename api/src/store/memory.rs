//! In-memory backend for tests and `LEARNLOOP_STORE=memory` local runs.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use learnloop_core::approval::Approval;
use learnloop_core::dataset::{Dataset, RunRecord, RunStatus};
use learnloop_core::experiment::{Experiment, ExperimentStatus, Sample};
use learnloop_core::policy::LearningPolicy;
use learnloop_core::proposals::Proposal;
use learnloop_core::session::{LearningSession, SessionStatus};
use learnloop_core::signals::Signal;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    Agent, AgentVersion, LearningStore, RunSource, SessionCounts, StageWrites, StoreError,
    VersionRegistry, VersionStatus,
};

#[derive(Default)]
struct Inner {
    sessions: BTreeMap<Uuid, LearningSession>,
    datasets: HashMap<Uuid, Dataset>,
    signals: Vec<Signal>,
    proposals: Vec<Proposal>,
    experiments: BTreeMap<Uuid, Experiment>,
    samples: Vec<Sample>,
    approvals: HashMap<Uuid, Approval>,
    policies: HashMap<Uuid, LearningPolicy>,
    agents: Vec<Agent>,
    versions: Vec<AgentVersion>,
    runs: Vec<RunRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent with an active version 1.
    pub async fn add_agent(&self, slug: &str, name: &str, config: serde_json::Value) -> (Agent, AgentVersion) {
        let now = Utc::now();
        let agent = Agent {
            id: Uuid::now_v7(),
            slug: slug.to_string(),
            name: name.to_string(),
            created_at: now,
        };
        let version = AgentVersion {
            id: Uuid::now_v7(),
            agent_id: agent.id,
            version: 1,
            status: VersionStatus::Active,
            config,
            created_at: now,
        };
        let mut inner = self.inner.write().await;
        inner.agents.push(agent.clone());
        inner.versions.push(version.clone());
        (agent, version)
    }

    #[cfg(test)]
    pub async fn add_runs(&self, runs: impl IntoIterator<Item = RunRecord>) {
        self.inner.write().await.runs.extend(runs);
    }

    #[cfg(test)]
    pub async fn version(&self, id: Uuid) -> Option<AgentVersion> {
        self.inner
            .read()
            .await
            .versions
            .iter()
            .find(|v| v.id == id)
            .cloned()
    }
}

fn has_active(inner: &Inner, agent_id: Uuid) -> bool {
    inner
        .sessions
        .values()
        .any(|s| s.agent_id == agent_id && !s.status.is_terminal())
}

#[async_trait]
impl LearningStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn create_session(&self, session: &LearningSession) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if has_active(&inner, session.agent_id) {
            return Err(StoreError::ActiveSessionExists {
                agent_id: session.agent_id,
            });
        }
        inner.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<LearningSession>, StoreError> {
        Ok(self.inner.read().await.sessions.get(&id).cloned())
    }

    async fn active_session(&self, agent_id: Uuid) -> Result<Option<LearningSession>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .sessions
            .values()
            .find(|s| s.agent_id == agent_id && !s.status.is_terminal())
            .cloned())
    }

    async fn list_sessions(&self, agent_id: Uuid) -> Result<Vec<LearningSession>, StoreError> {
        let inner = self.inner.read().await;
        let mut sessions: Vec<LearningSession> = inner
            .sessions
            .values()
            .filter(|s| s.agent_id == agent_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(sessions)
    }

    async fn list_active_sessions(&self) -> Result<Vec<LearningSession>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .sessions
            .values()
            .filter(|s| !s.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn commit_transition(
        &self,
        expected: SessionStatus,
        session: &LearningSession,
        writes: StageWrites,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        match inner.sessions.get(&session.id) {
            Some(stored) if stored.status == expected => {}
            Some(_) => return Ok(false),
            None => return Err(StoreError::NotFound(format!("session {}", session.id))),
        }
        if writes.approval.is_some() && inner.approvals.contains_key(&session.id) {
            return Err(StoreError::ApprovalExists {
                session_id: session.id,
            });
        }

        inner.sessions.insert(session.id, session.clone());
        if let Some(dataset) = writes.dataset {
            inner.datasets.insert(dataset.session_id, dataset);
        }
        inner.signals.extend(writes.signals);
        inner.proposals.extend(writes.proposals);
        if let Some(experiment) = writes.experiment {
            inner.experiments.insert(experiment.id, experiment);
        }
        if let Some(approval) = writes.approval {
            inner.approvals.insert(approval.session_id, approval);
        }
        if let Some((approval_id, version_id)) = writes.promoted_version {
            if let Some(approval) = inner.approvals.values_mut().find(|a| a.id == approval_id) {
                approval.promoted_version_id = Some(version_id);
            }
        }
        Ok(true)
    }

    async fn get_dataset(&self, session_id: Uuid) -> Result<Option<Dataset>, StoreError> {
        Ok(self.inner.read().await.datasets.get(&session_id).cloned())
    }

    async fn list_signals(&self, session_id: Uuid) -> Result<Vec<Signal>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .signals
            .iter()
            .filter(|s| s.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn list_proposals(&self, session_id: Uuid) -> Result<Vec<Proposal>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .proposals
            .iter()
            .filter(|p| p.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn list_experiments(&self, session_id: Uuid) -> Result<Vec<Experiment>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .experiments
            .values()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn list_agent_experiments(&self, agent_id: Uuid) -> Result<Vec<Experiment>, StoreError> {
        let inner = self.inner.read().await;
        let mut experiments: Vec<Experiment> = inner
            .experiments
            .values()
            .filter(|e| {
                inner
                    .sessions
                    .get(&e.session_id)
                    .is_some_and(|s| s.agent_id == agent_id)
            })
            .cloned()
            .collect();
        experiments.reverse();
        Ok(experiments)
    }

    async fn get_experiment(&self, id: Uuid) -> Result<Option<Experiment>, StoreError> {
        Ok(self.inner.read().await.experiments.get(&id).cloned())
    }

    async fn save_experiment(&self, experiment: &Experiment) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        if inner
            .experiments
            .get(&experiment.id)
            .is_some_and(|stored| stored.status.is_terminal())
        {
            return Ok(false);
        }
        inner.experiments.insert(experiment.id, experiment.clone());
        Ok(true)
    }

    async fn record_sample(
        &self,
        experiment: &Experiment,
        sample: &Sample,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(stored) = inner.experiments.get(&experiment.id) else {
            return Err(StoreError::NotFound(format!("experiment {}", experiment.id)));
        };
        if stored.status != ExperimentStatus::Running {
            return Ok(false);
        }
        if inner.samples.iter().any(|s| {
            s.experiment_id == sample.experiment_id && s.run_id == sample.run_id && s.arm == sample.arm
        }) {
            return Err(StoreError::DuplicateSample {
                run_id: sample.run_id.clone(),
            });
        }
        let Some(stored) = inner.experiments.get_mut(&experiment.id) else {
            return Err(StoreError::NotFound(format!("experiment {}", experiment.id)));
        };
        stored.baseline_metrics = experiment.baseline_metrics;
        stored.candidate_metrics = experiment.candidate_metrics;
        inner.samples.push(sample.clone());
        Ok(true)
    }

    async fn list_samples(&self, experiment_id: Uuid) -> Result<Vec<Sample>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .samples
            .iter()
            .filter(|s| s.experiment_id == experiment_id)
            .cloned()
            .collect())
    }

    async fn get_approval(&self, session_id: Uuid) -> Result<Option<Approval>, StoreError> {
        Ok(self.inner.read().await.approvals.get(&session_id).cloned())
    }

    async fn list_agent_approvals(&self, agent_id: Uuid) -> Result<Vec<Approval>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .approvals
            .values()
            .filter(|a| {
                inner
                    .sessions
                    .get(&a.session_id)
                    .is_some_and(|s| s.agent_id == agent_id)
            })
            .cloned()
            .collect())
    }

    async fn session_counts(
        &self,
        session_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, SessionCounts>, StoreError> {
        let inner = self.inner.read().await;
        let mut counts: HashMap<Uuid, SessionCounts> = session_ids
            .iter()
            .map(|id| (*id, SessionCounts::default()))
            .collect();
        for signal in &inner.signals {
            if let Some(c) = counts.get_mut(&signal.session_id) {
                c.signals += 1;
            }
        }
        for proposal in &inner.proposals {
            if let Some(c) = counts.get_mut(&proposal.session_id) {
                c.proposals += 1;
            }
        }
        for experiment in inner.experiments.values() {
            if let Some(c) = counts.get_mut(&experiment.session_id) {
                c.experiments += 1;
            }
        }
        Ok(counts)
    }

    async fn get_policy(&self, agent_id: Uuid) -> Result<Option<LearningPolicy>, StoreError> {
        Ok(self.inner.read().await.policies.get(&agent_id).cloned())
    }

    async fn save_policy(&self, policy: &LearningPolicy) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .policies
            .insert(policy.agent_id, policy.clone());
        Ok(())
    }
}

#[async_trait]
impl RunSource for MemoryStore {
    async fn runs_between(
        &self,
        agent_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RunRecord>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .runs
            .iter()
            .filter(|r| {
                r.agent_id == agent_id
                    && r.completed_at.is_some_and(|at| at >= from && at <= to)
            })
            .cloned()
            .collect())
    }

    async fn count_negative_runs(
        &self,
        agent_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .runs
            .iter()
            .filter(|r| {
                r.agent_id == agent_id
                    && r.status == RunStatus::Completed
                    && r.completed_at.is_some_and(|at| at >= since)
                    && (r.is_negative_feedback() || r.tool_calls.iter().any(|c| !c.success))
            })
            .count() as i64)
    }
}

#[async_trait]
impl VersionRegistry for MemoryStore {
    async fn find_agent(&self, slug: &str) -> Result<Option<Agent>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .agents
            .iter()
            .find(|a| a.slug == slug)
            .cloned())
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, StoreError> {
        Ok(self.inner.read().await.agents.clone())
    }

    async fn active_version(&self, agent_id: Uuid) -> Result<Option<AgentVersion>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .versions
            .iter()
            .find(|v| v.agent_id == agent_id && v.status == VersionStatus::Active)
            .cloned())
    }

    async fn create_draft(
        &self,
        agent_id: Uuid,
        config: serde_json::Value,
    ) -> Result<AgentVersion, StoreError> {
        let mut inner = self.inner.write().await;
        let next = inner
            .versions
            .iter()
            .filter(|v| v.agent_id == agent_id)
            .map(|v| v.version)
            .max()
            .unwrap_or(0)
            + 1;
        let version = AgentVersion {
            id: Uuid::now_v7(),
            agent_id,
            version: next,
            status: VersionStatus::Draft,
            config,
            created_at: Utc::now(),
        };
        inner.versions.push(version.clone());
        Ok(version)
    }

    async fn promote(
        &self,
        agent_id: Uuid,
        candidate_id: Uuid,
    ) -> Result<AgentVersion, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(index) = inner
            .versions
            .iter()
            .position(|v| {
                v.id == candidate_id && v.agent_id == agent_id && v.status == VersionStatus::Draft
            })
        else {
            return Err(StoreError::NotFound(format!("draft version {candidate_id}")));
        };
        for version in inner.versions.iter_mut() {
            if version.agent_id == agent_id && version.status == VersionStatus::Active {
                version.status = VersionStatus::Archived;
            }
        }
        inner.versions[index].status = VersionStatus::Active;
        Ok(inner.versions[index].clone())
    }

    async fn discard_draft(&self, version_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(version) = inner
            .versions
            .iter_mut()
            .find(|v| v.id == version_id && v.status == VersionStatus::Draft)
        {
            version.status = VersionStatus::Discarded;
        }
        Ok(())
    }

    async fn discard_stale_drafts(
        &self,
        agent_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let mut discarded = 0;
        for version in inner.versions.iter_mut().filter(|v| {
            v.agent_id == agent_id && v.status == VersionStatus::Draft && v.created_at <= cutoff
        }) {
            version.status = VersionStatus::Discarded;
            discarded += 1;
        }
        Ok(discarded)
    }
}
