use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use learnloop_core::dataset::RunRecord;
use learnloop_core::error::LearningError;
use learnloop_core::experiment::{
    Arm, Experiment, ExperimentMode, ExperimentStatus, Sample, route_run, traffic_bucket,
};
use learnloop_core::session::SessionStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use super::CancelFlag;
use super::locks::KeyedLocks;
use super::proposer::with_retry;
use crate::config::EngineConfig;
use crate::store::LearningStore;

/// Outcome of running one recorded input against one agent version.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ReplayOutcome {
    pub score: f64,
    pub success: bool,
}

/// Re-executes held-out runs against a given agent version.
#[async_trait]
pub trait Replayer: Send + Sync {
    async fn replay(&self, version_id: Uuid, run: &RunRecord)
    -> Result<ReplayOutcome, LearningError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReplayRequest {
    version_id: Uuid,
    run_id: Uuid,
}

/// `POST {base}/replay` on the execution service (`LEARNLOOP_REPLAY_URL`).
pub struct HttpReplayer {
    client: reqwest::Client,
    endpoint: url::Url,
}

impl HttpReplayer {
    pub fn new(base: url::Url, timeout: Duration) -> Result<Self, LearningError> {
        let endpoint = base
            .join("replay")
            .map_err(|e| LearningError::Internal(format!("replay url: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LearningError::Internal(format!("replay client: {e}")))?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl Replayer for HttpReplayer {
    async fn replay(
        &self,
        version_id: Uuid,
        run: &RunRecord,
    ) -> Result<ReplayOutcome, LearningError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&ReplayRequest {
                version_id,
                run_id: run.id,
            })
            .send()
            .await
            .map_err(|e| LearningError::ExternalDependency(format!("replay: {e}")))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(LearningError::ExternalDependency(format!(
                "replay returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(LearningError::Internal(format!(
                "replay rejected run {} with {status}",
                run.id
            )));
        }
        response
            .json::<ReplayOutcome>()
            .await
            .map_err(|e| LearningError::Internal(format!("replay response: {e}")))
    }
}

/// A sample as submitted by the execution subsystem.
#[derive(Debug, Clone)]
pub struct SampleInput {
    pub run_id: String,
    /// Decided by the traffic split when absent
    pub arm: Option<Arm>,
    pub score: f64,
    pub success: bool,
    pub pair_key: Option<String>,
}

/// Runs experiments and ingests their samples.
///
/// Sample ingestion and finalization for one experiment are serialized by a
/// per-experiment lock, so arm metrics never miss an update and no sample
/// lands after the gating decision was taken.
pub struct ExperimentRunner {
    store: Arc<dyn LearningStore>,
    replayer: Option<Arc<dyn Replayer>>,
    config: Arc<EngineConfig>,
    locks: KeyedLocks<Uuid>,
}

impl ExperimentRunner {
    pub fn new(
        store: Arc<dyn LearningStore>,
        replayer: Option<Arc<dyn Replayer>>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store,
            replayer,
            config,
            locks: KeyedLocks::new(),
        }
    }

    pub fn mode(&self) -> ExperimentMode {
        if self.replayer.is_some() {
            ExperimentMode::Replay
        } else {
            ExperimentMode::Shadow
        }
    }

    pub async fn lock(&self, experiment_id: Uuid) -> OwnedMutexGuard<()> {
        self.locks.lock(&experiment_id).await
    }

    pub async fn ingest(
        &self,
        experiment_id: Uuid,
        input: SampleInput,
    ) -> Result<Sample, LearningError> {
        let _guard = self.lock(experiment_id).await;
        let mut experiment = self
            .store
            .get_experiment(experiment_id)
            .await?
            .ok_or_else(|| LearningError::NotFound {
                resource: format!("experiment {experiment_id}"),
            })?;
        if experiment.status != ExperimentStatus::Running {
            return Err(LearningError::validation(
                format!(
                    "experiment {experiment_id} is {}, samples are no longer accepted",
                    experiment.status.as_str()
                ),
                "experimentId",
            ));
        }

        let arm = input.arm.unwrap_or_else(|| {
            route_run(experiment.id, input.run_id.trim(), experiment.traffic_split)
        });
        let sample = Sample::new(
            experiment.id,
            &input.run_id,
            arm,
            input.score,
            input.success,
            input.pair_key,
            Utc::now(),
        )?;
        experiment.record(&sample)?;

        if !self.store.record_sample(&experiment, &sample).await? {
            return Err(LearningError::validation(
                format!("experiment {experiment_id} stopped accepting samples"),
                "experimentId",
            ));
        }
        tracing::debug!(
            experiment_id = %experiment.id,
            run_id = %sample.run_id,
            arm = arm.as_str(),
            score = sample.score,
            baseline_samples = experiment.baseline_metrics.sample_count,
            candidate_samples = experiment.candidate_metrics.sample_count,
            "experiment sample recorded"
        );
        Ok(sample)
    }

    /// Arm a new run of `agent_id` must be dispatched to. Baseline when the
    /// agent has no running experiment.
    pub async fn route_for_agent(
        &self,
        agent_id: Uuid,
        run_id: &str,
    ) -> Result<(Option<Uuid>, Arm), LearningError> {
        let run_id = run_id.trim();
        if run_id.is_empty() {
            return Err(LearningError::validation("runId must not be empty", "runId"));
        }
        let Some(session) = self.store.active_session(agent_id).await? else {
            return Ok((None, Arm::Baseline));
        };
        if session.status != SessionStatus::Testing {
            return Ok((None, Arm::Baseline));
        }
        let running = self
            .store
            .list_experiments(session.id)
            .await?
            .into_iter()
            .find(|e| e.status == ExperimentStatus::Running && e.mode == ExperimentMode::Shadow);
        Ok(match running {
            Some(experiment) => (
                Some(experiment.id),
                route_run(experiment.id, run_id, experiment.traffic_split),
            ),
            None => (None, Arm::Baseline),
        })
    }

    /// Gather samples until both arms reach the minimum or the sample window
    /// closes. Replay mode produces the samples itself from `held_out`.
    pub async fn collect(
        &self,
        experiment: &Experiment,
        held_out: &[RunRecord],
        cancel: &CancelFlag,
    ) -> Result<(), LearningError> {
        match (&self.replayer, experiment.mode) {
            (Some(replayer), ExperimentMode::Replay) => {
                self.replay(replayer.as_ref(), experiment, held_out, cancel)
                    .await
            }
            _ => self.wait_for_samples(experiment, cancel).await,
        }
    }

    async fn wait_for_samples(
        &self,
        experiment: &Experiment,
        cancel: &CancelFlag,
    ) -> Result<(), LearningError> {
        let started = experiment.started_at.unwrap_or(experiment.created_at);
        let window = chrono::Duration::from_std(self.config.sample_window)
            .unwrap_or_else(|_| chrono::Duration::minutes(30));
        let closes_at = started + window;

        loop {
            cancel.checkpoint()?;
            let current = self
                .store
                .get_experiment(experiment.id)
                .await?
                .ok_or_else(|| LearningError::NotFound {
                    resource: format!("experiment {}", experiment.id),
                })?;
            if current.status != ExperimentStatus::Running {
                return Err(LearningError::Cancelled);
            }
            if current.has_enough_samples() {
                tracing::info!(experiment_id = %experiment.id, "experiment reached sample minimum");
                return Ok(());
            }

            let now = Utc::now();
            if now >= closes_at {
                tracing::info!(
                    experiment_id = %experiment.id,
                    baseline_samples = current.baseline_metrics.sample_count,
                    candidate_samples = current.candidate_metrics.sample_count,
                    "experiment sample window closed"
                );
                return Ok(());
            }
            let left = (closes_at - now).to_std().unwrap_or_default();
            tokio::time::sleep(self.config.runner_poll_interval.min(left)).await;
        }
    }

    async fn replay(
        &self,
        replayer: &dyn Replayer,
        experiment: &Experiment,
        held_out: &[RunRecord],
        cancel: &CancelFlag,
    ) -> Result<(), LearningError> {
        // Deterministic held-out selection: lowest traffic buckets first.
        let mut runs: Vec<&RunRecord> = held_out.iter().collect();
        runs.sort_by(|a, b| {
            traffic_bucket(experiment.id, &a.id.to_string())
                .total_cmp(&traffic_bucket(experiment.id, &b.id.to_string()))
        });
        runs.truncate(experiment.min_samples.max(0) as usize);

        // A driver resumed after a restart picks up where the last one stopped.
        let recorded: HashSet<(String, Arm)> = self
            .store
            .list_samples(experiment.id)
            .await?
            .into_iter()
            .map(|sample| (sample.run_id, sample.arm))
            .collect();
        if !recorded.is_empty() {
            tracing::info!(
                experiment_id = %experiment.id,
                recorded = recorded.len(),
                "resuming replay"
            );
        }

        for run in runs {
            cancel.checkpoint()?;
            let run_id = run.id.to_string();
            for (arm, version_id) in [
                (Arm::Baseline, experiment.baseline_version_id),
                (Arm::Candidate, experiment.candidate_version_id),
            ] {
                if recorded.contains(&(run_id.clone(), arm)) {
                    continue;
                }
                let outcome = with_retry(self.config.retry, "replay", move || {
                    replayer.replay(version_id, run)
                })
                .await?;
                self.ingest(
                    experiment.id,
                    SampleInput {
                        run_id: run_id.clone(),
                        arm: Some(arm),
                        score: outcome.score.clamp(0.0, 1.0),
                        success: outcome.success,
                        pair_key: Some(run_id.clone()),
                    },
                )
                .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use learnloop_core::dataset::RunStatus;
    use learnloop_core::experiment::NewExperiment;
    use learnloop_core::gating::RiskTier;

    use super::*;
    use crate::store::memory::MemoryStore;

    #[derive(Default)]
    struct ScriptedReplayer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Replayer for ScriptedReplayer {
        async fn replay(
            &self,
            _version_id: Uuid,
            _run: &RunRecord,
        ) -> Result<ReplayOutcome, LearningError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ReplayOutcome {
                score: 0.5,
                success: true,
            })
        }
    }

    fn held_out_runs(n: usize) -> Vec<RunRecord> {
        let agent_id = Uuid::now_v7();
        (0..n)
            .map(|_| RunRecord {
                id: Uuid::now_v7(),
                agent_id,
                version_id: None,
                status: RunStatus::Completed,
                scores: BTreeMap::from([("quality".to_string(), 0.5)]),
                tool_calls: Vec::new(),
                feedback: None,
                completed_at: Some(Utc::now()),
            })
            .collect()
    }

    async fn running_experiment(store: &MemoryStore, mode: ExperimentMode, min_samples: i64) -> Experiment {
        let mut experiment = Experiment::new(
            NewExperiment {
                session_id: Uuid::now_v7(),
                proposal_id: Uuid::now_v7(),
                mode,
                baseline_version_id: Uuid::now_v7(),
                candidate_version_id: Uuid::now_v7(),
                traffic_split: 0.5,
                risk_tier: RiskTier::Low,
                gating_threshold: 0.55,
                min_samples,
            },
            Utc::now(),
        )
        .expect("valid experiment");
        experiment.start(Utc::now());
        assert!(store.save_experiment(&experiment).await.expect("save"));
        experiment
    }

    fn runner(store: Arc<MemoryStore>, replayer: Option<Arc<dyn Replayer>>) -> ExperimentRunner {
        let config = EngineConfig {
            sample_window: Duration::from_millis(50),
            runner_poll_interval: Duration::from_millis(5),
            ..EngineConfig::default()
        };
        ExperimentRunner::new(store, replayer, Arc::new(config))
    }

    fn input(run_id: &str, arm: Option<Arm>, score: f64) -> SampleInput {
        SampleInput {
            run_id: run_id.to_string(),
            arm,
            score,
            success: true,
            pair_key: None,
        }
    }

    #[tokio::test]
    async fn ingest_updates_arm_metrics() {
        let store = Arc::new(MemoryStore::new());
        let experiment = running_experiment(&store, ExperimentMode::Shadow, 2).await;
        let runner = runner(store.clone(), None);

        runner
            .ingest(experiment.id, input("r1", Some(Arm::Baseline), 0.4))
            .await
            .expect("baseline sample");
        runner
            .ingest(experiment.id, input("r2", Some(Arm::Candidate), 0.8))
            .await
            .expect("candidate sample");

        let stored = store
            .get_experiment(experiment.id)
            .await
            .expect("read")
            .expect("exists");
        assert_eq!(stored.baseline_metrics.sample_count, 1);
        assert_eq!(stored.candidate_metrics.sample_count, 1);
        assert!((stored.candidate_metrics.avg_score - 0.8).abs() < 1e-9);
        assert_eq!(store.list_samples(experiment.id).await.expect("read").len(), 2);
    }

    #[tokio::test]
    async fn ingest_without_arm_follows_traffic_split() {
        let store = Arc::new(MemoryStore::new());
        let experiment = running_experiment(&store, ExperimentMode::Shadow, 2).await;
        let runner = runner(store.clone(), None);

        let sample = runner
            .ingest(experiment.id, input("run-42", None, 0.7))
            .await
            .expect("sample");
        assert_eq!(sample.arm, route_run(experiment.id, "run-42", 0.5));
    }

    #[tokio::test]
    async fn terminal_experiments_refuse_samples() {
        let store = Arc::new(MemoryStore::new());
        let mut experiment = running_experiment(&store, ExperimentMode::Shadow, 2).await;
        experiment.fail("cancelled", Utc::now());
        assert!(store.save_experiment(&experiment).await.expect("save"));
        let runner = runner(store.clone(), None);

        let err = runner
            .ingest(experiment.id, input("r1", Some(Arm::Baseline), 0.4))
            .await
            .expect_err("failed experiment must refuse samples");
        assert_eq!(err.code(), "ValidationError");
    }

    #[tokio::test]
    async fn shadow_wait_ends_when_window_closes() {
        let store = Arc::new(MemoryStore::new());
        let experiment = running_experiment(&store, ExperimentMode::Shadow, 5).await;
        let runner = runner(store.clone(), None);
        runner
            .collect(&experiment, &[], &CancelFlag::default())
            .await
            .expect("window closes without error");
    }

    #[tokio::test]
    async fn cancelled_flag_stops_collection() {
        let store = Arc::new(MemoryStore::new());
        let experiment = running_experiment(&store, ExperimentMode::Shadow, 5).await;
        let runner = runner(store.clone(), None);
        let flag = CancelFlag::default();
        flag.cancel();
        let err = runner
            .collect(&experiment, &[], &flag)
            .await
            .expect_err("cancelled");
        assert_eq!(err, LearningError::Cancelled);
    }

    #[tokio::test]
    async fn replay_produces_paired_samples() {
        let store = Arc::new(MemoryStore::new());
        let experiment = running_experiment(&store, ExperimentMode::Replay, 3).await;
        let runner = runner(store.clone(), Some(Arc::new(ScriptedReplayer::default())));
        let held_out = held_out_runs(5);

        runner
            .collect(&experiment, &held_out, &CancelFlag::default())
            .await
            .expect("replay succeeds");

        let samples = store.list_samples(experiment.id).await.expect("read");
        assert_eq!(samples.len(), 6);
        assert!(samples.iter().all(|s| s.pair_key.as_deref() == Some(s.run_id.as_str())));
    }

    #[tokio::test]
    async fn resumed_replay_skips_recorded_samples() {
        let store = Arc::new(MemoryStore::new());
        let experiment = running_experiment(&store, ExperimentMode::Replay, 3).await;
        let replayer = Arc::new(ScriptedReplayer::default());
        let runner = runner(store.clone(), Some(replayer.clone()));
        let held_out = held_out_runs(5);

        // A previous driver replayed every run against the baseline only.
        for run in &held_out {
            runner
                .ingest(
                    experiment.id,
                    SampleInput {
                        run_id: run.id.to_string(),
                        arm: Some(Arm::Baseline),
                        score: 0.4,
                        success: true,
                        pair_key: Some(run.id.to_string()),
                    },
                )
                .await
                .expect("earlier sample");
        }

        runner
            .collect(&experiment, &held_out, &CancelFlag::default())
            .await
            .expect("resumed replay succeeds");

        assert_eq!(replayer.calls.load(Ordering::SeqCst), 3);
        let samples = store.list_samples(experiment.id).await.expect("read");
        assert_eq!(samples.len(), 8);
        assert_eq!(samples.iter().filter(|s| s.arm == Arm::Candidate).count(), 3);
    }

    #[tokio::test]
    async fn route_defaults_to_baseline_without_running_experiment() {
        let store = Arc::new(MemoryStore::new());
        let runner = runner(store.clone(), None);
        let (experiment_id, arm) = runner
            .route_for_agent(Uuid::now_v7(), "run-1")
            .await
            .expect("route");
        assert_eq!(experiment_id, None);
        assert_eq!(arm, Arm::Baseline);
    }
}
