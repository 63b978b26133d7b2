use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use learnloop_core::error::LearningError;
use learnloop_core::policy::{is_schedule_due, is_threshold_reached};
use learnloop_core::session::{SessionStatus, Trigger, TriggerType};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::Coordinator;
use crate::store::Agent;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// Active sessions handed back to a driver
    pub resumed: usize,
    pub started: usize,
}

/// Periodic trigger source: scheduled and threshold sessions, plus resumption
/// of sessions nobody is driving (after a restart, or past their dwell budget).
pub struct Scheduler {
    coordinator: Arc<Coordinator>,
}

impl Scheduler {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    pub async fn tick(&self) -> Result<TickReport, LearningError> {
        let mut report = TickReport::default();

        for session in self.coordinator.store().list_active_sessions().await? {
            // A driver that is already running makes this a no-op; an expired
            // dwell budget fails the session on the next drive.
            if session.status.is_working() || session.status == SessionStatus::Approved {
                self.coordinator.spawn_drive(session.id);
                report.resumed += 1;
            }
        }

        for agent in self.coordinator.versions().list_agents().await? {
            match self.maybe_start(&agent).await {
                Ok(true) => report.started += 1,
                Ok(false) => {}
                Err(LearningError::PolicyDenied(reason)) => {
                    tracing::debug!(agent = %agent.slug, reason = reason.code(), "scheduler trigger denied");
                }
                Err(err) => {
                    tracing::warn!(agent = %agent.slug, error = %err, "scheduler could not evaluate agent");
                }
            }
        }

        if report.resumed > 0 || report.started > 0 {
            tracing::info!(resumed = report.resumed, started = report.started, "scheduler tick");
        }
        Ok(report)
    }

    async fn maybe_start(&self, agent: &Agent) -> Result<bool, LearningError> {
        let now = Utc::now();
        let policy = self.coordinator.policies().load(agent.id).await?;
        if !policy.enabled || policy.is_paused_at(now) {
            return Ok(false);
        }
        let store = self.coordinator.store();
        if store.active_session(agent.id).await?.is_some() {
            return Ok(false);
        }
        let last_created = store
            .list_sessions(agent.id)
            .await?
            .first()
            .map(|session| session.created_at);

        if is_schedule_due(&policy, last_created, now) {
            let trigger = Trigger::new("scheduled run", TriggerType::Scheduled)?;
            self.coordinator.create_session(agent, trigger).await?;
            return Ok(true);
        }

        if !policy.threshold_enabled {
            return Ok(false);
        }
        let window = chrono::Duration::minutes(policy.signal_window_minutes);
        // The runs that tripped the last threshold session must not trip another.
        if last_created.is_some_and(|at| now - at < window) {
            return Ok(false);
        }
        let negative = self
            .coordinator
            .runs()
            .count_negative_runs(agent.id, now - window)
            .await?;
        if !is_threshold_reached(&policy, negative) {
            return Ok(false);
        }
        let reason = format!(
            "{negative} negative runs in the last {} minutes",
            policy.signal_window_minutes
        );
        let trigger = Trigger::new(&reason, TriggerType::Threshold)?;
        self.coordinator.create_session(agent, trigger).await?;
        Ok(true)
    }
}

pub fn spawn_scheduler(scheduler: Arc<Scheduler>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if let Err(err) = scheduler.tick().await {
                tracing::error!(error = %err, "scheduler tick failed");
            }
        }
    })
}
