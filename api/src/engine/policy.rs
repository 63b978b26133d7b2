use std::sync::Arc;

use chrono::{DateTime, Utc};
use learnloop_core::error::LearningError;
use learnloop_core::policy::{LearningPolicy, PolicyUpdate};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use super::locks::KeyedLocks;
use crate::store::{LearningStore, StoreError};

/// Keyed policy store. Every read-modify-write for an agent runs under that
/// agent's lock, which session admission also takes.
pub struct PolicyEngine {
    store: Arc<dyn LearningStore>,
    locks: KeyedLocks<Uuid>,
}

impl PolicyEngine {
    pub fn new(store: Arc<dyn LearningStore>) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
        }
    }

    pub async fn lock_agent(&self, agent_id: Uuid) -> OwnedMutexGuard<()> {
        self.locks.lock(&agent_id).await
    }

    /// Stored policy, or defaults when the agent has no row yet.
    pub async fn load(&self, agent_id: Uuid) -> Result<LearningPolicy, StoreError> {
        Ok(self
            .store
            .get_policy(agent_id)
            .await?
            .unwrap_or_else(|| LearningPolicy::defaults_for(agent_id)))
    }

    pub async fn update(
        &self,
        agent_id: Uuid,
        update: &PolicyUpdate,
    ) -> Result<LearningPolicy, LearningError> {
        let _guard = self.lock_agent(agent_id).await;
        let mut policy = self.load(agent_id).await?;
        policy.apply(update, Utc::now())?;
        self.store.save_policy(&policy).await?;
        tracing::info!(
            agent_id = %agent_id,
            enabled = policy.enabled,
            auto_promotion = policy.auto_promotion_enabled,
            scheduled = policy.scheduled_enabled,
            threshold = policy.threshold_enabled,
            "learning policy updated"
        );
        Ok(policy)
    }

    pub async fn set_paused(
        &self,
        agent_id: Uuid,
        paused: bool,
        actor: Option<String>,
        reason: Option<String>,
        until: Option<DateTime<Utc>>,
    ) -> Result<LearningPolicy, LearningError> {
        let now = Utc::now();
        if paused && until.is_some_and(|until| until <= now) {
            return Err(LearningError::validation(
                "pausedUntil must be in the future",
                "pausedUntil",
            ));
        }
        let _guard = self.lock_agent(agent_id).await;
        let mut policy = self.load(agent_id).await?;
        if paused {
            policy.pause(actor.clone(), reason.clone(), until, now);
        } else {
            policy.resume(now);
        }
        self.store.save_policy(&policy).await?;
        tracing::info!(
            agent_id = %agent_id,
            paused,
            actor = actor.as_deref().unwrap_or("<none>"),
            reason = reason.as_deref().unwrap_or("<none>"),
            "learning policy pause toggled"
        );
        Ok(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn missing_policy_resolves_to_defaults() {
        let engine = PolicyEngine::new(Arc::new(MemoryStore::new()));
        let agent_id = Uuid::now_v7();
        let policy = engine.load(agent_id).await.expect("load should succeed");
        assert_eq!(policy, LearningPolicy::defaults_for(agent_id));
    }

    #[tokio::test]
    async fn pause_then_resume_clears_audit_fields() {
        let engine = PolicyEngine::new(Arc::new(MemoryStore::new()));
        let agent_id = Uuid::now_v7();
        let paused = engine
            .set_paused(
                agent_id,
                true,
                Some("ops@example.com".to_string()),
                Some("incident".to_string()),
                None,
            )
            .await
            .expect("pause should succeed");
        assert!(paused.paused);
        assert_eq!(paused.paused_by.as_deref(), Some("ops@example.com"));

        let resumed = engine
            .set_paused(agent_id, false, None, None, None)
            .await
            .expect("resume should succeed");
        assert!(!resumed.paused);
        assert!(resumed.paused_reason.is_none());
        assert!(!engine.load(agent_id).await.expect("load").paused);
    }

    #[tokio::test]
    async fn pause_until_in_the_past_is_rejected() {
        let engine = PolicyEngine::new(Arc::new(MemoryStore::new()));
        let err = engine
            .set_paused(
                Uuid::now_v7(),
                true,
                None,
                None,
                Some(Utc::now() - chrono::Duration::minutes(5)),
            )
            .await
            .expect_err("past pausedUntil must be rejected");
        assert_eq!(err.code(), "ValidationError");
    }

    #[tokio::test]
    async fn invalid_update_leaves_policy_untouched() {
        let store = Arc::new(MemoryStore::new());
        let engine = PolicyEngine::new(store.clone());
        let agent_id = Uuid::now_v7();
        let update = PolicyUpdate {
            traffic_split_candidate: Some(1.5),
            ..PolicyUpdate::default()
        };
        assert!(engine.update(agent_id, &update).await.is_err());
        assert!(store.get_policy(agent_id).await.expect("read").is_none());
    }
}
