use chrono::{DateTime, Utc};
use learnloop_core::session::{LearningSession, SessionStatus};
use serde::Serialize;
use tokio::sync::broadcast;
use utoipa::ToSchema;
use uuid::Uuid;

/// A committed status change.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub session_id: Uuid,
    pub agent_id: Uuid,
    /// `None` for the creation event
    pub from: Option<SessionStatus>,
    pub to: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

impl SessionEvent {
    pub fn transition(from: Option<SessionStatus>, session: &LearningSession) -> Self {
        let reason = match session.status {
            SessionStatus::Failed => session.metadata.failure_reason.clone(),
            SessionStatus::Cancelled => session.metadata.cancel_reason.clone(),
            SessionStatus::Rejected => session.metadata.rejection_reason.clone(),
            _ => None,
        };
        Self {
            session_id: session.id,
            agent_id: session.agent_id,
            from,
            to: session.status,
            reason,
            at: session.updated_at,
        }
    }
}

/// Fan-out of session events to SSE subscribers.
#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: SessionEvent) {
        // Err only means nobody is listening.
        if self.tx.send(event).is_err() {
            tracing::trace!("session event dropped, no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use learnloop_core::session::{Trigger, TriggerType};

    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let hub = EventHub::new(8);
        let mut rx = hub.subscribe();
        let trigger = Trigger::new("manual run", TriggerType::Manual).expect("valid trigger");
        let mut session = LearningSession::new(
            Uuid::now_v7(),
            1,
            Uuid::now_v7(),
            BTreeSet::new(),
            &trigger,
            Utc::now(),
        );
        session.metadata.failure_reason = Some("no signals".to_string());
        session
            .apply_transition(SessionStatus::Failed, Utc::now())
            .expect("collecting may fail");

        hub.publish(SessionEvent::transition(Some(SessionStatus::Collecting), &session));

        let event = rx.recv().await.expect("event should arrive");
        assert_eq!(event.to, SessionStatus::Failed);
        assert_eq!(event.reason.as_deref(), Some("no signals"));
    }
}
