//! Per-agent learning policy and the pure decisions made from it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{DenialReason, LearningError};
use crate::gating::RiskTier;
use crate::session::TriggerType;

pub const DEFAULT_SIGNAL_THRESHOLD: i64 = 10;
pub const DEFAULT_SIGNAL_WINDOW_MINUTES: i64 = 60;
pub const DEFAULT_SCHEDULE_INTERVAL_MINUTES: i64 = 1440;
pub const DEFAULT_TRAFFIC_SPLIT_CANDIDATE: f64 = 0.1;
pub const DEFAULT_MIN_CONFIDENCE_FOR_AUTO: f64 = 0.8;
pub const DEFAULT_MIN_WIN_RATE_FOR_AUTO: f64 = 0.6;
pub const MAX_WINDOW_MINUTES: i64 = 60 * 24 * 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LearningPolicy {
    pub agent_id: Uuid,
    pub enabled: bool,
    pub auto_promotion_enabled: bool,
    pub scheduled_enabled: bool,
    pub threshold_enabled: bool,
    pub paused: bool,
    pub paused_until: Option<DateTime<Utc>>,
    pub paused_reason: Option<String>,
    pub paused_by: Option<String>,
    /// Negative runs inside the window that trigger a threshold session
    pub signal_threshold: i64,
    pub signal_window_minutes: i64,
    pub schedule_interval_minutes: i64,
    pub traffic_split_candidate: f64,
    pub min_confidence_for_auto: f64,
    pub min_win_rate_for_auto: f64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl LearningPolicy {
    /// Resolution for agents without a stored policy row.
    pub fn defaults_for(agent_id: Uuid) -> Self {
        Self {
            agent_id,
            enabled: true,
            auto_promotion_enabled: false,
            scheduled_enabled: false,
            threshold_enabled: false,
            paused: false,
            paused_until: None,
            paused_reason: None,
            paused_by: None,
            signal_threshold: DEFAULT_SIGNAL_THRESHOLD,
            signal_window_minutes: DEFAULT_SIGNAL_WINDOW_MINUTES,
            schedule_interval_minutes: DEFAULT_SCHEDULE_INTERVAL_MINUTES,
            traffic_split_candidate: DEFAULT_TRAFFIC_SPLIT_CANDIDATE,
            min_confidence_for_auto: DEFAULT_MIN_CONFIDENCE_FOR_AUTO,
            min_win_rate_for_auto: DEFAULT_MIN_WIN_RATE_FOR_AUTO,
            updated_at: None,
        }
    }

    /// Paused right now. A `pausedUntil` in the past counts as resumed.
    pub fn is_paused_at(&self, now: DateTime<Utc>) -> bool {
        if !self.paused {
            return false;
        }
        match self.paused_until {
            Some(until) => until > now,
            None => true,
        }
    }

    pub fn trigger_enabled(&self, trigger_type: TriggerType) -> bool {
        match trigger_type {
            TriggerType::Manual => true,
            TriggerType::Scheduled => self.scheduled_enabled,
            TriggerType::Threshold => self.threshold_enabled,
        }
    }

    pub fn pause(
        &mut self,
        actor: Option<String>,
        reason: Option<String>,
        until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        self.paused = true;
        self.paused_until = until;
        self.paused_reason = reason;
        self.paused_by = actor;
        self.updated_at = Some(now);
    }

    pub fn resume(&mut self, now: DateTime<Utc>) {
        self.paused = false;
        self.paused_until = None;
        self.paused_reason = None;
        self.paused_by = None;
        self.updated_at = Some(now);
    }

    pub fn apply(&mut self, update: &PolicyUpdate, now: DateTime<Utc>) -> Result<(), LearningError> {
        update.validate()?;
        if let Some(v) = update.enabled {
            self.enabled = v;
        }
        if let Some(v) = update.auto_promotion_enabled {
            self.auto_promotion_enabled = v;
        }
        if let Some(v) = update.scheduled_enabled {
            self.scheduled_enabled = v;
        }
        if let Some(v) = update.threshold_enabled {
            self.threshold_enabled = v;
        }
        if let Some(v) = update.signal_threshold {
            self.signal_threshold = v;
        }
        if let Some(v) = update.signal_window_minutes {
            self.signal_window_minutes = v;
        }
        if let Some(v) = update.schedule_interval_minutes {
            self.schedule_interval_minutes = v;
        }
        if let Some(v) = update.traffic_split_candidate {
            self.traffic_split_candidate = v;
        }
        if let Some(v) = update.min_confidence_for_auto {
            self.min_confidence_for_auto = v;
        }
        if let Some(v) = update.min_win_rate_for_auto {
            self.min_win_rate_for_auto = v;
        }
        self.updated_at = Some(now);
        Ok(())
    }
}

/// Partial policy update; absent fields stay unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PolicyUpdate {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub auto_promotion_enabled: Option<bool>,
    #[serde(default)]
    pub scheduled_enabled: Option<bool>,
    #[serde(default)]
    pub threshold_enabled: Option<bool>,
    #[serde(default)]
    pub signal_threshold: Option<i64>,
    #[serde(default)]
    pub signal_window_minutes: Option<i64>,
    #[serde(default)]
    pub schedule_interval_minutes: Option<i64>,
    #[serde(default)]
    pub traffic_split_candidate: Option<f64>,
    #[serde(default)]
    pub min_confidence_for_auto: Option<f64>,
    #[serde(default)]
    pub min_win_rate_for_auto: Option<f64>,
}

fn check_unit(value: Option<f64>, field: &str) -> Result<(), LearningError> {
    match value {
        Some(v) if !v.is_finite() || !(0.0..=1.0).contains(&v) => Err(LearningError::validation(
            format!("{field} must be within [0, 1], got {v}"),
            field,
        )),
        _ => Ok(()),
    }
}

fn check_minutes(value: Option<i64>, field: &str) -> Result<(), LearningError> {
    match value {
        Some(v) if !(1..=MAX_WINDOW_MINUTES).contains(&v) => Err(LearningError::validation(
            format!("{field} must be within [1, {MAX_WINDOW_MINUTES}], got {v}"),
            field,
        )),
        _ => Ok(()),
    }
}

impl PolicyUpdate {
    pub fn validate(&self) -> Result<(), LearningError> {
        check_unit(self.traffic_split_candidate, "trafficSplitCandidate")?;
        check_unit(self.min_confidence_for_auto, "minConfidenceForAuto")?;
        check_unit(self.min_win_rate_for_auto, "minWinRateForAuto")?;
        check_minutes(self.signal_window_minutes, "signalWindowMinutes")?;
        check_minutes(self.schedule_interval_minutes, "scheduleIntervalMinutes")?;
        if let Some(threshold) = self.signal_threshold {
            if threshold < 1 {
                return Err(LearningError::validation(
                    format!("signalThreshold must be >= 1, got {threshold}"),
                    "signalThreshold",
                ));
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self == &PolicyUpdate::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied(DenialReason),
}

/// Order: disabled, paused, trigger type, then the active-session check.
pub fn is_session_creation_allowed(
    policy: &LearningPolicy,
    has_active_session: bool,
    trigger_type: TriggerType,
    now: DateTime<Utc>,
) -> Admission {
    if !policy.enabled {
        return Admission::Denied(DenialReason::PolicyDisabled);
    }
    if policy.is_paused_at(now) {
        return Admission::Denied(DenialReason::PolicyPaused);
    }
    if !policy.trigger_enabled(trigger_type) {
        return Admission::Denied(DenialReason::TriggerDisabled);
    }
    if has_active_session {
        return Admission::Denied(DenialReason::AlreadyActiveSession);
    }
    Admission::Allowed
}

pub fn is_auto_promotion_allowed(
    policy: &LearningPolicy,
    confidence: Option<f64>,
    win_rate: Option<f64>,
    risk_tier: RiskTier,
) -> bool {
    let (Some(confidence), Some(win_rate)) = (confidence, win_rate) else {
        return false;
    };
    policy.enabled
        && policy.auto_promotion_enabled
        && confidence >= policy.min_confidence_for_auto
        && win_rate >= policy.min_win_rate_for_auto
        && risk_tier == RiskTier::Low
}

/// A scheduled session is due when none ran within the interval.
pub fn is_schedule_due(
    policy: &LearningPolicy,
    last_session_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    if !policy.scheduled_enabled {
        return false;
    }
    match last_session_at {
        Some(last) => now - last >= Duration::minutes(policy.schedule_interval_minutes),
        None => true,
    }
}

pub fn is_threshold_reached(policy: &LearningPolicy, negative_runs: i64) -> bool {
    policy.threshold_enabled && negative_runs >= policy.signal_threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> LearningPolicy {
        LearningPolicy::defaults_for(Uuid::now_v7())
    }

    #[test]
    fn defaults_allow_manual_sessions() {
        let now = Utc::now();
        assert_eq!(
            is_session_creation_allowed(&policy(), false, TriggerType::Manual, now),
            Admission::Allowed
        );
        assert_eq!(
            is_session_creation_allowed(&policy(), false, TriggerType::Scheduled, now),
            Admission::Denied(DenialReason::TriggerDisabled)
        );
    }

    #[test]
    fn active_session_blocks_creation() {
        assert_eq!(
            is_session_creation_allowed(&policy(), true, TriggerType::Manual, Utc::now()),
            Admission::Denied(DenialReason::AlreadyActiveSession)
        );
    }

    #[test]
    fn disabled_and_paused_are_denied() {
        let now = Utc::now();
        let mut p = policy();
        p.pause(Some("ops".into()), Some("incident".into()), None, now);
        assert_eq!(
            is_session_creation_allowed(&p, false, TriggerType::Manual, now),
            Admission::Denied(DenialReason::PolicyPaused)
        );
        p.enabled = false;
        assert_eq!(
            is_session_creation_allowed(&p, false, TriggerType::Manual, now),
            Admission::Denied(DenialReason::PolicyDisabled)
        );
    }

    #[test]
    fn expired_pause_counts_as_resumed() {
        let now = Utc::now();
        let mut p = policy();
        p.pause(None, None, Some(now - Duration::minutes(1)), now - Duration::hours(1));
        assert!(!p.is_paused_at(now));
        p.pause(None, None, Some(now + Duration::minutes(1)), now);
        assert!(p.is_paused_at(now));
        p.resume(now);
        assert!(!p.paused);
        assert_eq!(p.paused_by, None);
    }

    #[test]
    fn auto_promotion_needs_every_condition() {
        let mut p = policy();
        assert!(!is_auto_promotion_allowed(&p, Some(0.9), Some(0.7), RiskTier::Low));
        p.auto_promotion_enabled = true;
        assert!(is_auto_promotion_allowed(&p, Some(0.9), Some(0.7), RiskTier::Low));
        assert!(!is_auto_promotion_allowed(&p, Some(0.9), Some(0.7), RiskTier::Medium));
        assert!(!is_auto_promotion_allowed(&p, Some(0.5), Some(0.7), RiskTier::Low));
        assert!(!is_auto_promotion_allowed(&p, Some(0.9), Some(0.5), RiskTier::Low));
        assert!(!is_auto_promotion_allowed(&p, None, Some(0.9), RiskTier::Low));
    }

    #[test]
    fn update_validates_ranges() {
        let mut p = policy();
        let bad = PolicyUpdate {
            traffic_split_candidate: Some(1.5),
            ..PolicyUpdate::default()
        };
        let err = p.apply(&bad, Utc::now()).unwrap_err();
        assert_eq!(
            err,
            LearningError::validation(
                "trafficSplitCandidate must be within [0, 1], got 1.5",
                "trafficSplitCandidate"
            )
        );
        let good = PolicyUpdate {
            auto_promotion_enabled: Some(true),
            signal_threshold: Some(3),
            ..PolicyUpdate::default()
        };
        p.apply(&good, Utc::now()).unwrap();
        assert!(p.auto_promotion_enabled);
        assert_eq!(p.signal_threshold, 3);
        assert!(p.updated_at.is_some());
    }

    #[test]
    fn schedule_and_threshold_triggers() {
        let now = Utc::now();
        let mut p = policy();
        assert!(!is_schedule_due(&p, None, now));
        p.scheduled_enabled = true;
        assert!(is_schedule_due(&p, None, now));
        assert!(!is_schedule_due(&p, Some(now - Duration::minutes(5)), now));
        assert!(is_schedule_due(&p, Some(now - Duration::days(2)), now));

        assert!(!is_threshold_reached(&p, 100));
        p.threshold_enabled = true;
        assert!(is_threshold_reached(&p, DEFAULT_SIGNAL_THRESHOLD));
        assert!(!is_threshold_reached(&p, DEFAULT_SIGNAL_THRESHOLD - 1));
    }
}
