use std::collections::BTreeMap;

use serde::Serialize;
use utoipa::ToSchema;

use crate::approval::{Approval, ApprovalDecision};
use crate::experiment::{Experiment, ExperimentStatus};
use crate::session::{LearningSession, SessionStatus};

/// Aggregate counters and rates shown on the learning dashboard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub total_sessions: i64,
    pub active_sessions: i64,
    pub awaiting_approval: i64,
    pub promoted: i64,
    pub rejected: i64,
    pub failed: i64,
    pub cancelled: i64,
    /// promoted / (promoted + rejected)
    pub promotion_rate: Option<f64>,
    /// auto approvals / all approving decisions
    pub auto_approval_rate: Option<f64>,
    pub avg_win_rate: Option<f64>,
    pub avg_candidate_score: Option<f64>,
    pub avg_baseline_score: Option<f64>,
    pub avg_session_duration_seconds: Option<f64>,
    pub signals_detected: i64,
    pub proposals_generated: i64,
    pub experiments_run: i64,
    pub failure_reasons: BTreeMap<String, i64>,
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}

fn ratio(numerator: i64, denominator: i64) -> Option<f64> {
    (denominator > 0).then(|| numerator as f64 / denominator as f64)
}

impl MetricsSummary {
    pub fn compute(
        sessions: &[LearningSession],
        experiments: &[Experiment],
        approvals: &[Approval],
        signals_detected: i64,
        proposals_generated: i64,
    ) -> Self {
        let count = |status: SessionStatus| {
            sessions.iter().filter(|s| s.status == status).count() as i64
        };
        let promoted = count(SessionStatus::Promoted);
        let rejected = count(SessionStatus::Rejected);

        let mut failure_reasons = BTreeMap::new();
        for session in sessions.iter().filter(|s| s.status == SessionStatus::Failed) {
            let reason = session
                .metadata
                .failure_reason
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            *failure_reasons.entry(reason).or_insert(0) += 1;
        }

        let approving = approvals.iter().filter(|a| a.decision.is_approval()).count() as i64;
        let auto = approvals
            .iter()
            .filter(|a| a.decision == ApprovalDecision::AutoApproved)
            .count() as i64;

        let completed: Vec<&Experiment> = experiments
            .iter()
            .filter(|e| e.status == ExperimentStatus::Completed)
            .collect();

        Self {
            total_sessions: sessions.len() as i64,
            active_sessions: sessions.iter().filter(|s| s.status.is_working()).count() as i64,
            awaiting_approval: count(SessionStatus::AwaitingApproval),
            promoted,
            rejected,
            failed: count(SessionStatus::Failed),
            cancelled: count(SessionStatus::Cancelled),
            promotion_rate: ratio(promoted, promoted + rejected),
            auto_approval_rate: ratio(auto, approving),
            avg_win_rate: mean(completed.iter().filter_map(|e| e.win_rate)),
            avg_candidate_score: mean(
                completed
                    .iter()
                    .filter(|e| e.candidate_metrics.sample_count > 0)
                    .map(|e| e.candidate_metrics.avg_score),
            ),
            avg_baseline_score: mean(
                completed
                    .iter()
                    .filter(|e| e.baseline_metrics.sample_count > 0)
                    .map(|e| e.baseline_metrics.avg_score),
            ),
            avg_session_duration_seconds: mean(sessions.iter().filter_map(|s| {
                s.completed_at
                    .map(|done| (done - s.created_at).num_milliseconds() as f64 / 1000.0)
            })),
            signals_detected,
            proposals_generated,
            experiments_run: experiments
                .iter()
                .filter(|e| e.status != ExperimentStatus::Pending)
                .count() as i64,
            failure_reasons,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use super::*;
    use crate::session::{Trigger, TriggerType};

    fn session(status: SessionStatus, failure: Option<&str>) -> LearningSession {
        let trigger = Trigger::new("t", TriggerType::Manual).unwrap();
        let now = Utc::now();
        let mut s = LearningSession::new(Uuid::now_v7(), 1, Uuid::now_v7(), BTreeSet::new(), &trigger, now);
        s.status = status;
        s.metadata.failure_reason = failure.map(str::to_string);
        if status.is_terminal() {
            s.completed_at = Some(now + Duration::seconds(10));
        }
        s
    }

    #[test]
    fn counts_and_rates() {
        let sessions = vec![
            session(SessionStatus::Promoted, None),
            session(SessionStatus::Rejected, None),
            session(SessionStatus::Rejected, None),
            session(SessionStatus::Failed, Some("no signals")),
            session(SessionStatus::Failed, Some("no signals")),
            session(SessionStatus::Testing, None),
        ];
        let summary = MetricsSummary::compute(&sessions, &[], &[], 7, 3);
        assert_eq!(summary.total_sessions, 6);
        assert_eq!(summary.active_sessions, 1);
        assert_eq!(summary.promoted, 1);
        assert_eq!(summary.failed, 2);
        assert!((summary.promotion_rate.unwrap() - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(summary.failure_reasons.get("no signals"), Some(&2));
        assert!((summary.avg_session_duration_seconds.unwrap() - 10.0).abs() < 1e-9);
        assert_eq!(summary.auto_approval_rate, None);
        assert_eq!(summary.signals_detected, 7);
    }

    #[test]
    fn empty_inputs_have_no_rates() {
        let summary = MetricsSummary::compute(&[], &[], &[], 0, 0);
        assert_eq!(summary.total_sessions, 0);
        assert_eq!(summary.promotion_rate, None);
        assert_eq!(summary.avg_win_rate, None);
    }
}
