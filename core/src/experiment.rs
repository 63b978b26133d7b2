//! A/B experiments: traffic routing, incremental arm metrics, win-rate
//! statistics and the completion rules that feed gating.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::LearningError;
use crate::gating::{ConfidenceInterval, GateDecision, GatingResult, RiskTier, gate_with_samples};

/// Two-sided 95% normal quantile.
pub const Z_95: f64 = 1.959964;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Pending => "PENDING",
            ExperimentStatus::Running => "RUNNING",
            ExperimentStatus::Completed => "COMPLETED",
            ExperimentStatus::Failed => "FAILED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(ExperimentStatus::Pending),
            "RUNNING" => Some(ExperimentStatus::Running),
            "COMPLETED" => Some(ExperimentStatus::Completed),
            "FAILED" => Some(ExperimentStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExperimentStatus::Completed | ExperimentStatus::Failed)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentMode {
    Shadow,
    Replay,
}

impl ExperimentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentMode::Shadow => "shadow",
            ExperimentMode::Replay => "replay",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "shadow" => Some(ExperimentMode::Shadow),
            "replay" => Some(ExperimentMode::Replay),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Arm {
    Baseline,
    Candidate,
}

impl Arm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arm::Baseline => "baseline",
            Arm::Candidate => "candidate",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "baseline" => Some(Arm::Baseline),
            "candidate" => Some(Arm::Candidate),
            _ => None,
        }
    }
}

/// Running aggregate for one arm. Updated one sample at a time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ArmMetrics {
    pub avg_score: f64,
    pub success_rate: f64,
    pub sample_count: i64,
}

impl ArmMetrics {
    pub fn record(&mut self, score: f64, success: bool) {
        let n = self.sample_count as f64;
        let success = if success { 1.0 } else { 0.0 };
        self.avg_score = (self.avg_score * n + score) / (n + 1.0);
        self.success_rate = (self.success_rate * n + success) / (n + 1.0);
        self.sample_count += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub id: Uuid,
    pub experiment_id: Uuid,
    pub run_id: String,
    pub arm: Arm,
    /// Primary-scorer score in [0, 1]
    pub score: f64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pair_key: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl Sample {
    pub fn new(
        experiment_id: Uuid,
        run_id: &str,
        arm: Arm,
        score: f64,
        success: bool,
        pair_key: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, LearningError> {
        let run_id = run_id.trim();
        if run_id.is_empty() {
            return Err(LearningError::validation("runId must not be empty", "runId"));
        }
        if !score.is_finite() || !(0.0..=1.0).contains(&score) {
            return Err(LearningError::validation(
                format!("score must be within [0, 1], got {score}"),
                "score",
            ));
        }
        Ok(Self {
            id: Uuid::now_v7(),
            experiment_id,
            run_id: run_id.to_string(),
            arm,
            score,
            success,
            pair_key: pair_key.filter(|key| !key.trim().is_empty()),
            recorded_at: now,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub id: Uuid,
    pub session_id: Uuid,
    pub proposal_id: Uuid,
    pub status: ExperimentStatus,
    pub mode: ExperimentMode,
    pub baseline_version_id: Uuid,
    pub candidate_version_id: Uuid,
    pub traffic_split: f64,
    pub risk_tier: RiskTier,
    pub baseline_metrics: ArmMetrics,
    pub candidate_metrics: ArmMetrics,
    pub gating_threshold: f64,
    pub min_samples: i64,
    pub win_rate: Option<f64>,
    pub confidence_interval: Option<ConfidenceInterval>,
    pub gating_result: Option<GatingResult>,
    pub auto_eligible: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Win statistics over the comparisons an experiment produced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WinStats {
    pub win_rate: f64,
    pub comparisons: i64,
    pub paired: bool,
    pub confidence_interval: ConfidenceInterval,
}

pub struct NewExperiment {
    pub session_id: Uuid,
    pub proposal_id: Uuid,
    pub mode: ExperimentMode,
    pub baseline_version_id: Uuid,
    pub candidate_version_id: Uuid,
    pub traffic_split: f64,
    pub risk_tier: RiskTier,
    pub gating_threshold: f64,
    pub min_samples: i64,
}

impl Experiment {
    pub fn new(spec: NewExperiment, now: DateTime<Utc>) -> Result<Self, LearningError> {
        if !(0.0..=1.0).contains(&spec.gating_threshold) {
            return Err(LearningError::validation(
                "gatingThreshold must be within [0, 1]",
                "gatingThreshold",
            ));
        }
        if !(0.0..=1.0).contains(&spec.traffic_split) {
            return Err(LearningError::validation(
                "trafficSplitCandidate must be within [0, 1]",
                "trafficSplitCandidate",
            ));
        }
        Ok(Self {
            id: Uuid::now_v7(),
            session_id: spec.session_id,
            proposal_id: spec.proposal_id,
            status: ExperimentStatus::Pending,
            mode: spec.mode,
            baseline_version_id: spec.baseline_version_id,
            candidate_version_id: spec.candidate_version_id,
            traffic_split: spec.traffic_split,
            risk_tier: spec.risk_tier,
            baseline_metrics: ArmMetrics::default(),
            candidate_metrics: ArmMetrics::default(),
            gating_threshold: spec.gating_threshold,
            min_samples: spec.min_samples.max(1),
            win_rate: None,
            confidence_interval: None,
            gating_result: None,
            auto_eligible: false,
            failure_reason: None,
            started_at: None,
            completed_at: None,
            created_at: now,
        })
    }

    pub fn start(&mut self, now: DateTime<Utc>) {
        if self.status == ExperimentStatus::Pending {
            self.status = ExperimentStatus::Running;
            self.started_at = Some(now);
        }
    }

    /// Fold one sample into the arm metrics. Terminal experiments are immutable.
    pub fn record(&mut self, sample: &Sample) -> Result<(), LearningError> {
        if self.status.is_terminal() {
            return Err(LearningError::validation(
                format!("experiment {} is {}", self.id, self.status.as_str()),
                "experimentId",
            ));
        }
        match sample.arm {
            Arm::Baseline => self.baseline_metrics.record(sample.score, sample.success),
            Arm::Candidate => self.candidate_metrics.record(sample.score, sample.success),
        }
        Ok(())
    }

    /// Both arms reached the statistical minimum.
    pub fn has_enough_samples(&self) -> bool {
        self.baseline_metrics.sample_count >= self.min_samples
            && self.candidate_metrics.sample_count >= self.min_samples
    }

    /// Compute statistics over `samples`, gate, and mark COMPLETED.
    pub fn finalize(
        &mut self,
        samples: &[Sample],
        now: DateTime<Utc>,
    ) -> Result<GateDecision, LearningError> {
        if self.status.is_terminal() {
            return Err(LearningError::validation(
                format!("experiment {} is already {}", self.id, self.status.as_str()),
                "experimentId",
            ));
        }
        let stats = win_statistics(samples);
        // The minimum applies to the comparisons behind the win rate.
        let effective_candidates = match &stats {
            Some(s) if s.paired => s.comparisons,
            Some(_) if self.baseline_metrics.sample_count >= self.min_samples => {
                self.candidate_metrics.sample_count
            }
            _ => 0,
        };
        let decision = gate_with_samples(
            stats.map(|s| s.win_rate),
            stats.as_ref().map(|s| &s.confidence_interval),
            self.gating_threshold,
            self.risk_tier,
            effective_candidates,
            self.min_samples,
        );

        self.win_rate = stats.map(|s| s.win_rate);
        self.confidence_interval = stats.map(|s| s.confidence_interval);
        self.gating_result = Some(decision.result);
        self.auto_eligible = decision.auto_eligible;
        self.status = ExperimentStatus::Completed;
        self.completed_at = Some(now);
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        Ok(decision)
    }

    /// Abort without a gating result (runner error, session cancelled).
    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = ExperimentStatus::Failed;
        self.gating_result = Some(GatingResult::Failed);
        self.auto_eligible = false;
        self.failure_reason = Some(reason.into());
        self.completed_at = Some(now);
    }

    /// Human-readable outcome used as the rejection rationale.
    pub fn summary(&self) -> String {
        match (self.gating_result, self.win_rate) {
            (_, _) if self.failure_reason.is_some() => format!(
                "experiment failed: {}",
                self.failure_reason.as_deref().unwrap_or_default()
            ),
            (Some(result), Some(win_rate)) => format!(
                "gating {}: win rate {:.3} vs threshold {:.3} ({} candidate / {} baseline samples)",
                result.as_str(),
                win_rate,
                self.gating_threshold,
                self.candidate_metrics.sample_count,
                self.baseline_metrics.sample_count
            ),
            _ => format!(
                "gating failed: insufficient samples ({} candidate / {} baseline, {} required per arm)",
                self.candidate_metrics.sample_count,
                self.baseline_metrics.sample_count,
                self.min_samples
            ),
        }
    }
}

/// Uniform bucket in [0, 1) derived from the experiment and run ids.
pub fn traffic_bucket(experiment_id: Uuid, run_id: &str) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(experiment_id.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(run_id.as_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix) as f64 / 18_446_744_073_709_551_616.0
}

/// Stateless routing: the same run always lands on the same arm.
pub fn route_run(experiment_id: Uuid, run_id: &str, split: f64) -> Arm {
    if traffic_bucket(experiment_id, run_id) < split {
        Arm::Candidate
    } else {
        Arm::Baseline
    }
}

pub fn wilson_interval(wins: f64, n: f64, z: f64) -> ConfidenceInterval {
    if n <= 0.0 {
        return ConfidenceInterval {
            lower: 0.0,
            upper: 1.0,
        };
    }
    let p = (wins / n).clamp(0.0, 1.0);
    let z2 = z * z;
    let denom = 1.0 + z2 / n;
    let centre = (p + z2 / (2.0 * n)) / denom;
    let margin = z * (p * (1.0 - p) / n + z2 / (4.0 * n * n)).sqrt() / denom;
    ConfidenceInterval {
        lower: (centre - margin).clamp(0.0, 1.0),
        upper: (centre + margin).clamp(0.0, 1.0),
    }
}

fn compare(candidate: f64, baseline: f64) -> f64 {
    if candidate > baseline {
        1.0
    } else if candidate < baseline {
        0.0
    } else {
        0.5
    }
}

/// Paired comparisons when every candidate sample has a baseline partner with
/// the same pair key; otherwise every candidate sample against every baseline
/// sample. Unmatched baseline samples do not break pairing.
pub fn win_statistics(samples: &[Sample]) -> Option<WinStats> {
    let mut pairs: BTreeMap<&str, (Option<f64>, Option<f64>)> = BTreeMap::new();
    for sample in samples {
        let Some(key) = sample.pair_key.as_deref() else {
            continue;
        };
        let entry = pairs.entry(key).or_insert((None, None));
        match sample.arm {
            Arm::Baseline => {
                entry.0.get_or_insert(sample.score);
            }
            Arm::Candidate => {
                entry.1.get_or_insert(sample.score);
            }
        }
    }
    let complete: Vec<(f64, f64)> = pairs
        .values()
        .filter_map(|(baseline, candidate)| Some(((*baseline)?, (*candidate)?)))
        .collect();

    let all_candidates_paired = samples.iter().all(|s| {
        s.arm == Arm::Baseline
            || s
                .pair_key
                .as_deref()
                .and_then(|key| pairs.get(key))
                .is_some_and(|(baseline, _)| baseline.is_some())
    });

    if !complete.is_empty() && all_candidates_paired {
        let wins: f64 = complete
            .iter()
            .map(|(baseline, candidate)| compare(*candidate, *baseline))
            .sum();
        let n = complete.len() as f64;
        return Some(WinStats {
            win_rate: wins / n,
            comparisons: complete.len() as i64,
            paired: true,
            confidence_interval: wilson_interval(wins, n, Z_95),
        });
    }

    let mut baseline: Vec<f64> = samples
        .iter()
        .filter(|s| s.arm == Arm::Baseline)
        .map(|s| s.score)
        .collect();
    let candidate: Vec<f64> = samples
        .iter()
        .filter(|s| s.arm == Arm::Candidate)
        .map(|s| s.score)
        .collect();
    if baseline.is_empty() || candidate.is_empty() {
        return None;
    }
    baseline.sort_by(f64::total_cmp);

    let wins: f64 = candidate
        .iter()
        .map(|c| {
            let below = baseline.partition_point(|b| b < c);
            let tied = baseline.partition_point(|b| b <= c) - below;
            below as f64 + 0.5 * tied as f64
        })
        .sum();
    let comparisons = (baseline.len() * candidate.len()) as f64;
    let win_rate = wins / comparisons;
    let n = candidate.len() as f64;
    Some(WinStats {
        win_rate,
        comparisons: comparisons as i64,
        paired: false,
        confidence_interval: wilson_interval(win_rate * n, n, Z_95),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(experiment_id: Uuid, run: &str, arm: Arm, score: f64, pair: Option<&str>) -> Sample {
        Sample::new(
            experiment_id,
            run,
            arm,
            score,
            score >= 0.5,
            pair.map(str::to_string),
            Utc::now(),
        )
        .unwrap()
    }

    fn experiment(min_samples: i64) -> Experiment {
        Experiment::new(
            NewExperiment {
                session_id: Uuid::now_v7(),
                proposal_id: Uuid::now_v7(),
                mode: ExperimentMode::Shadow,
                baseline_version_id: Uuid::now_v7(),
                candidate_version_id: Uuid::now_v7(),
                traffic_split: 0.5,
                risk_tier: RiskTier::Low,
                gating_threshold: 0.55,
                min_samples,
            },
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn routing_is_deterministic_and_respects_extremes() {
        let id = Uuid::now_v7();
        for i in 0..50 {
            let run = format!("run-{i}");
            assert_eq!(route_run(id, &run, 0.3), route_run(id, &run, 0.3));
            assert_eq!(route_run(id, &run, 0.0), Arm::Baseline);
            assert_eq!(route_run(id, &run, 1.0), Arm::Candidate);
        }
    }

    #[test]
    fn routing_split_is_roughly_proportional() {
        let id = Uuid::now_v7();
        let candidates = (0..4000)
            .filter(|i| route_run(id, &format!("run-{i}"), 0.1) == Arm::Candidate)
            .count();
        assert!((250..=550).contains(&candidates), "got {candidates}");
    }

    #[test]
    fn metrics_accumulate_incrementally() {
        let mut metrics = ArmMetrics::default();
        metrics.record(1.0, true);
        metrics.record(0.5, false);
        assert_eq!(metrics.sample_count, 2);
        assert!((metrics.avg_score - 0.75).abs() < 1e-9);
        assert!((metrics.success_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn wilson_interval_brackets_point_estimate() {
        let ci = wilson_interval(62.0, 100.0, Z_95);
        assert!(ci.lower < 0.62 && 0.62 < ci.upper);
        assert!((ci.lower - 0.5221).abs() < 1e-3, "lower {}", ci.lower);
        assert!((ci.upper - 0.7091).abs() < 1e-3, "upper {}", ci.upper);
    }

    #[test]
    fn independent_win_rate_counts_ties_as_half() {
        let id = Uuid::now_v7();
        let samples = vec![
            sample(id, "b1", Arm::Baseline, 0.4, None),
            sample(id, "b2", Arm::Baseline, 0.6, None),
            sample(id, "c1", Arm::Candidate, 0.6, None),
        ];
        let stats = win_statistics(&samples).unwrap();
        assert!(!stats.paired);
        assert_eq!(stats.comparisons, 2);
        assert!((stats.win_rate - 0.75).abs() < 1e-9);
    }

    #[test]
    fn paired_samples_compare_per_pair() {
        let id = Uuid::now_v7();
        let samples = vec![
            sample(id, "b1", Arm::Baseline, 0.4, Some("r1")),
            sample(id, "c1", Arm::Candidate, 0.9, Some("r1")),
            sample(id, "b2", Arm::Baseline, 0.8, Some("r2")),
            sample(id, "c2", Arm::Candidate, 0.1, Some("r2")),
            sample(id, "b3", Arm::Baseline, 0.1, Some("r3")),
        ];
        let stats = win_statistics(&samples).unwrap();
        assert!(stats.paired);
        assert_eq!(stats.comparisons, 2);
        assert!((stats.win_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn unpaired_candidates_force_independent_comparison() {
        let mut exp = experiment(30);
        exp.start(Utc::now());
        let mut samples = vec![
            sample(exp.id, "b-pair", Arm::Baseline, 0.1, Some("p1")),
            sample(exp.id, "c-pair", Arm::Candidate, 0.9, Some("p1")),
        ];
        for i in 0..29 {
            samples.push(sample(exp.id, &format!("b{i}"), Arm::Baseline, 0.95, None));
            samples.push(sample(exp.id, &format!("c{i}"), Arm::Candidate, 0.05, None));
        }
        for s in &samples {
            exp.record(s).unwrap();
        }

        let stats = win_statistics(&samples).unwrap();
        assert!(!stats.paired);
        assert_eq!(stats.comparisons, 900);

        let decision = exp.finalize(&samples, Utc::now()).unwrap();
        assert_eq!(decision.result, GatingResult::Failed);
        assert!(exp.win_rate.unwrap() < 0.1);
    }

    #[test]
    fn gate_counts_pairs_not_samples() {
        let mut exp = experiment(10);
        exp.start(Utc::now());
        // Ten candidate samples reusing one pair key make a single comparison.
        let mut samples = Vec::new();
        for i in 0..10 {
            samples.push(sample(exp.id, &format!("b{i}"), Arm::Baseline, 0.1, Some("p1")));
            samples.push(sample(exp.id, &format!("c{i}"), Arm::Candidate, 0.9, Some("p1")));
        }
        for s in &samples {
            exp.record(s).unwrap();
        }
        assert!(exp.has_enough_samples());

        let decision = exp.finalize(&samples, Utc::now()).unwrap();
        assert!((exp.win_rate.unwrap() - 1.0).abs() < 1e-9);
        assert_eq!(decision.result, GatingResult::Failed);
    }

    #[test]
    fn no_candidate_samples_means_no_statistics() {
        let id = Uuid::now_v7();
        let samples = vec![sample(id, "b1", Arm::Baseline, 0.4, None)];
        assert!(win_statistics(&samples).is_none());
    }

    #[test]
    fn finalize_fails_closed_below_minimum_samples() {
        let mut exp = experiment(30);
        exp.start(Utc::now());
        let mut samples = Vec::new();
        for i in 0..5 {
            let c = sample(exp.id, &format!("c{i}"), Arm::Candidate, 1.0, None);
            let b = sample(exp.id, &format!("b{i}"), Arm::Baseline, 0.0, None);
            exp.record(&c).unwrap();
            exp.record(&b).unwrap();
            samples.extend([c, b]);
        }
        let decision = exp.finalize(&samples, Utc::now()).unwrap();
        assert_eq!(decision.result, GatingResult::Failed);
        assert_eq!(exp.gating_result, Some(GatingResult::Failed));
        assert_eq!(exp.status, ExperimentStatus::Completed);
        assert!((exp.win_rate.unwrap() - 1.0).abs() < 1e-9);
        assert!(exp.record(&samples[0]).is_err());
    }

    #[test]
    fn finalize_passes_with_enough_winning_samples() {
        let mut exp = experiment(10);
        exp.start(Utc::now());
        let mut samples = Vec::new();
        for i in 0..40 {
            let key = format!("r{i}");
            let b = sample(exp.id, &format!("b{i}"), Arm::Baseline, 0.5, Some(&key));
            let c = sample(exp.id, &format!("c{i}"), Arm::Candidate, 0.8, Some(&key));
            exp.record(&b).unwrap();
            exp.record(&c).unwrap();
            samples.extend([b, c]);
        }
        let decision = exp.finalize(&samples, Utc::now()).unwrap();
        assert!(decision.passed());
        assert!(decision.auto_eligible);
        assert!(exp.win_rate.unwrap() >= exp.gating_threshold);
    }

    #[test]
    fn sample_rejects_out_of_range_scores() {
        let id = Uuid::now_v7();
        assert!(Sample::new(id, "r", Arm::Candidate, 1.5, true, None, Utc::now()).is_err());
        assert!(Sample::new(id, " ", Arm::Candidate, 0.5, true, None, Utc::now()).is_err());
    }
}
