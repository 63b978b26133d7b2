//! Signal detector: scans a dataset for recurring quality issues.
//!
//! Detection is a pure function of (runs, scorer config, thresholds). Output
//! order and evidence selection are fully determined by the input so a retried
//! ANALYZING stage produces the same signal set.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::dataset::{DatasetSnapshot, RunRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    LowScore,
    ToolFailure,
    NegativeFeedback,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::LowScore => "low_score",
            SignalType::ToolFailure => "tool_failure",
            SignalType::NegativeFeedback => "negative_feedback",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "low_score" => Some(SignalType::LowScore),
            "tool_failure" => Some(SignalType::ToolFailure),
            "negative_feedback" => Some(SignalType::NegativeFeedback),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn weight(&self) -> f64 {
        match self {
            Severity::Low => 0.5,
            Severity::Medium => 0.75,
            Severity::High => 1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Evidence {
    pub run_id: Uuid,
    pub scores: BTreeMap<String, f64>,
}

/// A detected issue before it is attached to a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalDraft {
    pub signal_type: SignalType,
    pub severity: Option<Severity>,
    /// Scorer or tool the signal is about ("feedback" for feedback signals)
    pub subject: String,
    pub pattern: String,
    pub frequency: i64,
    pub impact: Option<f64>,
    pub evidence: Vec<Evidence>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub id: Uuid,
    pub session_id: Uuid,
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    pub severity: Option<Severity>,
    pub subject: String,
    pub pattern: String,
    pub frequency: i64,
    pub impact: Option<f64>,
    pub evidence: Vec<Evidence>,
    pub created_at: DateTime<Utc>,
}

impl Signal {
    pub fn from_draft(session_id: Uuid, draft: SignalDraft, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            session_id,
            signal_type: draft.signal_type,
            severity: draft.severity,
            subject: draft.subject,
            pattern: draft.pattern,
            frequency: draft.frequency,
            impact: draft.impact,
            evidence: draft.evidence,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// A run scoring below this on a scorer counts toward a low_score signal
    pub score_cutoff: f64,
    /// Affected-run ratio above which a signal is high severity
    pub high_ratio: f64,
    pub medium_ratio: f64,
    /// Minimum affected-run ratio for a signal to be emitted at all
    pub low_ratio: f64,
    pub min_frequency: usize,
    pub max_evidence: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            score_cutoff: 0.6,
            high_ratio: 0.20,
            medium_ratio: 0.10,
            low_ratio: 0.05,
            min_frequency: 2,
            max_evidence: 10,
        }
    }
}

impl DetectorConfig {
    fn severity_for(&self, ratio: f64) -> Option<Severity> {
        if ratio > self.high_ratio {
            Some(Severity::High)
        } else if ratio > self.medium_ratio {
            Some(Severity::Medium)
        } else if ratio >= self.low_ratio {
            Some(Severity::Low)
        } else {
            None
        }
    }
}

pub struct SignalDetector {
    config: DetectorConfig,
}

impl SignalDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    pub fn detect(&self, snapshot: &DatasetSnapshot, scorers: &BTreeSet<String>) -> Vec<SignalDraft> {
        let runs = &snapshot.runs;
        if runs.is_empty() {
            return Vec::new();
        }

        let mut drafts = Vec::new();
        drafts.extend(self.low_score_signals(runs, scorers));
        drafts.extend(self.tool_failure_signals(runs, scorers));
        drafts.extend(self.negative_feedback_signal(runs, scorers));
        drafts.sort_by(compare_drafts);
        drafts
    }

    fn low_score_signals(&self, runs: &[RunRecord], scorers: &BTreeSet<String>) -> Vec<SignalDraft> {
        let mut by_scorer: BTreeMap<&str, Vec<(f64, &RunRecord)>> = BTreeMap::new();
        let mut scored_runs: BTreeMap<&str, usize> = BTreeMap::new();
        for run in runs {
            for (name, score) in run.scored_by(scorers) {
                *scored_runs.entry(name.as_str()).or_default() += 1;
                if score < self.config.score_cutoff {
                    by_scorer
                        .entry(name.as_str())
                        .or_default()
                        .push((self.config.score_cutoff - score, run));
                }
            }
        }

        by_scorer
            .into_iter()
            .filter_map(|(scorer, affected)| {
                let total = scored_runs.get(scorer).copied().unwrap_or(0);
                let pattern = format!(
                    "{scorer} scored below {:.2} in {} of {} runs ({:.1}%)",
                    self.config.score_cutoff,
                    affected.len(),
                    total,
                    pct(affected.len(), total)
                );
                self.draft(SignalType::LowScore, scorer, pattern, affected, total, scorers)
            })
            .collect()
    }

    fn tool_failure_signals(&self, runs: &[RunRecord], scorers: &BTreeSet<String>) -> Vec<SignalDraft> {
        let mut invoked: BTreeMap<&str, usize> = BTreeMap::new();
        let mut failing: BTreeMap<&str, Vec<(f64, &RunRecord)>> = BTreeMap::new();
        for run in runs {
            let mut per_tool: BTreeMap<&str, usize> = BTreeMap::new();
            for call in &run.tool_calls {
                let failures = per_tool.entry(call.tool.as_str()).or_default();
                if !call.success {
                    *failures += 1;
                }
            }
            for (tool, failures) in per_tool {
                *invoked.entry(tool).or_default() += 1;
                if failures > 0 {
                    failing.entry(tool).or_default().push((failures as f64, run));
                }
            }
        }

        failing
            .into_iter()
            .filter_map(|(tool, affected)| {
                let total = invoked.get(tool).copied().unwrap_or(0);
                let pattern = format!(
                    "tool '{tool}' failed in {} of {} runs that used it ({:.1}%)",
                    affected.len(),
                    total,
                    pct(affected.len(), total)
                );
                self.draft(SignalType::ToolFailure, tool, pattern, affected, total, scorers)
            })
            .collect()
    }

    fn negative_feedback_signal(&self, runs: &[RunRecord], scorers: &BTreeSet<String>) -> Option<SignalDraft> {
        let affected: Vec<(f64, &RunRecord)> = runs
            .iter()
            .filter(|run| run.is_negative_feedback())
            .map(|run| (1.0 - run.aggregate_score(scorers).unwrap_or(0.0), run))
            .collect();
        let pattern = format!(
            "negative user feedback on {} of {} runs ({:.1}%)",
            affected.len(),
            runs.len(),
            pct(affected.len(), runs.len())
        );
        self.draft(
            SignalType::NegativeFeedback,
            "feedback",
            pattern,
            affected,
            runs.len(),
            scorers,
        )
    }

    fn draft(
        &self,
        signal_type: SignalType,
        subject: &str,
        pattern: String,
        mut affected: Vec<(f64, &RunRecord)>,
        total: usize,
        scorers: &BTreeSet<String>,
    ) -> Option<SignalDraft> {
        if total == 0 || affected.len() < self.config.min_frequency {
            return None;
        }
        let ratio = affected.len() as f64 / total as f64;
        let severity = self.config.severity_for(ratio)?;

        // Largest deviation first; run id breaks ties so evidence is stable.
        affected.sort_by(|(da, ra), (db, rb)| db.total_cmp(da).then(ra.id.cmp(&rb.id)));
        let evidence = affected
            .iter()
            .take(self.config.max_evidence)
            .map(|(_, run)| Evidence {
                run_id: run.id,
                scores: run
                    .scored_by(scorers)
                    .map(|(name, score)| (name.clone(), score))
                    .collect(),
            })
            .collect();

        Some(SignalDraft {
            signal_type,
            severity: Some(severity),
            subject: subject.to_string(),
            pattern,
            frequency: affected.len() as i64,
            impact: Some((ratio * severity.weight()).clamp(0.0, 1.0)),
            evidence,
        })
    }
}

fn pct(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

/// Highest impact first, then severity, type and subject.
pub fn compare_drafts(a: &SignalDraft, b: &SignalDraft) -> Ordering {
    let impact_a = a.impact.unwrap_or(0.0);
    let impact_b = b.impact.unwrap_or(0.0);
    impact_b
        .total_cmp(&impact_a)
        .then(b.severity.cmp(&a.severity))
        .then(a.signal_type.cmp(&b.signal_type))
        .then(a.subject.cmp(&b.subject))
}

/// Order persisted signals the same way the detector emitted them.
pub fn sort_by_impact(signals: &mut [Signal]) {
    signals.sort_by(|a, b| {
        b.impact
            .unwrap_or(0.0)
            .total_cmp(&a.impact.unwrap_or(0.0))
            .then(b.severity.cmp(&a.severity))
            .then(a.signal_type.cmp(&b.signal_type))
            .then(a.subject.cmp(&b.subject))
    });
}
