//! Dataset builder: turns a window of historical agent runs into the fixed,
//! content-addressed input of one learning cycle.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::LearningError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallOutcome {
    pub tool: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackSentiment {
    Positive,
    Neutral,
    Negative,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RunFeedback {
    pub sentiment: FeedbackSentiment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// One agent execution as seen by the learning engine. Runs belong to the
/// execution subsystem; datasets only reference them by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: Uuid,
    pub agent_id: Uuid,
    #[serde(default)]
    pub version_id: Option<Uuid>,
    pub status: RunStatus,
    /// Evaluation scores keyed by scorer name, each in [0, 1]
    #[serde(default)]
    pub scores: BTreeMap<String, f64>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallOutcome>,
    #[serde(default)]
    pub feedback: Option<RunFeedback>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    /// Scores restricted to the configured scorers (all scores when none are configured).
    pub fn scored_by<'a>(
        &'a self,
        scorers: &'a BTreeSet<String>,
    ) -> impl Iterator<Item = (&'a String, f64)> + 'a {
        self.scores
            .iter()
            .filter(move |(name, _)| scorers.is_empty() || scorers.contains(*name))
            .map(|(name, score)| (name, *score))
    }

    /// Mean of the run's configured scores, `None` when it has none.
    pub fn aggregate_score(&self, scorers: &BTreeSet<String>) -> Option<f64> {
        let (sum, count) = self
            .scored_by(scorers)
            .fold((0.0, 0usize), |(sum, count), (_, score)| (sum + score, count + 1));
        (count > 0).then(|| sum / count as f64)
    }

    pub fn is_negative_feedback(&self) -> bool {
        matches!(
            self.feedback.as_ref().map(|feedback| feedback.sentiment),
            Some(FeedbackSentiment::Negative)
        )
    }
}

/// What a dataset selects. Serialized into the dataset hash, so any change here
/// yields a different hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SelectionCriteria {
    pub from_date: DateTime<Utc>,
    pub to_date: DateTime<Utc>,
    pub min_runs: usize,
    pub max_runs: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<Uuid>,
    #[serde(default)]
    pub scorers: BTreeSet<String>,
}

impl SelectionCriteria {
    pub fn validate(&self) -> Result<(), LearningError> {
        if self.from_date >= self.to_date {
            return Err(LearningError::validation(
                "fromDate must be earlier than toDate",
                "fromDate",
            ));
        }
        if self.min_runs == 0 {
            return Err(LearningError::validation(
                "minRuns must be at least 1",
                "minRuns",
            ));
        }
        if self.max_runs < self.min_runs {
            return Err(LearningError::validation(
                "maxRuns must be >= minRuns",
                "maxRuns",
            ));
        }
        Ok(())
    }

    fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.from_date && at <= self.to_date
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    pub id: Uuid,
    pub session_id: Uuid,
    pub run_count: i64,
    pub avg_score: Option<f64>,
    pub dataset_hash: String,
    pub from_date: DateTime<Utc>,
    pub to_date: DateTime<Utc>,
    pub selection_criteria: SelectionCriteria,
    /// Sorted ascending
    pub run_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// A dataset plus the run bodies it was built from, held for the duration of
/// one cycle so the detector does not need to re-read runs.
#[derive(Debug, Clone)]
pub struct DatasetSnapshot {
    pub dataset: Dataset,
    pub runs: Vec<RunRecord>,
}

/// Deterministic content hash over the sorted run ids and the selection criteria.
pub fn compute_dataset_hash(run_ids: &[Uuid], criteria: &SelectionCriteria) -> String {
    let mut sorted: Vec<String> = run_ids.iter().map(Uuid::to_string).collect();
    sorted.sort();

    // Going through Value sorts object keys, giving a canonical encoding.
    let canonical_criteria = serde_json::to_value(criteria)
        .map(|value| value.to_string())
        .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(sorted.join("\n").as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical_criteria.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn is_eligible(run: &RunRecord, criteria: &SelectionCriteria) -> bool {
    if run.status != RunStatus::Completed {
        return false;
    }
    let Some(completed_at) = run.completed_at else {
        return false;
    };
    if !criteria.contains(completed_at) {
        return false;
    }
    if let Some(version_id) = criteria.version_id {
        if run.version_id != Some(version_id) {
            return false;
        }
    }
    run.scored_by(&criteria.scorers).next().is_some()
}

pub struct DatasetBuilder {
    criteria: SelectionCriteria,
}

impl DatasetBuilder {
    pub fn new(criteria: SelectionCriteria) -> Result<Self, LearningError> {
        criteria.validate()?;
        Ok(Self { criteria })
    }

    pub fn criteria(&self) -> &SelectionCriteria {
        &self.criteria
    }

    /// Select eligible runs and materialize the dataset for `session_id`.
    ///
    /// When more than `maxRuns` runs qualify, the most recently completed ones
    /// are kept. Fails with `InsufficientData` below `minRuns`.
    pub fn build(
        &self,
        session_id: Uuid,
        runs: Vec<RunRecord>,
        now: DateTime<Utc>,
    ) -> Result<DatasetSnapshot, LearningError> {
        let mut eligible: Vec<RunRecord> = runs
            .into_iter()
            .filter(|run| is_eligible(run, &self.criteria))
            .collect();
        eligible.sort_by_key(|run| run.id);
        eligible.dedup_by_key(|run| run.id);

        if eligible.len() < self.criteria.min_runs {
            return Err(LearningError::InsufficientData {
                run_count: eligible.len(),
                minimum: self.criteria.min_runs,
            });
        }

        eligible.sort_by(|a, b| b.completed_at.cmp(&a.completed_at).then(a.id.cmp(&b.id)));
        eligible.truncate(self.criteria.max_runs);
        eligible.sort_by_key(|run| run.id);

        let run_ids: Vec<Uuid> = eligible.iter().map(|run| run.id).collect();
        let scores: Vec<f64> = eligible
            .iter()
            .filter_map(|run| run.aggregate_score(&self.criteria.scorers))
            .collect();
        let avg_score = (!scores.is_empty()).then(|| scores.iter().sum::<f64>() / scores.len() as f64);

        let dataset = Dataset {
            id: Uuid::now_v7(),
            session_id,
            run_count: run_ids.len() as i64,
            avg_score,
            dataset_hash: compute_dataset_hash(&run_ids, &self.criteria),
            from_date: self.criteria.from_date,
            to_date: self.criteria.to_date,
            selection_criteria: self.criteria.clone(),
            run_ids,
            created_at: now,
        };

        Ok(DatasetSnapshot {
            dataset,
            runs: eligible,
        })
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn run(agent_id: Uuid, scores: &[(&str, f64)], at: DateTime<Utc>) -> RunRecord {
        RunRecord {
            id: Uuid::now_v7(),
            agent_id,
            version_id: None,
            status: RunStatus::Completed,
            scores: scores
                .iter()
                .map(|(name, score)| (name.to_string(), *score))
                .collect(),
            tool_calls: Vec::new(),
            feedback: None,
            completed_at: Some(at),
        }
    }

    pub fn criteria(now: DateTime<Utc>, min_runs: usize) -> SelectionCriteria {
        SelectionCriteria {
            from_date: now - chrono::Duration::days(7),
            to_date: now,
            min_runs,
            max_runs: 500,
            version_id: None,
            scorers: BTreeSet::from(["helpfulness".to_string()]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{criteria, run};
    use super::*;

    #[test]
    fn hash_is_order_independent_and_deterministic() {
        let now = Utc::now();
        let c = criteria(now, 1);
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        assert_eq!(
            compute_dataset_hash(&[a, b], &c),
            compute_dataset_hash(&[b, a], &c)
        );
        let mut other = c.clone();
        other.max_runs = 100;
        assert_ne!(
            compute_dataset_hash(&[a, b], &c),
            compute_dataset_hash(&[a, b], &other)
        );
    }

    #[test]
    fn building_twice_yields_identical_hash() {
        let now = Utc::now();
        let agent = Uuid::now_v7();
        let runs: Vec<RunRecord> = (0..25)
            .map(|i| run(agent, &[("helpfulness", 0.5 + i as f64 / 100.0)], now - chrono::Duration::hours(1)))
            .collect();
        let builder = DatasetBuilder::new(criteria(now, 20)).unwrap();
        let first = builder.build(Uuid::now_v7(), runs.clone(), now).unwrap();
        let mut reversed = runs;
        reversed.reverse();
        let second = builder.build(Uuid::now_v7(), reversed, now).unwrap();
        assert_eq!(first.dataset.dataset_hash, second.dataset.dataset_hash);
        assert_eq!(first.dataset.run_ids, second.dataset.run_ids);
        assert_eq!(first.dataset.run_count, 25);
    }

    #[test]
    fn ineligible_runs_are_skipped() {
        let now = Utc::now();
        let agent = Uuid::now_v7();
        let inside = now - chrono::Duration::hours(2);
        let mut failed = run(agent, &[("helpfulness", 0.9)], inside);
        failed.status = RunStatus::Failed;
        let unscored = run(agent, &[], inside);
        let other_scorer = run(agent, &[("latency", 0.9)], inside);
        let too_old = run(agent, &[("helpfulness", 0.9)], now - chrono::Duration::days(30));
        let good = run(agent, &[("helpfulness", 0.4)], inside);

        let builder = DatasetBuilder::new(criteria(now, 1)).unwrap();
        let snapshot = builder
            .build(
                Uuid::now_v7(),
                vec![failed, unscored, other_scorer, too_old, good.clone()],
                now,
            )
            .unwrap();
        assert_eq!(snapshot.dataset.run_ids, vec![good.id]);
        assert_eq!(snapshot.dataset.avg_score, Some(0.4));
    }

    #[test]
    fn below_minimum_is_insufficient_data() {
        let now = Utc::now();
        let agent = Uuid::now_v7();
        let runs = vec![run(agent, &[("helpfulness", 0.7)], now - chrono::Duration::hours(1))];
        let err = DatasetBuilder::new(criteria(now, 20))
            .unwrap()
            .build(Uuid::now_v7(), runs, now)
            .expect_err("one run is below the minimum");
        assert_eq!(
            err,
            LearningError::InsufficientData {
                run_count: 1,
                minimum: 20
            }
        );
    }

    #[test]
    fn max_runs_keeps_most_recent() {
        let now = Utc::now();
        let agent = Uuid::now_v7();
        let old = run(agent, &[("helpfulness", 0.1)], now - chrono::Duration::hours(5));
        let recent = run(agent, &[("helpfulness", 0.9)], now - chrono::Duration::hours(1));
        let mut c = criteria(now, 1);
        c.max_runs = 1;
        let snapshot = DatasetBuilder::new(c)
            .unwrap()
            .build(Uuid::now_v7(), vec![old, recent.clone()], now)
            .unwrap();
        assert_eq!(snapshot.dataset.run_ids, vec![recent.id]);
    }

    #[test]
    fn invalid_window_is_rejected() {
        let now = Utc::now();
        let mut c = criteria(now, 1);
        c.from_date = now + chrono::Duration::hours(1);
        assert!(matches!(
            DatasetBuilder::new(c),
            Err(LearningError::Validation { .. })
        ));
    }
}
