use std::collections::BTreeSet;
use std::time::Duration;

use learnloop_core::session::SessionStatus;

/// Bounded retry for calls to external dependencies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): base, 2x base, 4x base, ...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Tunables for the learning engine, read from `LEARNLOOP_*` variables.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub min_dataset_runs: usize,
    pub max_dataset_runs: usize,
    pub lookback: Duration,
    pub scorers: BTreeSet<String>,
    pub proposal_confidence_floor: f64,
    pub gating_threshold: f64,
    pub min_samples_per_arm: i64,
    pub sample_window: Duration,
    pub collecting_timeout: Duration,
    pub analyzing_timeout: Duration,
    pub proposing_timeout: Duration,
    pub testing_timeout: Duration,
    pub collect_retry_interval: Duration,
    pub runner_poll_interval: Duration,
    pub retry: RetryPolicy,
    pub scheduler_tick: Duration,
    pub max_evidence: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_dataset_runs: 20,
            max_dataset_runs: 500,
            lookback: Duration::from_secs(168 * 3600),
            scorers: BTreeSet::new(),
            proposal_confidence_floor: 0.3,
            gating_threshold: 0.55,
            min_samples_per_arm: 30,
            sample_window: Duration::from_secs(30 * 60),
            collecting_timeout: Duration::from_secs(10 * 60),
            analyzing_timeout: Duration::from_secs(5 * 60),
            proposing_timeout: Duration::from_secs(5 * 60),
            testing_timeout: Duration::from_secs(2 * 3600),
            collect_retry_interval: Duration::from_secs(30),
            runner_poll_interval: Duration::from_secs(5),
            retry: RetryPolicy {
                attempts: 3,
                base_delay: Duration::from_millis(500),
            },
            scheduler_tick: Duration::from_secs(60),
            max_evidence: 10,
        }
    }
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable engine setting");
            None
        }
    }
}

fn unit(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: f64) -> f64 {
    match parsed::<f64>(lookup, key) {
        Some(v) if (0.0..=1.0).contains(&v) => v,
        Some(v) => {
            tracing::warn!(key, value = v, "engine setting outside [0, 1], using default");
            default
        }
        None => default,
    }
}

fn secs(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    match parsed::<u64>(lookup, key) {
        Some(0) | None => default,
        Some(v) => Duration::from_secs(v),
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let min_dataset_runs = parsed::<usize>(&lookup, "LEARNLOOP_MIN_DATASET_RUNS")
            .filter(|v| *v > 0)
            .unwrap_or(d.min_dataset_runs);
        let max_dataset_runs = parsed::<usize>(&lookup, "LEARNLOOP_MAX_DATASET_RUNS")
            .filter(|v| *v >= min_dataset_runs)
            .unwrap_or(d.max_dataset_runs.max(min_dataset_runs));
        let scorers = lookup("LEARNLOOP_SCORERS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let lookback_hours = parsed::<u64>(&lookup, "LEARNLOOP_LOOKBACK_HOURS")
            .filter(|v| *v > 0)
            .map(|h| Duration::from_secs(h * 3600));

        Self {
            min_dataset_runs,
            max_dataset_runs,
            lookback: lookback_hours.unwrap_or(d.lookback),
            scorers,
            proposal_confidence_floor: unit(
                &lookup,
                "LEARNLOOP_PROPOSAL_CONFIDENCE_FLOOR",
                d.proposal_confidence_floor,
            ),
            gating_threshold: unit(&lookup, "LEARNLOOP_GATING_THRESHOLD", d.gating_threshold),
            min_samples_per_arm: parsed::<i64>(&lookup, "LEARNLOOP_MIN_SAMPLES_PER_ARM")
                .filter(|v| *v > 0)
                .unwrap_or(d.min_samples_per_arm),
            sample_window: secs(&lookup, "LEARNLOOP_SAMPLE_WINDOW_SECS", d.sample_window),
            collecting_timeout: secs(&lookup, "LEARNLOOP_COLLECTING_TIMEOUT_SECS", d.collecting_timeout),
            analyzing_timeout: secs(&lookup, "LEARNLOOP_ANALYZING_TIMEOUT_SECS", d.analyzing_timeout),
            proposing_timeout: secs(&lookup, "LEARNLOOP_PROPOSING_TIMEOUT_SECS", d.proposing_timeout),
            testing_timeout: secs(&lookup, "LEARNLOOP_TESTING_TIMEOUT_SECS", d.testing_timeout),
            collect_retry_interval: secs(
                &lookup,
                "LEARNLOOP_COLLECT_RETRY_SECS",
                d.collect_retry_interval,
            ),
            runner_poll_interval: parsed::<u64>(&lookup, "LEARNLOOP_RUNNER_POLL_MS")
                .filter(|v| *v > 0)
                .map(Duration::from_millis)
                .unwrap_or(d.runner_poll_interval),
            retry: RetryPolicy {
                attempts: parsed::<u32>(&lookup, "LEARNLOOP_RETRY_ATTEMPTS")
                    .filter(|v| *v > 0)
                    .unwrap_or(d.retry.attempts),
                base_delay: parsed::<u64>(&lookup, "LEARNLOOP_RETRY_BASE_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(d.retry.base_delay),
            },
            scheduler_tick: secs(&lookup, "LEARNLOOP_SCHEDULER_TICK_SECS", d.scheduler_tick),
            max_evidence: parsed::<usize>(&lookup, "LEARNLOOP_MAX_EVIDENCE")
                .filter(|v| *v > 0)
                .unwrap_or(d.max_evidence),
        }
    }

    /// Dwell budget for a working stage. Stages that wait on a decision have none.
    pub fn stage_timeout(&self, status: SessionStatus) -> Option<Duration> {
        match status {
            SessionStatus::Collecting => Some(self.collecting_timeout),
            SessionStatus::Analyzing => Some(self.analyzing_timeout),
            SessionStatus::Proposing => Some(self.proposing_timeout),
            SessionStatus::Testing => Some(self.testing_timeout),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        assert_eq!(EngineConfig::from_lookup(lookup(&[])), EngineConfig::default());
    }

    #[test]
    fn reads_overrides_and_ignores_garbage() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("LEARNLOOP_MIN_DATASET_RUNS", "50"),
            ("LEARNLOOP_GATING_THRESHOLD", "1.7"),
            ("LEARNLOOP_PROPOSAL_CONFIDENCE_FLOOR", "0.5"),
            ("LEARNLOOP_TESTING_TIMEOUT_SECS", "abc"),
            ("LEARNLOOP_SCORERS", "helpfulness, accuracy,,"),
        ]));
        assert_eq!(config.min_dataset_runs, 50);
        assert_eq!(config.gating_threshold, 0.55);
        assert_eq!(config.proposal_confidence_floor, 0.5);
        assert_eq!(config.testing_timeout, Duration::from_secs(7200));
        assert_eq!(config.scorers.len(), 2);
        assert!(config.scorers.contains("accuracy"));
    }

    #[test]
    fn max_runs_never_below_min_runs() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("LEARNLOOP_MIN_DATASET_RUNS", "800"),
            ("LEARNLOOP_MAX_DATASET_RUNS", "100"),
        ]));
        assert_eq!(config.max_dataset_runs, 800);
    }

    #[test]
    fn retry_delay_doubles() {
        let retry = EngineConfig::default().retry;
        assert_eq!(retry.delay_for(1), Duration::from_millis(500));
        assert_eq!(retry.delay_for(3), Duration::from_millis(2000));
    }

    #[test]
    fn decision_stages_have_no_timeout() {
        let config = EngineConfig::default();
        assert_eq!(config.stage_timeout(SessionStatus::AwaitingApproval), None);
        assert_eq!(
            config.stage_timeout(SessionStatus::Analyzing),
            Some(Duration::from_secs(300))
        );
    }
}
