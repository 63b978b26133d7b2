//! Gating: the pass/fail decision applied to an experiment before promotion.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub const INSUFFICIENT_SAMPLES_REASON_CODE: &str = "insufficient_samples";
pub const WIN_RATE_BELOW_THRESHOLD_REASON_CODE: &str = "win_rate_below_threshold";
pub const RISK_TIER_NOT_LOW_REASON_CODE: &str = "risk_tier_not_low";
pub const LOWER_BOUND_BELOW_THRESHOLD_REASON_CODE: &str = "ci_lower_bound_below_threshold";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

impl RiskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::Low => "LOW",
            RiskTier::Medium => "MEDIUM",
            RiskTier::High => "HIGH",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "LOW" => Some(RiskTier::Low),
            "MEDIUM" => Some(RiskTier::Medium),
            "HIGH" => Some(RiskTier::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum GatingResult {
    Passed,
    Failed,
}

impl GatingResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatingResult::Passed => "passed",
            GatingResult::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "passed" => Some(GatingResult::Passed),
            "failed" => Some(GatingResult::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GateDecision {
    pub result: GatingResult,
    pub auto_eligible: bool,
    pub reason_codes: Vec<String>,
}

impl GateDecision {
    pub fn passed(&self) -> bool {
        self.result == GatingResult::Passed
    }
}

/// Pure gate: pass iff the point estimate reaches the threshold. Auto-promotion
/// additionally needs a LOW risk tier and the interval floor at or above the
/// threshold.
pub fn evaluate_gate(
    win_rate: f64,
    interval: &ConfidenceInterval,
    threshold: f64,
    risk_tier: RiskTier,
) -> GateDecision {
    let mut reason_codes = Vec::new();
    let passed = win_rate >= threshold;
    if !passed {
        reason_codes.push(WIN_RATE_BELOW_THRESHOLD_REASON_CODE.to_string());
    }
    if risk_tier != RiskTier::Low {
        reason_codes.push(RISK_TIER_NOT_LOW_REASON_CODE.to_string());
    }
    if interval.lower < threshold {
        reason_codes.push(LOWER_BOUND_BELOW_THRESHOLD_REASON_CODE.to_string());
    }

    GateDecision {
        result: if passed {
            GatingResult::Passed
        } else {
            GatingResult::Failed
        },
        auto_eligible: passed && risk_tier == RiskTier::Low && interval.lower >= threshold,
        reason_codes,
    }
}

/// Gate with the sample-size precondition. Too few candidate samples, or no
/// measurable win rate at all, fails closed.
pub fn gate_with_samples(
    win_rate: Option<f64>,
    interval: Option<&ConfidenceInterval>,
    threshold: f64,
    risk_tier: RiskTier,
    candidate_samples: i64,
    min_samples: i64,
) -> GateDecision {
    match (win_rate, interval) {
        (Some(win_rate), Some(interval)) if candidate_samples >= min_samples => {
            evaluate_gate(win_rate, interval, threshold, risk_tier)
        }
        _ => GateDecision {
            result: GatingResult::Failed,
            auto_eligible: false,
            reason_codes: vec![INSUFFICIENT_SAMPLES_REASON_CODE.to_string()],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_on_point_estimate_but_not_auto_eligible_below_interval_floor() {
        let interval = ConfidenceInterval {
            lower: 0.51,
            upper: 0.73,
        };
        let decision = evaluate_gate(0.62, &interval, 0.55, RiskTier::Low);
        assert_eq!(decision.result, GatingResult::Passed);
        assert!(!decision.auto_eligible);
        assert!(
            decision
                .reason_codes
                .contains(&LOWER_BOUND_BELOW_THRESHOLD_REASON_CODE.to_string())
        );
    }

    #[test]
    fn auto_eligible_requires_low_risk() {
        let interval = ConfidenceInterval {
            lower: 0.60,
            upper: 0.80,
        };
        assert!(evaluate_gate(0.7, &interval, 0.55, RiskTier::Low).auto_eligible);
        let medium = evaluate_gate(0.7, &interval, 0.55, RiskTier::Medium);
        assert!(medium.passed());
        assert!(!medium.auto_eligible);
    }

    #[test]
    fn below_threshold_fails() {
        let interval = ConfidenceInterval {
            lower: 0.40,
            upper: 0.60,
        };
        let decision = evaluate_gate(0.5, &interval, 0.55, RiskTier::Low);
        assert_eq!(decision.result, GatingResult::Failed);
        assert!(!decision.auto_eligible);
    }

    #[test]
    fn too_few_samples_fails_regardless_of_win_rate() {
        let interval = ConfidenceInterval {
            lower: 0.9,
            upper: 1.0,
        };
        let decision = gate_with_samples(Some(1.0), Some(&interval), 0.55, RiskTier::Low, 5, 30);
        assert_eq!(decision.result, GatingResult::Failed);
        assert_eq!(decision.reason_codes, vec![INSUFFICIENT_SAMPLES_REASON_CODE]);
        let missing = gate_with_samples(None, None, 0.55, RiskTier::Low, 100, 30);
        assert_eq!(missing.result, GatingResult::Failed);
    }
}
