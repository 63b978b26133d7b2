//! Proposal generation and selection.
//!
//! A proposal is one candidate change to an agent. Its payload is a tagged
//! variant so that each kind carries only the fields it needs and its own
//! invariants (an instructions proposal always has a non-empty diff).

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::LearningError;
use crate::gating::RiskTier;
use crate::signals::{Severity, Signal, SignalType};

pub const HEURISTIC_GENERATOR: &str = "heuristic.v1";

/// Unified-diff style change to the agent's instructions. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(try_from = "String", into = "String")]
pub struct InstructionsDiff(String);

impl InstructionsDiff {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for InstructionsDiff {
    type Error = LearningError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        if raw.trim().is_empty() {
            return Err(LearningError::validation(
                "instructionsDiff must not be empty",
                "instructionsDiff",
            ));
        }
        Ok(Self(raw))
    }
}

impl From<InstructionsDiff> for String {
    fn from(diff: InstructionsDiff) -> Self {
        diff.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ToolAction {
    AddRetry,
    Reconfigure,
    Disable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToolChange {
    pub tool: String,
    pub action: ToolAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MemoryOperation {
    Add,
    Update,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MemoryChange {
    pub operation: MemoryOperation,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModelChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum ProposalChange {
    Instructions(InstructionsDiff),
    Tools(Vec<ToolChange>),
    Memory(Vec<MemoryChange>),
    Model(ModelChange),
}

impl ProposalChange {
    pub fn proposal_type(&self) -> &'static str {
        match self {
            ProposalChange::Instructions(_) => "instructions",
            ProposalChange::Tools(_) => "tools",
            ProposalChange::Memory(_) => "memory",
            ProposalChange::Model(_) => "model",
        }
    }

    /// Instruction edits are low risk; tool reconfiguration and memory edits
    /// are medium; disabling a tool or swapping the model is high.
    pub fn risk_tier(&self) -> RiskTier {
        match self {
            ProposalChange::Instructions(_) => RiskTier::Low,
            ProposalChange::Memory(_) => RiskTier::Medium,
            ProposalChange::Tools(changes) => {
                if changes.iter().any(|change| change.action == ToolAction::Disable) {
                    RiskTier::High
                } else {
                    RiskTier::Medium
                }
            }
            ProposalChange::Model(_) => RiskTier::High,
        }
    }

    pub fn validate(&self) -> Result<(), LearningError> {
        match self {
            ProposalChange::Instructions(_) => Ok(()),
            ProposalChange::Tools(changes) => {
                if changes.is_empty() {
                    return Err(LearningError::validation(
                        "tool proposals need at least one tool change",
                        "toolChanges",
                    ));
                }
                if changes.iter().any(|change| change.tool.trim().is_empty()) {
                    return Err(LearningError::validation(
                        "tool name must not be empty",
                        "toolChanges.tool",
                    ));
                }
                Ok(())
            }
            ProposalChange::Memory(changes) => {
                if changes.is_empty() {
                    return Err(LearningError::validation(
                        "memory proposals need at least one memory change",
                        "memoryChanges",
                    ));
                }
                if changes.iter().any(|change| {
                    change.operation != MemoryOperation::Remove && change.content.is_none()
                }) {
                    return Err(LearningError::validation(
                        "memory add/update requires content",
                        "memoryChanges.content",
                    ));
                }
                Ok(())
            }
            ProposalChange::Model(change) => {
                if change.to.trim().is_empty() {
                    return Err(LearningError::validation(
                        "target model must not be empty",
                        "modelChanges.to",
                    ));
                }
                Ok(())
            }
        }
    }
}

impl ProposalChange {
    /// Candidate agent configuration: `base` with this change applied.
    ///
    /// Config layout: `instructions` (string), `tools` (object keyed by tool),
    /// `memory` (object keyed by memory key), `model` (string).
    pub fn apply_to(&self, base: &serde_json::Value) -> serde_json::Value {
        let mut config = match base {
            serde_json::Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        match self {
            ProposalChange::Instructions(diff) => {
                let current = config
                    .get("instructions")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default();
                let next = if current.is_empty() {
                    diff.as_str().to_string()
                } else {
                    format!("{current}\n{}", diff.as_str())
                };
                config.insert("instructions".to_string(), serde_json::Value::String(next));
            }
            ProposalChange::Tools(changes) => {
                let mut tools = take_object(&mut config, "tools");
                for change in changes {
                    let entry = tools
                        .entry(change.tool.clone())
                        .or_insert_with(|| serde_json::json!({}));
                    if !entry.is_object() {
                        *entry = serde_json::json!({});
                    }
                    if let Some(settings) = entry.as_object_mut() {
                        match change.action {
                            ToolAction::AddRetry => {
                                settings.insert("retry".to_string(), serde_json::json!(true));
                            }
                            ToolAction::Reconfigure => {
                                settings.insert(
                                    "reconfigure".to_string(),
                                    serde_json::json!(change.note.clone().unwrap_or_default()),
                                );
                            }
                            ToolAction::Disable => {
                                settings.insert("enabled".to_string(), serde_json::json!(false));
                            }
                        }
                    }
                }
                config.insert("tools".to_string(), serde_json::Value::Object(tools));
            }
            ProposalChange::Memory(changes) => {
                let mut memory = take_object(&mut config, "memory");
                for change in changes {
                    match (change.operation, &change.content) {
                        (MemoryOperation::Remove, _) => {
                            memory.remove(&change.key);
                        }
                        (_, Some(content)) => {
                            memory.insert(change.key.clone(), serde_json::json!(content));
                        }
                        (_, None) => {}
                    }
                }
                config.insert("memory".to_string(), serde_json::Value::Object(memory));
            }
            ProposalChange::Model(change) => {
                config.insert("model".to_string(), serde_json::json!(change.to));
            }
        }
        serde_json::Value::Object(config)
    }
}

fn take_object(
    config: &mut serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> serde_json::Map<String, serde_json::Value> {
    match config.remove(key) {
        Some(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    }
}

/// Output of a proposal generator before it is attached to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProposalDraft {
    pub title: String,
    pub description: String,
    pub change: ProposalChange,
    pub expected_impact: String,
    pub confidence_score: Option<f64>,
    pub generated_by: String,
    #[serde(default)]
    pub addressed_signal_ids: Vec<Uuid>,
}

impl ProposalDraft {
    pub fn validate(&self) -> Result<(), LearningError> {
        if self.title.trim().is_empty() {
            return Err(LearningError::validation("title must not be empty", "title"));
        }
        if let Some(confidence) = self.confidence_score {
            if !(0.0..=1.0).contains(&confidence) {
                return Err(LearningError::validation(
                    "confidenceScore must be within [0, 1]",
                    "confidenceScore",
                ));
            }
        }
        self.change.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub id: Uuid,
    pub session_id: Uuid,
    pub proposal_type: String,
    pub title: String,
    pub description: String,
    pub change: ProposalChange,
    pub expected_impact: String,
    pub confidence_score: Option<f64>,
    pub generated_by: String,
    pub risk_tier: RiskTier,
    pub addressed_signal_ids: Vec<Uuid>,
    pub candidate_version_id: Option<Uuid>,
    pub is_selected: bool,
    pub created_at: DateTime<Utc>,
}

impl Proposal {
    pub fn from_draft(session_id: Uuid, draft: ProposalDraft, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            session_id,
            proposal_type: draft.change.proposal_type().to_string(),
            risk_tier: draft.change.risk_tier(),
            title: draft.title,
            description: draft.description,
            change: draft.change,
            expected_impact: draft.expected_impact,
            confidence_score: draft.confidence_score,
            generated_by: draft.generated_by,
            addressed_signal_ids: draft.addressed_signal_ids,
            candidate_version_id: None,
            is_selected: false,
            created_at: now,
        }
    }
}

/// Confidence as a function of how much of the detected impact a proposal
/// addresses, how severe the addressed signals are and how often they recur.
pub fn confidence_for(addressed: &[&Signal], all: &[Signal], run_count: i64) -> f64 {
    if addressed.is_empty() || run_count <= 0 {
        return 0.0;
    }
    let total_impact: f64 = all.iter().filter_map(|signal| signal.impact).sum();
    let addressed_impact: f64 = addressed.iter().filter_map(|signal| signal.impact).sum();
    let coverage = if total_impact > 0.0 {
        addressed_impact / total_impact
    } else {
        addressed.len() as f64 / all.len().max(1) as f64
    };
    let severity = addressed
        .iter()
        .map(|signal| signal.severity.map(|s| s.weight()).unwrap_or(0.25))
        .sum::<f64>()
        / addressed.len() as f64;
    let frequency: i64 = addressed.iter().map(|signal| signal.frequency).sum();
    let frequency_score = (frequency as f64 / (run_count as f64 * 0.25)).min(1.0);

    let raw = 0.40 * coverage + 0.35 * severity + 0.25 * frequency_score;
    (raw.clamp(0.0, 1.0) * 10_000.0).round() / 10_000.0
}

/// Deterministic generator used when no model provider is configured. Each
/// signal family maps to one proposal kind, so proposals address disjoint
/// signal subsets.
pub fn generate_heuristic(signals: &[Signal], run_count: i64) -> Vec<ProposalDraft> {
    let mut drafts = Vec::new();

    let low_scores = of_type(signals, SignalType::LowScore);
    if !low_scores.is_empty() {
        let mut diff = String::from("@@ instructions @@\n");
        for signal in &low_scores {
            diff.push_str(&format!(
                "+ Before answering, check the response against the '{}' criterion; recent runs fell short ({}).\n",
                signal.subject, signal.pattern
            ));
        }
        let scorers: BTreeSet<&str> = low_scores.iter().map(|s| s.subject.as_str()).collect();
        if let Ok(diff) = InstructionsDiff::try_from(diff) {
            drafts.push(ProposalDraft {
                title: format!(
                    "Tighten instructions for {}",
                    scorers.into_iter().collect::<Vec<_>>().join(", ")
                ),
                description: "Add explicit self-check guidance for the scorers with recurring low scores."
                    .to_string(),
                change: ProposalChange::Instructions(diff),
                expected_impact: "Raise the share of runs scoring above the cutoff".to_string(),
                confidence_score: Some(confidence_for(&low_scores, signals, run_count)),
                generated_by: HEURISTIC_GENERATOR.to_string(),
                addressed_signal_ids: low_scores.iter().map(|s| s.id).collect(),
            });
        }
    }

    let tool_failures = of_type(signals, SignalType::ToolFailure);
    if !tool_failures.is_empty() {
        let changes: Vec<ToolChange> = tool_failures
            .iter()
            .map(|signal| ToolChange {
                tool: signal.subject.clone(),
                action: if signal.severity == Some(Severity::High) {
                    ToolAction::Reconfigure
                } else {
                    ToolAction::AddRetry
                },
                note: Some(signal.pattern.clone()),
            })
            .collect();
        drafts.push(ProposalDraft {
            title: format!("Harden {} failing tool(s)", changes.len()),
            description: "Reconfigure or add retries to tools with recurring failures.".to_string(),
            change: ProposalChange::Tools(changes),
            expected_impact: "Fewer runs degraded by tool errors".to_string(),
            confidence_score: Some(
                (confidence_for(&tool_failures, signals, run_count) * 0.9 * 10_000.0).round()
                    / 10_000.0,
            ),
            generated_by: HEURISTIC_GENERATOR.to_string(),
            addressed_signal_ids: tool_failures.iter().map(|s| s.id).collect(),
        });
    }

    let feedback = of_type(signals, SignalType::NegativeFeedback);
    if !feedback.is_empty() {
        let changes = feedback
            .iter()
            .map(|signal| MemoryChange {
                operation: MemoryOperation::Add,
                key: format!("lesson:{}", signal.subject),
                content: Some(format!("Users reacted negatively: {}", signal.pattern)),
            })
            .collect();
        drafts.push(ProposalDraft {
            title: "Record lessons from negative feedback".to_string(),
            description: "Store feedback-derived lessons in agent memory.".to_string(),
            change: ProposalChange::Memory(changes),
            expected_impact: "Fewer repeated mistakes users flagged".to_string(),
            confidence_score: Some(
                (confidence_for(&feedback, signals, run_count) * 0.8 * 10_000.0).round()
                    / 10_000.0,
            ),
            generated_by: HEURISTIC_GENERATOR.to_string(),
            addressed_signal_ids: feedback.iter().map(|s| s.id).collect(),
        });
    }

    drafts
}

fn of_type(signals: &[Signal], signal_type: SignalType) -> Vec<&Signal> {
    signals
        .iter()
        .filter(|signal| signal.signal_type == signal_type)
        .collect()
}

/// Pick the proposal to advance: highest confidence at or above `floor`,
/// most recently created on ties. Proposals without a confidence never win.
pub fn select_proposal(proposals: &[Proposal], floor: f64) -> Option<Uuid> {
    proposals
        .iter()
        .filter(|proposal| proposal.confidence_score.is_some_and(|c| c >= floor))
        .max_by(|a, b| {
            let ca = a.confidence_score.unwrap_or(0.0);
            let cb = b.confidence_score.unwrap_or(0.0);
            ca.total_cmp(&cb)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        })
        .map(|proposal| proposal.id)
}

/// Mark exactly one proposal selected. Fails if one already is.
pub fn mark_selected(proposals: &mut [Proposal], selected: Uuid) -> Result<(), LearningError> {
    if proposals.iter().any(|proposal| proposal.is_selected) {
        return Err(LearningError::Internal(
            "a proposal is already selected for this session".to_string(),
        ));
    }
    let proposal = proposals
        .iter_mut()
        .find(|proposal| proposal.id == selected)
        .ok_or_else(|| LearningError::NotFound {
            resource: format!("proposal {selected}"),
        })?;
    proposal.is_selected = true;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::Evidence;

    fn signal(signal_type: SignalType, subject: &str, severity: Severity, frequency: i64, impact: f64) -> Signal {
        Signal {
            id: Uuid::now_v7(),
            session_id: Uuid::nil(),
            signal_type,
            severity: Some(severity),
            subject: subject.to_string(),
            pattern: format!("{subject} issue"),
            frequency,
            impact: Some(impact),
            evidence: Vec::<Evidence>::new(),
            created_at: Utc::now(),
        }
    }

    fn proposal(confidence: Option<f64>, created_at: DateTime<Utc>) -> Proposal {
        let draft = ProposalDraft {
            title: "t".to_string(),
            description: "d".to_string(),
            change: ProposalChange::Instructions(InstructionsDiff::try_from("+ x".to_string()).unwrap()),
            expected_impact: "e".to_string(),
            confidence_score: confidence,
            generated_by: HEURISTIC_GENERATOR.to_string(),
            addressed_signal_ids: Vec::new(),
        };
        Proposal::from_draft(Uuid::nil(), draft, created_at)
    }

    #[test]
    fn apply_to_edits_the_matching_config_section() {
        let base = serde_json::json!({"instructions": "Be helpful.", "model": "small"});
        let diff = ProposalChange::Instructions(InstructionsDiff::try_from("+ Cite sources.".to_string()).unwrap());
        let next = diff.apply_to(&base);
        assert_eq!(next["instructions"], "Be helpful.\n+ Cite sources.");
        assert_eq!(next["model"], "small");

        let tools = ProposalChange::Tools(vec![ToolChange {
            tool: "search".to_string(),
            action: ToolAction::Disable,
            note: None,
        }]);
        assert_eq!(tools.apply_to(&base)["tools"]["search"]["enabled"], false);

        let model = ProposalChange::Model(ModelChange { from: Some("small".into()), to: "large".into() });
        assert_eq!(model.apply_to(&serde_json::Value::Null)["model"], "large");
    }

    #[test]
    fn empty_instructions_diff_is_rejected_at_deserialization() {
        let raw = serde_json::json!({"kind": "instructions", "payload": "   "});
        assert!(serde_json::from_value::<ProposalChange>(raw).is_err());
        let ok = serde_json::json!({"kind": "instructions", "payload": "+ be concise"});
        assert!(serde_json::from_value::<ProposalChange>(ok).is_ok());
    }

    #[test]
    fn risk_tiers_follow_change_kind() {
        let diff = InstructionsDiff::try_from("+ a".to_string()).unwrap();
        assert_eq!(ProposalChange::Instructions(diff).risk_tier(), RiskTier::Low);
        let disable = ProposalChange::Tools(vec![ToolChange {
            tool: "search".to_string(),
            action: ToolAction::Disable,
            note: None,
        }]);
        assert_eq!(disable.risk_tier(), RiskTier::High);
        let model = ProposalChange::Model(ModelChange {
            from: None,
            to: "gpt-x".to_string(),
        });
        assert_eq!(model.risk_tier(), RiskTier::High);
    }

    #[test]
    fn selection_prefers_confidence_then_recency() {
        let t0 = Utc::now();
        let older = proposal(Some(0.8), t0);
        let newer = proposal(Some(0.8), t0 + chrono::Duration::seconds(1));
        let weaker = proposal(Some(0.5), t0 + chrono::Duration::seconds(2));
        let unscored = proposal(None, t0 + chrono::Duration::seconds(3));
        let all = vec![older, newer.clone(), weaker, unscored];
        assert_eq!(select_proposal(&all, 0.3), Some(newer.id));
        // Order of the input does not matter.
        let mut reversed = all.clone();
        reversed.reverse();
        assert_eq!(select_proposal(&reversed, 0.3), Some(newer.id));
    }

    #[test]
    fn nothing_selected_below_floor() {
        let all = vec![proposal(Some(0.2), Utc::now()), proposal(None, Utc::now())];
        assert_eq!(select_proposal(&all, 0.3), None);
    }

    #[test]
    fn mark_selected_flips_exactly_once() {
        let mut all = vec![proposal(Some(0.9), Utc::now()), proposal(Some(0.4), Utc::now())];
        let chosen = all[0].id;
        let other = all[1].id;
        mark_selected(&mut all, chosen).unwrap();
        assert_eq!(all.iter().filter(|p| p.is_selected).count(), 1);
        assert!(mark_selected(&mut all, other).is_err());
    }

    #[test]
    fn heuristic_generator_covers_disjoint_signal_subsets() {
        let signals = vec![
            signal(SignalType::LowScore, "helpfulness", Severity::High, 12, 0.24),
            signal(SignalType::ToolFailure, "search", Severity::Medium, 4, 0.1),
            signal(SignalType::NegativeFeedback, "feedback", Severity::Low, 3, 0.03),
        ];
        let drafts = generate_heuristic(&signals, 50);
        assert_eq!(drafts.len(), 3);
        let mut covered: Vec<Uuid> = drafts
            .iter()
            .flat_map(|d| d.addressed_signal_ids.clone())
            .collect();
        covered.sort();
        covered.dedup();
        assert_eq!(covered.len(), 3);
        for draft in &drafts {
            draft.validate().unwrap();
        }
        let instructions = &drafts[0];
        assert_eq!(instructions.change.proposal_type(), "instructions");
        let best = drafts
            .iter()
            .map(|d| d.confidence_score.unwrap())
            .fold(0.0, f64::max);
        assert_eq!(instructions.confidence_score, Some(best));
    }

    #[test]
    fn no_signals_means_no_proposals() {
        assert!(generate_heuristic(&[], 50).is_empty());
    }

    #[test]
    fn confidence_is_bounded() {
        let signals = vec![signal(SignalType::LowScore, "x", Severity::High, 1_000, 1.0)];
        let refs: Vec<&Signal> = signals.iter().collect();
        let c = confidence_for(&refs, &signals, 10);
        assert!((0.0..=1.0).contains(&c));
        assert_eq!(c, 1.0);
    }
}
