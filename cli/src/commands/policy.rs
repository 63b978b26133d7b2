use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use learnloop_core::policy::PolicyUpdate;
use serde_json::json;

use crate::util::{api_request, exit_error, learning_path};

#[derive(Subcommand)]
pub enum PolicyCommands {
    /// Show the agent's learning policy
    Show,
    /// Update policy fields; omitted fields stay unchanged
    Set(PolicySetArgs),
}

#[derive(Args, Default)]
pub struct PolicySetArgs {
    #[arg(long)]
    pub enabled: Option<bool>,
    #[arg(long)]
    pub auto_promotion: Option<bool>,
    #[arg(long)]
    pub scheduled: Option<bool>,
    #[arg(long)]
    pub threshold: Option<bool>,
    /// Negative runs that trigger a threshold session
    #[arg(long)]
    pub signal_threshold: Option<i64>,
    #[arg(long)]
    pub signal_window_minutes: Option<i64>,
    #[arg(long)]
    pub schedule_interval_minutes: Option<i64>,
    /// Share of experiment traffic routed to the candidate, in [0, 1]
    #[arg(long)]
    pub traffic_split: Option<f64>,
    #[arg(long)]
    pub min_confidence: Option<f64>,
    #[arg(long)]
    pub min_win_rate: Option<f64>,
}

impl PolicySetArgs {
    fn into_update(self) -> PolicyUpdate {
        PolicyUpdate {
            enabled: self.enabled,
            auto_promotion_enabled: self.auto_promotion,
            scheduled_enabled: self.scheduled,
            threshold_enabled: self.threshold,
            signal_threshold: self.signal_threshold,
            signal_window_minutes: self.signal_window_minutes,
            schedule_interval_minutes: self.schedule_interval_minutes,
            traffic_split_candidate: self.traffic_split,
            min_confidence_for_auto: self.min_confidence,
            min_win_rate_for_auto: self.min_win_rate,
        }
    }
}

#[derive(Args)]
pub struct PauseArgs {
    /// Who is pausing
    #[arg(long, env = "LEARNLOOP_ACTOR")]
    pub actor: Option<String>,
    #[arg(long)]
    pub reason: Option<String>,
    /// Resume automatically at this time (RFC3339)
    #[arg(long)]
    pub until: Option<DateTime<Utc>>,
}

pub async fn run(api_url: &str, agent: &str, command: PolicyCommands) -> i32 {
    let path = learning_path(agent, "policy");
    match command {
        PolicyCommands::Show => {
            api_request(api_url, reqwest::Method::GET, &path, None, &[]).await
        }
        PolicyCommands::Set(args) => {
            let update = args.into_update();
            if update == PolicyUpdate::default() {
                exit_error(
                    "No policy fields given",
                    Some("Pass at least one flag, e.g. --auto-promotion true"),
                );
            }
            let body = update_body(&update);
            api_request(api_url, reqwest::Method::POST, &path, Some(body), &[]).await
        }
    }
}

pub async fn pause(api_url: &str, agent: &str, args: PauseArgs) -> i32 {
    api_request(
        api_url,
        reqwest::Method::POST,
        &learning_path(agent, "pause"),
        Some(pause_body(true, args)),
        &[],
    )
    .await
}

pub async fn resume(api_url: &str, agent: &str, actor: Option<String>) -> i32 {
    let args = PauseArgs {
        actor,
        reason: None,
        until: None,
    };
    api_request(
        api_url,
        reqwest::Method::POST,
        &learning_path(agent, "pause"),
        Some(pause_body(false, args)),
        &[],
    )
    .await
}

/// Only the fields that were set, so the request reads like what was typed.
fn update_body(update: &PolicyUpdate) -> serde_json::Value {
    let mut body = serde_json::to_value(update).unwrap_or_else(|_| json!({}));
    if let Some(fields) = body.as_object_mut() {
        fields.retain(|_, v| !v.is_null());
    }
    body
}

fn pause_body(paused: bool, args: PauseArgs) -> serde_json::Value {
    let mut body = json!({ "paused": paused });
    if let Some(actor) = args.actor {
        body["actorId"] = json!(actor);
    }
    if let Some(reason) = args.reason {
        body["reason"] = json!(reason);
    }
    if let Some(until) = args.until {
        body["pausedUntil"] = json!(until.to_rfc3339());
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_body_keeps_only_set_fields() {
        let args = PolicySetArgs {
            auto_promotion: Some(true),
            traffic_split: Some(0.25),
            ..PolicySetArgs::default()
        };
        let body = update_body(&args.into_update());
        assert_eq!(
            body,
            json!({"autoPromotionEnabled": true, "trafficSplitCandidate": 0.25})
        );
    }

    #[test]
    fn resume_body_carries_only_actor() {
        let body = pause_body(
            false,
            PauseArgs {
                actor: Some("ops@example.com".to_string()),
                reason: None,
                until: None,
            },
        );
        assert_eq!(body, json!({"paused": false, "actorId": "ops@example.com"}));
    }
}
