use clap::Args;
use serde_json::json;
use uuid::Uuid;

use crate::util::{api_request, learning_path};

#[derive(Args)]
pub struct SampleArgs {
    #[arg(long)]
    pub experiment_id: Uuid,
    #[arg(long)]
    pub run_id: String,
    /// Omit to let the traffic split decide
    #[arg(long, value_parser = ["baseline", "candidate"])]
    pub arm: Option<String>,
    /// Quality score in [0, 1]
    #[arg(long)]
    pub score: f64,
    #[arg(long)]
    pub success: bool,
    /// Pairs a baseline and a candidate sample for the same input
    #[arg(long)]
    pub pair_key: Option<String>,
}

pub async fn list(api_url: &str, agent: &str, status: Option<String>) -> i32 {
    let query: Vec<(String, String)> = status
        .map(|s| vec![("status".to_string(), s)])
        .unwrap_or_default();
    api_request(
        api_url,
        reqwest::Method::GET,
        &learning_path(agent, "experiments"),
        None,
        &query,
    )
    .await
}

pub async fn metrics(api_url: &str, agent: &str) -> i32 {
    api_request(
        api_url,
        reqwest::Method::GET,
        &learning_path(agent, "metrics"),
        None,
        &[],
    )
    .await
}

pub async fn route(api_url: &str, agent: &str, run_id: &str) -> i32 {
    api_request(
        api_url,
        reqwest::Method::POST,
        &learning_path(agent, "route"),
        Some(json!({ "runId": run_id })),
        &[],
    )
    .await
}

pub async fn sample(api_url: &str, agent: &str, args: SampleArgs) -> i32 {
    api_request(
        api_url,
        reqwest::Method::POST,
        &learning_path(agent, &format!("experiments/{}/samples", args.experiment_id)),
        Some(sample_body(&args)),
        &[],
    )
    .await
}

fn sample_body(args: &SampleArgs) -> serde_json::Value {
    let mut body = json!({
        "runId": args.run_id,
        "score": args.score,
        "success": args.success,
    });
    if let Some(arm) = &args.arm {
        body["arm"] = json!(arm);
    }
    if let Some(pair_key) = &args.pair_key {
        body["pairKey"] = json!(pair_key);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_body_omits_unset_arm() {
        let args = SampleArgs {
            experiment_id: Uuid::nil(),
            run_id: "run-7".to_string(),
            arm: None,
            score: 0.75,
            success: true,
            pair_key: Some("input-3".to_string()),
        };
        assert_eq!(
            sample_body(&args),
            json!({"runId": "run-7", "score": 0.75, "success": true, "pairKey": "input-3"})
        );
    }
}
