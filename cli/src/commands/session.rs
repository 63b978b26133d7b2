use std::time::Duration;

use clap::Subcommand;
use serde_json::json;
use uuid::Uuid;

use crate::util::{
    RequestError, SseDecoder, api_request, build_url, client, connection_error, event_status,
    learning_path, raw_api_request,
};

const POLL_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Subcommand)]
pub enum SessionCommands {
    /// List sessions, newest first
    List,
    /// Show a session with its dataset, signals, proposals, experiments and approval
    Show {
        session_id: Uuid,
    },
    /// Start a manual learning session
    Start {
        /// Why the session is being started (1-500 characters)
        #[arg(long)]
        reason: String,
    },
    /// Cancel a session (no-op when it already finished)
    Cancel {
        session_id: Uuid,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Approve the candidate of a session awaiting approval
    Approve {
        session_id: Uuid,
        /// Approver identity
        #[arg(long, env = "LEARNLOOP_ACTOR")]
        by: String,
        #[arg(long)]
        rationale: Option<String>,
    },
    /// Reject the candidate of a session awaiting approval
    Reject {
        session_id: Uuid,
        /// Reviewer identity
        #[arg(long, env = "LEARNLOOP_ACTOR")]
        by: String,
        #[arg(long)]
        rationale: Option<String>,
    },
    /// Follow a session until it reaches a terminal status
    Watch {
        session_id: Uuid,
        /// Poll every 3 seconds instead of streaming events
        #[arg(long)]
        poll: bool,
    },
}

pub async fn run(api_url: &str, agent: &str, command: SessionCommands) -> i32 {
    match command {
        SessionCommands::List => {
            api_request(
                api_url,
                reqwest::Method::GET,
                &learning_path(agent, ""),
                None,
                &[],
            )
            .await
        }
        SessionCommands::Show { session_id } => {
            api_request(
                api_url,
                reqwest::Method::GET,
                &learning_path(agent, &session_id.to_string()),
                None,
                &[],
            )
            .await
        }
        SessionCommands::Start { reason } => {
            api_request(
                api_url,
                reqwest::Method::POST,
                &learning_path(agent, ""),
                Some(json!({ "triggerReason": reason })),
                &[],
            )
            .await
        }
        SessionCommands::Cancel { session_id, reason } => {
            let body = reason.map(|r| json!({ "reason": r }));
            api_request(
                api_url,
                reqwest::Method::DELETE,
                &learning_path(agent, &session_id.to_string()),
                body,
                &[],
            )
            .await
        }
        SessionCommands::Approve {
            session_id,
            by,
            rationale,
        } => {
            let mut body = json!({ "approvedBy": by });
            if let Some(r) = rationale {
                body["rationale"] = json!(r);
            }
            api_request(
                api_url,
                reqwest::Method::POST,
                &learning_path(agent, &format!("{session_id}/approve")),
                Some(body),
                &[],
            )
            .await
        }
        SessionCommands::Reject {
            session_id,
            by,
            rationale,
        } => {
            let mut body = json!({ "rejectedBy": by });
            if let Some(r) = rationale {
                body["rationale"] = json!(r);
            }
            api_request(
                api_url,
                reqwest::Method::POST,
                &learning_path(agent, &format!("{session_id}/reject")),
                Some(body),
                &[],
            )
            .await
        }
        SessionCommands::Watch { session_id, poll } => {
            if poll {
                watch_poll(api_url, agent, session_id).await
            } else {
                watch_stream(api_url, agent, session_id).await
            }
        }
    }
}

/// Print one JSON line per event from the SSE endpoint.
async fn watch_stream(api_url: &str, agent: &str, session_id: Uuid) -> i32 {
    let path = learning_path(agent, &format!("{session_id}/events"));
    let url = match build_url(api_url, &path, &[]) {
        Ok(url) => url,
        Err(message) => {
            eprintln!("{:#}", json!({"error": "cli_error", "message": message}));
            return 4;
        }
    };

    let mut resp = match client()
        .get(url)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send()
        .await
    {
        Ok(resp) => resp,
        Err(e) => {
            eprintln!("{:#}", connection_error(&e.to_string()));
            return 3;
        }
    };

    let status = resp.status();
    if !status.is_success() {
        let body: serde_json::Value = resp.json().await.unwrap_or(json!({}));
        eprintln!("{body:#}");
        return if status.is_client_error() { 1 } else { 2 };
    }

    let mut decoder = SseDecoder::default();
    loop {
        let chunk = match resp.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => return 0,
            Err(e) => {
                eprintln!("{:#}", connection_error(&e.to_string()));
                return 3;
            }
        };
        for frame in decoder.push(&String::from_utf8_lossy(&chunk)) {
            let data: serde_json::Value = match serde_json::from_str(&frame.data) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, event = %frame.event, "skipping undecodable event");
                    continue;
                }
            };
            println!("{}", json!({ "event": frame.event, "data": data }));
            if event_status(&frame.event, &data).is_some_and(|s| s.is_terminal()) {
                return 0;
            }
        }
    }
}

/// Print the session whenever its status changes.
async fn watch_poll(api_url: &str, agent: &str, session_id: Uuid) -> i32 {
    let path = learning_path(agent, &session_id.to_string());
    let mut last = None;
    loop {
        let (status, body) =
            match raw_api_request(api_url, reqwest::Method::GET, &path, None, &[]).await {
                Ok(resp) => resp,
                Err(RequestError::Usage(message)) => {
                    eprintln!("{:#}", json!({"error": "cli_error", "message": message}));
                    return 4;
                }
                Err(RequestError::Connection(message)) => {
                    eprintln!("{:#}", connection_error(&message));
                    return 3;
                }
            };
        if !(200..300).contains(&status) {
            eprintln!("{body:#}");
            return if status < 500 { 1 } else { 2 };
        }

        let session = &body["session"];
        let current = event_status("session", session);
        if current != last {
            println!("{}", json!({ "event": "session", "data": session }));
            last = current;
        }
        if current.is_some_and(|s| s.is_terminal()) {
            return 0;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
