use learnloop_core::session::SessionStatus;
use serde_json::json;

pub fn client() -> reqwest::Client {
    reqwest::Client::new()
}

pub fn exit_error(message: &str, docs_hint: Option<&str>) -> ! {
    let mut err = json!({
        "error": "cli_error",
        "message": message
    });
    if let Some(hint) = docs_hint {
        err["docs_hint"] = json!(hint);
    }
    eprintln!("{err:#}");
    std::process::exit(4);
}

/// `/api/agents/{slug}/learning` plus an optional suffix.
pub fn learning_path(agent: &str, suffix: &str) -> String {
    let base = format!("/api/agents/{agent}/learning");
    match suffix.trim_matches('/') {
        "" => base,
        rest => format!("{base}/{rest}"),
    }
}

pub fn build_url(
    api_url: &str,
    path: &str,
    query: &[(String, String)],
) -> Result<reqwest::Url, String> {
    let mut url = reqwest::Url::parse(&format!("{}{path}", api_url.trim_end_matches('/')))
        .map_err(|e| format!("Invalid URL: {api_url}{path}: {e}"))?;
    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (k, v) in query {
            pairs.append_pair(k, v);
        }
    }
    Ok(url)
}

/// Map an HTTP status and response envelope to an exit code.
///
/// Exit codes: 0=success, 1=client error (4xx or `success: false`),
///             2=server error (5xx), 3=connection error, 4=usage error
pub fn exit_code_for(status: u16, body: &serde_json::Value) -> i32 {
    match status {
        200..=299 if body.get("success") == Some(&json!(false)) => 1,
        200..=299 => 0,
        400..=499 => 1,
        _ => 2,
    }
}

/// Execute an API request, print the response, and return the exit code.
pub async fn api_request(
    api_url: &str,
    method: reqwest::Method,
    path: &str,
    body: Option<serde_json::Value>,
    query: &[(String, String)],
) -> i32 {
    match raw_api_request(api_url, method, path, body, query).await {
        Ok((status, resp_body)) => {
            let code = exit_code_for(status, &resp_body);
            if code == 0 {
                println!("{resp_body:#}");
            } else {
                eprintln!("{resp_body:#}");
            }
            code
        }
        Err(RequestError::Usage(message)) => {
            eprintln!("{:#}", json!({"error": "cli_error", "message": message}));
            4
        }
        Err(RequestError::Connection(message)) => {
            eprintln!("{:#}", connection_error(&message));
            3
        }
    }
}

#[derive(Debug)]
pub enum RequestError {
    Usage(String),
    Connection(String),
}

pub fn connection_error(message: &str) -> serde_json::Value {
    json!({
        "error": "connection_error",
        "message": message,
        "docs_hint": "Is the API server running? Check LEARNLOOP_API_URL."
    })
}

/// Execute an API request and return the response (no printing).
pub async fn raw_api_request(
    api_url: &str,
    method: reqwest::Method,
    path: &str,
    body: Option<serde_json::Value>,
    query: &[(String, String)],
) -> Result<(u16, serde_json::Value), RequestError> {
    let url = build_url(api_url, path, query).map_err(RequestError::Usage)?;
    tracing::debug!(%method, %url, "api request");

    let mut req = client().request(method, url);
    if let Some(b) = body {
        req = req.json(&b);
    }

    let resp = req
        .send()
        .await
        .map_err(|e| RequestError::Connection(e.to_string()))?;
    let status = resp.status().as_u16();
    let body = match resp.json().await {
        Ok(v) => v,
        Err(e) => json!({"raw_error": format!("Failed to parse response as JSON: {e}")}),
    };
    tracing::debug!(status, "api response");
    Ok((status, body))
}

/// Parse a `key=value` pair.
pub fn parse_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.trim().to_string())),
        _ => Err(format!("Invalid pair '{raw}', expected key=value")),
    }
}

/// Session status carried by a `session` snapshot or a `transition` event.
pub fn event_status(event: &str, data: &serde_json::Value) -> Option<SessionStatus> {
    let field = match event {
        "session" => "status",
        "transition" => "to",
        _ => return None,
    };
    serde_json::from_value(data.get(field)?.clone()).ok()
}

#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` decoder. Comment lines (keep-alives) and
/// fields other than `event`/`data` are skipped.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.buffer.push_str(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                if let Some(frame) = self.dispatch() {
                    frames.push(frame);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }
        frames
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn learning_path_joins_suffix() {
        assert_eq!(learning_path("demo", ""), "/api/agents/demo/learning");
        assert_eq!(
            learning_path("demo", "/metrics"),
            "/api/agents/demo/learning/metrics"
        );
    }

    #[test]
    fn build_url_appends_query_and_trims_slash() {
        let url = build_url(
            "http://localhost:3000/",
            "/api/agents/demo/learning/experiments",
            &[("status".to_string(), "all".to_string())],
        )
        .expect("url");
        assert_eq!(
            url.as_str(),
            "http://localhost:3000/api/agents/demo/learning/experiments?status=all"
        );
        assert!(build_url("not a url", "/health", &[]).is_err());
    }

    #[test]
    fn envelope_failure_is_a_client_error() {
        assert_eq!(exit_code_for(200, &json!({"success": true})), 0);
        assert_eq!(exit_code_for(200, &json!({"status": "ok"})), 0);
        assert_eq!(exit_code_for(200, &json!({"success": false})), 1);
        assert_eq!(exit_code_for(409, &json!({"success": false})), 1);
        assert_eq!(exit_code_for(503, &json!({})), 2);
    }

    #[test]
    fn parse_pair_requires_key() {
        assert_eq!(
            parse_pair("signalThreshold=5"),
            Ok(("signalThreshold".to_string(), "5".to_string()))
        );
        assert!(parse_pair("=5").is_err());
        assert!(parse_pair("novalue").is_err());
    }

    #[test]
    fn sse_decoder_handles_split_chunks_and_keepalives() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push("event: session\ndata: {\"sta").is_empty());
        let frames = decoder.push("tus\":\"TESTING\"}\n\n:\n\nevent: transition\n");
        assert_eq!(
            frames,
            vec![SseFrame {
                event: "session".to_string(),
                data: "{\"status\":\"TESTING\"}".to_string(),
            }]
        );
        let frames = decoder.push("data: {\"to\":\"PROMOTED\"}\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "transition");
    }

    #[test]
    fn event_status_reads_the_right_field() {
        assert_eq!(
            event_status("session", &json!({"status": "TESTING"})),
            Some(SessionStatus::Testing)
        );
        assert_eq!(
            event_status("transition", &json!({"from": "TESTING", "to": "FAILED"})),
            Some(SessionStatus::Failed)
        );
        assert_eq!(event_status("message", &json!({"status": "TESTING"})), None);
    }
}
