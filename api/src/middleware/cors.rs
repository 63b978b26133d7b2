use axum::http::{HeaderName, HeaderValue, Method};
use tower_http::cors::CorsLayer;

const DEFAULT_ORIGINS: &str = "http://localhost:3000";

/// Build a CORS layer from the `LEARNLOOP_CORS_ORIGINS` env var.
///
/// - Origins: comma-separated list (default: `http://localhost:3000`)
/// - Methods: GET, POST, DELETE, OPTIONS
/// - Headers: Authorization, Content-Type, Last-Event-ID
/// - Max age: 3600s
pub fn build_cors_layer() -> CorsLayer {
    let raw = std::env::var("LEARNLOOP_CORS_ORIGINS").unwrap_or_else(|_| DEFAULT_ORIGINS.to_string());
    layer_for(&parse_origins(&raw))
}

fn parse_origins(raw: &str) -> Vec<HeaderValue> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect()
}

fn layer_for(origins: &[HeaderValue]) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(origins.to_vec())
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            HeaderName::from_static("authorization"),
            HeaderName::from_static("content-type"),
            HeaderName::from_static("last-event-id"),
        ])
        .max_age(std::time::Duration::from_secs(3600))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comma_separated_origins() {
        let origins = parse_origins(" https://dash.example.com, ,http://localhost:5173 ");
        assert_eq!(origins.len(), 2);
        assert_eq!(origins[0], "https://dash.example.com");
        assert_eq!(origins[1], "http://localhost:5173");
    }

    #[test]
    fn drops_invalid_origins() {
        let origins = parse_origins("https://ok.example.com,bad\norigin");
        assert_eq!(origins.len(), 1);
    }
}
