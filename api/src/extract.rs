//! JSON bodies for the learning routes.
//!
//! `JsonBody<T>` replaces `axum::Json<T>` in handler signatures so a
//! malformed request answers with the `ValidationError` envelope, naming the
//! offending request field in its camelCase wire form.

use axum::{
    Json,
    extract::{FromRequest, Request, rejection::JsonRejection},
};

use crate::error::AppError;

const DATA_ERROR_PREFIX: &str = "Failed to deserialize the JSON body into the target type: ";

pub struct JsonBody<T>(pub T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let route = format!("{} {}", req.method(), req.uri().path());
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(JsonBody(value)),
            Err(rejection) => {
                let problem = BodyProblem::from_rejection(&rejection);
                tracing::debug!(
                    route = %route,
                    field = %problem.field,
                    "rejected learning request body"
                );
                Err(problem.into_error(&route))
            }
        }
    }
}

/// What was wrong with a request body, in envelope terms.
#[derive(Debug, PartialEq)]
struct BodyProblem {
    field: String,
    message: String,
}

impl BodyProblem {
    fn from_rejection(rejection: &JsonRejection) -> Self {
        match rejection {
            JsonRejection::MissingJsonContentType(_) => BodyProblem {
                field: "Content-Type".to_string(),
                message: "Learning endpoints take `application/json` bodies".to_string(),
            },
            JsonRejection::JsonSyntaxError(_) => BodyProblem {
                field: "body".to_string(),
                message: format!("Request body is not valid JSON: {}", rejection.body_text()),
            },
            JsonRejection::JsonDataError(_) => Self::from_data_error(&rejection.body_text()),
            _ => BodyProblem {
                field: "body".to_string(),
                message: format!("Could not read request body: {}", rejection.body_text()),
            },
        }
    }

    /// Data errors read `<path>: <serde message>`, or just the serde message
    /// when the problem sits on the body object itself.
    fn from_data_error(text: &str) -> Self {
        let detail = text.strip_prefix(DATA_ERROR_PREFIX).unwrap_or(text);
        if let Some(field) = quoted_field(detail, "missing field `") {
            return BodyProblem {
                message: format!("`{field}` is required"),
                field,
            };
        }
        if let Some(field) = quoted_field(detail, "unknown field `") {
            return BodyProblem {
                message: format!("`{field}` is not a field of this request"),
                field,
            };
        }
        match detail.split_once(": ") {
            Some((path, reason)) if !path.is_empty() && !path.contains(' ') => BodyProblem {
                field: path.to_string(),
                message: format!("`{path}` has the wrong shape: {reason}"),
            },
            _ => BodyProblem {
                field: "body".to_string(),
                message: format!("Invalid request body: {detail}"),
            },
        }
    }

    fn into_error(self, route: &str) -> AppError {
        AppError::Validation {
            message: self.message,
            field: Some(self.field),
            received: None,
            docs_hint: Some(format!(
                "The body schema for {route} is in /api-doc/openapi.json."
            )),
        }
    }
}

fn quoted_field(detail: &str, marker: &str) -> Option<String> {
    let start = detail.find(marker)? + marker.len();
    let rest = &detail[start..];
    rest.find('`').map(|end| rest[..end].to_string())
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode, header};
    use axum::routing::post;
    use serde::Deserialize;
    use tower::ServiceExt;

    use super::*;

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase", deny_unknown_fields)]
    #[allow(dead_code)]
    struct Pause {
        paused: bool,
        actor_id: Option<String>,
    }

    async fn pause(JsonBody(_): JsonBody<Pause>) -> StatusCode {
        StatusCode::NO_CONTENT
    }

    async fn send(content_type: Option<&str>, body: &str) -> (StatusCode, serde_json::Value) {
        let app = Router::new().route("/api/agents/a1/learning/pause", post(pause));
        let mut request = Request::post("/api/agents/a1/learning/pause");
        if let Some(content_type) = content_type {
            request = request.header(header::CONTENT_TYPE, content_type);
        }
        let response = app
            .oneshot(request.body(Body::from(body.to_string())).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        if bytes.is_empty() {
            return (status, serde_json::Value::Null);
        }
        (status, serde_json::from_slice(&bytes).expect("json body"))
    }

    #[tokio::test]
    async fn unknown_field_names_the_field() {
        let (status, body) = send(
            Some("application/json"),
            r#"{"paused": true, "pausedBy": "ops"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "ValidationError");
        assert_eq!(body["field"], "pausedBy");
        assert_eq!(
            body["docsHint"],
            "The body schema for POST /api/agents/a1/learning/pause is in /api-doc/openapi.json."
        );
    }

    #[tokio::test]
    async fn missing_content_type_points_at_header() {
        let (status, body) = send(None, r#"{"paused": true}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "Content-Type");
    }

    #[tokio::test]
    async fn well_formed_body_reaches_handler() {
        let (status, _) = send(
            Some("application/json"),
            r#"{"paused": false, "actorId": "ops"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[test]
    fn wrong_type_uses_the_path_as_field() {
        let problem = BodyProblem::from_data_error(
            "Failed to deserialize the JSON body into the target type: paused: invalid type: string \"yes\", expected a boolean at line 1 column 16",
        );
        assert_eq!(problem.field, "paused");
        assert!(problem.message.starts_with("`paused` has the wrong shape"));
    }

    #[test]
    fn missing_field_is_required() {
        let problem = BodyProblem::from_data_error(
            "Failed to deserialize the JSON body into the target type: missing field `paused` at line 1 column 2",
        );
        assert_eq!(
            problem,
            BodyProblem {
                field: "paused".to_string(),
                message: "`paused` is required".to_string(),
            }
        );
    }

    #[test]
    fn root_level_type_error_falls_back_to_body() {
        let problem = BodyProblem::from_data_error(
            "invalid type: sequence, expected struct Pause at line 1 column 0",
        );
        assert_eq!(problem.field, "body");
    }
}
