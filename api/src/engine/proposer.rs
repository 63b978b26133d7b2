use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use learnloop_core::error::LearningError;
use learnloop_core::proposals::{HEURISTIC_GENERATOR, ProposalDraft, generate_heuristic};
use learnloop_core::signals::Signal;
use serde::{Deserialize, Serialize};

use crate::config::RetryPolicy;

/// Source of proposal drafts for a set of signals, highest impact first.
#[async_trait]
pub trait ProposalModel: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(
        &self,
        signals: &[Signal],
        run_count: i64,
    ) -> Result<Vec<ProposalDraft>, LearningError>;
}

/// Deterministic rule-based generator. The default.
pub struct HeuristicModel;

#[async_trait]
impl ProposalModel for HeuristicModel {
    fn name(&self) -> &str {
        HEURISTIC_GENERATOR
    }

    async fn generate(
        &self,
        signals: &[Signal],
        run_count: i64,
    ) -> Result<Vec<ProposalDraft>, LearningError> {
        Ok(generate_heuristic(signals, run_count))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ModelRequest<'a> {
    signals: &'a [Signal],
    run_count: i64,
}

#[derive(Deserialize)]
struct ModelResponse {
    #[serde(default)]
    proposals: Vec<ProposalDraft>,
}

/// Proposal provider reached over HTTP (`LEARNLOOP_PROPOSAL_MODEL_URL`).
pub struct HttpProposalModel {
    client: reqwest::Client,
    url: url::Url,
    name: String,
}

impl HttpProposalModel {
    pub fn new(url: url::Url, timeout: Duration) -> Result<Self, LearningError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LearningError::Internal(format!("proposal model client: {e}")))?;
        let name = format!("model:{}", url.host_str().unwrap_or("unknown"));
        Ok(Self { client, url, name })
    }
}

#[async_trait]
impl ProposalModel for HttpProposalModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        signals: &[Signal],
        run_count: i64,
    ) -> Result<Vec<ProposalDraft>, LearningError> {
        let response = self
            .client
            .post(self.url.clone())
            .json(&ModelRequest { signals, run_count })
            .send()
            .await
            .map_err(|e| LearningError::ExternalDependency(format!("proposal model: {e}")))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(LearningError::ExternalDependency(format!(
                "proposal model returned {status}"
            )));
        }
        if !status.is_success() {
            tracing::warn!(status = %status, "proposal model rejected the request");
            return Err(LearningError::Internal(format!(
                "proposal model rejected the request with {status}"
            )));
        }

        let body = response
            .json::<ModelResponse>()
            .await
            .map_err(|e| LearningError::Internal(format!("proposal model response: {e}")))?;

        let mut drafts = Vec::with_capacity(body.proposals.len());
        for mut draft in body.proposals {
            if draft.generated_by.trim().is_empty() {
                draft.generated_by = self.name.clone();
            }
            match draft.validate() {
                Ok(()) => drafts.push(draft),
                Err(err) => {
                    tracing::warn!(title = %draft.title, error = %err, "dropping invalid model proposal");
                }
            }
        }
        Ok(drafts)
    }
}

/// Run `op`, retrying retryable failures with exponential backoff.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, LearningError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LearningError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.attempts => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    label,
                    attempt,
                    max_attempts = policy.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "external call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if err.is_retryable() {
                    tracing::error!(label, attempts = attempt, error = %err, "external call failed, giving up");
                }
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            base_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn retries_external_failures_up_to_the_limit() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), LearningError> = with_retry(fast_retry(3), "test", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(LearningError::ExternalDependency("503".to_string()))
            }
        })
        .await;
        assert!(matches!(result, Err(LearningError::ExternalDependency(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = with_retry(fast_retry(3), "test", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(LearningError::ExternalDependency("timeout".to_string()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.expect("second attempt succeeds"), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn does_not_retry_non_retryable_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), LearningError> = with_retry(fast_retry(5), "test", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(LearningError::Internal("bad payload".to_string()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn heuristic_model_yields_nothing_without_signals() {
        let drafts = HeuristicModel
            .generate(&[], 50)
            .await
            .expect("heuristic never fails");
        assert!(drafts.is_empty());
    }
}
