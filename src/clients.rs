//! HTTP client for step invocation.
//!
//! Speaks the fixed wire contract: POST a JSON envelope
//! `{step_id, arguments, meta}` to the step endpoint and expect
//! `{success, outputs?, error?}` back. HTTP 200 is required for
//! success; everything else maps onto the retryable/non-retryable
//! error split.

use reqwest::StatusCode;
use std::time::Duration;

use crate::error::EngineError;
use crate::types::{AsyncHttpConfig, HttpConfig, StepInvocationRequest, StepInvocationResponse};

/// Client wrapper for sync-http calls and async-http dispatches.
pub struct StepClient<'a> {
    http: &'a reqwest::Client,
}

impl<'a> StepClient<'a> {
    pub fn new(http: &'a reqwest::Client) -> Self {
        Self { http }
    }

    /// Invoke a sync-http step and wait for its outputs.
    pub async fn invoke_sync(
        &self,
        config: &HttpConfig,
        request: &StepInvocationRequest,
    ) -> Result<StepInvocationResponse, EngineError> {
        let response = self
            .http
            .post(&config.endpoint)
            .timeout(Duration::from_secs(config.timeout_secs))
            .json(request)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(classify_status(status));
        }

        let body: StepInvocationResponse = response.json().await.map_err(|e| {
            EngineError::StepUnsuccessful(format!("malformed step response body: {e}"))
        })?;

        if !body.success {
            return Err(EngineError::StepUnsuccessful(
                body.error.unwrap_or_else(|| "step reported failure".into()),
            ));
        }
        Ok(body)
    }

    /// Dispatch an async-http step. A 200 acknowledges the dispatch;
    /// completion arrives later through the callback ingestion path.
    pub async fn dispatch_async(
        &self,
        config: &AsyncHttpConfig,
        request: &StepInvocationRequest,
    ) -> Result<(), EngineError> {
        let response = self
            .http
            .post(&config.endpoint)
            .json(request)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(classify_status(status));
        }
        Ok(())
    }
}

fn classify_send_error(err: reqwest::Error) -> EngineError {
    if err.is_timeout() {
        EngineError::Timeout(err.to_string())
    } else {
        EngineError::Transport(err.to_string())
    }
}

/// Status classification: 5xx and the throttling/timeout 4xx codes
/// are retryable transport conditions, the rest of 4xx is the step's
/// final answer.
fn classify_status(status: StatusCode) -> EngineError {
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        EngineError::Transport(format!("step endpoint returned {status}"))
    } else {
        EngineError::StepUnsuccessful(format!("step endpoint returned {status}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_split_matches_retry_policy() {
        assert!(classify_status(StatusCode::INTERNAL_SERVER_ERROR).is_retryable());
        assert!(classify_status(StatusCode::BAD_GATEWAY).is_retryable());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT).is_retryable());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS).is_retryable());
        assert!(!classify_status(StatusCode::BAD_REQUEST).is_retryable());
        assert!(!classify_status(StatusCode::NOT_FOUND).is_retryable());
        assert!(!classify_status(StatusCode::UNPROCESSABLE_ENTITY).is_retryable());
    }
}
