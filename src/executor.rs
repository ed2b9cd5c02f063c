//! Step executor: runs one step attempt via its configured transport.
//!
//! Routes on the transport tag:
//! - `sync-http` → blocking POST, outputs in the response body
//! - `async-http` → dispatch with a callback URL; completion arrives
//!   out of band through the callback ingestion endpoint
//! - `script` → black-box interpreter invocation
//!
//! The executor never appends events; it reports an outcome and the
//! orchestrator decides which event that becomes.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use crate::clients::StepClient;
use crate::error::EngineError;
use crate::script::ScriptEngine;
use crate::types::{
    AttributeName, InvocationMeta, RetryPolicy, Step, StepInvocationRequest, StepTransport,
    WorkflowId,
};

/// Result of one executor invocation.
#[derive(Debug)]
pub enum StepOutcome {
    /// The step finished and produced these outputs.
    Completed(HashMap<AttributeName, Value>),
    /// An async-http step was dispatched; the terminal event will be
    /// ingested through the callback path.
    AwaitingCallback,
}

/// Executes steps; cheap to clone, shared by every workflow runner.
#[derive(Clone)]
pub struct StepExecutor {
    http: reqwest::Client,
    scripts: Arc<dyn ScriptEngine>,
    /// Public base URL of this engine, used to build callback URLs.
    callback_base: String,
}

impl StepExecutor {
    pub fn new(http: reqwest::Client, scripts: Arc<dyn ScriptEngine>, callback_base: String) -> Self {
        Self {
            http,
            scripts,
            callback_base: callback_base.trim_end_matches('/').to_string(),
        }
    }

    /// Callback URL for one attempt of one async step. The attempt
    /// suffix lets the ingestion endpoint reject stale callbacks.
    pub fn callback_url(
        &self,
        workflow_id: &str,
        step_id: &str,
        token: &str,
        attempt: u32,
    ) -> String {
        format!(
            "{}/engine/callbacks/{}/{}/{}.{}",
            self.callback_base, workflow_id, step_id, token, attempt
        )
    }

    /// Run one attempt. Honors `cancel`: on cancellation the transport
    /// is dropped and `EngineError::Cancelled` returned without any
    /// terminal outcome.
    pub async fn execute(
        &self,
        step: &Step,
        workflow_id: &WorkflowId,
        attempt: u32,
        arguments: HashMap<AttributeName, Value>,
        workflow_metadata: HashMap<String, Value>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<StepOutcome, EngineError> {
        let work = self.run_transport(step, workflow_id, attempt, arguments, workflow_metadata);
        tokio::select! {
            outcome = work => outcome,
            _ = cancel.wait_for(|stop| *stop) => Err(EngineError::Cancelled),
        }
    }

    async fn run_transport(
        &self,
        step: &Step,
        workflow_id: &WorkflowId,
        attempt: u32,
        arguments: HashMap<AttributeName, Value>,
        workflow_metadata: HashMap<String, Value>,
    ) -> Result<StepOutcome, EngineError> {
        match &step.transport {
            StepTransport::SyncHttp { http } => {
                let request = StepInvocationRequest {
                    step_id: step.id.clone(),
                    arguments,
                    meta: InvocationMeta {
                        workflow_id: workflow_id.clone(),
                        attempt,
                        callback_url: None,
                        workflow_metadata,
                    },
                };
                let response = StepClient::new(&self.http).invoke_sync(http, &request).await?;
                let outputs = response.outputs.unwrap_or_default();
                Ok(StepOutcome::Completed(declared_outputs(step, outputs)))
            }

            StepTransport::AsyncHttp { async_http } => {
                let callback_url = self.callback_url(
                    workflow_id,
                    &step.id,
                    &async_http.callback_token,
                    attempt,
                );
                let request = StepInvocationRequest {
                    step_id: step.id.clone(),
                    arguments,
                    meta: InvocationMeta {
                        workflow_id: workflow_id.clone(),
                        attempt,
                        callback_url: Some(callback_url),
                        workflow_metadata,
                    },
                };
                StepClient::new(&self.http)
                    .dispatch_async(async_http, &request)
                    .await?;
                Ok(StepOutcome::AwaitingCallback)
            }

            StepTransport::Script { script } => {
                let value = self
                    .scripts
                    .evaluate(&script.language, &script.source, &arguments)?;
                let Value::Object(map) = value else {
                    return Err(EngineError::StepUnsuccessful(
                        "script did not return an output mapping".into(),
                    ));
                };
                let outputs = map.into_iter().collect();
                Ok(StepOutcome::Completed(declared_outputs(step, outputs)))
            }
        }
    }
}

/// Restrict returned outputs to the step's declared output
/// attributes; anything else cannot enter the environment.
pub fn declared_outputs(
    step: &Step,
    mut outputs: HashMap<AttributeName, Value>,
) -> HashMap<AttributeName, Value> {
    let declared: Vec<&AttributeName> = step.outputs().collect();
    let dropped: Vec<String> = outputs
        .keys()
        .filter(|k| !declared.contains(k))
        .cloned()
        .collect();
    for key in &dropped {
        debug!(step_id = %step.id, attribute = %key, "dropping undeclared step output");
        outputs.remove(key);
    }
    outputs
}

// ═══════════════════════════════════════════════════════════════════════════
// Retry policy evaluation
// ═══════════════════════════════════════════════════════════════════════════

/// Backoff before re-scheduling attempt `attempts + 1`:
/// `min(initial * multiplier^(attempts-1), max)`. Deterministic, so
/// every replica computes the same deadline from the same event.
pub fn retry_backoff(policy: &RetryPolicy, attempts: u32) -> Duration {
    let exp = attempts.saturating_sub(1);
    let raw = policy.initial_backoff_ms as f64 * policy.multiplier.powi(exp as i32);
    let capped = raw.min(policy.max_backoff_ms as f64).max(0.0);
    Duration::from_millis(capped as u64)
}

/// Whether a failed attempt should be retried.
pub fn should_retry(policy: &RetryPolicy, attempts: u32, error: &EngineError) -> bool {
    error.is_retryable() && attempts < policy.max_attempts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::ExprEngine;
    use crate::types::*;
    use indexmap::IndexMap;
    use serde_json::json;

    fn script_step(source: &str, outputs: &[&str]) -> Step {
        let attributes: IndexMap<String, Attribute> = outputs
            .iter()
            .map(|name| {
                (
                    name.to_string(),
                    Attribute {
                        name: name.to_string(),
                        attr_type: AttributeType::String,
                        role: AttributeRole::Output,
                        default: None,
                    },
                )
            })
            .collect();
        Step {
            id: "s".into(),
            name: "s".into(),
            version: "1".into(),
            transport: StepTransport::Script {
                script: ScriptConfig {
                    language: "expr".into(),
                    source: source.into(),
                },
            },
            attributes,
            predicate: None,
            retry: RetryPolicy::default(),
        }
    }

    fn executor() -> StepExecutor {
        StepExecutor::new(
            reqwest::Client::new(),
            Arc::new(ExprEngine),
            "http://localhost:8080/".into(),
        )
    }

    #[tokio::test]
    async fn script_step_produces_declared_outputs() {
        let (_tx, cancel) = watch::channel(false);
        let step = script_step(r#"{"result": "ok", "extra": 1}"#, &["result"]);
        let outcome = executor()
            .execute(&step, &"wf".to_string(), 1, HashMap::new(), HashMap::new(), cancel)
            .await
            .unwrap();
        match outcome {
            StepOutcome::Completed(outputs) => {
                assert_eq!(outputs.get("result"), Some(&json!("ok")));
                // Undeclared attributes never reach the environment.
                assert!(!outputs.contains_key("extra"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn script_returning_non_object_fails_permanently() {
        let (_tx, cancel) = watch::channel(false);
        let step = script_step("true", &["result"]);
        let err = executor()
            .execute(&step, &"wf".to_string(), 1, HashMap::new(), HashMap::new(), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StepUnsuccessful(_)));
    }

    #[tokio::test]
    async fn cancellation_wins_over_slow_work() {
        let (tx, cancel) = watch::channel(false);
        // A listener that never answers: the request hangs until the
        // cancel signal lands.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}/never", listener.local_addr().unwrap());
        let step = Step {
            id: "slow".into(),
            name: "slow".into(),
            version: "1".into(),
            transport: StepTransport::SyncHttp {
                http: HttpConfig {
                    endpoint,
                    timeout_secs: 60,
                },
            },
            attributes: IndexMap::new(),
            predicate: None,
            retry: RetryPolicy::default(),
        };
        let exec = executor();
        let handle = tokio::spawn(async move {
            exec.execute(&step, &"wf".to_string(), 1, HashMap::new(), HashMap::new(), cancel)
                .await
        });
        tx.send(true).unwrap();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }

    #[test]
    fn backoff_grows_geometrically_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(retry_backoff(&policy, 1), Duration::from_millis(1_000));
        assert_eq!(retry_backoff(&policy, 2), Duration::from_millis(2_000));
        assert_eq!(retry_backoff(&policy, 3), Duration::from_millis(4_000));
        assert_eq!(retry_backoff(&policy, 20), Duration::from_millis(30_000));
    }

    #[test]
    fn retry_only_on_retryable_errors_with_budget_left() {
        let policy = RetryPolicy::default();
        let transport = EngineError::Transport("refused".into());
        let fatal = EngineError::StepUnsuccessful("no".into());
        assert!(should_retry(&policy, 1, &transport));
        assert!(should_retry(&policy, 2, &transport));
        assert!(!should_retry(&policy, 3, &transport));
        assert!(!should_retry(&policy, 1, &fatal));
    }

    #[test]
    fn callback_url_embeds_attempt_suffix() {
        let url = executor().callback_url("wf-1", "notify", "tok", 2);
        assert_eq!(
            url,
            "http://localhost:8080/engine/callbacks/wf-1/notify/tok.2"
        );
    }
}
