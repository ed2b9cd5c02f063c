//! End-to-end engine scenarios against mock step endpoints.
//!
//! - Single sync step success (goal completes, outputs land in args)
//! - Dataflow ordering (producer completes before consumer starts)
//! - Retry with backoff (fail twice, succeed on the third attempt)
//! - Predicate skip (needed producer skipped fails the workflow;
//!   unneeded steps are never invoked)
//! - Async-http dispatch, lease re-claim, and stale callback handling
//! - Projection round-trip equals the fetched state

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{extract::State, routing::post, Json, Router};
use indexmap::IndexMap;
use serde_json::{json, Value};

use argyll::config::Config;
use argyll::error::EngineError;
use argyll::events::EventKind;
use argyll::hibernate::MemoryBlobArchive;
use argyll::orchestrator::{CallbackOutcome, Engine, WorkflowFetch};
use argyll::projection::project;
use argyll::script::ExprEngine;
use argyll::store::{EventStore, MemoryEventStore};
use argyll::types::*;

// ═══════════════════════════════════════════════════════════════════════════
// Harness
// ═══════════════════════════════════════════════════════════════════════════

fn test_config() -> Arc<Config> {
    Arc::new(Config {
        host: "127.0.0.1".into(),
        port: 0,
        public_url: "http://127.0.0.1:0".into(),
        key_prefix: "argyll-test".into(),
        redis_rest_url: None,
        redis_rest_token: None,
        store_poll_interval: Duration::from_millis(25),
        subscription_buffer: 256,
        stabilization: Duration::from_millis(50),
        lease_timeout: Duration::from_millis(300),
        shutdown_grace: Duration::from_secs(2),
        hibernate_after: Duration::from_secs(3_600),
        hibernate_sweep: Duration::from_secs(300),
    })
}

fn new_engine() -> Arc<Engine> {
    Engine::new(
        test_config(),
        Arc::new(MemoryEventStore::default()),
        Arc::new(MemoryBlobArchive::default()),
        Arc::new(ExprEngine),
        reqwest::Client::new(),
    )
}

/// What a mock step endpoint saw and how it should answer.
#[derive(Default)]
struct MockStepState {
    requests: Mutex<Vec<StepInvocationRequest>>,
    /// Attempts that answer HTTP 500 before `responses` kicks in.
    fail_first: AtomicU32,
    response: Mutex<Value>,
}

type Shared = Arc<MockStepState>;

async fn mock_step_handler(
    State(mock): State<Shared>,
    Json(request): Json<StepInvocationRequest>,
) -> axum::response::Response {
    mock.requests.lock().unwrap().push(request);
    let remaining = mock.fail_first.load(Ordering::SeqCst);
    if remaining > 0 {
        mock.fail_first.store(remaining - 1, Ordering::SeqCst);
        return axum::response::IntoResponse::into_response((
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"success": false, "error": "induced failure"})),
        ));
    }
    let body = mock.response.lock().unwrap().clone();
    axum::response::IntoResponse::into_response(Json(body))
}

/// Serve one mock step endpoint on an ephemeral port; returns its URL.
async fn spawn_mock_step(mock: Shared) -> String {
    let app = Router::new()
        .route("/step", post(mock_step_handler))
        .with_state(mock);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/step")
}

fn attr(name: &str, role: AttributeRole) -> Attribute {
    Attribute {
        name: name.into(),
        attr_type: AttributeType::String,
        role,
        default: None,
    }
}

fn http_step(id: &str, endpoint: &str, attrs: Vec<Attribute>, retry: RetryPolicy) -> Step {
    Step {
        id: id.into(),
        name: id.into(),
        version: "1".into(),
        transport: StepTransport::SyncHttp {
            http: HttpConfig {
                endpoint: endpoint.into(),
                timeout_secs: 5,
            },
        },
        attributes: attrs.into_iter().map(|a| (a.name.clone(), a)).collect(),
        predicate: None,
        retry,
    }
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff_ms: 40,
        multiplier: 1.0,
        max_backoff_ms: 40,
    }
}

fn submit_request(workflow_id: &str, steps: Vec<Step>, goals: &[&str]) -> SubmitWorkflowRequest {
    SubmitWorkflowRequest {
        workflow_id: workflow_id.into(),
        plan: SubmittedPlan {
            goals: goals.iter().map(|s| s.to_string()).collect(),
            required: vec![],
            steps: steps.into_iter().map(|s| (s.id.clone(), Some(s))).collect(),
        },
        args: HashMap::new(),
        metadata: HashMap::new(),
    }
}

async fn wait_for_status(
    engine: &Arc<Engine>,
    workflow_id: &str,
    status: WorkflowStatus,
    budget: Duration,
) -> WorkflowState {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        if let WorkflowFetch::Found(state) = engine.fetch(workflow_id).await.unwrap() {
            if state.status == status {
                return *state;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("workflow {workflow_id} never reached {status}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Scenarios
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn single_sync_step_success_within_budget() {
    let engine = new_engine();
    let mock = Shared::default();
    *mock.response.lock().unwrap() = json!({"success": true, "outputs": {"result": "success"}});
    let endpoint = spawn_mock_step(mock.clone()).await;

    let step = http_step(
        "goal-step",
        &endpoint,
        vec![attr("result", AttributeRole::Output)],
        RetryPolicy::default(),
    );
    engine
        .submit(submit_request("wf-s1", vec![step], &["goal-step"]))
        .await
        .unwrap();

    let state = wait_for_status(
        &engine,
        "wf-s1",
        WorkflowStatus::Completed,
        Duration::from_millis(500),
    )
    .await;

    assert_eq!(state.executions["goal-step"].status, StepStatus::Completed);
    assert_eq!(state.args["result"], json!("success"));

    // The endpoint received the fixed envelope shape.
    let requests = mock.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].step_id, "goal-step");
    assert_eq!(requests[0].meta.workflow_id, "wf-s1");

    engine.shutdown().await;
}

#[tokio::test]
async fn producer_completes_before_consumer_starts() {
    let engine = new_engine();

    let mock_a = Shared::default();
    *mock_a.response.lock().unwrap() = json!({"success": true, "outputs": {"x": "v"}});
    let endpoint_a = spawn_mock_step(mock_a.clone()).await;

    let mock_b = Shared::default();
    *mock_b.response.lock().unwrap() = json!({"success": true, "outputs": {"y": "done"}});
    let endpoint_b = spawn_mock_step(mock_b.clone()).await;

    let a = http_step(
        "a",
        &endpoint_a,
        vec![attr("x", AttributeRole::Output)],
        RetryPolicy::default(),
    );
    let b = http_step(
        "b",
        &endpoint_b,
        vec![attr("x", AttributeRole::Required), attr("y", AttributeRole::Output)],
        RetryPolicy::default(),
    );

    engine
        .submit(submit_request("wf-s2", vec![a, b], &["b"]))
        .await
        .unwrap();
    let state = wait_for_status(
        &engine,
        "wf-s2",
        WorkflowStatus::Completed,
        Duration::from_secs(2),
    )
    .await;

    assert_eq!(state.args["x"], json!("v"));

    // b's invocation carried a's output as an argument.
    let b_requests = mock_b.requests.lock().unwrap();
    assert_eq!(b_requests.len(), 1);
    assert_eq!(b_requests[0].arguments["x"], json!("v"));

    // Log order: a completed strictly before b started.
    let events = engine.events("wf-s2", 0).await.unwrap();
    let a_completed = events
        .iter()
        .position(|r| matches!(&r.kind, EventKind::StepCompleted { step_id, .. } if step_id == "a"))
        .unwrap();
    let b_started = events
        .iter()
        .position(|r| matches!(&r.kind, EventKind::StepStarted { step_id, .. } if step_id == "b"))
        .unwrap();
    assert!(a_completed < b_started);

    engine.shutdown().await;
}

#[tokio::test]
async fn retry_twice_then_succeed_third_attempt() {
    let engine = new_engine();
    let mock = Shared::default();
    mock.fail_first.store(2, Ordering::SeqCst);
    *mock.response.lock().unwrap() = json!({"success": true, "outputs": {"result": "ok"}});
    let endpoint = spawn_mock_step(mock.clone()).await;

    let step = http_step(
        "flaky",
        &endpoint,
        vec![attr("result", AttributeRole::Output)],
        fast_retry(3),
    );
    engine
        .submit(submit_request("wf-s3", vec![step], &["flaky"]))
        .await
        .unwrap();
    let state = wait_for_status(
        &engine,
        "wf-s3",
        WorkflowStatus::Completed,
        Duration::from_secs(3),
    )
    .await;
    assert_eq!(state.executions["flaky"].attempts, 3);

    let events = engine.events("wf-s3", 0).await.unwrap();
    let failures: Vec<(u32, bool)> = events
        .iter()
        .filter_map(|r| match &r.kind {
            EventKind::StepFailed {
                attempt, will_retry, ..
            } => Some((*attempt, *will_retry)),
            _ => None,
        })
        .collect();
    assert_eq!(failures, vec![(1, true), (2, true)]);

    let third_start = events.iter().any(
        |r| matches!(&r.kind, EventKind::StepStarted { attempt: 3, step_id, .. } if step_id == "flaky"),
    );
    let third_done = events.iter().any(
        |r| matches!(&r.kind, EventKind::StepCompleted { attempt: 3, step_id, .. } if step_id == "flaky"),
    );
    assert!(third_start && third_done);
    assert_eq!(mock.requests.lock().unwrap().len(), 3);

    engine.shutdown().await;
}

#[tokio::test]
async fn exhausted_retries_fail_the_workflow() {
    let engine = new_engine();
    let mock = Shared::default();
    mock.fail_first.store(10, Ordering::SeqCst);
    let endpoint = spawn_mock_step(mock.clone()).await;

    let step = http_step(
        "doomed",
        &endpoint,
        vec![attr("result", AttributeRole::Output)],
        fast_retry(2),
    );
    engine
        .submit(submit_request("wf-fail", vec![step], &["doomed"]))
        .await
        .unwrap();
    let state = wait_for_status(
        &engine,
        "wf-fail",
        WorkflowStatus::Failed,
        Duration::from_secs(3),
    )
    .await;
    assert_eq!(state.executions["doomed"].status, StepStatus::Failed);
    assert_eq!(state.executions["doomed"].attempts, 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn skipped_needed_producer_fails_lazy_steps_never_run() {
    let engine = new_engine();
    let consumer_mock = Shared::default();
    let consumer_endpoint = spawn_mock_step(consumer_mock.clone()).await;
    let bystander_mock = Shared::default();
    let bystander_endpoint = spawn_mock_step(bystander_mock.clone()).await;

    // gate produces x but its predicate is false; consume needs x.
    let mut gate = Step {
        id: "gate".into(),
        name: "gate".into(),
        version: "1".into(),
        transport: StepTransport::Script {
            script: ScriptConfig {
                language: "expr".into(),
                source: r#"{"x": 1}"#.into(),
            },
        },
        attributes: IndexMap::from([("x".to_string(), attr("x", AttributeRole::Output))]),
        predicate: None,
        retry: RetryPolicy::default(),
    };
    gate.predicate = Some(Predicate {
        language: "expr".into(),
        source: "false".into(),
    });

    let consume = http_step(
        "consume",
        &consumer_endpoint,
        vec![attr("x", AttributeRole::Required), attr("y", AttributeRole::Output)],
        RetryPolicy::default(),
    );
    // bystander is not needed by the goal and must never be invoked.
    let bystander = http_step(
        "bystander",
        &bystander_endpoint,
        vec![attr("z", AttributeRole::Output)],
        RetryPolicy::default(),
    );

    engine
        .submit(submit_request("wf-s5", vec![gate, consume, bystander], &["consume"]))
        .await
        .unwrap();
    let state = wait_for_status(
        &engine,
        "wf-s5",
        WorkflowStatus::Failed,
        Duration::from_secs(2),
    )
    .await;

    assert_eq!(state.executions["gate"].status, StepStatus::Skipped);
    assert_eq!(state.executions["consume"].status, StepStatus::Pending);
    assert_eq!(state.executions["bystander"].status, StepStatus::Pending);
    assert!(consumer_mock.requests.lock().unwrap().is_empty());
    assert!(bystander_mock.requests.lock().unwrap().is_empty());

    let events = engine.events("wf-s5", 0).await.unwrap();
    assert!(events
        .iter()
        .any(|r| matches!(&r.kind, EventKind::StepSkipped { step_id, .. } if step_id == "gate")));

    engine.shutdown().await;
}

#[tokio::test]
async fn async_step_lease_retry_ignores_stale_callback() {
    let engine = new_engine();
    let mock = Shared::default();
    // The dispatch acknowledgment; completion only comes via callback.
    *mock.response.lock().unwrap() = json!({"success": true});
    let endpoint = spawn_mock_step(mock.clone()).await;

    let step = Step {
        id: "notify".into(),
        name: "notify".into(),
        version: "1".into(),
        transport: StepTransport::AsyncHttp {
            async_http: AsyncHttpConfig {
                endpoint,
                callback_token: "tok".into(),
            },
        },
        attributes: IndexMap::from([("ack".to_string(), attr("ack", AttributeRole::Output))]),
        predicate: None,
        retry: fast_retry(5),
    };
    engine
        .submit(submit_request("wf-s6", vec![step], &["notify"]))
        .await
        .unwrap();

    // Wait past the lease timeout so attempt 1 is superseded.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if mock.requests.lock().unwrap().len() >= 2 {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("async step was never re-dispatched after lease expiry");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // The stale callback (attempt 1) must be acknowledged and dropped.
    let stale = engine
        .ingest_callback(
            "wf-s6",
            "notify",
            "tok.1",
            StepInvocationResponse {
                success: true,
                outputs: Some(HashMap::from([("ack".to_string(), json!("stale"))])),
                error: None,
            },
        )
        .await
        .unwrap();
    assert!(matches!(stale, CallbackOutcome::Stale(_)));

    // A wrong token is rejected outright.
    let forbidden = engine
        .ingest_callback(
            "wf-s6",
            "notify",
            "wrong.2",
            StepInvocationResponse {
                success: true,
                outputs: None,
                error: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(forbidden, CallbackOutcome::Forbidden);

    // The callback for the current attempt completes the workflow.
    // Re-read the attempt on each try in case a lease expires between
    // observing it and delivering the callback.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let WorkflowFetch::Found(state) = engine.fetch("wf-s6").await.unwrap() else {
            panic!("workflow disappeared");
        };
        let current_attempt = state.executions["notify"].attempts;
        let outcome = engine
            .ingest_callback(
                "wf-s6",
                "notify",
                &format!("tok.{current_attempt}"),
                StepInvocationResponse {
                    success: true,
                    outputs: Some(HashMap::from([("ack".to_string(), json!("delivered"))])),
                    error: None,
                },
            )
            .await
            .unwrap();
        if outcome == CallbackOutcome::Accepted {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("callback never accepted: {outcome:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let state = wait_for_status(
        &engine,
        "wf-s6",
        WorkflowStatus::Completed,
        Duration::from_secs(2),
    )
    .await;
    assert_eq!(state.args["ack"], json!("delivered"));

    // The dispatches carried attempt-scoped callback URLs.
    let requests = mock.requests.lock().unwrap();
    let urls: Vec<String> = requests
        .iter()
        .filter_map(|r| r.meta.callback_url.clone())
        .collect();
    assert!(urls[0].ends_with("/engine/callbacks/wf-s6/notify/tok.1"));
    assert!(urls.iter().all(|u| u.contains("/engine/callbacks/wf-s6/notify/tok.")));

    engine.shutdown().await;
}

#[tokio::test]
async fn projection_round_trip_matches_fetched_state() {
    let engine = new_engine();
    let mock = Shared::default();
    *mock.response.lock().unwrap() = json!({"success": true, "outputs": {"result": "success"}});
    let endpoint = spawn_mock_step(mock.clone()).await;

    let step = http_step(
        "goal-step",
        &endpoint,
        vec![attr("result", AttributeRole::Output)],
        RetryPolicy::default(),
    );
    engine
        .submit(submit_request("wf-rt", vec![step], &["goal-step"]))
        .await
        .unwrap();
    let fetched = wait_for_status(
        &engine,
        "wf-rt",
        WorkflowStatus::Completed,
        Duration::from_secs(2),
    )
    .await;

    let events = engine.store().read("wf-rt", 0).await.unwrap();
    let projected = project(&events).unwrap();
    assert_eq!(projected, fetched);

    // Sequences are dense and start at 1.
    for (i, record) in events.iter().enumerate() {
        assert_eq!(record.sequence, i as u64 + 1);
    }

    engine.shutdown().await;
}

#[tokio::test]
async fn validation_rejects_cyclic_plan_at_submission() {
    let engine = new_engine();
    let a = http_step(
        "a",
        "http://127.0.0.1:1/unused",
        vec![attr("y", AttributeRole::Required), attr("x", AttributeRole::Output)],
        RetryPolicy::default(),
    );
    let b = http_step(
        "b",
        "http://127.0.0.1:1/unused",
        vec![attr("x", AttributeRole::Required), attr("y", AttributeRole::Output)],
        RetryPolicy::default(),
    );
    let err = engine
        .submit(submit_request("wf-cycle", vec![a, b], &["b"]))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}
