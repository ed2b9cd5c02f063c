//! Core data model: attributes, steps, execution plans, and the
//! projected workflow state.
//!
//! Attribute names are plan-global: the `required` inputs and every
//! step's declared outputs share one namespace, and the merged
//! attribute environment (`WorkflowState::args`) is keyed by it.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Opaque workflow identifier (one event-log aggregate per workflow).
pub type WorkflowId = String;
/// Opaque step identifier, unique within a plan.
pub type StepId = String;
/// Attribute name, unique across a plan.
pub type AttributeName = String;
/// Per-aggregate event sequence number, starting at 1 (0 = empty log).
pub type Sequence = u64;

// ═══════════════════════════════════════════════════════════════════════════
// Attributes
// ═══════════════════════════════════════════════════════════════════════════

/// Semantic type of an attribute value (shape hint, not enforced).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

/// How a step relates to an attribute.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttributeRole {
    /// Consumed; the step cannot run without it.
    Required,
    /// Consumed if present; a declared default fills the gap.
    Optional,
    /// Produced by the step on completion.
    Output,
}

/// A typed input or output declared by a step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attribute {
    pub name: AttributeName,
    #[serde(rename = "type")]
    pub attr_type: AttributeType,
    pub role: AttributeRole,
    /// Only meaningful when `role == Optional`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Steps
// ═══════════════════════════════════════════════════════════════════════════

/// Transport configuration, tagged by step type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum StepTransport {
    /// Blocking HTTP call; the response body carries the outputs.
    #[serde(rename = "sync-http")]
    SyncHttp { http: HttpConfig },
    /// Fire-and-callback HTTP call; completion arrives out of band
    /// through the callback ingestion endpoint.
    #[serde(rename = "async-http")]
    AsyncHttp { async_http: AsyncHttpConfig },
    /// Black-box script invocation via a pluggable interpreter.
    #[serde(rename = "script")]
    Script { script: ScriptConfig },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpConfig {
    pub endpoint: String,
    /// Per-step request timeout in seconds.
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

fn default_http_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AsyncHttpConfig {
    pub endpoint: String,
    /// Shared secret embedded in the callback URL.
    pub callback_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScriptConfig {
    pub language: String,
    pub source: String,
}

/// Gate expression deciding whether a step should run at all given
/// the attribute environment. A false predicate skips the step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Predicate {
    pub language: String,
    pub source: String,
}

/// Retry policy for a step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    1_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            multiplier: 2.0,
            max_backoff_ms: 30_000,
        }
    }
}

/// A unit of work with declared typed inputs and outputs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub id: StepId,
    pub name: String,
    pub version: String,
    #[serde(flatten)]
    pub transport: StepTransport,
    /// Keyed by attribute name; keys are unique by construction.
    #[serde(default)]
    pub attributes: IndexMap<AttributeName, Attribute>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<Predicate>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Step {
    /// Attributes this step declares with the given role.
    pub fn inputs_with_role(&self, role: AttributeRole) -> impl Iterator<Item = &Attribute> {
        self.attributes.values().filter(move |a| a.role == role)
    }

    /// Attribute names this step produces on completion.
    pub fn outputs(&self) -> impl Iterator<Item = &AttributeName> {
        self.attributes
            .values()
            .filter(|a| a.role == AttributeRole::Output)
            .map(|a| &a.name)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Execution plan
// ═══════════════════════════════════════════════════════════════════════════

/// A client-submitted plan: goal steps, externally supplied inputs,
/// and the step catalog. Immutable after submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionPlan {
    /// Steps whose completion is the success criterion; their declared
    /// outputs are the plan outputs. Order is preserved.
    pub goals: Vec<StepId>,
    /// Inputs the client must supply at submission.
    #[serde(default)]
    pub required: Vec<AttributeName>,
    /// Step catalog, keyed by step id. Insertion order is the stable
    /// iteration order used when the frontier is listed.
    pub steps: IndexMap<StepId, Step>,
}

impl ExecutionPlan {
    /// The step producing `attr`, if any. Output names are unique
    /// across a valid plan, so at most one step matches.
    pub fn producer_of(&self, attr: &str) -> Option<&Step> {
        self.steps
            .values()
            .find(|s| s.outputs().any(|o| o == attr))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Step execution and workflow state
// ═══════════════════════════════════════════════════════════════════════════

/// Status of a single step execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Overall workflow status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowStatus::Running)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Projected execution record of one step within a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepExecution {
    pub step_id: StepId,
    pub status: StepStatus,
    pub attempts: u32,
    /// True between a `StepScheduled` claim and the attempt's outcome.
    /// A claimed step is pending but owned, so no other replica's
    /// frontier includes it for this attempt.
    #[serde(default)]
    pub scheduled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Populated only when `status == Completed`.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub outputs: HashMap<AttributeName, Value>,
}

impl StepExecution {
    pub fn new(step_id: &str) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Pending,
            attempts: 0,
            scheduled: false,
            scheduled_at: None,
            last_error: None,
            started_at: None,
            ended_at: None,
            outputs: HashMap::new(),
        }
    }
}

/// Snapshot of a workflow, projected from its event log. Never
/// mutated directly; the projection is the only writer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowState {
    pub id: WorkflowId,
    pub plan_hash: String,
    pub status: WorkflowStatus,
    pub plan: ExecutionPlan,
    /// Merged attribute environment: plan `required` inputs plus every
    /// completed step's outputs.
    pub args: HashMap<AttributeName, Value>,
    pub executions: IndexMap<StepId, StepExecution>,
    /// Sequence of the last applied event.
    pub version: Sequence,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl WorkflowState {
    pub fn execution(&self, step_id: &str) -> Option<&StepExecution> {
        self.executions.get(step_id)
    }

    /// Plan outputs: the goals' declared output attributes, restricted
    /// to values present in the environment.
    pub fn goal_outputs(&self) -> HashMap<AttributeName, Value> {
        let mut out = HashMap::new();
        for goal in &self.plan.goals {
            if let Some(step) = self.plan.steps.get(goal) {
                for name in step.outputs() {
                    if let Some(v) = self.args.get(name) {
                        out.insert(name.clone(), v.clone());
                    }
                }
            }
        }
        out
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Step invocation envelope (fixed wire contract)
// ═══════════════════════════════════════════════════════════════════════════

/// Request body POSTed to a step endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInvocationRequest {
    pub step_id: StepId,
    pub arguments: HashMap<AttributeName, Value>,
    pub meta: InvocationMeta,
}

/// Invocation metadata; `workflow_id` is always present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationMeta {
    pub workflow_id: WorkflowId,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub workflow_metadata: HashMap<String, Value>,
}

/// Response body expected from a step endpoint (and from the async
/// callback ingestion path).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInvocationResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<HashMap<AttributeName, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Control API bodies
// ═══════════════════════════════════════════════════════════════════════════

/// Body of `POST /engine/workflows`.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitWorkflowRequest {
    pub workflow_id: WorkflowId,
    pub plan: SubmittedPlan,
    #[serde(default)]
    pub args: HashMap<AttributeName, Value>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// A plan as submitted: step entries may be full definitions or bare
/// references (`null`) to steps registered in the catalog.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmittedPlan {
    pub goals: Vec<StepId>,
    #[serde(default)]
    pub required: Vec<AttributeName>,
    #[serde(default)]
    pub steps: IndexMap<StepId, Option<Step>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitWorkflowResponse {
    pub workflow_id: WorkflowId,
    pub plan_hash: String,
}

/// One row of `GET /engine/workflows`.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSummary {
    pub workflow_id: WorkflowId,
    pub status: WorkflowStatus,
    pub version: Sequence,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub store: String,
    pub active_workflows: usize,
}

/// Error body returned by every non-2xx control API response.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn step_transport_tagging_round_trips() {
        let step: Step = serde_json::from_value(json!({
            "id": "fetch",
            "name": "Fetch",
            "version": "1",
            "type": "sync-http",
            "http": {"endpoint": "http://localhost:9000/fetch"},
            "attributes": {
                "url": {"name": "url", "type": "string", "role": "required"},
                "body": {"name": "body", "type": "object", "role": "output"}
            }
        }))
        .unwrap();

        match &step.transport {
            StepTransport::SyncHttp { http } => {
                assert_eq!(http.endpoint, "http://localhost:9000/fetch");
                assert_eq!(http.timeout_secs, 30);
            }
            other => panic!("unexpected transport: {:?}", other),
        }

        let round = serde_json::to_value(&step).unwrap();
        assert_eq!(round["type"], "sync-http");
        assert_eq!(step.retry, RetryPolicy::default());
    }

    #[test]
    fn producer_lookup_finds_owning_step() {
        let step: Step = serde_json::from_value(json!({
            "id": "a",
            "name": "A",
            "version": "1",
            "type": "script",
            "script": {"language": "expr", "source": "true"},
            "attributes": {
                "x": {"name": "x", "type": "string", "role": "output"}
            }
        }))
        .unwrap();

        let plan = ExecutionPlan {
            goals: vec!["a".into()],
            required: vec![],
            steps: IndexMap::from([("a".to_string(), step)]),
        };

        assert_eq!(plan.producer_of("x").map(|s| s.id.as_str()), Some("a"));
        assert!(plan.producer_of("y").is_none());
    }
}
