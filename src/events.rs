//! Domain events and the append-only record envelope.
//!
//! One workflow = one aggregate. Every record carries a sequence
//! number, unique and strictly increasing per aggregate starting at 1.
//! Events are immutable once appended; state is only ever derived by
//! folding them through the projection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::types::{AttributeName, ExecutionPlan, Sequence, StepId, WorkflowId};

/// Event payload, adjacently tagged so the wire shape is
/// `{"type": "...", "data": {...}}` — the same shape WebSocket
/// subscribers receive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum EventKind {
    WorkflowStarted {
        plan: ExecutionPlan,
        plan_hash: String,
        args: HashMap<AttributeName, Value>,
        #[serde(default)]
        metadata: HashMap<String, Value>,
    },
    /// The CAS claim: whichever replica appends this owns the attempt.
    StepScheduled {
        step_id: StepId,
        attempt: u32,
    },
    StepStarted {
        step_id: StepId,
        attempt: u32,
        at: DateTime<Utc>,
    },
    StepCompleted {
        step_id: StepId,
        attempt: u32,
        outputs: HashMap<AttributeName, Value>,
        at: DateTime<Utc>,
    },
    StepFailed {
        step_id: StepId,
        attempt: u32,
        error: String,
        will_retry: bool,
        at: DateTime<Utc>,
    },
    StepSkipped {
        step_id: StepId,
        reason: String,
    },
    WorkflowCompleted {
        at: DateTime<Utc>,
        outputs: HashMap<AttributeName, Value>,
    },
    WorkflowFailed {
        at: DateTime<Utc>,
        error: String,
    },
}

impl EventKind {
    /// Stable name matching the serialized `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::WorkflowStarted { .. } => "WorkflowStarted",
            EventKind::StepScheduled { .. } => "StepScheduled",
            EventKind::StepStarted { .. } => "StepStarted",
            EventKind::StepCompleted { .. } => "StepCompleted",
            EventKind::StepFailed { .. } => "StepFailed",
            EventKind::StepSkipped { .. } => "StepSkipped",
            EventKind::WorkflowCompleted { .. } => "WorkflowCompleted",
            EventKind::WorkflowFailed { .. } => "WorkflowFailed",
        }
    }

    /// True for events that end the workflow.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::WorkflowCompleted { .. } | EventKind::WorkflowFailed { .. }
        )
    }

    /// The step this event concerns, if any.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            EventKind::StepScheduled { step_id, .. }
            | EventKind::StepStarted { step_id, .. }
            | EventKind::StepCompleted { step_id, .. }
            | EventKind::StepFailed { step_id, .. }
            | EventKind::StepSkipped { step_id, .. } => Some(step_id),
            _ => None,
        }
    }
}

/// A persisted event: payload plus aggregate position.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub workflow_id: WorkflowId,
    pub sequence: Sequence,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl EventRecord {
    /// Aggregate id path, as exposed on subscription frames.
    pub fn aggregate_path(&self) -> Vec<String> {
        vec!["wf".to_string(), self.workflow_id.clone()]
    }
}
