//! Pure reduction of an event sequence into a `WorkflowState`.
//!
//! `project` folds a full event slice from a zero state; `apply`
//! advances an existing state by one event. Projecting the whole log
//! must equal incrementally applying each event to the previous
//! state — the orchestrator relies on that to cache snapshots.

use crate::error::EngineError;
use crate::events::{EventKind, EventRecord};
use crate::types::{StepExecution, StepStatus, WorkflowState, WorkflowStatus};

/// Fold a complete event sequence into a state snapshot. The first
/// event must be `WorkflowStarted`.
pub fn project(events: &[EventRecord]) -> Result<WorkflowState, EngineError> {
    let Some((first, rest)) = events.split_first() else {
        return Err(EngineError::InconsistentState(
            "cannot project an empty event sequence".into(),
        ));
    };
    let mut state = initial_state(first)?;
    for record in rest {
        state = apply(state, record)?;
    }
    Ok(state)
}

/// Construct the zero state from the aggregate's first event.
pub fn initial_state(record: &EventRecord) -> Result<WorkflowState, EngineError> {
    let EventKind::WorkflowStarted {
        plan,
        plan_hash,
        args,
        metadata,
    } = &record.kind
    else {
        return Err(EngineError::InconsistentState(format!(
            "first event of {} is {}, expected WorkflowStarted",
            record.workflow_id,
            record.kind.name()
        )));
    };

    let executions = plan
        .steps
        .keys()
        .map(|id| (id.clone(), StepExecution::new(id)))
        .collect();

    Ok(WorkflowState {
        id: record.workflow_id.clone(),
        plan_hash: plan_hash.clone(),
        status: WorkflowStatus::Running,
        plan: plan.clone(),
        args: args.clone(),
        executions,
        version: record.sequence,
        metadata: metadata.clone(),
        started_at: record.timestamp,
        ended_at: None,
    })
}

/// Apply one event to a state snapshot, yielding the next snapshot.
pub fn apply(mut state: WorkflowState, record: &EventRecord) -> Result<WorkflowState, EngineError> {
    if record.sequence != state.version + 1 {
        return Err(EngineError::InconsistentState(format!(
            "event sequence {} applied to state at version {}",
            record.sequence, state.version
        )));
    }

    match &record.kind {
        EventKind::WorkflowStarted { .. } => {
            return Err(EngineError::InconsistentState(format!(
                "duplicate WorkflowStarted at sequence {}",
                record.sequence
            )));
        }

        EventKind::StepScheduled { step_id, attempt } => {
            let at = record.timestamp;
            let exec = execution_mut(&mut state, step_id)?;
            exec.status = StepStatus::Pending;
            exec.attempts = *attempt;
            exec.scheduled = true;
            exec.scheduled_at = Some(at);
            exec.started_at = None;
            exec.ended_at = None;
        }

        EventKind::StepStarted { step_id, at, .. } => {
            let exec = execution_mut(&mut state, step_id)?;
            exec.status = StepStatus::Running;
            exec.started_at = Some(*at);
        }

        EventKind::StepCompleted {
            step_id,
            outputs,
            at,
            ..
        } => {
            let exec = execution_mut(&mut state, step_id)?;
            exec.status = StepStatus::Completed;
            exec.scheduled = false;
            exec.ended_at = Some(*at);
            exec.outputs = outputs.clone();
            for (name, value) in outputs {
                if state.args.contains_key(name) {
                    return Err(EngineError::InconsistentState(format!(
                        "attribute {name} produced twice (step {step_id})"
                    )));
                }
                state.args.insert(name.clone(), value.clone());
            }
        }

        EventKind::StepFailed {
            step_id,
            error,
            will_retry,
            at,
            ..
        } => {
            let exec = execution_mut(&mut state, step_id)?;
            exec.last_error = Some(error.clone());
            exec.ended_at = Some(*at);
            exec.scheduled = false;
            exec.status = if *will_retry {
                StepStatus::Pending
            } else {
                StepStatus::Failed
            };
        }

        EventKind::StepSkipped { step_id, reason } => {
            let exec = execution_mut(&mut state, step_id)?;
            exec.status = StepStatus::Skipped;
            exec.scheduled = false;
            exec.last_error = Some(reason.clone());
        }

        EventKind::WorkflowCompleted { at, .. } => {
            state.status = WorkflowStatus::Completed;
            state.ended_at = Some(*at);
        }

        EventKind::WorkflowFailed { at, .. } => {
            state.status = WorkflowStatus::Failed;
            state.ended_at = Some(*at);
        }
    }

    state.version = record.sequence;
    Ok(state)
}

fn execution_mut<'a>(
    state: &'a mut WorkflowState,
    step_id: &str,
) -> Result<&'a mut StepExecution, EngineError> {
    let workflow_id = state.id.clone();
    state.executions.get_mut(step_id).ok_or_else(|| {
        EngineError::InconsistentState(format!(
            "event references step {step_id} absent from plan of {workflow_id}"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use chrono::Utc;
    use indexmap::IndexMap;
    use serde_json::json;
    use std::collections::HashMap;

    fn script_step(id: &str, outputs: &[&str], inputs: &[&str]) -> Step {
        let mut attributes = IndexMap::new();
        for name in inputs {
            attributes.insert(
                name.to_string(),
                Attribute {
                    name: name.to_string(),
                    attr_type: AttributeType::String,
                    role: AttributeRole::Required,
                    default: None,
                },
            );
        }
        for name in outputs {
            attributes.insert(
                name.to_string(),
                Attribute {
                    name: name.to_string(),
                    attr_type: AttributeType::String,
                    role: AttributeRole::Output,
                    default: None,
                },
            );
        }
        Step {
            id: id.to_string(),
            name: id.to_string(),
            version: "1".into(),
            transport: StepTransport::Script {
                script: ScriptConfig {
                    language: "expr".into(),
                    source: "true".into(),
                },
            },
            attributes,
            predicate: None,
            retry: RetryPolicy::default(),
        }
    }

    fn two_step_plan() -> ExecutionPlan {
        ExecutionPlan {
            goals: vec!["b".into()],
            required: vec!["seed".into()],
            steps: IndexMap::from([
                ("a".to_string(), script_step("a", &["x"], &["seed"])),
                ("b".to_string(), script_step("b", &["y"], &["x"])),
            ]),
        }
    }

    fn record(seq: u64, kind: EventKind) -> EventRecord {
        EventRecord {
            workflow_id: "wf".into(),
            sequence: seq,
            timestamp: Utc::now(),
            kind,
        }
    }

    fn started_record() -> EventRecord {
        record(
            1,
            EventKind::WorkflowStarted {
                plan: two_step_plan(),
                plan_hash: "h".into(),
                args: HashMap::from([("seed".to_string(), json!("s"))]),
                metadata: HashMap::new(),
            },
        )
    }

    #[test]
    fn started_initializes_every_step_pending() {
        let state = project(&[started_record()]).unwrap();
        assert_eq!(state.status, WorkflowStatus::Running);
        assert_eq!(state.version, 1);
        assert_eq!(state.args["seed"], json!("s"));
        assert!(state
            .executions
            .values()
            .all(|e| e.status == StepStatus::Pending && e.attempts == 0));
    }

    #[test]
    fn completed_step_merges_outputs_into_environment() {
        let events = vec![
            started_record(),
            record(2, EventKind::StepScheduled { step_id: "a".into(), attempt: 1 }),
            record(3, EventKind::StepStarted { step_id: "a".into(), attempt: 1, at: Utc::now() }),
            record(
                4,
                EventKind::StepCompleted {
                    step_id: "a".into(),
                    attempt: 1,
                    outputs: HashMap::from([("x".to_string(), json!("v"))]),
                    at: Utc::now(),
                },
            ),
        ];
        let state = project(&events).unwrap();
        assert_eq!(state.args["x"], json!("v"));
        assert_eq!(state.executions["a"].status, StepStatus::Completed);
        assert_eq!(state.version, 4);
    }

    #[test]
    fn duplicate_attribute_production_is_inconsistent() {
        let events = vec![
            started_record(),
            record(2, EventKind::StepScheduled { step_id: "a".into(), attempt: 1 }),
            record(
                3,
                EventKind::StepCompleted {
                    step_id: "a".into(),
                    attempt: 1,
                    // "seed" is already bound as a required input.
                    outputs: HashMap::from([("seed".to_string(), json!("clash"))]),
                    at: Utc::now(),
                },
            ),
        ];
        let err = project(&events).unwrap_err();
        assert!(matches!(err, EngineError::InconsistentState(_)));
    }

    #[test]
    fn failed_with_retry_returns_step_to_pending() {
        let events = vec![
            started_record(),
            record(2, EventKind::StepScheduled { step_id: "a".into(), attempt: 1 }),
            record(3, EventKind::StepStarted { step_id: "a".into(), attempt: 1, at: Utc::now() }),
            record(
                4,
                EventKind::StepFailed {
                    step_id: "a".into(),
                    attempt: 1,
                    error: "boom".into(),
                    will_retry: true,
                    at: Utc::now(),
                },
            ),
        ];
        let state = project(&events).unwrap();
        let exec = &state.executions["a"];
        assert_eq!(exec.status, StepStatus::Pending);
        assert_eq!(exec.attempts, 1);
        assert_eq!(exec.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn failed_without_retry_is_terminal_for_the_step() {
        let events = vec![
            started_record(),
            record(2, EventKind::StepScheduled { step_id: "a".into(), attempt: 3 }),
            record(
                3,
                EventKind::StepFailed {
                    step_id: "a".into(),
                    attempt: 3,
                    error: "boom".into(),
                    will_retry: false,
                    at: Utc::now(),
                },
            ),
        ];
        let state = project(&events).unwrap();
        assert_eq!(state.executions["a"].status, StepStatus::Failed);
    }

    #[test]
    fn projection_is_a_fold_homomorphism() {
        let events = vec![
            started_record(),
            record(2, EventKind::StepScheduled { step_id: "a".into(), attempt: 1 }),
            record(3, EventKind::StepStarted { step_id: "a".into(), attempt: 1, at: Utc::now() }),
            record(
                4,
                EventKind::StepCompleted {
                    step_id: "a".into(),
                    attempt: 1,
                    outputs: HashMap::from([("x".to_string(), json!("v"))]),
                    at: Utc::now(),
                },
            ),
            record(5, EventKind::StepScheduled { step_id: "b".into(), attempt: 1 }),
        ];

        // project(e1..eN) == apply(project(e1..eN-1), eN) for every prefix.
        for n in 2..=events.len() {
            let full = project(&events[..n]).unwrap();
            let prefix = project(&events[..n - 1]).unwrap();
            let stepped = apply(prefix, &events[n - 1]).unwrap();
            assert_eq!(full, stepped, "prefix length {n}");
        }
    }

    #[test]
    fn sequence_gap_is_rejected() {
        let state = project(&[started_record()]).unwrap();
        let err = apply(
            state,
            &record(5, EventKind::StepScheduled { step_id: "a".into(), attempt: 1 }),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InconsistentState(_)));
    }

    #[test]
    fn workflow_terminal_events_set_status() {
        let events = vec![
            started_record(),
            record(
                2,
                EventKind::WorkflowFailed {
                    at: Utc::now(),
                    error: "cancelled".into(),
                },
            ),
        ];
        let state = project(&events).unwrap();
        assert_eq!(state.status, WorkflowStatus::Failed);
        assert!(state.ended_at.is_some());
    }
}
