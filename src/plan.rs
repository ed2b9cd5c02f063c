//! Plan validation and the goal-directed frontier resolver.
//!
//! A plan is a bipartite dataflow graph: steps produce named
//! attributes, steps consume named attributes. Attribute names have a
//! unique producer, so the graph collapses to step → step edges for
//! cycle checking. Resolution is lazy: only steps reachable backwards
//! from an incomplete goal are ever considered.

use petgraph::algo::is_cyclic_directed;
use petgraph::graphmap::DiGraphMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

use crate::error::EngineError;
use crate::script::{truthy, ScriptEngine};
use crate::types::{
    AttributeName, AttributeRole, ExecutionPlan, Step, StepId, StepStatus, WorkflowState,
};

/// Content hash of a plan. Step maps are insertion-ordered, so equal
/// submissions hash equally.
pub fn plan_hash(plan: &ExecutionPlan) -> String {
    let bytes = serde_json::to_vec(plan).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    format!("{:x}", hasher.finalize())
}

// ═══════════════════════════════════════════════════════════════════════════
// Validation
// ═══════════════════════════════════════════════════════════════════════════

/// Validate a plan at submission. Rejections here are permanent: a
/// plan that passes can only deadlock through skips at runtime.
pub fn validate(plan: &ExecutionPlan) -> Result<(), EngineError> {
    if plan.goals.is_empty() {
        return Err(EngineError::Validation("plan declares no goals".into()));
    }
    for goal in &plan.goals {
        if !plan.steps.contains_key(goal) {
            return Err(EngineError::Validation(format!(
                "goal {goal} is not a plan step"
            )));
        }
    }

    let required: HashSet<&str> = plan.required.iter().map(String::as_str).collect();

    // Attribute names partition into required-inputs and step-outputs;
    // each output has exactly one producer.
    let mut producers: HashMap<&str, &str> = HashMap::new();
    for (id, step) in &plan.steps {
        if id.is_empty() {
            return Err(EngineError::Validation("empty step id".into()));
        }
        if step.id != *id {
            return Err(EngineError::Validation(format!(
                "step keyed {id} declares id {}",
                step.id
            )));
        }
        for (name, attr) in &step.attributes {
            if *name != attr.name {
                return Err(EngineError::Validation(format!(
                    "step {id}: attribute keyed {name} declares name {}",
                    attr.name
                )));
            }
            if attr.default.is_some() && attr.role != AttributeRole::Optional {
                return Err(EngineError::Validation(format!(
                    "step {id}: attribute {name} declares a default but is not optional"
                )));
            }
            if attr.role == AttributeRole::Output {
                if required.contains(name.as_str()) {
                    return Err(EngineError::Validation(format!(
                        "attribute {name} is both a required input and an output of step {id}"
                    )));
                }
                if let Some(prev) = producers.insert(name, id) {
                    return Err(EngineError::Validation(format!(
                        "attribute {name} produced by both {prev} and {id}"
                    )));
                }
            }
        }
    }

    // Every non-optional input must be satisfiable.
    for (id, step) in &plan.steps {
        for attr in step.inputs_with_role(AttributeRole::Required) {
            let name = attr.name.as_str();
            if !required.contains(name) && !producers.contains_key(name) {
                return Err(EngineError::Validation(format!(
                    "step {id}: required input {name} has no producer and is not a plan input"
                )));
            }
        }
    }

    // Producer → consumer edges must form a DAG.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for id in plan.steps.keys() {
        graph.add_node(id.as_str());
    }
    for (id, step) in &plan.steps {
        for attr in step.attributes.values() {
            if attr.role != AttributeRole::Output {
                if let Some(producer) = producers.get(attr.name.as_str()) {
                    graph.add_edge(*producer, id.as_str(), ());
                }
            }
        }
    }
    if is_cyclic_directed(&graph) {
        return Err(EngineError::Validation(
            "plan dataflow graph contains a cycle".into(),
        ));
    }

    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Resolution
// ═══════════════════════════════════════════════════════════════════════════

/// Smallest step set that still has to make progress for the goals:
/// incomplete goals plus, transitively, the producers of every
/// missing required input of a pending/running member. Listed in plan
/// insertion order.
pub fn needed(plan: &ExecutionPlan, state: &WorkflowState) -> Vec<StepId> {
    let mut member: HashSet<&str> = HashSet::new();
    let mut stack: Vec<&str> = Vec::new();

    for goal in &plan.goals {
        let completed = state
            .execution(goal)
            .map(|e| e.status == StepStatus::Completed)
            .unwrap_or(false);
        if !completed && member.insert(goal) {
            stack.push(goal);
        }
    }

    while let Some(id) = stack.pop() {
        let Some(step) = plan.steps.get(id) else { continue };
        let status = state
            .execution(id)
            .map(|e| e.status)
            .unwrap_or(StepStatus::Pending);
        // Only steps that can still run pull their inputs in.
        if !matches!(status, StepStatus::Pending | StepStatus::Running) {
            continue;
        }
        for attr in step.inputs_with_role(AttributeRole::Required) {
            if state.args.contains_key(&attr.name) {
                continue;
            }
            if let Some(producer) = plan.producer_of(&attr.name) {
                if member.insert(&producer.id) {
                    stack.push(&producer.id);
                }
            }
        }
    }

    plan.steps
        .keys()
        .filter(|id| member.contains(id.as_str()))
        .cloned()
        .collect()
}

/// The currently runnable subset of `needed`, plus steps whose
/// predicate gates them out this pass.
#[derive(Debug, Default)]
pub struct Frontier {
    /// Pending steps whose inputs are all satisfied, in plan order.
    pub runnable: Vec<StepId>,
    /// Steps whose predicate evaluated false (with the reason).
    pub skips: Vec<(StepId, String)>,
}

impl Frontier {
    pub fn is_empty(&self) -> bool {
        self.runnable.is_empty() && self.skips.is_empty()
    }
}

/// Compute the frontier. Predicates are evaluated against the merged
/// environment including declared optional defaults.
pub fn frontier(
    plan: &ExecutionPlan,
    state: &WorkflowState,
    scripts: &dyn ScriptEngine,
) -> Frontier {
    let mut out = Frontier::default();

    for id in needed(plan, state) {
        let Some(step) = plan.steps.get(&id) else { continue };
        let Some(exec) = state.execution(&id) else { continue };
        // A scheduled step is claimed by some replica for the current
        // attempt; it leaves the frontier until the attempt resolves.
        if exec.status != StepStatus::Pending || exec.scheduled {
            continue;
        }
        let Some(arguments) = step_arguments(step, &state.args) else {
            continue; // a required input is still missing
        };

        if let Some(predicate) = &step.predicate {
            match scripts.evaluate(&predicate.language, &predicate.source, &arguments) {
                Ok(v) if truthy(&v) => {}
                Ok(_) => {
                    out.skips.push((id, "predicate evaluated false".into()));
                    continue;
                }
                Err(e) => {
                    out.skips.push((id, format!("predicate evaluation failed: {e}")));
                    continue;
                }
            }
        }
        out.runnable.push(id);
    }

    out
}

/// The argument environment for one step: every required input, plus
/// optional inputs that are bound or carry a default. `None` when a
/// required input is missing.
pub fn step_arguments(
    step: &Step,
    args: &HashMap<AttributeName, Value>,
) -> Option<HashMap<AttributeName, Value>> {
    let mut out = HashMap::new();
    for attr in step.attributes.values() {
        match attr.role {
            AttributeRole::Required => {
                out.insert(attr.name.clone(), args.get(&attr.name)?.clone());
            }
            AttributeRole::Optional => {
                if let Some(v) = args.get(&attr.name).or(attr.default.as_ref()) {
                    out.insert(attr.name.clone(), v.clone());
                }
            }
            AttributeRole::Output => {}
        }
    }
    Some(out)
}

/// Terminal evaluation of a workflow that has no runnable frontier.
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    /// All goals completed; carries the plan outputs.
    Completed(HashMap<AttributeName, Value>),
    /// A needed step can never run again.
    Failed(String),
    /// Needed steps remain, nothing is running, nothing can run: an
    /// unsatisfiable plan slipped past submission or was skipped into
    /// a corner.
    Deadlocked(String),
    /// Progress is still possible; keep the control loop going.
    Pending,
}

/// Decide whether the workflow is finished. `frontier_empty` reflects
/// the caller's latest `frontier` computation (runnable and skips both
/// drained).
pub fn evaluate_termination(state: &WorkflowState, frontier_empty: bool) -> Termination {
    let plan = &state.plan;

    let all_goals_done = plan.goals.iter().all(|g| {
        state
            .execution(g)
            .map(|e| e.status == StepStatus::Completed)
            .unwrap_or(false)
    });
    if all_goals_done {
        return Termination::Completed(state.goal_outputs());
    }

    let needed_now = needed(plan, state);

    // A needed step in a dead status can never produce its outputs;
    // attribute producers are unique, so no path routes around it.
    let dead: Vec<&str> = needed_now
        .iter()
        .filter(|id| {
            state
                .execution(id)
                .map(|e| matches!(e.status, StepStatus::Failed | StepStatus::Skipped))
                .unwrap_or(false)
        })
        .map(|id| id.as_str())
        .collect();
    if !dead.is_empty() {
        return Termination::Failed(format!(
            "steps can no longer run: {}",
            dead.join(", ")
        ));
    }

    if !frontier_empty {
        return Termination::Pending;
    }

    let running = needed_now.iter().any(|id| {
        state
            .execution(id)
            .map(|e| e.status == StepStatus::Running)
            .unwrap_or(false)
    });
    if running {
        return Termination::Pending;
    }

    let stuck: Vec<&str> = needed_now.iter().map(|id| id.as_str()).collect();
    Termination::Deadlocked(format!(
        "no runnable step and nothing running; waiting on: {}",
        stuck.join(", ")
    ))
}
