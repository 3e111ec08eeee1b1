//! Planning: turning a task request into a subtask DAG.
//!
//! The planner asks the model provider for a JSON plan under a system
//! prompt that enumerates the capabilities of the currently dispatchable
//! workers. Models wrap JSON in prose, so parsing is tolerant: the first
//! balanced `{…}` or `[…]` block is extracted and everything around it
//! ignored. Unbalanced braces are a parse failure.
//!
//! The parsed [`SubtaskSpec`]s are validated (non-empty, unique names,
//! dependencies referencing known names, acyclic) and materialised into
//! [`Task`] records with freshly minted ids; dependency names are
//! translated to those ids and the numeric 1–10 priority collapses into
//! the four-valued domain. The rest of the orchestrator only ever sees
//! the typed plan, never raw model text.

use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt;

use serde::Deserialize;
use serde_json::Value;

use crate::agentmesh::task::{Task, TaskPriority};

/// One planned subtask, as the model describes it.
#[derive(Debug, Clone, Deserialize)]
pub struct SubtaskSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Capability the subtask should be routed to.
    #[serde(default)]
    pub assigned_to: String,
    /// Dependencies by subtask *name*; translated to ids on materialise.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Numeric priority 1–10.
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub input: Value,
}

fn default_priority() -> i64 {
    5
}

#[derive(Debug, Deserialize)]
struct PlanDocument {
    subtasks: Vec<SubtaskSpec>,
}

/// Errors raised while parsing or validating a plan.
#[derive(Debug, Clone)]
pub enum PlannerError {
    /// No balanced JSON block was found, or it failed to deserialize.
    Unparseable(String),
    /// The plan contained no subtasks.
    EmptyPlan,
    /// Two subtasks share a name.
    DuplicateName(String),
    /// A dependency references a name that is not in the plan.
    UnknownDependency { subtask: String, dependency: String },
    /// The dependency graph contains a cycle.
    CyclicDependencies,
}

impl fmt::Display for PlannerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlannerError::Unparseable(msg) => {
                write!(f, "unparseable planner output: {}", msg)
            }
            PlannerError::EmptyPlan => write!(f, "planner returned an empty subtask list"),
            PlannerError::DuplicateName(name) => {
                write!(f, "plan names subtask '{}' more than once", name)
            }
            PlannerError::UnknownDependency { subtask, dependency } => {
                write!(
                    f,
                    "subtask '{}' depends on unknown subtask '{}'",
                    subtask, dependency
                )
            }
            PlannerError::CyclicDependencies => {
                write!(f, "plan dependencies contain a cycle")
            }
        }
    }
}

impl Error for PlannerError {}

/// System prompt enumerating worker capabilities and demanding the strict
/// JSON plan shape.
pub fn build_planning_prompt(capabilities: &[String]) -> String {
    let capability_list = if capabilities.is_empty() {
        String::from("(none registered)")
    } else {
        capabilities.join(", ")
    };
    format!(
        "You are a task planner for a multi-agent system. Decompose the \
         user's task into subtasks executable by the available workers.\n\n\
         Available worker capabilities: {}\n\n\
         Respond with JSON only, exactly this shape:\n\
         {{\"subtasks\": [{{\"name\": \"unique-name\", \"description\": \"what to do\", \
         \"assigned_to\": \"capability\", \"dependencies\": [\"other-name\"], \
         \"priority\": 5, \"input\": \"payload\"}}]}}\n\n\
         Rules: every assigned_to must be one of the listed capabilities; \
         dependencies reference subtask names from this plan; priority is \
         an integer from 1 (lowest) to 10 (highest).",
        capability_list
    )
}

/// User message for a replanning round, carrying the failure context.
pub fn build_replan_message(original: &str, failed_subtask: &str, error: &str) -> String {
    format!(
        "The previous plan failed. Subtask '{}' ended with: {}\n\n\
         Produce a new plan for the remaining work of the original task:\n{}",
        failed_subtask, error, original
    )
}

/// Extract the first balanced `{…}` or `[…]` block from model output.
///
/// Tracks string literals and escapes so braces inside strings do not
/// count. Returns `None` when no opener exists or the block never closes.
pub fn extract_json_block(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = text.find(|c| c == '{' || c == '[')?;
    let open = bytes[start];
    let close = if open == b'{' { b'}' } else { b']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b if b == open => depth += 1,
            b if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse and validate a plan from raw model output.
pub fn parse_plan(text: &str) -> Result<Vec<SubtaskSpec>, PlannerError> {
    let block = extract_json_block(text)
        .ok_or_else(|| PlannerError::Unparseable(String::from("no balanced JSON block")))?;

    let specs: Vec<SubtaskSpec> = if block.trim_start().starts_with('[') {
        serde_json::from_str(block).map_err(|e| PlannerError::Unparseable(e.to_string()))?
    } else {
        let doc: PlanDocument =
            serde_json::from_str(block).map_err(|e| PlannerError::Unparseable(e.to_string()))?;
        doc.subtasks
    };

    if specs.is_empty() {
        return Err(PlannerError::EmptyPlan);
    }

    let mut names = HashSet::new();
    for spec in &specs {
        if !names.insert(spec.name.clone()) {
            return Err(PlannerError::DuplicateName(spec.name.clone()));
        }
    }
    for spec in &specs {
        for dependency in &spec.dependencies {
            if !names.contains(dependency) {
                return Err(PlannerError::UnknownDependency {
                    subtask: spec.name.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
    }
    if topological_order(&specs).is_none() {
        return Err(PlannerError::CyclicDependencies);
    }
    Ok(specs)
}

/// Kahn's algorithm over subtask names. Returns indices in an order where
/// every dependency precedes its dependents, or `None` on a cycle.
pub fn topological_order(specs: &[SubtaskSpec]) -> Option<Vec<usize>> {
    let index_of: HashMap<&str, usize> = specs
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; specs.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); specs.len()];
    for (i, spec) in specs.iter().enumerate() {
        for dependency in &spec.dependencies {
            let d = *index_of.get(dependency.as_str())?;
            in_degree[i] += 1;
            dependents[d].push(i);
        }
    }

    // Seed in plan order so independent subtasks keep their planned order.
    let mut ready: Vec<usize> = (0..specs.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(specs.len());
    while let Some(i) = ready.first().copied() {
        ready.remove(0);
        order.push(i);
        for &dependent in &dependents[i] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.push(dependent);
            }
        }
    }

    if order.len() == specs.len() {
        Some(order)
    } else {
        None
    }
}

/// Materialise validated specs into ledger-ready tasks with fresh ids.
///
/// Dependency names are translated to the minted ids; the parent task id
/// is stored both on the record and in each subtask's metadata.
pub fn materialize_plan(
    specs: &[SubtaskSpec],
    parent_id: &str,
    created_by: &str,
) -> Vec<Task> {
    // Mint every id up front: dependencies may name subtasks that appear
    // later in plan order.
    let mut tasks: Vec<Task> = specs
        .iter()
        .map(|spec| {
            Task::new(spec.name.clone(), spec.description.clone(), created_by)
                .with_type(spec.assigned_to.clone())
                .with_priority(TaskPriority::from_numeric(spec.priority))
                .with_input(spec.input.clone())
                .with_parent(parent_id)
                .with_metadata("parent_task_id", parent_id)
        })
        .collect();

    let ids: HashMap<&str, String> = specs
        .iter()
        .zip(tasks.iter())
        .map(|(spec, task)| (spec.name.as_str(), task.id.clone()))
        .collect();

    for (spec, task) in specs.iter().zip(tasks.iter_mut()) {
        for dependency in &spec.dependencies {
            if let Some(dep_id) = ids.get(dependency.as_str()) {
                task.dependencies.insert(dep_id.clone());
            }
        }
    }
    tasks
}
