//! Task domain types.
//!
//! A [`Task`] is one node of a subtask DAG: it carries its dependencies by
//! id, an input payload, and the status machine the ledger enforces:
//!
//! ```text
//! Pending ─▶ Assigned ─▶ Running ─▶ Completed
//!    │           │           ├────▶ Failed
//!    │           │           └────▶ Cancelled
//!    └───────────┴─▶ Failed / Cancelled
//! ```
//!
//! Completed, Failed, and Cancelled are absorbing.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Scheduling priority of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    /// Collapse a planner's 1–10 numeric priority into the four-valued
    /// domain: ≥9 Critical, ≥7 High, ≥4 Normal, else Low.
    pub fn from_numeric(priority: i64) -> Self {
        if priority >= 9 {
            TaskPriority::Critical
        } else if priority >= 7 {
            TaskPriority::High
        } else if priority >= 4 {
            TaskPriority::Normal
        } else {
            TaskPriority::Low
        }
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal states absorb: no transition leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether `self → next` is a legal transition. A no-op transition to
    /// the same status is always legal for non-terminal states.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if *self == next {
            return true;
        }
        match self {
            TaskStatus::Pending => matches!(
                next,
                TaskStatus::Assigned | TaskStatus::Failed | TaskStatus::Cancelled
            ),
            TaskStatus::Assigned => matches!(
                next,
                TaskStatus::Running
                    | TaskStatus::Completed
                    | TaskStatus::Failed
                    | TaskStatus::Cancelled
            ),
            TaskStatus::Running => matches!(
                next,
                TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
            ),
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Assigned => write!(f, "assigned"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One node of a subtask DAG, owned by the task ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// The user-level task this subtask was planned from, if any.
    pub parent_id: Option<String>,
    pub name: String,
    pub description: String,
    /// Free-form type tag, matched against worker capabilities.
    pub task_type: String,
    pub priority: TaskPriority,
    /// Id of the component that created the task (orchestrator id for
    /// planned subtasks).
    pub created_by: String,
    /// Worker the task is currently assigned to.
    pub assigned_to: Option<String>,
    pub input: Value,
    pub status: TaskStatus,
    /// Ids of tasks that must complete before this one is dispatched.
    pub dependencies: HashSet<String>,
    pub output: Value,
    pub error: Option<String>,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a pending task with a fresh id.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        created_by: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: None,
            name: name.into(),
            description: description.into(),
            task_type: String::from("general"),
            priority: TaskPriority::Normal,
            created_by: created_by.into(),
            assigned_to: None,
            input: Value::Null,
            status: TaskStatus::Pending,
            dependencies: HashSet::new(),
            output: Value::Null,
            error: None,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the type tag (builder pattern).
    pub fn with_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = task_type.into();
        self
    }

    /// Set the priority (builder pattern).
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the input payload (builder pattern).
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    /// Add a dependency by task id (builder pattern).
    pub fn with_dependency(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.insert(dependency.into());
        self
    }

    /// Set the parent task id (builder pattern).
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Attach a metadata entry (builder pattern).
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A user-submitted request the orchestrator plans and executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub task_type: String,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl TaskRequest {
    /// A request with default type, priority, and empty input.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            task_type: String::from("general"),
            priority: TaskPriority::Normal,
            input: Value::Null,
            metadata: HashMap::new(),
        }
    }

    /// Set the input payload (builder pattern).
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    /// Set the priority (builder pattern).
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// The aggregated outcome of a driven task DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: String,
    /// Map of subtask id → subtask output.
    pub output: Value,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}
