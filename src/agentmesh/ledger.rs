//! Task and progress ledgers.
//!
//! The task ledger is the authoritative owner of [`Task`] records: every
//! status change flows through it and is checked against the legal
//! transition graph, dependency references are verified at creation, and
//! terminal states can never be overwritten. The progress ledger is an
//! append-only log of [`ProgressEntry`] records, totally ordered per task.
//!
//! Both are traits so deployments can persist them externally; the
//! in-process implementations guard plain maps with reader-writer locks.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::agentmesh::task::{Task, TaskStatus};

/// Errors raised by ledger operations.
#[derive(Debug, Clone)]
pub enum LedgerError {
    /// No task with the given id.
    TaskNotFound(String),
    /// A dependency id does not name an existing task.
    UnknownDependency { task: String, dependency: String },
    /// The requested status change is not a legal transition.
    IllegalTransition {
        task: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    /// Create was called with an id that already exists.
    DuplicateTask(String),
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::TaskNotFound(id) => write!(f, "task not found: {}", id),
            LedgerError::UnknownDependency { task, dependency } => {
                write!(f, "task {} depends on unknown task {}", task, dependency)
            }
            LedgerError::IllegalTransition { task, from, to } => {
                write!(f, "illegal transition for task {}: {} -> {}", task, from, to)
            }
            LedgerError::DuplicateTask(id) => write!(f, "task already exists: {}", id),
        }
    }
}

impl Error for LedgerError {}

/// Authoritative store of task records.
#[async_trait]
pub trait TaskLedger: Send + Sync {
    /// Insert a new task. Its dependencies must already exist in the
    /// ledger, which also keeps the dependency graph acyclic: a task can
    /// only reference tasks created before it.
    async fn create_task(&self, task: Task) -> Result<(), LedgerError>;

    /// Replace a task's record. The status change from the stored record
    /// to the new one must be legal.
    async fn update_task(&self, task: Task) -> Result<(), LedgerError>;

    /// Fetch a task by id.
    async fn get_task(&self, id: &str) -> Result<Task, LedgerError>;

    /// Transition a task to Completed with its output payload.
    async fn complete_task(&self, id: &str, output: Value) -> Result<(), LedgerError>;

    /// Transition a task to Failed with an error message.
    async fn fail_task(&self, id: &str, error: &str) -> Result<(), LedgerError>;

    /// Every task currently in the ledger.
    async fn list_tasks(&self) -> Vec<Task>;
}

/// One record in the append-only progress log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub task_id: String,
    pub agent_id: String,
    /// What happened, e.g. `planning`, `execute`, `retry`.
    pub action: String,
    pub description: String,
    pub output: Value,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEntry {
    /// A progress record stamped with the current time.
    pub fn new(
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
        action: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            action: action.into(),
            description: description.into(),
            output: Value::Null,
            status: String::from("completed"),
            timestamp: Utc::now(),
        }
    }

    /// Attach a structured output blob (builder pattern).
    pub fn with_output(mut self, output: Value) -> Self {
        self.output = output;
        self
    }

    /// Override the status string (builder pattern).
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }
}

/// Append-only log of progress entries.
#[async_trait]
pub trait ProgressLedger: Send + Sync {
    /// Append one entry.
    async fn add_entry(&self, entry: ProgressEntry);

    /// Entries for a task in append order.
    async fn query(&self, task_id: &str) -> Vec<ProgressEntry>;
}

/// In-process task ledger: a map behind a reader-writer lock.
pub struct InMemoryTaskLedger {
    tasks: RwLock<HashMap<String, Task>>,
}

impl InMemoryTaskLedger {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryTaskLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskLedger for InMemoryTaskLedger {
    async fn create_task(&self, task: Task) -> Result<(), LedgerError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(LedgerError::DuplicateTask(task.id));
        }
        for dependency in &task.dependencies {
            if !tasks.contains_key(dependency) {
                return Err(LedgerError::UnknownDependency {
                    task: task.id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
        tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn update_task(&self, mut task: Task) -> Result<(), LedgerError> {
        let mut tasks = self.tasks.write().await;
        let stored = tasks
            .get(&task.id)
            .ok_or_else(|| LedgerError::TaskNotFound(task.id.clone()))?;
        if !stored.status.can_transition_to(task.status) {
            return Err(LedgerError::IllegalTransition {
                task: task.id.clone(),
                from: stored.status,
                to: task.status,
            });
        }
        task.updated_at = Utc::now();
        tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Task, LedgerError> {
        self.tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| LedgerError::TaskNotFound(id.to_string()))
    }

    async fn complete_task(&self, id: &str, output: Value) -> Result<(), LedgerError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| LedgerError::TaskNotFound(id.to_string()))?;
        if !task.status.can_transition_to(TaskStatus::Completed) {
            return Err(LedgerError::IllegalTransition {
                task: id.to_string(),
                from: task.status,
                to: TaskStatus::Completed,
            });
        }
        task.status = TaskStatus::Completed;
        task.output = output;
        task.error = None;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn fail_task(&self, id: &str, error: &str) -> Result<(), LedgerError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| LedgerError::TaskNotFound(id.to_string()))?;
        if !task.status.can_transition_to(TaskStatus::Failed) {
            return Err(LedgerError::IllegalTransition {
                task: id.to_string(),
                from: task.status,
                to: TaskStatus::Failed,
            });
        }
        task.status = TaskStatus::Failed;
        task.error = Some(error.to_string());
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn list_tasks(&self) -> Vec<Task> {
        self.tasks.read().await.values().cloned().collect()
    }
}

/// In-process progress ledger.
pub struct InMemoryProgressLedger {
    entries: RwLock<Vec<ProgressEntry>>,
}

impl InMemoryProgressLedger {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryProgressLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProgressLedger for InMemoryProgressLedger {
    async fn add_entry(&self, entry: ProgressEntry) {
        self.entries.write().await.push(entry);
    }

    async fn query(&self, task_id: &str) -> Vec<ProgressEntry> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|entry| entry.task_id == task_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentmesh::task::TaskStatus;
    use serde_json::json;

    fn task(name: &str) -> Task {
        Task::new(name, format!("{} description", name), "tester")
    }

    #[tokio::test]
    async fn create_get_round_trip() {
        let ledger = InMemoryTaskLedger::new();
        let t = task("a");
        let id = t.id.clone();
        ledger.create_task(t).await.unwrap();

        let fetched = ledger.get_task(&id).await.unwrap();
        assert_eq!(fetched.name, "a");
        assert_eq!(fetched.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let ledger = InMemoryTaskLedger::new();
        let t = task("a");
        ledger.create_task(t.clone()).await.unwrap();
        let err = ledger.create_task(t).await.unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateTask(_)));
    }

    #[tokio::test]
    async fn unknown_dependency_is_rejected() {
        let ledger = InMemoryTaskLedger::new();
        let t = task("a").with_dependency("missing");
        let err = ledger.create_task(t).await.unwrap_err();
        assert!(matches!(err, LedgerError::UnknownDependency { .. }));
    }

    #[tokio::test]
    async fn dependencies_must_predate_the_task() {
        let ledger = InMemoryTaskLedger::new();
        let a = task("a");
        let a_id = a.id.clone();
        ledger.create_task(a).await.unwrap();

        let b = task("b").with_dependency(a_id);
        ledger.create_task(b).await.unwrap();
    }

    #[tokio::test]
    async fn status_walk_through_the_legal_graph() {
        let ledger = InMemoryTaskLedger::new();
        let mut t = task("a");
        let id = t.id.clone();
        ledger.create_task(t.clone()).await.unwrap();

        t.status = TaskStatus::Assigned;
        t.assigned_to = Some("worker-1".to_string());
        ledger.update_task(t.clone()).await.unwrap();

        t.status = TaskStatus::Running;
        ledger.update_task(t.clone()).await.unwrap();

        ledger.complete_task(&id, json!({"answer": 42})).await.unwrap();
        let done = ledger.get_task(&id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.output["answer"], 42);
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let ledger = InMemoryTaskLedger::new();
        let mut t = task("a");
        ledger.create_task(t.clone()).await.unwrap();

        t.status = TaskStatus::Running; // Pending -> Running skips Assigned
        let err = ledger.update_task(t).await.unwrap_err();
        assert!(matches!(err, LedgerError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn terminal_states_cannot_be_overwritten() {
        let ledger = InMemoryTaskLedger::new();
        let t = task("a");
        let id = t.id.clone();
        ledger.create_task(t.clone()).await.unwrap();
        ledger.fail_task(&id, "boom").await.unwrap();

        let err = ledger.complete_task(&id, json!({})).await.unwrap_err();
        assert!(matches!(err, LedgerError::IllegalTransition { .. }));

        let stored = ledger.get_task(&id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn progress_entries_are_ordered_per_task() {
        let ledger = InMemoryProgressLedger::new();
        for i in 0..3 {
            ledger
                .add_entry(
                    ProgressEntry::new("t1", "agent-1", "execute", format!("step {}", i))
                        .with_output(json!({"step": i})),
                )
                .await;
        }
        ledger
            .add_entry(ProgressEntry::new("t2", "agent-1", "execute", "other"))
            .await;

        let entries = ledger.query("t1").await;
        assert_eq!(entries.len(), 3);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.output["step"], i);
        }
    }
}
