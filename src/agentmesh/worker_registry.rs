//! Worker registry and selection scoring.
//!
//! The registry owns the runtime record of every registered worker: its
//! role, capability set, status, and priority. Selection for a task
//! filters out Offline/Failed workers and scores the rest:
//!
//! ```text
//! score = base
//!       + 20 if the worker's capabilities contain the task type
//!       + 10 if the worker is a Specialist
//!       +  5 if the worker is Idle
//!       + worker priority
//! ```
//!
//! Ties resolve to the lexicographically smallest agent id: candidates
//! are sorted by id before scoring, so selection is deterministic across
//! runs rather than dependent on map iteration order. A task already
//! assigned to a live worker sticks to that worker.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::agentmesh::task::Task;

/// Coarse role a worker plays in the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerRole {
    Generalist,
    Specialist,
    Coordinator,
}

/// Runtime availability of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Offline,
    Failed,
}

impl WorkerStatus {
    /// Offline and Failed workers are never dispatched to.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, WorkerStatus::Idle | WorkerStatus::Busy)
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStatus::Idle => write!(f, "idle"),
            WorkerStatus::Busy => write!(f, "busy"),
            WorkerStatus::Offline => write!(f, "offline"),
            WorkerStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Runtime record of a registered worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub agent_id: String,
    pub role: WorkerRole,
    pub capabilities: HashSet<String>,
    pub status: WorkerStatus,
    pub priority: i64,
    pub registered_at: DateTime<Utc>,
}

impl WorkerInfo {
    /// An idle generalist with no capabilities and zero priority.
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            role: WorkerRole::Generalist,
            capabilities: HashSet::new(),
            status: WorkerStatus::Idle,
            priority: 0,
            registered_at: Utc::now(),
        }
    }

    /// Set the role (builder pattern).
    pub fn with_role(mut self, role: WorkerRole) -> Self {
        self.role = role;
        self
    }

    /// Add one capability (builder pattern).
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    /// Set the priority (builder pattern).
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

/// Owns worker records and implements selection.
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, WorkerInfo>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
        }
    }

    /// Register or replace a worker record.
    pub async fn register(&self, worker: WorkerInfo) {
        log::info!(
            "registering worker '{}' (role {:?}, {} capabilities)",
            worker.agent_id,
            worker.role,
            worker.capabilities.len()
        );
        self.workers
            .write()
            .await
            .insert(worker.agent_id.clone(), worker);
    }

    /// Remove a worker; returns whether it was registered.
    pub async fn unregister(&self, agent_id: &str) -> bool {
        self.workers.write().await.remove(agent_id).is_some()
    }

    /// Fetch one worker record.
    pub async fn get(&self, agent_id: &str) -> Option<WorkerInfo> {
        self.workers.read().await.get(agent_id).cloned()
    }

    /// All workers, sorted by agent id.
    pub async fn list(&self) -> Vec<WorkerInfo> {
        let mut workers: Vec<WorkerInfo> =
            self.workers.read().await.values().cloned().collect();
        workers.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        workers
    }

    /// Update a worker's status; returns false if the worker is unknown.
    pub async fn update_status(&self, agent_id: &str, status: WorkerStatus) -> bool {
        match self.workers.write().await.get_mut(agent_id) {
            Some(worker) => {
                worker.status = status;
                true
            }
            None => false,
        }
    }

    /// Capability names across every dispatchable worker, sorted and
    /// deduplicated. Feeds the planner's system prompt.
    pub async fn available_capabilities(&self) -> Vec<String> {
        let workers = self.workers.read().await;
        let mut capabilities: Vec<String> = workers
            .values()
            .filter(|w| w.status.is_dispatchable())
            .flat_map(|w| w.capabilities.iter().cloned())
            .collect();
        capabilities.sort();
        capabilities.dedup();
        capabilities
    }

    fn score(worker: &WorkerInfo, task: &Task) -> i64 {
        let mut score: i64 = 1;
        if worker.capabilities.contains(&task.task_type) {
            score += 20;
        }
        if worker.role == WorkerRole::Specialist {
            score += 10;
        }
        if worker.status == WorkerStatus::Idle {
            score += 5;
        }
        score + worker.priority
    }

    /// Pick the best worker for a task, or `None` when no dispatchable
    /// worker exists.
    ///
    /// Selection is sticky: a task already assigned to a live worker is
    /// returned to that worker. Otherwise candidates are scored and ties
    /// break on the smallest agent id (a documented, deterministic choice).
    pub async fn select_worker(&self, task: &Task) -> Option<WorkerInfo> {
        let workers = self.workers.read().await;

        if let Some(assigned) = &task.assigned_to {
            if let Some(worker) = workers.get(assigned) {
                if worker.status.is_dispatchable() {
                    return Some(worker.clone());
                }
            }
        }

        let mut candidates: Vec<&WorkerInfo> = workers
            .values()
            .filter(|w| w.status.is_dispatchable())
            .collect();
        candidates.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));

        let mut best: Option<(&WorkerInfo, i64)> = None;
        for worker in candidates {
            let score = Self::score(worker, task);
            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((worker, score)),
            }
        }
        best.map(|(worker, _)| worker.clone())
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn research_task() -> Task {
        Task::new("r", "research things", "orch").with_type("research")
    }

    #[tokio::test]
    async fn offline_and_failed_workers_are_filtered() {
        let registry = WorkerRegistry::new();
        registry
            .register(
                WorkerInfo::new("down")
                    .with_capability("research")
                    .with_priority(100),
            )
            .await;
        registry.update_status("down", WorkerStatus::Offline).await;
        registry
            .register(WorkerInfo::new("broken").with_capability("research"))
            .await;
        registry.update_status("broken", WorkerStatus::Failed).await;
        registry.register(WorkerInfo::new("up")).await;

        let selected = registry.select_worker(&research_task()).await.unwrap();
        assert_eq!(selected.agent_id, "up");
    }

    #[tokio::test]
    async fn capability_match_outweighs_role_and_status() {
        let registry = WorkerRegistry::new();
        registry
            .register(WorkerInfo::new("matching").with_capability("research"))
            .await;
        registry
            .register(
                WorkerInfo::new("specialist-idle")
                    .with_role(WorkerRole::Specialist)
                    .with_priority(3),
            )
            .await;

        let selected = registry.select_worker(&research_task()).await.unwrap();
        assert_eq!(selected.agent_id, "matching");
    }

    #[tokio::test]
    async fn specialist_and_idle_bonuses_apply() {
        let registry = WorkerRegistry::new();
        registry
            .register(
                WorkerInfo::new("busy-generalist").with_capability("research"),
            )
            .await;
        registry.update_status("busy-generalist", WorkerStatus::Busy).await;
        registry
            .register(
                WorkerInfo::new("idle-specialist")
                    .with_role(WorkerRole::Specialist)
                    .with_capability("research"),
            )
            .await;

        let selected = registry.select_worker(&research_task()).await.unwrap();
        assert_eq!(selected.agent_id, "idle-specialist");
    }

    #[tokio::test]
    async fn ties_break_on_smallest_agent_id() {
        let registry = WorkerRegistry::new();
        for id in ["charlie", "alice", "bob"] {
            registry
                .register(WorkerInfo::new(id).with_capability("research"))
                .await;
        }
        let selected = registry.select_worker(&research_task()).await.unwrap();
        assert_eq!(selected.agent_id, "alice");
    }

    #[tokio::test]
    async fn sticky_assignment_to_a_live_worker() {
        let registry = WorkerRegistry::new();
        registry
            .register(WorkerInfo::new("alice").with_capability("research"))
            .await;
        registry.register(WorkerInfo::new("bob")).await;

        let mut task = research_task();
        task.assigned_to = Some("bob".to_string());
        let selected = registry.select_worker(&task).await.unwrap();
        assert_eq!(selected.agent_id, "bob");

        // A dead assignee falls back to scoring.
        registry.update_status("bob", WorkerStatus::Offline).await;
        let selected = registry.select_worker(&task).await.unwrap();
        assert_eq!(selected.agent_id, "alice");
    }

    #[tokio::test]
    async fn no_dispatchable_worker_yields_none() {
        let registry = WorkerRegistry::new();
        assert!(registry.select_worker(&research_task()).await.is_none());

        registry.register(WorkerInfo::new("w")).await;
        registry.update_status("w", WorkerStatus::Offline).await;
        assert!(registry.select_worker(&research_task()).await.is_none());
    }

    #[tokio::test]
    async fn available_capabilities_are_sorted_and_deduped() {
        let registry = WorkerRegistry::new();
        registry
            .register(
                WorkerInfo::new("a")
                    .with_capability("research")
                    .with_capability("writing"),
            )
            .await;
        registry
            .register(WorkerInfo::new("b").with_capability("research"))
            .await;
        registry
            .register(WorkerInfo::new("c").with_capability("hidden"))
            .await;
        registry.update_status("c", WorkerStatus::Offline).await;

        assert_eq!(
            registry.available_capabilities().await,
            vec!["research".to_string(), "writing".to_string()]
        );
    }
}
