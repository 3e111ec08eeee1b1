//! Persistence interface for agents, metrics, and activities.
//!
//! The runtime persists three families of records: agent definitions,
//! per-agent execution metrics, and an activity audit log. [`Storage`] is
//! the plug-in point: [`MemoryStorage`] here, an external database driver
//! elsewhere. List operations take page/page-size plus behavior-type,
//! status, and free-text filters (matched over name and description).

use std::collections::HashMap;
use std::error::Error;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::agentmesh::agent::{Agent, AgentStatus};

/// Errors raised by storage operations.
#[derive(Debug, Clone)]
pub enum StorageError {
    NotFound(String),
    /// Duplicate create.
    Conflict(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::NotFound(id) => write!(f, "record not found: {}", id),
            StorageError::Conflict(id) => write!(f, "record already exists: {}", id),
        }
    }
}

impl Error for StorageError {}

/// One audited agent execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    pub agent_id: String,
    pub action: String,
    pub input: Value,
    pub output: Value,
    pub status: String,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Activity {
    /// A new activity record with a fresh id.
    pub fn new(agent_id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            action: action.into(),
            input: Value::Null,
            output: Value::Null,
            status: String::from("completed"),
            duration_ms: 0,
            error: None,
            created_at: Utc::now(),
        }
    }
}

/// Rolling execution metrics for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub agent_id: String,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    /// Running average over all executions.
    pub average_latency_ms: f64,
    pub updated_at: DateTime<Utc>,
}

impl AgentMetrics {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            total_executions: 0,
            successful_executions: 0,
            failed_executions: 0,
            average_latency_ms: 0.0,
            updated_at: Utc::now(),
        }
    }

    /// Fold one execution into the counters and the running average.
    pub fn record(&mut self, success: bool, duration_ms: u64) {
        self.total_executions += 1;
        if success {
            self.successful_executions += 1;
        } else {
            self.failed_executions += 1;
        }
        let n = self.total_executions as f64;
        self.average_latency_ms += (duration_ms as f64 - self.average_latency_ms) / n;
        self.updated_at = Utc::now();
    }
}

/// Filters and paging for agent listings.
#[derive(Debug, Clone)]
pub struct AgentListOptions {
    /// 1-based page number.
    pub page: usize,
    pub page_size: usize,
    pub behavior_type: Option<String>,
    pub status: Option<AgentStatus>,
    /// Case-insensitive free text over name + description.
    pub search: Option<String>,
}

impl Default for AgentListOptions {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 20,
            behavior_type: None,
            status: None,
            search: None,
        }
    }
}

impl AgentListOptions {
    /// Filter by behavior type (builder pattern).
    pub fn with_behavior_type(mut self, behavior_type: impl Into<String>) -> Self {
        self.behavior_type = Some(behavior_type.into());
        self
    }

    /// Filter by lifecycle status (builder pattern).
    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Free-text search (builder pattern).
    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    /// Select a page (builder pattern).
    pub fn with_page(mut self, page: usize, page_size: usize) -> Self {
        self.page = page.max(1);
        self.page_size = page_size;
        self
    }
}

/// Agent/metric/activity persistence.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn create_agent(&self, agent: Agent) -> Result<(), StorageError>;
    async fn get_agent(&self, id: &str) -> Result<Agent, StorageError>;
    async fn update_agent(&self, agent: Agent) -> Result<(), StorageError>;
    async fn delete_agent(&self, id: &str) -> Result<(), StorageError>;
    /// Returns the requested page and the total match count.
    async fn list_agents(&self, options: AgentListOptions) -> (Vec<Agent>, usize);

    async fn upsert_metrics(&self, metrics: AgentMetrics);
    async fn get_metrics(&self, agent_id: &str) -> Option<AgentMetrics>;

    async fn record_activity(&self, activity: Activity) -> Result<(), StorageError>;
    /// Newest first.
    async fn list_activities(&self, agent_id: &str, page: usize, page_size: usize)
        -> Vec<Activity>;
}

/// In-process storage: maps behind reader-writer locks.
pub struct MemoryStorage {
    agents: RwLock<HashMap<String, Agent>>,
    metrics: RwLock<HashMap<String, AgentMetrics>>,
    activities: RwLock<Vec<Activity>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            metrics: RwLock::new(HashMap::new()),
            activities: RwLock::new(Vec::new()),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn create_agent(&self, agent: Agent) -> Result<(), StorageError> {
        let mut agents = self.agents.write().await;
        if agents.contains_key(&agent.id) {
            return Err(StorageError::Conflict(agent.id));
        }
        agents.insert(agent.id.clone(), agent);
        Ok(())
    }

    async fn get_agent(&self, id: &str) -> Result<Agent, StorageError> {
        self.agents
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    async fn update_agent(&self, mut agent: Agent) -> Result<(), StorageError> {
        let mut agents = self.agents.write().await;
        if !agents.contains_key(&agent.id) {
            return Err(StorageError::NotFound(agent.id));
        }
        agent.updated_at = Utc::now();
        agents.insert(agent.id.clone(), agent);
        Ok(())
    }

    async fn delete_agent(&self, id: &str) -> Result<(), StorageError> {
        self.agents
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    async fn list_agents(&self, options: AgentListOptions) -> (Vec<Agent>, usize) {
        let agents = self.agents.read().await;
        let needle = options.search.as_ref().map(|s| s.to_lowercase());

        let mut matches: Vec<Agent> = agents
            .values()
            .filter(|agent| {
                if let Some(behavior) = &options.behavior_type {
                    if &agent.behavior_type != behavior {
                        return false;
                    }
                }
                if let Some(status) = options.status {
                    if agent.status != status {
                        return false;
                    }
                }
                if let Some(needle) = &needle {
                    let haystack = format!(
                        "{} {}",
                        agent.name.to_lowercase(),
                        agent.description.to_lowercase()
                    );
                    if !haystack.contains(needle.as_str()) {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));

        let total = matches.len();
        let start = (options.page.max(1) - 1) * options.page_size;
        let page: Vec<Agent> = matches
            .into_iter()
            .skip(start)
            .take(options.page_size)
            .collect();
        (page, total)
    }

    async fn upsert_metrics(&self, metrics: AgentMetrics) {
        self.metrics
            .write()
            .await
            .insert(metrics.agent_id.clone(), metrics);
    }

    async fn get_metrics(&self, agent_id: &str) -> Option<AgentMetrics> {
        self.metrics.read().await.get(agent_id).cloned()
    }

    async fn record_activity(&self, activity: Activity) -> Result<(), StorageError> {
        self.activities.write().await.push(activity);
        Ok(())
    }

    async fn list_activities(
        &self,
        agent_id: &str,
        page: usize,
        page_size: usize,
    ) -> Vec<Activity> {
        let activities = self.activities.read().await;
        let mut matches: Vec<Activity> = activities
            .iter()
            .filter(|a| a.agent_id == agent_id)
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matches
            .into_iter()
            .skip((page.max(1) - 1) * page_size)
            .take(page_size)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(name: &str, behavior: &str, status: AgentStatus) -> Agent {
        Agent::new(name, format!("{} agent", name))
            .with_behavior(behavior)
            .with_status(status)
    }

    #[tokio::test]
    async fn agent_crud_round_trip() {
        let storage = MemoryStorage::new();
        let a = agent("alpha", "default", AgentStatus::Active);
        let id = a.id.clone();

        storage.create_agent(a.clone()).await.unwrap();
        assert!(matches!(
            storage.create_agent(a.clone()).await,
            Err(StorageError::Conflict(_))
        ));

        let mut fetched = storage.get_agent(&id).await.unwrap();
        fetched.description = "updated".to_string();
        storage.update_agent(fetched).await.unwrap();
        assert_eq!(storage.get_agent(&id).await.unwrap().description, "updated");

        storage.delete_agent(&id).await.unwrap();
        assert!(matches!(
            storage.get_agent(&id).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn listing_filters_and_pages() {
        let storage = MemoryStorage::new();
        storage
            .create_agent(agent("alpha researcher", "researcher", AgentStatus::Active))
            .await
            .unwrap();
        storage
            .create_agent(agent("beta assistant", "assistant", AgentStatus::Active))
            .await
            .unwrap();
        storage
            .create_agent(agent("gamma researcher", "researcher", AgentStatus::Draft))
            .await
            .unwrap();

        let (page, total) = storage
            .list_agents(AgentListOptions::default().with_behavior_type("researcher"))
            .await;
        assert_eq!(total, 2);
        assert_eq!(page.len(), 2);

        let (page, total) = storage
            .list_agents(
                AgentListOptions::default()
                    .with_behavior_type("researcher")
                    .with_status(AgentStatus::Draft),
            )
            .await;
        assert_eq!(total, 1);
        assert_eq!(page[0].name, "gamma researcher");

        let (page, total) = storage
            .list_agents(AgentListOptions::default().with_search("BETA"))
            .await;
        assert_eq!(total, 1);
        assert_eq!(page[0].name, "beta assistant");

        let (page, total) = storage
            .list_agents(AgentListOptions::default().with_page(2, 2))
            .await;
        assert_eq!(total, 3);
        assert_eq!(page.len(), 1);
    }

    #[tokio::test]
    async fn metrics_running_average() {
        let mut metrics = AgentMetrics::new("a1");
        metrics.record(true, 100);
        metrics.record(true, 200);
        metrics.record(false, 600);

        assert_eq!(metrics.total_executions, 3);
        assert_eq!(metrics.successful_executions, 2);
        assert_eq!(metrics.failed_executions, 1);
        assert!((metrics.average_latency_ms - 300.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn activities_list_newest_first() {
        let storage = MemoryStorage::new();
        for i in 0..3 {
            let mut activity = Activity::new("a1", "execute");
            activity.created_at = Utc::now() + chrono::Duration::milliseconds(i);
            activity.input = serde_json::json!(i);
            storage.record_activity(activity).await.unwrap();
        }
        storage
            .record_activity(Activity::new("other", "execute"))
            .await
            .unwrap();

        let activities = storage.list_activities("a1", 1, 10).await;
        assert_eq!(activities.len(), 3);
        assert_eq!(activities[0].input, serde_json::json!(2));
    }
}
