//! Orchestrator core: plan → dispatch → await → retry → replan.
//!
//! [`Orchestrator::execute_task`] drives one user-submitted request end to
//! end. The model provider plans a subtask DAG, each subtask is routed to
//! the best-scoring worker over the messaging protocol, completion is
//! observed by draining replies and polling the task ledger, failures are
//! retried with reassignment. When replanning is enabled, a terminal
//! subtask failure triggers a fresh planning round that replaces
//! the remainder of the plan.
//!
//! Subtasks run in topological order computed up front, so a subtask is
//! only ever dispatched after all of its dependencies completed; planner
//! cycles are rejected at parse time rather than deadlocking the loop.
//!
//! Multiple `execute_task` calls may run concurrently on one orchestrator;
//! each drives its own DAG and correlates replies by task id.

use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::agentmesh::ledger::{ProgressEntry, ProgressLedger, TaskLedger};
use crate::agentmesh::planner::{
    self, build_planning_prompt, build_replan_message, SubtaskSpec,
};
use crate::agentmesh::protocol::{Message, MessageType, Protocol};
use crate::agentmesh::provider::{CompletionRequest, ModelProvider};
use crate::agentmesh::retry::Cancelled;
use crate::agentmesh::task::{Task, TaskRequest, TaskResult, TaskStatus};
use crate::agentmesh::worker_registry::{WorkerInfo, WorkerRegistry};
use uuid::Uuid;

/// Tuning knobs for the execution loop.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Dispatch retries per subtask after the initial attempt.
    pub max_retries: u32,
    /// Sleep between dispatch retries.
    pub retry_delay: Duration,
    /// Wait bound per subtask dispatch.
    pub task_timeout: Duration,
    /// Reply-drain/ledger-poll tick. Kept at or below 100ms.
    pub poll_interval: Duration,
    /// Replan on terminal subtask failure instead of failing the request.
    pub enable_replanning: bool,
    /// Upper bound on replanning rounds per request.
    pub max_replans: u32,
    /// Token budget for planning completions.
    pub planning_max_tokens: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_delay: Duration::from_millis(500),
            task_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_millis(100),
            enable_replanning: false,
            max_replans: 1,
            planning_max_tokens: 2000,
        }
    }
}

impl OrchestratorConfig {
    /// Override the per-subtask retry budget (builder pattern).
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Override the delay between retries (builder pattern).
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Override the per-subtask wait bound (builder pattern).
    pub fn with_task_timeout(mut self, task_timeout: Duration) -> Self {
        self.task_timeout = task_timeout;
        self
    }

    /// Override the poll tick (builder pattern).
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Enable or disable replanning (builder pattern).
    pub fn with_replanning(mut self, enable: bool) -> Self {
        self.enable_replanning = enable;
        self
    }
}

/// Errors raised by the orchestrator.
#[derive(Debug)]
pub enum OrchestratorError {
    /// Planning failed terminally (unparseable output, empty plan, or the
    /// provider itself failed) after any permitted replan attempt.
    PlanningFailed(String),
    /// No dispatchable worker exists for a subtask.
    NoSuitableWorker { task: String },
    /// One or more subtasks failed and replanning was exhausted or
    /// disabled; wraps the last subtask error.
    SubtasksFailed { last_error: String },
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::PlanningFailed(msg) => write!(f, "planning failed: {}", msg),
            OrchestratorError::NoSuitableWorker { task } => {
                write!(f, "no suitable worker for task {}", task)
            }
            OrchestratorError::SubtasksFailed { last_error } => {
                write!(f, "failed to complete all subtasks: {}", last_error)
            }
        }
    }
}

impl Error for OrchestratorError {}

enum SubtaskOutcome {
    Completed(Value),
    Failed(String),
}

/// Coordinates planning, dispatch, and aggregation over shared ledgers,
/// the worker registry, and the messaging protocol.
pub struct Orchestrator {
    id: String,
    provider: Arc<dyn ModelProvider>,
    protocol: Arc<dyn Protocol>,
    workers: Arc<WorkerRegistry>,
    tasks: Arc<dyn TaskLedger>,
    progress: Arc<dyn ProgressLedger>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        protocol: Arc<dyn Protocol>,
        workers: Arc<WorkerRegistry>,
        tasks: Arc<dyn TaskLedger>,
        progress: Arc<dyn ProgressLedger>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            id: format!("orchestrator-{}", Uuid::new_v4()),
            provider,
            protocol,
            workers,
            tasks,
            progress,
            config,
        }
    }

    /// This orchestrator's consumer id on the protocol.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Register a worker with the registry.
    pub async fn register_worker(&self, worker: WorkerInfo) {
        self.workers.register(worker).await;
    }

    /// Unregister a worker; returns whether it was registered.
    pub async fn unregister_worker(&self, agent_id: &str) -> bool {
        self.workers.unregister(agent_id).await
    }

    /// Execute a user request: plan, drive the DAG, aggregate.
    pub async fn execute_task(
        &self,
        request: TaskRequest,
        token: &CancellationToken,
    ) -> Result<TaskResult, Box<dyn Error + Send + Sync>> {
        let parent = Task::new(request.name.clone(), request.description.clone(), &self.id)
            .with_type(request.task_type.clone())
            .with_priority(request.priority)
            .with_input(request.input.clone());
        let parent_id = parent.id.clone();
        self.tasks.create_task(parent).await?;

        log::info!("[{}] executing task '{}' ({})", self.id, request.name, parent_id);

        let mut specs = match self.plan(&request, None).await {
            Ok(specs) => specs,
            Err(err) => {
                let _ = self.tasks.fail_task(&parent_id, &err.to_string()).await;
                return Err(err);
            }
        };

        let mut results: HashMap<String, Value> = HashMap::new();
        let mut completed: HashSet<String> = HashSet::new();
        let mut replans_used: u32 = 0;

        'plan: loop {
            self.progress
                .add_entry(
                    ProgressEntry::new(&parent_id, &self.id, "planning", "plan accepted")
                        .with_output(json!({
                            "subtasks": specs.len(),
                            "replans_used": replans_used,
                        })),
                )
                .await;

            // Topological order, computed up front; parse_plan already
            // rejected cycles so this cannot fail here.
            let order = planner::topological_order(&specs)
                .ok_or_else(|| OrchestratorError::PlanningFailed("cyclic plan".into()))?;
            let subtasks = planner::materialize_plan(&specs, &parent_id, &self.id);

            for &index in &order {
                self.tasks.create_task(subtasks[index].clone()).await?;
            }

            for &index in &order {
                if token.is_cancelled() {
                    let _ = self.tasks.fail_task(&parent_id, "cancelled").await;
                    return Err(Box::new(Cancelled));
                }

                let subtask = &subtasks[index];
                match self.run_subtask(subtask, token).await? {
                    SubtaskOutcome::Completed(output) => {
                        completed.insert(subtask.id.clone());
                        results.insert(subtask.id.clone(), output);
                    }
                    SubtaskOutcome::Failed(error) => {
                        if self.config.enable_replanning && replans_used < self.config.max_replans
                        {
                            replans_used += 1;
                            log::warn!(
                                "[{}] subtask '{}' failed ({}); replanning ({}/{})",
                                self.id,
                                subtask.name,
                                error,
                                replans_used,
                                self.config.max_replans
                            );
                            match self
                                .plan(&request, Some((subtask.name.as_str(), error.as_str())))
                                .await
                            {
                                Ok(new_specs) => {
                                    // The new plan replaces the remainder;
                                    // cancel what the old plan never ran.
                                    for &rest in
                                        order.iter().skip_while(|&&i| i != index).skip(1)
                                    {
                                        let mut abandoned =
                                            self.tasks.get_task(&subtasks[rest].id).await?;
                                        if !abandoned.status.is_terminal() {
                                            abandoned.status = TaskStatus::Cancelled;
                                            let _ = self.tasks.update_task(abandoned).await;
                                        }
                                    }
                                    specs = new_specs;
                                    continue 'plan;
                                }
                                Err(err) => {
                                    let _ =
                                        self.tasks.fail_task(&parent_id, &err.to_string()).await;
                                    return Err(err);
                                }
                            }
                        }

                        let _ = self.tasks.fail_task(&parent_id, &error).await;
                        return Err(Box::new(OrchestratorError::SubtasksFailed {
                            last_error: error,
                        }));
                    }
                }
            }

            break 'plan;
        }

        let output = json!(results);
        self.tasks.complete_task(&parent_id, output.clone()).await?;
        log::info!(
            "[{}] task {} completed with {} subtask results",
            self.id,
            parent_id,
            completed.len()
        );

        Ok(TaskResult {
            task_id: parent_id,
            status: String::from("completed"),
            output,
            error: None,
            completed_at: Utc::now(),
        })
    }

    /// One planning round. `failure` carries replan context; planner parse
    /// failures consume one replan attempt when replanning is enabled.
    async fn plan(
        &self,
        request: &TaskRequest,
        failure: Option<(&str, &str)>,
    ) -> Result<Vec<SubtaskSpec>, Box<dyn Error + Send + Sync>> {
        let capabilities = self.workers.available_capabilities().await;
        let system_prompt = build_planning_prompt(&capabilities);

        let task_text = format!(
            "Task: {}\nDescription: {}\nInput: {}",
            request.name, request.description, request.input
        );
        let user_message = match failure {
            Some((subtask, error)) => build_replan_message(&task_text, subtask, error),
            None => task_text,
        };

        let completion_request = CompletionRequest::new(system_prompt, user_message)
            .with_model(self.provider.model_name().to_string())
            .with_max_tokens(self.config.planning_max_tokens);

        let first_attempt = self.provider.complete(completion_request.clone()).await;
        let parse = |content: String| planner::parse_plan(&content).map_err(|e| e.to_string());

        let parsed = match first_attempt {
            Ok(completion) => parse(completion.content),
            Err(err) => Err(err.to_string()),
        };

        match parsed {
            Ok(specs) => Ok(specs),
            Err(first_error) if self.config.enable_replanning && failure.is_none() => {
                // One corrective round: repeat the request with the parse
                // failure as context.
                log::warn!("[{}] planning failed ({}); retrying once", self.id, first_error);
                let retry_request = CompletionRequest::new(
                    build_planning_prompt(&capabilities),
                    format!(
                        "Your previous plan was invalid: {}\n\nPlan again.\n{}",
                        first_error, completion_request.user_message
                    ),
                )
                .with_model(self.provider.model_name().to_string())
                .with_max_tokens(self.config.planning_max_tokens);

                let completion = self
                    .provider
                    .complete(retry_request)
                    .await
                    .map_err(|e| OrchestratorError::PlanningFailed(e.to_string()))?;
                planner::parse_plan(&completion.content).map_err(|e| {
                    Box::new(OrchestratorError::PlanningFailed(e.to_string()))
                        as Box<dyn Error + Send + Sync>
                })
            }
            Err(first_error) => Err(Box::new(OrchestratorError::PlanningFailed(first_error))
                as Box<dyn Error + Send + Sync>),
        }
    }

    /// Dispatch one subtask with retries and await its terminal state.
    /// Returns `Ok(Failed)` for task-level failure (retry budget spent) so
    /// the caller can decide between replanning and surfacing.
    async fn run_subtask(
        &self,
        subtask: &Task,
        token: &CancellationToken,
    ) -> Result<SubtaskOutcome, Box<dyn Error + Send + Sync>> {
        let mut last_error = String::new();

        for attempt in 0..=self.config.max_retries {
            if token.is_cancelled() {
                return Err(Box::new(Cancelled));
            }

            let mut record = self.tasks.get_task(&subtask.id).await?;
            match record.status {
                // An external writer may have finished the task between
                // attempts; honour the ledger.
                TaskStatus::Completed => {
                    return Ok(SubtaskOutcome::Completed(record.output));
                }
                TaskStatus::Failed | TaskStatus::Cancelled => {
                    last_error = record
                        .error
                        .unwrap_or_else(|| String::from("task failed externally"));
                    break;
                }
                _ => {}
            }

            // Selection sees the live record, so a task already assigned
            // to a live worker sticks to it.
            let worker = match self.workers.select_worker(&record).await {
                Some(worker) => worker,
                None => {
                    return Err(Box::new(OrchestratorError::NoSuitableWorker {
                        task: subtask.id.clone(),
                    }));
                }
            };

            record.assigned_to = Some(worker.agent_id.clone());
            record.status = TaskStatus::Assigned;
            self.tasks.update_task(record).await?;

            log::debug!(
                "[{}] dispatching '{}' to worker '{}' (attempt {})",
                self.id,
                subtask.name,
                worker.agent_id,
                attempt + 1
            );
            self.protocol
                .send(Message::task(
                    &self.id,
                    &worker.agent_id,
                    &subtask.id,
                    json!({
                        "task_id": subtask.id,
                        "name": subtask.name,
                        "description": subtask.description,
                        "task_type": subtask.task_type,
                        "input": subtask.input,
                    }),
                ))
                .await?;

            match self.await_subtask(&subtask.id, token).await? {
                SubtaskOutcome::Completed(output) => {
                    self.progress
                        .add_entry(
                            ProgressEntry::new(
                                &subtask.id,
                                &worker.agent_id,
                                "execute",
                                format!("subtask '{}' completed", subtask.name),
                            )
                            .with_output(output.clone()),
                        )
                        .await;
                    return Ok(SubtaskOutcome::Completed(output));
                }
                SubtaskOutcome::Failed(error) => {
                    last_error = error.clone();
                    if attempt < self.config.max_retries {
                        self.progress
                            .add_entry(
                                ProgressEntry::new(
                                    &subtask.id,
                                    &worker.agent_id,
                                    "retry",
                                    format!(
                                        "attempt {} failed: {}; reassigning",
                                        attempt + 1,
                                        error
                                    ),
                                )
                                .with_status("failed"),
                            )
                            .await;
                        tokio::select! {
                            _ = token.cancelled() => return Err(Box::new(Cancelled)),
                            _ = tokio::time::sleep(self.config.retry_delay) => {}
                        }
                    }
                }
            }
        }

        // Retry budget spent: record the terminal failure.
        let _ = self.tasks.fail_task(&subtask.id, &last_error).await;
        self.progress
            .add_entry(
                ProgressEntry::new(
                    &subtask.id,
                    &self.id,
                    "execute",
                    format!("subtask '{}' failed", subtask.name),
                )
                .with_status("failed")
                .with_output(json!({ "error": last_error })),
            )
            .await;
        Ok(SubtaskOutcome::Failed(last_error))
    }

    /// Wait for one subtask to reach a terminal state: drain protocol
    /// replies addressed to this orchestrator and honour ledger updates,
    /// ticking at the poll interval, bounded by the task timeout.
    ///
    /// A non-terminal return (`Failed` without ledger terminality) leaves
    /// the record Assigned so a retry can reassign it.
    async fn await_subtask(
        &self,
        task_id: &str,
        token: &CancellationToken,
    ) -> Result<SubtaskOutcome, Box<dyn Error + Send + Sync>> {
        let deadline = tokio::time::Instant::now() + self.config.task_timeout;

        loop {
            if token.is_cancelled() {
                return Err(Box::new(Cancelled));
            }

            for message in self.protocol.receive(&self.id).await? {
                let reply_to = match &message.in_reply_to {
                    Some(id) => id.clone(),
                    None => continue,
                };
                match message.message_type {
                    MessageType::Result => {
                        let output = message
                            .content
                            .get("output")
                            .cloned()
                            .unwrap_or(message.content.clone());
                        if let Err(err) = self.tasks.complete_task(&reply_to, output).await {
                            log::warn!("[{}] stale result for {}: {}", self.id, reply_to, err);
                        }
                    }
                    MessageType::Error => {
                        let error = message
                            .content
                            .get("error")
                            .and_then(Value::as_str)
                            .unwrap_or("worker reported an error")
                            .to_string();
                        if reply_to == task_id {
                            // Leave the ledger record non-terminal so the
                            // retry path can reassign; only the final
                            // attempt marks it Failed.
                            return Ok(SubtaskOutcome::Failed(error));
                        }
                        if let Err(err) = self.tasks.fail_task(&reply_to, &error).await {
                            log::warn!("[{}] stale error for {}: {}", self.id, reply_to, err);
                        }
                    }
                    _ => {}
                }
            }

            let record = self.tasks.get_task(task_id).await?;
            match record.status {
                TaskStatus::Completed => return Ok(SubtaskOutcome::Completed(record.output)),
                TaskStatus::Failed => {
                    return Ok(SubtaskOutcome::Failed(
                        record.error.unwrap_or_else(|| String::from("task failed")),
                    ));
                }
                TaskStatus::Cancelled => {
                    return Ok(SubtaskOutcome::Failed(String::from("task cancelled")));
                }
                _ => {}
            }

            if tokio::time::Instant::now() >= deadline {
                // Reported as a failure; the record stays non-terminal so
                // the retry path can reassign, and the final attempt marks
                // it Failed.
                return Ok(SubtaskOutcome::Failed(format!(
                    "task {} timed out waiting for a worker reply",
                    task_id
                )));
            }

            tokio::select! {
                _ = token.cancelled() => return Err(Box::new(Cancelled)),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }
}
