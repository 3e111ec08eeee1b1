//! The agent execution path.
//!
//! [`AgentExecutor::execute`] drives one agent invocation end to end:
//! load and gate the agent, resolve its behavior, pre-process the input,
//! call the model provider with the agent's configuration (missing fields
//! default to the executor's model id, temperature 0.7, and 1000 tokens),
//! post-process the output, and record an [`Activity`] plus metrics.
//!
//! Activity recording and metrics are best-effort sinks: their failure is
//! logged and never fails the execution itself.

use std::error::Error;
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;

use crate::agentmesh::agent::{Agent, AgentError};
use crate::agentmesh::behavior::{BehaviorRegistry, ExecutionOutput};
use crate::agentmesh::provider::{CompletionRequest, ModelProvider};
use crate::agentmesh::storage::{Activity, AgentMetrics, Storage};

/// Defaults applied when an agent's config leaves fields unset.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub default_model: String,
    pub default_temperature: f32,
    pub default_max_tokens: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_model: String::from("default"),
            default_temperature: 0.7,
            default_max_tokens: 1000,
        }
    }
}

/// Executes agents against the model provider.
pub struct AgentExecutor {
    storage: Arc<dyn Storage>,
    behaviors: Arc<BehaviorRegistry>,
    provider: Arc<dyn ModelProvider>,
    config: ExecutorConfig,
}

impl AgentExecutor {
    pub fn new(
        storage: Arc<dyn Storage>,
        behaviors: Arc<BehaviorRegistry>,
        provider: Arc<dyn ModelProvider>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            storage,
            behaviors,
            provider,
            config,
        }
    }

    /// Run one agent invocation.
    pub async fn execute(
        &self,
        agent_id: &str,
        input: &str,
    ) -> Result<ExecutionOutput, Box<dyn Error + Send + Sync>> {
        let started = Instant::now();

        let agent = self
            .storage
            .get_agent(agent_id)
            .await
            .map_err(|_| AgentError::NotFound(agent_id.to_string()))?;
        if !agent.status.is_executable() {
            return Err(Box::new(AgentError::NotExecutable {
                id: agent.id.clone(),
                status: agent.status,
            }));
        }
        agent.validate()?;

        let behavior = self
            .behaviors
            .resolve(&agent.behavior_type)
            .await
            .ok_or_else(|| {
                AgentError::Validation(String::from(
                    "behavior registry has no default behavior",
                ))
            })?;

        let processed = behavior.process_input(&agent, input).await?;

        let mut system_prompt = behavior.system_prompt(&agent);
        if let Some(instructions) = &processed.instructions {
            system_prompt.push_str("\n\n");
            system_prompt.push_str(instructions);
        }

        let request = CompletionRequest::new(system_prompt, processed.content)
            .with_model(
                agent
                    .config
                    .model
                    .clone()
                    .unwrap_or_else(|| self.config.default_model.clone()),
            )
            .with_temperature(
                agent
                    .config
                    .temperature
                    .unwrap_or(self.config.default_temperature),
            )
            .with_max_tokens(
                agent
                    .config
                    .max_tokens
                    .unwrap_or(self.config.default_max_tokens),
            );

        let completion = match self.provider.complete(request).await {
            Ok(completion) => completion,
            Err(err) => {
                self.record(&agent, input, None, Some(&err.to_string()), started)
                    .await;
                return Err(err);
            }
        };

        let mut output = ExecutionOutput {
            content: completion.content,
            model: completion.model,
            tokens: completion.tokens,
            finish_reason: completion.finish_reason,
        };

        if let Err(err) = behavior.process_output(&agent, &mut output).await {
            self.record(&agent, input, None, Some(&err.to_string()), started)
                .await;
            return Err(err);
        }

        self.record(&agent, input, Some(&output), None, started).await;
        Ok(output)
    }

    /// Best-effort activity + metrics sink. Logs failures and continues.
    async fn record(
        &self,
        agent: &Agent,
        input: &str,
        output: Option<&ExecutionOutput>,
        error: Option<&str>,
        started: Instant,
    ) {
        let duration_ms = started.elapsed().as_millis() as u64;
        let success = error.is_none();

        let mut activity = Activity::new(agent.id.clone(), "execute");
        activity.input = json!(input);
        activity.duration_ms = duration_ms;
        match (output, error) {
            (Some(output), _) => {
                activity.output = json!({
                    "content": output.content,
                    "model": output.model,
                    "tokens_used": output.tokens.map(|t| t.total_tokens),
                    "finish_reason": output.finish_reason,
                });
            }
            (None, Some(error)) => {
                activity.status = String::from("failed");
                activity.error = Some(error.to_string());
            }
            _ => {}
        }
        if let Err(err) = self.storage.record_activity(activity).await {
            log::warn!("failed to record activity for agent {}: {}", agent.id, err);
        }

        let mut metrics = self
            .storage
            .get_metrics(&agent.id)
            .await
            .unwrap_or_else(|| AgentMetrics::new(agent.id.clone()));
        metrics.record(success, duration_ms);
        self.storage.upsert_metrics(metrics).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentmesh::agent::AgentStatus;
    use crate::agentmesh::provider::Completion;
    use crate::agentmesh::storage::{AgentListOptions, MemoryStorage, StorageError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct EchoProvider;

    #[async_trait]
    impl ModelProvider for EchoProvider {
        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<Completion, Box<dyn Error + Send + Sync>> {
            Ok(Completion::text(
                format!("echo: {}", request.user_message),
                request.model,
            ))
        }

        fn model_name(&self) -> &str {
            "echo"
        }
    }

    async fn executor_with(
        storage: Arc<dyn Storage>,
        provider: Arc<dyn ModelProvider>,
    ) -> AgentExecutor {
        AgentExecutor::new(
            storage,
            Arc::new(BehaviorRegistry::with_defaults().await),
            provider,
            ExecutorConfig::default(),
        )
    }

    async fn active_agent(storage: &dyn Storage) -> Agent {
        let agent = Agent::new("echoer", "Echoes input").with_status(AgentStatus::Active);
        storage.create_agent(agent.clone()).await.unwrap();
        agent
    }

    #[tokio::test]
    async fn executes_and_records() {
        let storage = Arc::new(MemoryStorage::new());
        let agent = active_agent(storage.as_ref()).await;
        let executor = executor_with(storage.clone(), Arc::new(EchoProvider)).await;

        let output = executor.execute(&agent.id, "hello").await.unwrap();
        assert_eq!(output.content, "echo: hello");

        let activities = storage.list_activities(&agent.id, 1, 10).await;
        assert_eq!(activities.len(), 1);
        assert_eq!(activities[0].action, "execute");
        assert_eq!(activities[0].status, "completed");

        let metrics = storage.get_metrics(&agent.id).await.unwrap();
        assert_eq!(metrics.total_executions, 1);
        assert_eq!(metrics.successful_executions, 1);
    }

    #[tokio::test]
    async fn inactive_agent_is_rejected() {
        let storage = Arc::new(MemoryStorage::new());
        let agent = Agent::new("dormant", "d").with_status(AgentStatus::Archived);
        storage.create_agent(agent.clone()).await.unwrap();
        let executor = executor_with(storage, Arc::new(EchoProvider)).await;

        let err = executor.execute(&agent.id, "hi").await.unwrap_err();
        assert!(err.to_string().contains("cannot be invoked"));
    }

    #[tokio::test]
    async fn out_of_range_temperature_is_rejected() {
        let storage = Arc::new(MemoryStorage::new());
        let mut agent = Agent::new("hot", "too spicy").with_status(AgentStatus::Active);
        agent.config.temperature = Some(2.5);
        storage.create_agent(agent.clone()).await.unwrap();
        let executor = executor_with(storage, Arc::new(EchoProvider)).await;

        let err = executor.execute(&agent.id, "hi").await.unwrap_err();
        assert!(err.to_string().contains("outside [0, 2]"));
    }

    #[tokio::test]
    async fn missing_agent_is_not_found() {
        let storage = Arc::new(MemoryStorage::new());
        let executor = executor_with(storage, Arc::new(EchoProvider)).await;
        let err = executor.execute("ghost", "hi").await.unwrap_err();
        assert!(err.to_string().contains("agent not found"));
    }

    #[tokio::test]
    async fn provider_failure_records_a_failed_activity() {
        struct FailingProvider;

        #[async_trait]
        impl ModelProvider for FailingProvider {
            async fn complete(
                &self,
                _request: CompletionRequest,
            ) -> Result<Completion, Box<dyn Error + Send + Sync>> {
                Err("connection reset".into())
            }

            fn model_name(&self) -> &str {
                "failing"
            }
        }

        let storage = Arc::new(MemoryStorage::new());
        let agent = active_agent(storage.as_ref()).await;
        let executor = executor_with(storage.clone(), Arc::new(FailingProvider)).await;

        assert!(executor.execute(&agent.id, "hi").await.is_err());

        let activities = storage.list_activities(&agent.id, 1, 10).await;
        assert_eq!(activities[0].status, "failed");
        let metrics = storage.get_metrics(&agent.id).await.unwrap();
        assert_eq!(metrics.failed_executions, 1);
    }

    #[tokio::test]
    async fn activity_sink_failure_does_not_fail_the_call() {
        struct FlakySink {
            inner: MemoryStorage,
            fail_activity: AtomicBool,
        }

        #[async_trait]
        impl Storage for FlakySink {
            async fn create_agent(&self, agent: Agent) -> Result<(), StorageError> {
                self.inner.create_agent(agent).await
            }
            async fn get_agent(&self, id: &str) -> Result<Agent, StorageError> {
                self.inner.get_agent(id).await
            }
            async fn update_agent(&self, agent: Agent) -> Result<(), StorageError> {
                self.inner.update_agent(agent).await
            }
            async fn delete_agent(&self, id: &str) -> Result<(), StorageError> {
                self.inner.delete_agent(id).await
            }
            async fn list_agents(&self, options: AgentListOptions) -> (Vec<Agent>, usize) {
                self.inner.list_agents(options).await
            }
            async fn upsert_metrics(&self, metrics: AgentMetrics) {
                self.inner.upsert_metrics(metrics).await
            }
            async fn get_metrics(&self, agent_id: &str) -> Option<AgentMetrics> {
                self.inner.get_metrics(agent_id).await
            }
            async fn record_activity(&self, activity: Activity) -> Result<(), StorageError> {
                if self.fail_activity.load(Ordering::SeqCst) {
                    return Err(StorageError::Conflict("sink down".into()));
                }
                self.inner.record_activity(activity).await
            }
            async fn list_activities(
                &self,
                agent_id: &str,
                page: usize,
                page_size: usize,
            ) -> Vec<Activity> {
                self.inner.list_activities(agent_id, page, page_size).await
            }
        }

        let storage = Arc::new(FlakySink {
            inner: MemoryStorage::new(),
            fail_activity: AtomicBool::new(true),
        });
        let agent = active_agent(storage.as_ref()).await;
        let executor = executor_with(storage.clone(), Arc::new(EchoProvider)).await;

        let output = executor.execute(&agent.id, "hi").await.unwrap();
        assert_eq!(output.content, "echo: hi");
        // Metrics still flowed even though the activity sink failed.
        assert_eq!(
            storage.get_metrics(&agent.id).await.unwrap().total_executions,
            1
        );
    }
}
