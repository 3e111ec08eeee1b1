//! Worker runtime: receives tasks, executes, replies.
//!
//! A [`TaskWorker`] pairs a registered worker identity with the agent
//! execution path. Its loop drains the protocol for Task (and Delegate)
//! messages addressed to it, flips its registry status to Busy around the
//! execution, and answers the sender with a Result or Error message
//! correlated to the task id.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::agentmesh::executor::AgentExecutor;
use crate::agentmesh::protocol::{Message, MessageType, Protocol};
use crate::agentmesh::worker_registry::{WorkerRegistry, WorkerStatus};

/// One running worker.
pub struct TaskWorker {
    agent_id: String,
    protocol: Arc<dyn Protocol>,
    registry: Arc<WorkerRegistry>,
    executor: Arc<AgentExecutor>,
    poll_interval: Duration,
}

impl TaskWorker {
    pub fn new(
        agent_id: impl Into<String>,
        protocol: Arc<dyn Protocol>,
        registry: Arc<WorkerRegistry>,
        executor: Arc<AgentExecutor>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            protocol,
            registry,
            executor,
            poll_interval: Duration::from_millis(50),
        }
    }

    /// Override the receive poll tick (builder pattern).
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// The worker's consumer id on the protocol.
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Drain and handle currently queued messages once.
    pub async fn drain_once(&self) {
        let messages = match self.protocol.receive(&self.agent_id).await {
            Ok(messages) => messages,
            Err(err) => {
                log::warn!("worker '{}' receive failed: {}", self.agent_id, err);
                return;
            }
        };
        for message in messages {
            match message.message_type {
                MessageType::Task | MessageType::Delegate => {
                    self.handle_task(message).await;
                }
                MessageType::Inform => {
                    log::debug!(
                        "worker '{}' informed: {}",
                        self.agent_id,
                        message.content
                    );
                }
                _ => {}
            }
        }
    }

    async fn handle_task(&self, message: Message) {
        let task_id = match message
            .in_reply_to
            .clone()
            .or_else(|| {
                message
                    .content
                    .get("task_id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            }) {
            Some(id) => id,
            None => {
                log::warn!(
                    "worker '{}' received a task message without a task id",
                    self.agent_id
                );
                return;
            }
        };

        self.registry
            .update_status(&self.agent_id, WorkerStatus::Busy)
            .await;

        let input = Self::task_input(&message.content);
        log::debug!("worker '{}' executing task {}", self.agent_id, task_id);
        let reply = match self.executor.execute(&self.agent_id, &input).await {
            Ok(output) => Message::result(
                &self.agent_id,
                &message.sender,
                &task_id,
                json!({
                    "output": {
                        "content": output.content,
                        "model": output.model,
                        "tokens_used": output.tokens.map(|t| t.total_tokens),
                        "finish_reason": output.finish_reason,
                    }
                }),
            ),
            Err(err) => Message::error(
                &self.agent_id,
                &message.sender,
                &task_id,
                json!({ "error": err.to_string() }),
            ),
        };

        if let Err(err) = self.protocol.send(reply).await {
            log::error!(
                "worker '{}' failed to reply for task {}: {}",
                self.agent_id,
                task_id,
                err
            );
        }

        self.registry
            .update_status(&self.agent_id, WorkerStatus::Idle)
            .await;
    }

    /// Flatten the dispatch payload into the executor's text input.
    fn task_input(content: &Value) -> String {
        let description = content
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("");
        match content.get("input") {
            Some(Value::Null) | None => description.to_string(),
            Some(Value::String(s)) if description.is_empty() => s.clone(),
            Some(Value::String(s)) => format!("{}\n\nInput: {}", description, s),
            Some(other) if description.is_empty() => other.to_string(),
            Some(other) => format!("{}\n\nInput: {}", description, other),
        }
    }

    /// Run until the token is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        log::info!("worker '{}' started", self.agent_id);
        loop {
            self.drain_once().await;
            tokio::select! {
                _ = token.cancelled() => {
                    log::info!("worker '{}' stopping", self.agent_id);
                    return;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Spawn [`TaskWorker::run`] on the runtime.
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(token).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentmesh::agent::{Agent, AgentStatus};
    use crate::agentmesh::behavior::BehaviorRegistry;
    use crate::agentmesh::executor::ExecutorConfig;
    use crate::agentmesh::protocol::InProcessProtocol;
    use crate::agentmesh::provider::{Completion, CompletionRequest, ModelProvider};
    use crate::agentmesh::storage::{MemoryStorage, Storage};
    use crate::agentmesh::worker_registry::WorkerInfo;
    use async_trait::async_trait;
    use std::error::Error;

    struct EchoProvider;

    #[async_trait]
    impl ModelProvider for EchoProvider {
        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<Completion, Box<dyn Error + Send + Sync>> {
            Ok(Completion::text(
                format!("done: {}", request.user_message),
                "echo",
            ))
        }

        fn model_name(&self) -> &str {
            "echo"
        }
    }

    async fn worker_fixture() -> (Arc<InProcessProtocol>, TaskWorker, String) {
        let storage = Arc::new(MemoryStorage::new());
        let agent = Agent::new("worker-agent", "does work").with_status(AgentStatus::Active);
        let agent_id = agent.id.clone();
        storage.create_agent(agent).await.unwrap();

        let registry = Arc::new(WorkerRegistry::new());
        registry.register(WorkerInfo::new(agent_id.clone())).await;

        let executor = Arc::new(AgentExecutor::new(
            storage,
            Arc::new(BehaviorRegistry::with_defaults().await),
            Arc::new(EchoProvider),
            ExecutorConfig::default(),
        ));

        let protocol = Arc::new(InProcessProtocol::new());
        let worker = TaskWorker::new(
            agent_id.clone(),
            protocol.clone(),
            registry,
            executor,
        );
        (protocol, worker, agent_id)
    }

    #[tokio::test]
    async fn executes_task_and_replies_with_result() {
        let (protocol, worker, agent_id) = worker_fixture().await;

        protocol
            .send(Message::task(
                "orch-1",
                &agent_id,
                "task-1",
                json!({"task_id": "task-1", "description": "summarize", "input": "text"}),
            ))
            .await
            .unwrap();

        worker.drain_once().await;

        let replies = protocol.receive("orch-1").await.unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].message_type, MessageType::Result);
        assert_eq!(replies[0].in_reply_to.as_deref(), Some("task-1"));
        let content = replies[0].content["output"]["content"].as_str().unwrap();
        assert!(content.starts_with("done:"));
    }

    #[tokio::test]
    async fn failing_execution_replies_with_error() {
        let (protocol, _worker, _agent_id) = worker_fixture().await;

        // A worker whose agent record is archived: every execution fails,
        // and the failure must come back as an Error reply.
        let storage = Arc::new(MemoryStorage::new());
        let agent = Agent::new("dormant", "d").with_status(AgentStatus::Archived);
        let dormant_id = agent.id.clone();
        storage.create_agent(agent).await.unwrap();
        let registry = Arc::new(WorkerRegistry::new());
        registry.register(WorkerInfo::new(dormant_id.clone())).await;
        let executor = Arc::new(AgentExecutor::new(
            storage,
            Arc::new(BehaviorRegistry::with_defaults().await),
            Arc::new(EchoProvider),
            ExecutorConfig::default(),
        ));
        let worker2 = TaskWorker::new(
            dormant_id.clone(),
            protocol.clone(),
            registry,
            executor,
        );

        protocol
            .send(Message::task(
                "orch-1",
                &dormant_id,
                "task-2",
                json!({"task_id": "task-2", "description": "noop"}),
            ))
            .await
            .unwrap();
        worker2.drain_once().await;

        let replies = protocol.receive("orch-1").await.unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].message_type, MessageType::Error);
        assert!(replies[0].content["error"]
            .as_str()
            .unwrap()
            .contains("cannot be invoked"));
    }
}
