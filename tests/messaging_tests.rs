use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use agentmesh::agentmesh::dedup::DedupConfig;
use agentmesh::agentmesh::executor::{AgentExecutor, ExecutorConfig};
use agentmesh::{
    Agent, AgentStatus, BehaviorRegistry, Completion, CompletionRequest, InProcessProtocol,
    MemoryStorage, Message, MessageType, ModelProvider, Protocol, Storage, TaskWorker,
    WorkerInfo, WorkerRegistry,
};

use async_trait::async_trait;
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};

struct CountingProvider {
    calls: AtomicUsize,
}

#[async_trait]
impl ModelProvider for CountingProvider {
    async fn complete(
        &self,
        _request: CompletionRequest,
    ) -> Result<Completion, Box<dyn Error + Send + Sync>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Completion::text("handled", "counting"))
    }

    fn model_name(&self) -> &str {
        "counting"
    }
}

/// Replayed dispatches with an identical message id run the worker's
/// handler body exactly once.
#[tokio::test]
async fn deduplicated_replay_runs_the_handler_once() {
    let storage = Arc::new(MemoryStorage::new());
    let agent = Agent::new("worker", "handles tasks").with_status(AgentStatus::Active);
    let agent_id = agent.id.clone();
    storage.create_agent(agent).await.unwrap();

    let registry = Arc::new(WorkerRegistry::new());
    registry.register(WorkerInfo::new(agent_id.clone())).await;

    let provider = Arc::new(CountingProvider {
        calls: AtomicUsize::new(0),
    });
    let executor = Arc::new(AgentExecutor::new(
        storage,
        Arc::new(BehaviorRegistry::with_defaults().await),
        provider.clone(),
        ExecutorConfig::default(),
    ));

    let protocol = Arc::new(InProcessProtocol::with_dedup(
        DedupConfig::default().with_ttl(Duration::from_secs(3600)),
    ));
    let worker = TaskWorker::new(
        agent_id.clone(),
        protocol.clone(),
        registry,
        executor,
    );

    let dispatch = Message::task(
        "orch-1",
        &agent_id,
        "task-1",
        json!({"task_id": "task-1", "description": "do the thing"}),
    );

    // Same id, sent twice within the TTL window.
    protocol.send(dispatch.clone()).await.unwrap();
    protocol.send(dispatch).await.unwrap();
    worker.drain_once().await;

    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    let replies = protocol.receive("orch-1").await.unwrap();
    assert_eq!(replies.len(), 1);
    assert_eq!(protocol.dedup_stats().duplicates, 1);
}

/// Result/Error replies name the task they answer, and that task's
/// creator is the recipient.
#[tokio::test]
async fn replies_correlate_to_their_task_and_creator() {
    let protocol = InProcessProtocol::new();

    protocol
        .send(Message::result(
            "worker-1",
            "orch-1",
            "task-42",
            json!({"output": {"content": "done"}}),
        ))
        .await
        .unwrap();

    let replies = protocol.receive("orch-1").await.unwrap();
    assert_eq!(replies.len(), 1);
    let reply = &replies[0];
    assert_eq!(reply.message_type, MessageType::Result);
    assert_eq!(reply.in_reply_to.as_deref(), Some("task-42"));
    assert_eq!(reply.recipient.as_deref(), Some("orch-1"));
}

/// Per-consumer FIFO holds even when traffic interleaves broadcasts and
/// direct sends.
#[tokio::test]
async fn fifo_holds_across_mixed_traffic() {
    let protocol = InProcessProtocol::new();
    protocol
        .subscribe("consumer", vec![MessageType::Inform])
        .await
        .unwrap();

    for i in 0..10 {
        let message = if i % 2 == 0 {
            Message::new(MessageType::Inform, "sender").with_content(json!(i))
        } else {
            Message::new(MessageType::Task, "sender")
                .with_recipient("consumer")
                .with_reply_to(format!("t{}", i))
                .with_content(json!(i))
        };
        protocol.send(message).await.unwrap();
    }

    let received = protocol.receive("consumer").await.unwrap();
    let order: Vec<i64> = received.iter().map(|m| m.content.as_i64().unwrap()).collect();
    assert_eq!(order, (0..10).collect::<Vec<i64>>());
}
