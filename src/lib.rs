// src/lib.rs

// Import the top-level `agentmesh` module.
pub mod agentmesh;

// Re-export the component modules at the crate root so callers can write
// agentmesh::retry::with_retry instead of walking the hierarchy.
pub use agentmesh::{
    agent, behavior, circuit_breaker, connection_pool, dedup, discovery, executor, health,
    ledger, orchestrator, planner, protocol, provider, retry, schema, session, storage, task,
    tool_bridge, tool_cache, tool_protocol, transport, worker, worker_registry,
};

// Re-exporting key items for easier external access.
pub use agentmesh::agent::{Agent, AgentConfig, AgentStatus};
pub use agentmesh::behavior::{Behavior, BehaviorRegistry};
pub use agentmesh::executor::{AgentExecutor, ExecutorConfig};
pub use agentmesh::ledger::{
    InMemoryProgressLedger, InMemoryTaskLedger, ProgressLedger, TaskLedger,
};
pub use agentmesh::orchestrator::{Orchestrator, OrchestratorConfig};
pub use agentmesh::protocol::{InProcessProtocol, Message, MessageType, Protocol};
pub use agentmesh::provider::{Completion, CompletionRequest, ModelProvider, TokenUsage};
pub use agentmesh::session::SessionManager;
pub use agentmesh::storage::{MemoryStorage, Storage};
pub use agentmesh::task::{Task, TaskPriority, TaskRequest, TaskResult, TaskStatus};
pub use agentmesh::worker::TaskWorker;
pub use agentmesh::worker_registry::{WorkerInfo, WorkerRegistry, WorkerRole, WorkerStatus};
