//! Messaging protocol: publish/subscribe plus point-to-point delivery.
//!
//! The [`Protocol`] trait is the seam between the orchestrator/workers and
//! whatever carries their messages: the in-process implementation here, a
//! durable pub/sub, or a partitioned log. The interface deliberately does
//! not leak which.
//!
//! Delivery semantics every implementation must honour:
//!
//! - a consumer receives a message iff it is addressed to the consumer by
//!   id, or the consumer is subscribed to the message's type and no
//!   recipient is set;
//! - [`Protocol::receive`] returns delivered, not-yet-consumed messages in
//!   FIFO order;
//! - replies correlate through `in_reply_to`: a Result or Error for task T
//!   targets the task's creator and carries `in_reply_to = T`;
//! - delivery is at-most-once-useful: replayed message ids are dropped by
//!   the deduplication filter.

use std::collections::{HashMap, HashSet, VecDeque};
use std::error::Error;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::agentmesh::dedup::{DedupConfig, Deduplicator};

/// Kinds of traffic the protocol carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Dispatch of a task to a worker.
    Task,
    /// A worker forwarding work to another worker.
    Delegate,
    /// Successful completion of a task.
    Result,
    /// Failed completion of a task.
    Error,
    /// Free-form notification.
    Inform,
    /// Subscription control.
    Subscribe,
    /// Subscription control.
    Unsubscribe,
}

/// One unit of traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub message_type: MessageType,
    pub sender: String,
    /// Direct recipient; `None` makes the message a broadcast to
    /// subscribers of its type.
    pub recipient: Option<String>,
    /// Task id this message answers. Mandatory for Result and Error.
    pub in_reply_to: Option<String>,
    pub content: Value,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// A message with a fresh id and the current timestamp.
    pub fn new(message_type: MessageType, sender: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type,
            sender: sender.into(),
            recipient: None,
            in_reply_to: None,
            content: Value::Null,
            created_at: Utc::now(),
        }
    }

    /// Address the message to one consumer (builder pattern).
    pub fn with_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    /// Correlate the message to a task (builder pattern).
    pub fn with_reply_to(mut self, task_id: impl Into<String>) -> Self {
        self.in_reply_to = Some(task_id.into());
        self
    }

    /// Set the payload (builder pattern).
    pub fn with_content(mut self, content: Value) -> Self {
        self.content = content;
        self
    }

    /// A task dispatch addressed to a worker.
    pub fn task(sender: impl Into<String>, recipient: impl Into<String>, task_id: impl Into<String>, content: Value) -> Self {
        Message::new(MessageType::Task, sender)
            .with_recipient(recipient)
            .with_reply_to(task_id)
            .with_content(content)
    }

    /// A successful reply for a task, addressed to its creator.
    pub fn result(sender: impl Into<String>, recipient: impl Into<String>, task_id: impl Into<String>, content: Value) -> Self {
        Message::new(MessageType::Result, sender)
            .with_recipient(recipient)
            .with_reply_to(task_id)
            .with_content(content)
    }

    /// A failure reply for a task, addressed to its creator.
    pub fn error(sender: impl Into<String>, recipient: impl Into<String>, task_id: impl Into<String>, content: Value) -> Self {
        Message::new(MessageType::Error, sender)
            .with_recipient(recipient)
            .with_reply_to(task_id)
            .with_content(content)
    }
}

/// Errors raised by protocol implementations.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    /// A Result/Error message was sent without `in_reply_to`.
    MissingCorrelation(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::MissingCorrelation(id) => {
                write!(f, "message {} of type result/error carries no in_reply_to", id)
            }
        }
    }
}

impl Error for ProtocolError {}

/// Abstract messaging interface.
#[async_trait]
pub trait Protocol: Send + Sync {
    /// Publish one message.
    async fn send(&self, message: Message) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Drain the consumer's delivered, unconsumed messages (FIFO).
    async fn receive(&self, consumer_id: &str) -> Result<Vec<Message>, Box<dyn Error + Send + Sync>>;

    /// Subscribe the consumer to broadcast messages of the given types.
    async fn subscribe(
        &self,
        consumer_id: &str,
        types: Vec<MessageType>,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Drop the consumer's subscriptions. Direct-addressed delivery still
    /// works afterwards.
    async fn unsubscribe(&self, consumer_id: &str) -> Result<(), Box<dyn Error + Send + Sync>>;
}

struct ProtocolState {
    queues: HashMap<String, VecDeque<Message>>,
    subscriptions: HashMap<String, HashSet<MessageType>>,
}

/// In-process protocol: per-consumer FIFO queues behind one lock, fronted
/// by the deduplication filter.
pub struct InProcessProtocol {
    state: RwLock<ProtocolState>,
    dedup: Deduplicator,
}

impl InProcessProtocol {
    /// Protocol with the default one-hour dedup window.
    pub fn new() -> Self {
        Self::with_dedup(DedupConfig::default())
    }

    /// Protocol with a custom dedup configuration.
    pub fn with_dedup(config: DedupConfig) -> Self {
        Self {
            state: RwLock::new(ProtocolState {
                queues: HashMap::new(),
                subscriptions: HashMap::new(),
            }),
            dedup: Deduplicator::new(config),
        }
    }

    /// Dedup traffic counters, for observability.
    pub fn dedup_stats(&self) -> crate::agentmesh::dedup::DedupStats {
        self.dedup.stats()
    }
}

impl Default for InProcessProtocol {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Protocol for InProcessProtocol {
    async fn send(&self, message: Message) -> Result<(), Box<dyn Error + Send + Sync>> {
        if matches!(message.message_type, MessageType::Result | MessageType::Error)
            && message.in_reply_to.is_none()
        {
            return Err(Box::new(ProtocolError::MissingCorrelation(message.id)));
        }

        if !self.dedup.check_and_record(&message.id) {
            log::debug!("dropping duplicate message {}", message.id);
            return Ok(());
        }

        let mut state = self.state.write().await;
        match message.recipient.clone() {
            Some(recipient) => {
                state
                    .queues
                    .entry(recipient)
                    .or_insert_with(VecDeque::new)
                    .push_back(message);
            }
            None => {
                let targets: Vec<String> = state
                    .subscriptions
                    .iter()
                    .filter(|(_, types)| types.contains(&message.message_type))
                    .map(|(consumer, _)| consumer.clone())
                    .collect();
                for consumer in targets {
                    state
                        .queues
                        .entry(consumer)
                        .or_insert_with(VecDeque::new)
                        .push_back(message.clone());
                }
            }
        }
        Ok(())
    }

    async fn receive(
        &self,
        consumer_id: &str,
    ) -> Result<Vec<Message>, Box<dyn Error + Send + Sync>> {
        let mut state = self.state.write().await;
        Ok(state
            .queues
            .get_mut(consumer_id)
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default())
    }

    async fn subscribe(
        &self,
        consumer_id: &str,
        types: Vec<MessageType>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut state = self.state.write().await;
        state
            .subscriptions
            .entry(consumer_id.to_string())
            .or_insert_with(HashSet::new)
            .extend(types);
        state
            .queues
            .entry(consumer_id.to_string())
            .or_insert_with(VecDeque::new);
        Ok(())
    }

    async fn unsubscribe(&self, consumer_id: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.state.write().await.subscriptions.remove(consumer_id);
        Ok(())
    }
}
