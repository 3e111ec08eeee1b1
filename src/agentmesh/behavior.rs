//! Behaviors: named strategies around a model invocation.
//!
//! A behavior decides how an agent's raw input becomes a prompt and how
//! the model's completion becomes the agent's output. The registry is a
//! process-scoped lifecycle object passed explicitly into the executor,
//! never an ambient singleton. Unknown behavior types resolve to
//! "default".

use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::agentmesh::agent::Agent;
use crate::agentmesh::provider::TokenUsage;

/// The behavior's view of a processed input.
#[derive(Debug, Clone)]
pub struct ProcessedInput {
    /// The text forwarded to the model.
    pub content: String,
    /// Extra instructions appended to the system prompt, if any.
    pub instructions: Option<String>,
    /// Structured context the behavior wants carried to the output stage.
    pub context: HashMap<String, Value>,
}

impl ProcessedInput {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            instructions: None,
            context: HashMap::new(),
        }
    }
}

/// An agent execution's result.
#[derive(Debug, Clone)]
pub struct ExecutionOutput {
    pub content: String,
    pub model: String,
    pub tokens: Option<TokenUsage>,
    pub finish_reason: Option<String>,
}

/// Pre/post-processing strategy around the model call.
#[async_trait]
pub trait Behavior: Send + Sync {
    /// Registry key for this behavior.
    fn name(&self) -> &str;

    /// Shape the raw input before the model sees it.
    async fn process_input(
        &self,
        agent: &Agent,
        input: &str,
    ) -> Result<ProcessedInput, Box<dyn Error + Send + Sync>>;

    /// Build the system prompt for the agent.
    fn system_prompt(&self, agent: &Agent) -> String;

    /// Shape the model's completion into the final output. Errors abort
    /// the execution.
    async fn process_output(
        &self,
        agent: &Agent,
        output: &mut ExecutionOutput,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;
}

fn base_prompt(agent: &Agent) -> String {
    let mut prompt = format!("You are {}. {}", agent.name, agent.description);
    if let Some(personality) = &agent.config.personality {
        prompt.push_str(&format!(" Personality: {}.", personality));
    }
    if let Some(language) = &agent.config.language {
        prompt.push_str(&format!(" Respond in {}.", language));
    }
    prompt
}

/// Pass-through behavior; the fallback for unknown types.
pub struct DefaultBehavior;

#[async_trait]
impl Behavior for DefaultBehavior {
    fn name(&self) -> &str {
        "default"
    }

    async fn process_input(
        &self,
        _agent: &Agent,
        input: &str,
    ) -> Result<ProcessedInput, Box<dyn Error + Send + Sync>> {
        Ok(ProcessedInput::new(input))
    }

    fn system_prompt(&self, agent: &Agent) -> String {
        base_prompt(agent)
    }

    async fn process_output(
        &self,
        _agent: &Agent,
        _output: &mut ExecutionOutput,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(())
    }
}

/// Conversational assistant: concise, helpful framing.
pub struct AssistantBehavior;

#[async_trait]
impl Behavior for AssistantBehavior {
    fn name(&self) -> &str {
        "assistant"
    }

    async fn process_input(
        &self,
        _agent: &Agent,
        input: &str,
    ) -> Result<ProcessedInput, Box<dyn Error + Send + Sync>> {
        Ok(ProcessedInput::new(input.trim()))
    }

    fn system_prompt(&self, agent: &Agent) -> String {
        format!(
            "{} You are a helpful assistant. Answer concisely and ask for \
             clarification when the request is ambiguous.",
            base_prompt(agent)
        )
    }

    async fn process_output(
        &self,
        _agent: &Agent,
        output: &mut ExecutionOutput,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        output.content = output.content.trim().to_string();
        Ok(())
    }
}

/// Research framing: asks the model to cite its reasoning.
pub struct ResearcherBehavior;

#[async_trait]
impl Behavior for ResearcherBehavior {
    fn name(&self) -> &str {
        "researcher"
    }

    async fn process_input(
        &self,
        _agent: &Agent,
        input: &str,
    ) -> Result<ProcessedInput, Box<dyn Error + Send + Sync>> {
        let mut processed = ProcessedInput::new(input);
        processed.instructions = Some(String::from(
            "Structure the answer as findings followed by supporting reasoning.",
        ));
        Ok(processed)
    }

    fn system_prompt(&self, agent: &Agent) -> String {
        format!(
            "{} You are a research specialist. Be thorough, separate facts \
             from inference, and state uncertainty explicitly.",
            base_prompt(agent)
        )
    }

    async fn process_output(
        &self,
        _agent: &Agent,
        _output: &mut ExecutionOutput,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(())
    }
}

/// Process-scoped behavior registry.
pub struct BehaviorRegistry {
    behaviors: RwLock<HashMap<String, Arc<dyn Behavior>>>,
}

impl BehaviorRegistry {
    /// An empty registry. Most callers want [`BehaviorRegistry::with_defaults`].
    pub fn new() -> Self {
        Self {
            behaviors: RwLock::new(HashMap::new()),
        }
    }

    /// A registry pre-populated with the built-in behaviors.
    pub async fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(DefaultBehavior)).await;
        registry.register(Arc::new(AssistantBehavior)).await;
        registry.register(Arc::new(ResearcherBehavior)).await;
        registry
    }

    /// Register a behavior under its own name.
    pub async fn register(&self, behavior: Arc<dyn Behavior>) {
        self.behaviors
            .write()
            .await
            .insert(behavior.name().to_string(), behavior);
    }

    /// Exact lookup, no fallback.
    pub async fn get(&self, name: &str) -> Option<Arc<dyn Behavior>> {
        self.behaviors.read().await.get(name).cloned()
    }

    /// Lookup with fallback to "default". Returns `None` only when not
    /// even the default behavior is registered.
    pub async fn resolve(&self, name: &str) -> Option<Arc<dyn Behavior>> {
        let behaviors = self.behaviors.read().await;
        behaviors
            .get(name)
            .or_else(|| behaviors.get("default"))
            .cloned()
    }

    /// Registered behavior names, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.behaviors.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for BehaviorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
