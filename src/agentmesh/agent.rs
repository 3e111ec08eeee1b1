//! Agent definitions.
//!
//! An [`Agent`] is a configured worker template: identity, a behavior
//! type resolved against the behavior registry at execution time, model
//! configuration, a capability list, and a lifecycle status. Only Active
//! and Draft agents can be invoked.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of an agent definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Draft,
    Active,
    Inactive,
    Archived,
}

impl AgentStatus {
    /// Whether an agent in this state may be executed.
    pub fn is_executable(&self) -> bool {
        matches!(self, AgentStatus::Active | AgentStatus::Draft)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Draft => write!(f, "draft"),
            AgentStatus::Active => write!(f, "active"),
            AgentStatus::Inactive => write!(f, "inactive"),
            AgentStatus::Archived => write!(f, "archived"),
        }
    }
}

/// Model invocation parameters. Unset fields fall back to the executor's
/// defaults (model id, temperature 0.7, 1000 tokens).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<usize>,
    pub personality: Option<String>,
    pub language: Option<String>,
}

impl AgentConfig {
    /// Check invariants; temperature must lie in `[0, 2]`.
    pub fn validate(&self) -> Result<(), AgentError> {
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(AgentError::Validation(format!(
                    "temperature {} is outside [0, 2]",
                    t
                )));
            }
        }
        Ok(())
    }
}

/// Errors raised by agent validation and lookup.
#[derive(Debug, Clone)]
pub enum AgentError {
    /// Invalid agent definition or configuration.
    Validation(String),
    /// No agent registered under the id.
    NotFound(String),
    /// The agent's lifecycle status forbids execution.
    NotExecutable { id: String, status: AgentStatus },
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::Validation(msg) => write!(f, "invalid agent: {}", msg),
            AgentError::NotFound(id) => write!(f, "agent not found: {}", id),
            AgentError::NotExecutable { id, status } => {
                write!(f, "agent {} cannot be invoked while {}", id, status)
            }
        }
    }
}

impl Error for AgentError {}

/// A configured worker template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Resolved against the behavior registry at execution time; falls
    /// back to "default" when unknown.
    pub behavior_type: String,
    pub status: AgentStatus,
    pub config: AgentConfig,
    pub capabilities: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    /// A draft agent with a fresh id and the default behavior.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: description.into(),
            behavior_type: String::from("default"),
            status: AgentStatus::Draft,
            config: AgentConfig::default(),
            capabilities: Vec::new(),
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the behavior type (builder pattern).
    pub fn with_behavior(mut self, behavior_type: impl Into<String>) -> Self {
        self.behavior_type = behavior_type.into();
        self
    }

    /// Set the lifecycle status (builder pattern).
    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = status;
        self
    }

    /// Replace the model configuration (builder pattern).
    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    /// Add one capability (builder pattern).
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    /// Check the definition's invariants.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.name.trim().is_empty() {
            return Err(AgentError::Validation("name must not be empty".into()));
        }
        self.config.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperature_bounds() {
        let mut agent = Agent::new("a", "d");
        agent.config.temperature = Some(0.0);
        assert!(agent.validate().is_ok());
        agent.config.temperature = Some(2.0);
        assert!(agent.validate().is_ok());
        agent.config.temperature = Some(2.01);
        assert!(agent.validate().is_err());
        agent.config.temperature = Some(-0.01);
        assert!(agent.validate().is_err());
    }

    #[test]
    fn executable_states() {
        assert!(AgentStatus::Active.is_executable());
        assert!(AgentStatus::Draft.is_executable());
        assert!(!AgentStatus::Inactive.is_executable());
        assert!(!AgentStatus::Archived.is_executable());
    }

    #[test]
    fn empty_name_is_invalid() {
        let agent = Agent::new("  ", "d");
        assert!(agent.validate().is_err());
    }
}
