//! Local tool registry.
//!
//! Tools (local functions or bridged remote capabilities) are registered
//! under unique names and executed through the [`ToolProtocol`] trait.
//! Arguments are validated against each tool's JSON schema before the
//! protocol sees them, so implementations can assume well-formed input.
//!
//! The registry takes `&self` everywhere and is safe to share behind an
//! `Arc`: the orchestrator, workers, and the tool bridge all hold the same
//! instance.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentmesh::tool_protocol::{LocalToolProtocol, ToolMetadata, ToolRegistry, ToolResult};
//! use std::sync::Arc;
//!
//! # async {
//! let local = Arc::new(LocalToolProtocol::new());
//! local
//!     .register(
//!         ToolMetadata::new("add", "Add two numbers").with_schema(serde_json::json!({
//!             "type": "object",
//!             "required": ["a", "b"],
//!             "properties": {"a": {"type": "number"}, "b": {"type": "number"}}
//!         })),
//!         Arc::new(|args| {
//!             let a = args["a"].as_f64().unwrap_or(0.0);
//!             let b = args["b"].as_f64().unwrap_or(0.0);
//!             Ok(ToolResult::success(serde_json::json!({"sum": a + b})))
//!         }),
//!     )
//!     .await;
//!
//! let registry = ToolRegistry::new();
//! registry.register_protocol_tools(local).await.unwrap();
//!
//! let result = registry
//!     .execute_tool("add", serde_json::json!({"a": 2, "b": 2}))
//!     .await
//!     .unwrap();
//! assert_eq!(result.output["sum"], 4.0);
//! # };
//! ```

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::agentmesh::schema::SchemaValidator;

/// Result of a tool execution.
#[derive(Debug, Clone)]
pub struct ToolResult {
    /// Whether the tool completed successfully.
    pub success: bool,
    /// Output payload; `Value::Null` for failures.
    pub output: Value,
    /// Failure message when `success` is false.
    pub error: Option<String>,
}

impl ToolResult {
    /// Successful execution with the given output.
    pub fn success(output: Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    /// Failed execution with the given message.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Value::Null,
            error: Some(error.into()),
        }
    }
}

/// Identity and argument schema of a registered tool.
#[derive(Debug, Clone)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
    /// JSON schema validated before execution; `Value::Null` disables
    /// validation for this tool.
    pub input_schema: Value,
}

impl ToolMetadata {
    /// Metadata with no argument schema.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: Value::Null,
        }
    }

    /// Attach the argument schema (builder pattern).
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }
}

/// Errors raised by registry operations.
#[derive(Debug, Clone)]
pub enum ToolError {
    /// No tool registered under the requested name.
    NotFound(String),
    /// Arguments failed schema validation.
    InvalidArguments(String),
    /// The protocol reported an execution failure.
    ExecutionFailed(String),
    /// A name collision on registration.
    DuplicateName(String),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::NotFound(name) => write!(f, "tool not found: {}", name),
            ToolError::InvalidArguments(msg) => write!(f, "invalid arguments: {}", msg),
            ToolError::ExecutionFailed(msg) => write!(f, "tool execution failed: {}", msg),
            ToolError::DuplicateName(name) => {
                write!(f, "tool '{}' is already registered", name)
            }
        }
    }
}

impl Error for ToolError {}

/// Executes tools on behalf of the registry.
#[async_trait]
pub trait ToolProtocol: Send + Sync {
    /// Execute the named tool with validated JSON arguments.
    async fn execute(
        &self,
        tool_name: &str,
        arguments: Value,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>>;

    /// Metadata for every tool this protocol serves.
    async fn list_tools(&self) -> Vec<ToolMetadata>;

    /// Short protocol identifier used in logs.
    fn protocol_name(&self) -> &str;
}

/// Synchronous local tool function.
pub type ToolFunction =
    Arc<dyn Fn(Value) -> Result<ToolResult, Box<dyn Error + Send + Sync>> + Send + Sync>;

/// In-process tool protocol backed by registered Rust closures.
pub struct LocalToolProtocol {
    tools: RwLock<HashMap<String, (ToolMetadata, ToolFunction)>>,
}

impl LocalToolProtocol {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Register a closure-backed tool, replacing any previous registration
    /// under the same name.
    pub async fn register(&self, metadata: ToolMetadata, function: ToolFunction) {
        self.tools
            .write()
            .await
            .insert(metadata.name.clone(), (metadata, function));
    }

    /// Remove a tool by name.
    pub async fn unregister(&self, name: &str) {
        self.tools.write().await.remove(name);
    }
}

impl Default for LocalToolProtocol {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolProtocol for LocalToolProtocol {
    async fn execute(
        &self,
        tool_name: &str,
        arguments: Value,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let function = {
            let tools = self.tools.read().await;
            match tools.get(tool_name) {
                Some((_, function)) => function.clone(),
                None => return Err(Box::new(ToolError::NotFound(tool_name.to_string()))),
            }
        };
        function(arguments)
    }

    async fn list_tools(&self) -> Vec<ToolMetadata> {
        self.tools
            .read()
            .await
            .values()
            .map(|(metadata, _)| metadata.clone())
            .collect()
    }

    fn protocol_name(&self) -> &str {
        "local"
    }
}

struct RegisteredTool {
    metadata: ToolMetadata,
    protocol: Arc<dyn ToolProtocol>,
    /// Name under which the backing protocol knows this tool. Differs from
    /// `metadata.name` for bridged tools, which are namespaced locally.
    protocol_tool_name: String,
}

/// Shared registry of executable tools.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, RegisteredTool>>,
    validator: SchemaValidator,
}

impl ToolRegistry {
    /// Registry with relaxed argument validation.
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            validator: SchemaValidator::relaxed(),
        }
    }

    /// Registry with strict argument validation (unknown fields rejected).
    pub fn strict() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            validator: SchemaValidator::strict(),
        }
    }

    /// Register one tool under `metadata.name`, executed through
    /// `protocol` under `protocol_tool_name`.
    pub async fn register_tool(
        &self,
        metadata: ToolMetadata,
        protocol: Arc<dyn ToolProtocol>,
        protocol_tool_name: impl Into<String>,
    ) -> Result<(), ToolError> {
        let mut tools = self.tools.write().await;
        let name = metadata.name.clone();
        if tools.contains_key(&name) {
            return Err(ToolError::DuplicateName(name));
        }
        tools.insert(
            name,
            RegisteredTool {
                metadata,
                protocol,
                protocol_tool_name: protocol_tool_name.into(),
            },
        );
        Ok(())
    }

    /// Discover and register every tool a protocol serves, under the
    /// tools' own names.
    pub async fn register_protocol_tools(
        &self,
        protocol: Arc<dyn ToolProtocol>,
    ) -> Result<usize, ToolError> {
        let discovered = protocol.list_tools().await;
        let mut registered = 0;
        for metadata in discovered {
            let protocol_name = metadata.name.clone();
            self.register_tool(metadata, protocol.clone(), protocol_name)
                .await?;
            registered += 1;
        }
        Ok(registered)
    }

    /// Remove a tool by name; returns whether it was present.
    pub async fn unregister_tool(&self, name: &str) -> bool {
        self.tools.write().await.remove(name).is_some()
    }

    /// Remove every tool whose name starts with `prefix`; returns the
    /// removed names.
    pub async fn unregister_prefix(&self, prefix: &str) -> Vec<String> {
        let mut tools = self.tools.write().await;
        let doomed: Vec<String> = tools
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        for name in &doomed {
            tools.remove(name);
        }
        doomed
    }

    /// Metadata for one tool.
    pub async fn get_tool(&self, name: &str) -> Option<ToolMetadata> {
        self.tools.read().await.get(name).map(|t| t.metadata.clone())
    }

    /// Metadata for every registered tool, sorted by name.
    pub async fn list_tools(&self) -> Vec<ToolMetadata> {
        let tools = self.tools.read().await;
        let mut out: Vec<ToolMetadata> = tools.values().map(|t| t.metadata.clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Number of registered tools.
    pub async fn len(&self) -> usize {
        self.tools.read().await.len()
    }

    /// True when no tools are registered.
    pub async fn is_empty(&self) -> bool {
        self.tools.read().await.is_empty()
    }

    /// Validate arguments and execute the named tool.
    pub async fn execute_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let (schema, protocol, protocol_tool_name) = {
            let tools = self.tools.read().await;
            let tool = tools
                .get(name)
                .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
            (
                tool.metadata.input_schema.clone(),
                tool.protocol.clone(),
                tool.protocol_tool_name.clone(),
            )
        };

        if !schema.is_null() {
            if let Err(violation) = self.validator.validate(&arguments, &schema) {
                return Err(Box::new(ToolError::InvalidArguments(violation.to_string())));
            }
        }

        log::debug!(
            "executing tool '{}' via protocol '{}'",
            name,
            protocol.protocol_name()
        );
        protocol.execute(&protocol_tool_name, arguments).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn echo_protocol() -> Arc<LocalToolProtocol> {
        let local = Arc::new(LocalToolProtocol::new());
        local
            .register(
                ToolMetadata::new("echo", "Echo the input").with_schema(json!({
                    "type": "object",
                    "required": ["text"],
                    "properties": {"text": {"type": "string"}}
                })),
                Arc::new(|args| Ok(ToolResult::success(json!({"echo": args["text"]})))),
            )
            .await;
        local
    }

    #[tokio::test]
    async fn register_and_execute() {
        let registry = ToolRegistry::new();
        registry
            .register_protocol_tools(echo_protocol().await)
            .await
            .unwrap();

        let result = registry
            .execute_tool("echo", json!({"text": "hi"}))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output["echo"], "hi");
    }

    #[tokio::test]
    async fn invalid_arguments_are_rejected_before_execution() {
        let registry = ToolRegistry::new();
        registry
            .register_protocol_tools(echo_protocol().await)
            .await
            .unwrap();

        let err = registry
            .execute_tool("echo", json!({"text": 42}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid arguments"));
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let registry = ToolRegistry::new();
        let err = registry.execute_tool("ghost", json!({})).await.unwrap_err();
        assert!(err.to_string().contains("tool not found"));
    }

    #[tokio::test]
    async fn duplicate_registration_is_a_conflict() {
        let registry = ToolRegistry::new();
        let local = echo_protocol().await;
        registry
            .register_protocol_tools(local.clone())
            .await
            .unwrap();

        let err = registry
            .register_tool(
                ToolMetadata::new("echo", "again"),
                local as Arc<dyn ToolProtocol>,
                "echo",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::DuplicateName(_)));
    }

    #[tokio::test]
    async fn unregister_prefix_removes_namespace() {
        let registry = ToolRegistry::new();
        let local = echo_protocol().await;
        for name in ["mcp_files_read", "mcp_files_write", "mcp_web_fetch", "calc"] {
            registry
                .register_tool(
                    ToolMetadata::new(name, "t"),
                    local.clone() as Arc<dyn ToolProtocol>,
                    name,
                )
                .await
                .unwrap();
        }

        let removed = registry.unregister_prefix("mcp_files_").await;
        assert_eq!(removed.len(), 2);
        assert_eq!(registry.len().await, 2);
        assert!(registry.get_tool("mcp_web_fetch").await.is_some());
        assert!(registry.get_tool("calc").await.is_some());
    }
}
