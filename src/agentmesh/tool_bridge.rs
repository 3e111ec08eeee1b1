//! Bridges remote tool servers into the local tool registry.
//!
//! Each remote tool is registered under the namespaced name
//! `mcp_<server>_<tool>` so catalogs from different servers cannot
//! collide. Refreshing a server's registration is
//! unregister-then-register, which makes the operation idempotent: running
//! it twice leaves the registry in the same state.
//!
//! Agents see bridged tools through capability gating. An agent's
//! capability set grants access at three scopes:
//!
//! | capability | grants |
//! |---|---|
//! | `mcp_integration` | every bridged tool |
//! | `mcp_<server>` | every tool on one server |
//! | `mcp_<server>_<tool>` | a single tool |

use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::agentmesh::discovery::ToolServerManager;
use crate::agentmesh::tool_protocol::{ToolMetadata, ToolProtocol, ToolRegistry, ToolResult};
use crate::agentmesh::transport::{ToolCallResult, ToolDescriptor};

/// The remote side the bridge adapts: discovery plus invocation.
///
/// [`ToolServerManager`] is the production implementation; tests provide
/// in-memory fakes.
#[async_trait]
pub trait ToolSource: Send + Sync {
    async fn discover(
        &self,
        server: &str,
        token: &CancellationToken,
    ) -> Result<Vec<ToolDescriptor>, Box<dyn Error + Send + Sync>>;

    async fn call(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        token: &CancellationToken,
    ) -> Result<ToolCallResult, Box<dyn Error + Send + Sync>>;
}

#[async_trait]
impl ToolSource for ToolServerManager {
    async fn discover(
        &self,
        server: &str,
        token: &CancellationToken,
    ) -> Result<Vec<ToolDescriptor>, Box<dyn Error + Send + Sync>> {
        self.discover_tools(server, token).await
    }

    async fn call(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        token: &CancellationToken,
    ) -> Result<ToolCallResult, Box<dyn Error + Send + Sync>> {
        self.call_tool(server, tool, arguments, token).await
    }
}

/// The namespaced registry name for a remote tool.
pub fn bridged_name(server: &str, tool: &str) -> String {
    format!("mcp_{}_{}", server, tool)
}

/// True when `capabilities` grants access to `tool` on `server`.
pub fn capability_allows(capabilities: &[String], server: &str, tool: &str) -> bool {
    let server_scope = format!("mcp_{}", server);
    let tool_scope = bridged_name(server, tool);
    capabilities.iter().any(|cap| {
        cap == "mcp_integration" || *cap == server_scope || *cap == tool_scope
    })
}

/// Routes a bridged tool's execution back to its server.
struct BridgedToolProtocol {
    source: Arc<dyn ToolSource>,
    server: String,
    token: CancellationToken,
}

#[async_trait]
impl ToolProtocol for BridgedToolProtocol {
    async fn execute(
        &self,
        tool_name: &str,
        arguments: Value,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let call = self
            .source
            .call(&self.server, tool_name, arguments, &self.token)
            .await?;
        if call.is_error {
            let message = call
                .content
                .iter()
                .filter_map(|c| c.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n");
            Ok(ToolResult::failure(if message.is_empty() {
                format!("tool '{}' reported an error", tool_name)
            } else {
                message
            }))
        } else {
            Ok(ToolResult::success(Value::Array(call.content)))
        }
    }

    async fn list_tools(&self) -> Vec<ToolMetadata> {
        // The bridge registers tools explicitly; the protocol itself does
        // not advertise a catalog.
        Vec::new()
    }

    fn protocol_name(&self) -> &str {
        "mcp"
    }
}

/// Tracks which bridged names belong to which server.
#[derive(Default)]
struct BridgeState {
    /// server → [(bridged name, remote name)]
    registered: HashMap<String, Vec<(String, String)>>,
}

/// Adapts remote tool catalogs into a shared [`ToolRegistry`].
pub struct ToolBridge {
    source: Arc<dyn ToolSource>,
    registry: Arc<ToolRegistry>,
    state: RwLock<BridgeState>,
    token: CancellationToken,
}

impl ToolBridge {
    /// Create a bridge between `source` and `registry`.
    pub fn new(
        source: Arc<dyn ToolSource>,
        registry: Arc<ToolRegistry>,
        token: CancellationToken,
    ) -> Self {
        Self {
            source,
            registry,
            state: RwLock::new(BridgeState::default()),
            token,
        }
    }

    /// Discover a server's catalog and register each tool under its
    /// namespaced name. Returns the registered names.
    pub async fn register_server_tools(
        &self,
        server: &str,
    ) -> Result<Vec<String>, Box<dyn Error + Send + Sync>> {
        let descriptors = self.source.discover(server, &self.token).await?;
        let protocol: Arc<dyn ToolProtocol> = Arc::new(BridgedToolProtocol {
            source: self.source.clone(),
            server: server.to_string(),
            token: self.token.clone(),
        });

        let mut names = Vec::with_capacity(descriptors.len());
        let mut pairs = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let name = bridged_name(server, &descriptor.name);
            let metadata = ToolMetadata::new(name.clone(), descriptor.description.clone())
                .with_schema(descriptor.input_schema.clone());
            self.registry
                .register_tool(metadata, protocol.clone(), descriptor.name.clone())
                .await?;
            pairs.push((name.clone(), descriptor.name));
            names.push(name);
        }

        self.state
            .write()
            .await
            .registered
            .insert(server.to_string(), pairs);
        log::info!("bridged {} tools from server '{}'", names.len(), server);
        Ok(names)
    }

    /// Remove every bridged tool belonging to `server`. Returns the
    /// removed names.
    pub async fn unregister_server_tools(&self, server: &str) -> Vec<String> {
        self.state.write().await.registered.remove(server);
        self.registry
            .unregister_prefix(&format!("mcp_{}_", server))
            .await
    }

    /// Refresh a server's registration: unregister, then register from a
    /// fresh discovery.
    pub async fn refresh_server_tools(
        &self,
        server: &str,
    ) -> Result<Vec<String>, Box<dyn Error + Send + Sync>> {
        self.unregister_server_tools(server).await;
        self.register_server_tools(server).await
    }

    /// Bridged tool metadata visible to an agent with `capabilities`.
    pub async fn tools_for_capabilities(&self, capabilities: &[String]) -> Vec<ToolMetadata> {
        let state = self.state.read().await;
        let mut out = Vec::new();
        for (server, pairs) in &state.registered {
            for (bridged, remote) in pairs {
                if capability_allows(capabilities, server, remote) {
                    if let Some(metadata) = self.registry.get_tool(bridged).await {
                        out.push(metadata);
                    }
                }
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Servers with at least one bridged tool.
    pub async fn bridged_servers(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut servers: Vec<String> = state.registered.keys().cloned().collect();
        servers.sort();
        servers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct FakeSource {
        tools: Vec<ToolDescriptor>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl FakeSource {
        fn new(tools: Vec<ToolDescriptor>) -> Arc<Self> {
            Arc::new(Self {
                tools,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ToolSource for FakeSource {
        async fn discover(
            &self,
            _server: &str,
            _token: &CancellationToken,
        ) -> Result<Vec<ToolDescriptor>, Box<dyn Error + Send + Sync>> {
            Ok(self.tools.clone())
        }

        async fn call(
            &self,
            server: &str,
            tool: &str,
            _arguments: Value,
            _token: &CancellationToken,
        ) -> Result<ToolCallResult, Box<dyn Error + Send + Sync>> {
            self.calls
                .lock()
                .unwrap()
                .push((server.to_string(), tool.to_string()));
            Ok(ToolCallResult {
                content: vec![json!({"type": "text", "text": "ok"})],
                is_error: false,
            })
        }
    }

    fn descriptor(name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: format!("{} tool", name),
            input_schema: json!({"type": "object"}),
        }
    }

    fn bridge_with(tools: Vec<ToolDescriptor>) -> (ToolBridge, Arc<ToolRegistry>) {
        let registry = Arc::new(ToolRegistry::new());
        let bridge = ToolBridge::new(
            FakeSource::new(tools),
            registry.clone(),
            CancellationToken::new(),
        );
        (bridge, registry)
    }

    #[tokio::test]
    async fn registers_namespaced_tools() {
        let (bridge, registry) = bridge_with(vec![descriptor("read"), descriptor("write")]);
        let names = bridge.register_server_tools("files").await.unwrap();

        assert_eq!(names, vec!["mcp_files_read", "mcp_files_write"]);
        assert!(registry.get_tool("mcp_files_read").await.is_some());
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn execution_routes_to_the_remote_name() {
        let source = FakeSource::new(vec![descriptor("read")]);
        let registry = Arc::new(ToolRegistry::new());
        let bridge = ToolBridge::new(source.clone(), registry.clone(), CancellationToken::new());
        bridge.register_server_tools("files").await.unwrap();

        let result = registry
            .execute_tool("mcp_files_read", json!({}))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(
            source.calls.lock().unwrap().as_slice(),
            &[("files".to_string(), "read".to_string())]
        );
    }

    #[tokio::test]
    async fn unregister_then_register_is_idempotent_refresh() {
        let (bridge, registry) = bridge_with(vec![descriptor("read")]);
        bridge.register_server_tools("files").await.unwrap();
        let before: Vec<_> = registry.list_tools().await.iter().map(|t| t.name.clone()).collect();

        bridge.refresh_server_tools("files").await.unwrap();
        let after: Vec<_> = registry.list_tools().await.iter().map(|t| t.name.clone()).collect();

        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn unregister_restores_prior_registry_state() {
        let (bridge, registry) = bridge_with(vec![descriptor("read"), descriptor("write")]);
        assert!(registry.is_empty().await);

        bridge.register_server_tools("files").await.unwrap();
        let removed = bridge.unregister_server_tools("files").await;

        assert_eq!(removed.len(), 2);
        assert!(registry.is_empty().await);
        assert!(bridge.bridged_servers().await.is_empty());
    }

    #[tokio::test]
    async fn capability_scopes() {
        let caps = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        assert!(capability_allows(&caps(&["mcp_integration"]), "files", "read"));
        assert!(capability_allows(&caps(&["mcp_files"]), "files", "read"));
        assert!(capability_allows(&caps(&["mcp_files_read"]), "files", "read"));
        assert!(!capability_allows(&caps(&["mcp_files_read"]), "files", "write"));
        assert!(!capability_allows(&caps(&["mcp_web"]), "files", "read"));
        assert!(!capability_allows(&caps(&["research"]), "files", "read"));
    }

    #[tokio::test]
    async fn tools_for_capabilities_filters_by_scope() {
        let (bridge, _registry) = bridge_with(vec![descriptor("read"), descriptor("write")]);
        bridge.register_server_tools("files").await.unwrap();

        let all = bridge
            .tools_for_capabilities(&["mcp_integration".to_string()])
            .await;
        assert_eq!(all.len(), 2);

        let one = bridge
            .tools_for_capabilities(&["mcp_files_write".to_string()])
            .await;
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].name, "mcp_files_write");

        let none = bridge.tools_for_capabilities(&["research".to_string()]).await;
        assert!(none.is_empty());
    }
}
