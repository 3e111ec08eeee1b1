#![cfg(unix)]

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use agentmesh::agentmesh::discovery::{DiscoveryConfig, ToolServerManager};
use agentmesh::agentmesh::tool_bridge::ToolBridge;
use agentmesh::agentmesh::tool_protocol::ToolRegistry;
use agentmesh::agentmesh::transport::{
    StdioServerConfig, ToolServerConnection, TransportConfig,
};

/// A line-delimited JSON-RPC tool server as a shell script: answers
/// initialize, tools/list, and tools/call, and exits on stdin EOF.
const FAKE_SERVER: &str = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","serverInfo":{"name":"fake"}}}\n' "$id"
      ;;
    *'"method":"notifications/initialized"'*)
      ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"greet","description":"Greets","inputSchema":{"type":"object","required":["name"],"properties":{"name":{"type":"string"}}}}]}}\n' "$id"
      ;;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"hello"}],"isError":false}}\n' "$id"
      ;;
    *)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"method not found"}}\n' "$id"
      ;;
  esac
done
"#;

fn write_server_script() -> tempfile::TempPath {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(FAKE_SERVER.as_bytes()).unwrap();
    let path = file.into_temp_path();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn stdio_config(path: &std::path::Path) -> TransportConfig {
    TransportConfig::Stdio(StdioServerConfig::new(path.to_string_lossy().to_string()))
}

#[tokio::test]
async fn stdio_round_trip_against_a_subprocess_server() {
    let script = write_server_script();
    let conn = ToolServerConnection::connect("fake", &stdio_config(&script))
        .await
        .unwrap();

    let tools = conn.list_tools().await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "greet");
    assert_eq!(tools[0].input_schema["required"][0], "name");

    let result = conn
        .call_tool("greet", json!({"name": "world"}))
        .await
        .unwrap();
    assert!(!result.is_error);
    assert_eq!(result.content[0]["text"], "hello");

    conn.close().await;
}

/// A server that rejects the initialize handshake outright.
const REFUSING_SERVER: &str = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32000,"message":"not today"}}\n' "$id"
done
"#;

#[tokio::test]
async fn refused_initialize_fails_the_connect() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(REFUSING_SERVER.as_bytes()).unwrap();
    let path = file.into_temp_path();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();

    let err = ToolServerConnection::connect("refusing", &stdio_config(&path))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not today"), "{}", err);
}

#[tokio::test]
async fn manager_discovery_hits_the_cache_on_the_second_read() {
    let script = write_server_script();
    let manager = ToolServerManager::new(DiscoveryConfig::default());
    manager.add_server("fake", stdio_config(&script)).await;

    let token = CancellationToken::new();
    let first = manager.discover_tools("fake", &token).await.unwrap();
    assert_eq!(first.len(), 1);

    let second = manager.discover_tools("fake", &token).await.unwrap();
    assert_eq!(second.len(), 1);

    let stats = manager.cache().stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);

    // Health sees a connected server with discovered tools.
    let health = manager.health().check_server("fake").await;
    assert!(health.connected);
    assert_eq!(health.tools_discovered, 1);

    manager.close().await;
}

#[tokio::test]
async fn bridge_registers_and_executes_namespaced_tools_end_to_end() {
    let script = write_server_script();
    let manager = Arc::new(ToolServerManager::new(DiscoveryConfig::default()));
    manager.add_server("fake", stdio_config(&script)).await;

    let registry = Arc::new(ToolRegistry::new());
    let bridge = ToolBridge::new(
        manager.clone(),
        registry.clone(),
        CancellationToken::new(),
    );

    let names = bridge.register_server_tools("fake").await.unwrap();
    assert_eq!(names, vec!["mcp_fake_greet"]);

    let result = registry
        .execute_tool("mcp_fake_greet", json!({"name": "world"}))
        .await
        .unwrap();
    assert!(result.success);

    // Schema validation happens locally, before the wire.
    let err = registry
        .execute_tool("mcp_fake_greet", json!({"name": 7}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("invalid arguments"));

    bridge.unregister_server_tools("fake").await;
    assert!(registry.is_empty().await);

    manager.close().await;
}
