//! JSON-RPC 2.0 client transports for tool servers.
//!
//! Two flavors are supported:
//!
//! - **Subprocess stdio**: the server is launched as a child process with
//!   a caller-supplied environment and working directory; frames are
//!   newline-delimited JSON on stdin/stdout, stderr is drained to the log,
//!   and lines are capped at 1 MiB. Closing sends EOF and then signals
//!   termination.
//! - **HTTP**: the request is POSTed as the JSON body
//!   (`Content-Type: application/json`) and the response read from the
//!   body. Authentication is none, Bearer, API key (configurable header),
//!   or OAuth (configurable token type). Non-200 responses are errors
//!   carrying status and body.
//!
//! Request ids are monotonic per transport. The wire methods used by the
//! discovery layer are `tools/list` (`{tools: [{name, description,
//! inputSchema}]}`) and `tools/call` (`{name, arguments}` →
//! `{content: [...], isError}`), preceded by an `initialize` handshake on
//! connect.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;

/// Longest stdout line accepted from a stdio server.
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Protocol version announced in the `initialize` handshake.
const PROTOCOL_VERSION: &str = "2024-11-05";

/// A remote tool as advertised by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema describing the accepted arguments.
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// Result of a `tools/call` invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

/// Transport-level errors.
#[derive(Debug)]
pub enum TransportError {
    /// Read/write against the peer failed.
    Io(String),
    /// The peer answered with a JSON-RPC error object.
    Rpc { code: i64, message: String },
    /// HTTP status outside 2xx, with the response body.
    Http { status: u16, body: String },
    /// A stdout line exceeded the 1 MiB cap.
    LineTooLong(usize),
    /// The transport was closed (EOF from the peer or explicit close).
    Closed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Io(msg) => write!(f, "transport i/o error: {}", msg),
            TransportError::Rpc { code, message } => {
                write!(f, "json-rpc error {}: {}", code, message)
            }
            TransportError::Http { status, body } => {
                write!(f, "http status {}: {}", status, body)
            }
            TransportError::LineTooLong(len) => {
                write!(f, "response line of {} bytes exceeds 1 MiB cap", len)
            }
            TransportError::Closed => write!(f, "transport closed (eof)"),
        }
    }
}

impl Error for TransportError {}

/// Launch parameters for a stdio tool server.
#[derive(Debug, Clone)]
pub struct StdioServerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl StdioServerConfig {
    /// Describe a server launched as `command args…`.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
        }
    }

    /// Append an argument (builder pattern).
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set an environment variable (builder pattern).
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the working directory (builder pattern).
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Authentication applied to HTTP transports.
#[derive(Debug, Clone)]
pub enum HttpAuth {
    None,
    /// `Authorization: Bearer <token>`
    Bearer { token: String },
    /// `<header>: <key>`; header defaults to `X-API-Key`.
    ApiKey { key: String, header: String },
    /// `Authorization: <token_type> <access_token>`; token type defaults
    /// to `Bearer`.
    OAuth {
        access_token: String,
        token_type: String,
    },
}

impl HttpAuth {
    /// API-key auth with the default `X-API-Key` header.
    pub fn api_key(key: impl Into<String>) -> Self {
        HttpAuth::ApiKey {
            key: key.into(),
            header: "X-API-Key".to_string(),
        }
    }

    /// OAuth auth with the default `Bearer` token type.
    pub fn oauth(access_token: impl Into<String>) -> Self {
        HttpAuth::OAuth {
            access_token: access_token.into(),
            token_type: "Bearer".to_string(),
        }
    }

    /// The header name/value pair this auth mode contributes, if any.
    pub fn header(&self) -> Option<(String, String)> {
        match self {
            HttpAuth::None => None,
            HttpAuth::Bearer { token } => {
                Some(("Authorization".to_string(), format!("Bearer {}", token)))
            }
            HttpAuth::ApiKey { key, header } => Some((header.clone(), key.clone())),
            HttpAuth::OAuth {
                access_token,
                token_type,
            } => Some((
                "Authorization".to_string(),
                format!("{} {}", token_type, access_token),
            )),
        }
    }
}

/// Endpoint parameters for an HTTP tool server.
#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    pub url: String,
    pub auth: HttpAuth,
    pub timeout: Duration,
}

impl HttpServerConfig {
    /// Describe a server reachable at `url` with no authentication.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth: HttpAuth::None,
            timeout: Duration::from_secs(30),
        }
    }

    /// Set the authentication mode (builder pattern).
    pub fn with_auth(mut self, auth: HttpAuth) -> Self {
        self.auth = auth;
        self
    }

    /// Override the per-request timeout (builder pattern).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// How to reach a tool server.
#[derive(Debug, Clone)]
pub enum TransportConfig {
    Stdio(StdioServerConfig),
    Http(HttpServerConfig),
}

/// A JSON-RPC 2.0 request/response transport.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    /// Issue one request and await its response's `result` member.
    async fn request(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Value, Box<dyn Error + Send + Sync>>;

    /// Fire a notification (no id, no response).
    async fn notify(
        &self,
        method: &str,
        params: Value,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Tear the transport down.
    async fn close(&self);
}

fn parse_response(frame: &Value) -> Result<Value, Box<dyn Error + Send + Sync>> {
    if let Some(err) = frame.get("error") {
        let code = err.get("code").and_then(Value::as_i64).unwrap_or(-32000);
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Err(Box::new(TransportError::Rpc { code, message }));
    }
    Ok(frame.get("result").cloned().unwrap_or(Value::Null))
}

struct StdioIo {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// Newline-delimited JSON-RPC over a child process's stdio.
pub struct StdioTransport {
    child: Mutex<Child>,
    io: Mutex<StdioIo>,
    next_id: AtomicU64,
    command: String,
}

impl StdioTransport {
    /// Spawn the server process and wire up its streams. The stderr drain
    /// runs as a detached task and logs each line.
    pub async fn spawn(config: &StdioServerConfig) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let mut command = tokio::process::Command::new(&config.command);
        command
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &config.env {
            command.env(key, value);
        }
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            TransportError::Io(format!("failed to spawn '{}': {}", config.command, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Io("tool server has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Io("tool server has no stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::Io("tool server has no stderr".into()))?;

        let cmd = config.command.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                log::debug!("[{} stderr] {}", cmd, line);
            }
        });

        Ok(Self {
            child: Mutex::new(child),
            io: Mutex::new(StdioIo {
                stdin,
                stdout: BufReader::new(stdout),
            }),
            next_id: AtomicU64::new(1),
            command: config.command.clone(),
        })
    }

    async fn write_frame(
        io: &mut StdioIo,
        frame: &Value,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut payload = serde_json::to_vec(frame)?;
        payload.push(b'\n');
        io.stdin
            .write_all(&payload)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        io.stdin
            .flush()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(())
    }

    async fn read_frame(io: &mut StdioIo) -> Result<Value, Box<dyn Error + Send + Sync>> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = io
                .stdout
                .read_line(&mut line)
                .await
                .map_err(|e| TransportError::Io(e.to_string()))?;
            if n == 0 {
                return Err(Box::new(TransportError::Closed));
            }
            if n > MAX_LINE_BYTES {
                return Err(Box::new(TransportError::LineTooLong(n)));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Ok(serde_json::from_str(trimmed)?);
        }
    }
}

#[async_trait]
impl ToolTransport for StdioTransport {
    async fn request(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Value, Box<dyn Error + Send + Sync>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let mut io = self.io.lock().await;
        Self::write_frame(&mut io, &frame).await?;

        // Skip notifications and stale responses until our id appears.
        loop {
            let message = Self::read_frame(&mut io).await?;
            if message.get("id").and_then(Value::as_u64) == Some(id) {
                return parse_response(&message);
            }
            log::debug!(
                "[{}] skipping unsolicited frame: {}",
                self.command,
                message.get("method").and_then(Value::as_str).unwrap_or("?")
            );
        }
    }

    async fn notify(
        &self,
        method: &str,
        params: Value,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let frame = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        let mut io = self.io.lock().await;
        Self::write_frame(&mut io, &frame).await
    }

    async fn close(&self) {
        // EOF first so a cooperative server can exit on its own.
        {
            let mut io = self.io.lock().await;
            let _ = io.stdin.shutdown().await;
        }
        let mut child = self.child.lock().await;
        match tokio::time::timeout(Duration::from_secs(2), child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                log::warn!("tool server '{}' did not exit on eof; killing", self.command);
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
    }
}

/// JSON-RPC POSTed to an HTTP endpoint.
pub struct HttpTransport {
    config: HttpServerConfig,
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl HttpTransport {
    /// Build a transport against the configured endpoint. The underlying
    /// `reqwest` client keeps per-host connections pooled.
    pub fn new(config: HttpServerConfig) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let client = reqwest::ClientBuilder::new()
            .pool_max_idle_per_host(8)
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .connect_timeout(Duration::from_secs(10))
            .timeout(config.timeout)
            .build()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(Self {
            config,
            client,
            next_id: AtomicU64::new(1),
        })
    }

    async fn post(&self, frame: &Value) -> Result<Option<Value>, Box<dyn Error + Send + Sync>> {
        let mut request = self
            .client
            .post(&self.config.url)
            .header("Content-Type", "application/json")
            .json(frame);
        if let Some((name, value)) = self.config.auth.header() {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        if !status.is_success() {
            return Err(Box::new(TransportError::Http {
                status: status.as_u16(),
                body,
            }));
        }
        if body.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&body)?))
    }
}

#[async_trait]
impl ToolTransport for HttpTransport {
    async fn request(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Value, Box<dyn Error + Send + Sync>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        match self.post(&frame).await? {
            Some(body) => parse_response(&body),
            None => Err(Box::new(TransportError::Io(
                "empty response body".to_string(),
            ))),
        }
    }

    async fn notify(
        &self,
        method: &str,
        params: Value,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let frame = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.post(&frame).await.map(|_| ())
    }

    async fn close(&self) {}
}

/// A connected tool server: a named transport plus the wire conventions
/// (`initialize`, `tools/list`, `tools/call`).
pub struct ToolServerConnection {
    server: String,
    transport: Box<dyn ToolTransport>,
}

impl ToolServerConnection {
    /// Establish a connection per the transport config and run the
    /// `initialize` handshake.
    pub async fn connect(
        server: impl Into<String>,
        config: &TransportConfig,
    ) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let server = server.into();
        let transport: Box<dyn ToolTransport> = match config {
            TransportConfig::Stdio(stdio) => Box::new(StdioTransport::spawn(stdio).await?),
            TransportConfig::Http(http) => Box::new(HttpTransport::new(http.clone())?),
        };

        let conn = Self { server, transport };
        conn.transport
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "agentmesh",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            )
            .await?;
        conn.transport
            .notify("notifications/initialized", json!({}))
            .await?;
        Ok(conn)
    }

    /// Server name this connection belongs to.
    pub fn server(&self) -> &str {
        &self.server
    }

    /// `tools/list`: the server's advertised catalog.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, Box<dyn Error + Send + Sync>> {
        let result = self.transport.request("tools/list", json!({})).await?;
        let tools = result.get("tools").cloned().unwrap_or(json!([]));
        Ok(serde_json::from_value(tools)?)
    }

    /// `tools/call`: invoke one tool with JSON arguments.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<ToolCallResult, Box<dyn Error + Send + Sync>> {
        let result = self
            .transport
            .request("tools/call", json!({"name": name, "arguments": arguments}))
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Close the underlying transport.
    pub async fn close(&self) {
        self.transport.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_headers() {
        assert!(HttpAuth::None.header().is_none());

        let (name, value) = HttpAuth::Bearer {
            token: "tok".into(),
        }
        .header()
        .unwrap();
        assert_eq!(name, "Authorization");
        assert_eq!(value, "Bearer tok");

        let (name, value) = HttpAuth::api_key("secret").header().unwrap();
        assert_eq!(name, "X-API-Key");
        assert_eq!(value, "secret");

        let (name, value) = HttpAuth::oauth("tok").header().unwrap();
        assert_eq!(name, "Authorization");
        assert_eq!(value, "Bearer tok");

        let (_, value) = HttpAuth::OAuth {
            access_token: "tok".into(),
            token_type: "MAC".into(),
        }
        .header()
        .unwrap();
        assert_eq!(value, "MAC tok");
    }

    #[test]
    fn response_parsing() {
        let ok = json!({"jsonrpc": "2.0", "id": 1, "result": {"tools": []}});
        assert_eq!(parse_response(&ok).unwrap(), json!({"tools": []}));

        let err = json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32601, "message": "method not found"}});
        let e = parse_response(&err).unwrap_err();
        assert!(e.to_string().contains("-32601"));
        assert!(e.to_string().contains("method not found"));
    }

    #[test]
    fn tool_descriptor_deserializes_wire_shape() {
        let wire = json!({
            "name": "search",
            "description": "Full-text search",
            "inputSchema": {
                "type": "object",
                "properties": {"query": {"type": "string"}},
                "required": ["query"]
            }
        });
        let tool: ToolDescriptor = serde_json::from_value(wire).unwrap();
        assert_eq!(tool.name, "search");
        assert_eq!(tool.input_schema["required"][0], "query");
    }

    #[test]
    fn tool_call_result_defaults() {
        let wire = json!({"content": [{"type": "text", "text": "4"}]});
        let result: ToolCallResult = serde_json::from_value(wire).unwrap();
        assert!(!result.is_error);
        assert_eq!(result.content.len(), 1);

        let wire = json!({"content": [], "isError": true});
        let result: ToolCallResult = serde_json::from_value(wire).unwrap();
        assert!(result.is_error);
    }
}
