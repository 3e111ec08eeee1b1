//! Tool-server discovery and invocation.
//!
//! [`ToolServerManager`] is the single entry point for talking to remote
//! tool servers. Every operation composes the resilience stack in a fixed
//! order:
//!
//! ```text
//! discover_tools / call_tool
//!   └─ tool cache (discovery only)
//!        └─ connection pool (bounded, keyed by server)
//!             └─ retry (backoff + jitter)
//!                  └─ circuit breaker (per server, records every attempt)
//!                       └─ JSON-RPC transport (stdio or HTTP)
//! ```
//!
//! The circuit breaker sits inside the retry loop so that each individual
//! attempt is recorded, and an open breaker short-circuits the remaining
//! attempts (its error is not classified retryable). Call outcomes feed
//! the health checker, which classifies servers for the operator.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::agentmesh::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::agentmesh::connection_pool::{ConnectionPool, PoolConfig, PoolConnector};
use crate::agentmesh::health::{HealthCheckConfig, HealthChecker};
use crate::agentmesh::retry::{self, RetryConfig};
use crate::agentmesh::tool_cache::{ToolCache, ToolCacheConfig};
use crate::agentmesh::transport::{
    ToolCallResult, ToolDescriptor, ToolServerConnection, TransportConfig,
};

/// Errors specific to the discovery layer.
#[derive(Debug, Clone)]
pub enum DiscoveryError {
    /// No server registered under the requested name.
    ServerNotFound(String),
}

impl fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryError::ServerNotFound(name) => {
                write!(f, "tool server not found: {}", name)
            }
        }
    }
}

impl Error for DiscoveryError {}

/// Aggregate configuration for the discovery stack.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub pool: PoolConfig,
    pub cache: ToolCacheConfig,
    pub breaker: CircuitBreakerConfig,
    pub call_retry: RetryConfig,
    pub health: HealthCheckConfig,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            cache: ToolCacheConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            call_retry: RetryConfig::default(),
            health: HealthCheckConfig::default(),
        }
    }
}

/// Dials [`ToolServerConnection`]s for the pool from the manager's
/// registered transport configs.
pub struct ServerConnector {
    configs: Arc<RwLock<HashMap<String, TransportConfig>>>,
}

#[async_trait]
impl PoolConnector for ServerConnector {
    type Connection = ToolServerConnection;

    async fn connect(
        &self,
        server: &str,
    ) -> Result<ToolServerConnection, Box<dyn Error + Send + Sync>> {
        let config = {
            let configs = self.configs.read().await;
            configs
                .get(server)
                .cloned()
                .ok_or_else(|| DiscoveryError::ServerNotFound(server.to_string()))?
        };
        ToolServerConnection::connect(server, &config).await
    }

    async fn disconnect(&self, conn: &ToolServerConnection) {
        conn.close().await;
    }
}

/// Discovery, caching, and resilient invocation of remote tools.
pub struct ToolServerManager {
    configs: Arc<RwLock<HashMap<String, TransportConfig>>>,
    pool: ConnectionPool<ServerConnector>,
    cache: Arc<ToolCache>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    breaker_config: CircuitBreakerConfig,
    call_retry: RetryConfig,
    health: Arc<HealthChecker>,
    shutdown: CancellationToken,
}

impl ToolServerManager {
    /// Build the manager and its resilience stack.
    pub fn new(config: DiscoveryConfig) -> Self {
        let configs: Arc<RwLock<HashMap<String, TransportConfig>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let connector = Arc::new(ServerConnector {
            configs: configs.clone(),
        });
        Self {
            configs,
            pool: ConnectionPool::new(connector, config.pool),
            cache: Arc::new(ToolCache::new(config.cache)),
            breakers: RwLock::new(HashMap::new()),
            breaker_config: config.breaker,
            call_retry: config.call_retry,
            health: Arc::new(HealthChecker::new(config.health)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawn the background workers (pool sweeper, cache cleanup, health
    /// loop). They all stop when [`ToolServerManager::close`] runs.
    pub fn start_background(&self) {
        self.pool.start_sweeper(self.shutdown.child_token());
        self.cache.clone().start_cleanup(self.shutdown.child_token());
        let health = self.health.clone();
        let token = self.shutdown.child_token();
        tokio::spawn(async move {
            health.run(token).await;
        });
    }

    /// Register a tool server under `name`.
    pub async fn add_server(&self, name: impl Into<String>, transport: TransportConfig) {
        let name = name.into();
        self.configs.write().await.insert(name.clone(), transport);
        self.health.register_server(&name).await;
        log::info!("registered tool server '{}'", name);
    }

    /// Remove a server: its config, cached catalog, and health record.
    pub async fn remove_server(&self, name: &str) {
        self.configs.write().await.remove(name);
        self.cache.invalidate(name);
        self.health.unregister_server(name).await;
        log::info!("removed tool server '{}'", name);
    }

    /// Names of the registered servers, sorted.
    pub async fn servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    async fn breaker_for(&self, server: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().await.get(server) {
            return breaker.clone();
        }
        let mut breakers = self.breakers.write().await;
        breakers
            .entry(server.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(server, self.breaker_config.clone()))
            })
            .clone()
    }

    /// The server's tool catalog: from cache when fresh, otherwise from a
    /// live `tools/list` round trip (which repopulates the cache).
    pub async fn discover_tools(
        &self,
        server: &str,
        token: &CancellationToken,
    ) -> Result<Vec<ToolDescriptor>, Box<dyn Error + Send + Sync>> {
        if let Some(tools) = self.cache.get(server) {
            return Ok(tools);
        }

        let breaker = self.breaker_for(server).await;
        let handle = match self.pool.acquire(server, token).await {
            Ok(handle) => {
                self.health.set_connected(server, true).await;
                handle
            }
            Err(err) => {
                self.health.set_connected(server, false).await;
                self.health.record_failure(server).await;
                return Err(err);
            }
        };

        let conn = handle.conn();
        let result = retry::with_retry(&self.call_retry, token, |_| {
            let breaker = breaker.clone();
            async move { breaker.execute(|| async { conn.list_tools().await }).await }
        })
        .await;

        let outcome = match result {
            Ok(tools) => {
                self.cache.set(server, tools.clone());
                self.health.record_success(server).await;
                self.health.set_tools_discovered(server, tools.len()).await;
                Ok(tools)
            }
            Err(err) => {
                self.health.record_failure(server).await;
                Err(err)
            }
        };

        let _ = self.pool.release(handle);
        outcome
    }

    /// Invoke one remote tool through the full resilience stack.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        token: &CancellationToken,
    ) -> Result<ToolCallResult, Box<dyn Error + Send + Sync>> {
        let breaker = self.breaker_for(server).await;
        let handle = match self.pool.acquire(server, token).await {
            Ok(handle) => {
                self.health.set_connected(server, true).await;
                handle
            }
            Err(err) => {
                self.health.set_connected(server, false).await;
                self.health.record_failure(server).await;
                return Err(err);
            }
        };

        let conn = handle.conn();
        let result = retry::with_retry(&self.call_retry, token, |_| {
            let breaker = breaker.clone();
            let arguments = arguments.clone();
            async move {
                breaker
                    .execute(|| async move { conn.call_tool(tool, arguments).await })
                    .await
            }
        })
        .await;

        let outcome = match result {
            Ok(call) => {
                self.health.record_success(server).await;
                Ok(call)
            }
            Err(err) => {
                self.health.record_failure(server).await;
                Err(err)
            }
        };

        let _ = self.pool.release(handle);
        outcome
    }

    /// Drop a server's cached catalog so the next discovery is live.
    pub fn invalidate_cache(&self, server: &str) {
        self.cache.invalidate(server);
    }

    /// The discovery cache, for stats and tests.
    pub fn cache(&self) -> &ToolCache {
        &self.cache
    }

    /// The health checker, for reports.
    pub fn health(&self) -> &HealthChecker {
        &self.health
    }

    /// The per-server circuit breaker, created on first use.
    pub async fn breaker(&self, server: &str) -> Arc<CircuitBreaker> {
        self.breaker_for(server).await
    }

    /// Pool metrics snapshot.
    pub fn pool_metrics(&self) -> crate::agentmesh::connection_pool::PoolMetrics {
        self.pool.metrics()
    }

    /// Stop background workers and close every pooled connection.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.pool.close().await;
        log::info!("tool server manager closed");
    }
}
