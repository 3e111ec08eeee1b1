//! Health classification for connected tool servers.
//!
//! Each registered server accumulates a sliding window of recent call
//! outcomes alongside its connection state and discovered-tool count. From
//! those three signals the checker derives a [`HealthStatus`]:
//!
//! - not connected ⇒ `Unhealthy`
//! - error rate ≥ 50% over the recent window ⇒ `Unhealthy`
//! - error rate ≥ 20%, zero discovered tools, or any error within the
//!   last minute ⇒ at least `Degraded`
//! - no signals recorded yet ⇒ `Unknown`
//!
//! Checks run on demand through [`HealthChecker::check_server`] /
//! [`HealthChecker::check_all`] and periodically through
//! [`HealthChecker::run`], which logs state degradations until its
//! cancellation token fires.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Classified health of a single server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    /// No signals recorded yet.
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Configuration for [`HealthChecker`].
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Interval of the periodic check loop.
    pub check_interval: Duration,
    /// Number of recent calls considered when computing the error rate.
    pub window_size: usize,
    /// Error rate (percent) at which a server is unhealthy.
    pub unhealthy_threshold: f64,
    /// Error rate (percent) at which a server is degraded.
    pub degraded_threshold: f64,
    /// Any error younger than this keeps the server at least degraded.
    pub recent_error_window: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            window_size: 50,
            unhealthy_threshold: 50.0,
            degraded_threshold: 20.0,
            recent_error_window: Duration::from_secs(60),
        }
    }
}

impl HealthCheckConfig {
    /// Override the periodic check interval (builder pattern).
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Override the outcome window size (builder pattern).
    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }
}

/// Point-in-time health report for one server.
#[derive(Debug, Clone)]
pub struct ServerHealth {
    pub server: String,
    pub status: HealthStatus,
    pub connected: bool,
    pub tools_discovered: usize,
    pub recent_calls: usize,
    pub recent_failures: usize,
    /// Error rate over the window, in percent.
    pub error_rate: f64,
    pub checked_at: Instant,
}

/// Aggregate view over every registered server.
#[derive(Debug, Clone, Default)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unknown: usize,
}

struct ServerRecord {
    connected: bool,
    tools_discovered: usize,
    outcomes: VecDeque<bool>,
    last_error_at: Option<Instant>,
    has_signal: bool,
}

impl ServerRecord {
    fn new() -> Self {
        Self {
            connected: false,
            tools_discovered: 0,
            outcomes: VecDeque::new(),
            last_error_at: None,
            has_signal: false,
        }
    }
}

/// Tracks per-server signals and classifies health on demand.
pub struct HealthChecker {
    config: HealthCheckConfig,
    servers: RwLock<HashMap<String, ServerRecord>>,
}

impl HealthChecker {
    /// Create a checker with the supplied configuration.
    pub fn new(config: HealthCheckConfig) -> Self {
        Self {
            config,
            servers: RwLock::new(HashMap::new()),
        }
    }

    /// Start tracking a server. Idempotent.
    pub async fn register_server(&self, server: &str) {
        self.servers
            .write()
            .await
            .entry(server.to_string())
            .or_insert_with(ServerRecord::new);
    }

    /// Stop tracking a server and drop its window.
    pub async fn unregister_server(&self, server: &str) {
        self.servers.write().await.remove(server);
    }

    /// Record whether the server's transport is currently connected.
    pub async fn set_connected(&self, server: &str, connected: bool) {
        let mut servers = self.servers.write().await;
        let record = servers
            .entry(server.to_string())
            .or_insert_with(ServerRecord::new);
        record.connected = connected;
        record.has_signal = true;
    }

    /// Record how many tools discovery returned for the server.
    pub async fn set_tools_discovered(&self, server: &str, count: usize) {
        let mut servers = self.servers.write().await;
        let record = servers
            .entry(server.to_string())
            .or_insert_with(ServerRecord::new);
        record.tools_discovered = count;
        record.has_signal = true;
    }

    /// Record a successful call against the server.
    pub async fn record_success(&self, server: &str) {
        self.record_outcome(server, true).await;
    }

    /// Record a failed call against the server.
    pub async fn record_failure(&self, server: &str) {
        self.record_outcome(server, false).await;
    }

    async fn record_outcome(&self, server: &str, success: bool) {
        let mut servers = self.servers.write().await;
        let record = servers
            .entry(server.to_string())
            .or_insert_with(ServerRecord::new);
        record.outcomes.push_back(success);
        while record.outcomes.len() > self.config.window_size {
            record.outcomes.pop_front();
        }
        if !success {
            record.last_error_at = Some(Instant::now());
        }
        record.has_signal = true;
    }

    fn classify(&self, record: &ServerRecord) -> (HealthStatus, usize, usize, f64) {
        let calls = record.outcomes.len();
        let failures = record.outcomes.iter().filter(|ok| !**ok).count();
        let rate = if calls == 0 {
            0.0
        } else {
            failures as f64 / calls as f64 * 100.0
        };

        if !record.has_signal {
            return (HealthStatus::Unknown, calls, failures, rate);
        }
        if !record.connected {
            return (HealthStatus::Unhealthy, calls, failures, rate);
        }
        if calls > 0 && rate >= self.config.unhealthy_threshold {
            return (HealthStatus::Unhealthy, calls, failures, rate);
        }

        let recent_error = record
            .last_error_at
            .map(|at| at.elapsed() < self.config.recent_error_window)
            .unwrap_or(false);
        let degraded = (calls > 0 && rate >= self.config.degraded_threshold)
            || record.tools_discovered == 0
            || recent_error;

        if degraded {
            (HealthStatus::Degraded, calls, failures, rate)
        } else {
            (HealthStatus::Healthy, calls, failures, rate)
        }
    }

    /// Classify one server; `Unknown` when it was never registered.
    pub async fn check_server(&self, server: &str) -> ServerHealth {
        let servers = self.servers.read().await;
        match servers.get(server) {
            Some(record) => {
                let (status, calls, failures, rate) = self.classify(record);
                ServerHealth {
                    server: server.to_string(),
                    status,
                    connected: record.connected,
                    tools_discovered: record.tools_discovered,
                    recent_calls: calls,
                    recent_failures: failures,
                    error_rate: rate,
                    checked_at: Instant::now(),
                }
            }
            None => ServerHealth {
                server: server.to_string(),
                status: HealthStatus::Unknown,
                connected: false,
                tools_discovered: 0,
                recent_calls: 0,
                recent_failures: 0,
                error_rate: 0.0,
                checked_at: Instant::now(),
            },
        }
    }

    /// Classify every registered server.
    pub async fn check_all(&self) -> Vec<ServerHealth> {
        let names: Vec<String> = self.servers.read().await.keys().cloned().collect();
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            out.push(self.check_server(&name).await);
        }
        out
    }

    /// Aggregate counts across all servers.
    pub async fn summary(&self) -> HealthSummary {
        let mut summary = HealthSummary::default();
        for health in self.check_all().await {
            summary.total += 1;
            match health.status {
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Degraded => summary.degraded += 1,
                HealthStatus::Unhealthy => summary.unhealthy += 1,
                HealthStatus::Unknown => summary.unknown += 1,
            }
        }
        summary
    }

    /// Names of servers currently classified unhealthy.
    pub async fn unhealthy_servers(&self) -> Vec<String> {
        self.filtered(HealthStatus::Unhealthy).await
    }

    /// Names of servers currently classified degraded.
    pub async fn degraded_servers(&self) -> Vec<String> {
        self.filtered(HealthStatus::Degraded).await
    }

    async fn filtered(&self, status: HealthStatus) -> Vec<String> {
        self.check_all()
            .await
            .into_iter()
            .filter(|h| h.status == status)
            .map(|h| h.server)
            .collect()
    }

    /// Periodic check loop: classifies all servers every `check_interval`
    /// and logs non-healthy ones. Runs until the token is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    log::debug!("health checker stopping");
                    return;
                }
                _ = ticker.tick() => {
                    for health in self.check_all().await {
                        match health.status {
                            HealthStatus::Unhealthy => log::warn!(
                                "server '{}' unhealthy (error rate {:.1}%, connected={})",
                                health.server, health.error_rate, health.connected
                            ),
                            HealthStatus::Degraded => log::info!(
                                "server '{}' degraded (error rate {:.1}%, tools={})",
                                health.server, health.error_rate, health.tools_discovered
                            ),
                            _ => {}
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected_server(checker: &HealthChecker, name: &str, tools: usize) {
        checker.register_server(name).await;
        checker.set_connected(name, true).await;
        checker.set_tools_discovered(name, tools).await;
    }

    #[tokio::test]
    async fn unregistered_server_is_unknown() {
        let checker = HealthChecker::new(HealthCheckConfig::default());
        let health = checker.check_server("ghost").await;
        assert_eq!(health.status, HealthStatus::Unknown);
    }

    #[tokio::test]
    async fn connected_server_with_tools_is_healthy() {
        let checker = HealthChecker::new(HealthCheckConfig::default());
        connected_server(&checker, "s1", 3).await;
        for _ in 0..10 {
            checker.record_success("s1").await;
        }
        assert_eq!(checker.check_server("s1").await.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn disconnected_server_is_unhealthy() {
        let checker = HealthChecker::new(HealthCheckConfig::default());
        connected_server(&checker, "s1", 3).await;
        checker.set_connected("s1", false).await;
        assert_eq!(checker.check_server("s1").await.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn error_rate_thresholds() {
        let checker = HealthChecker::new(
            HealthCheckConfig::default().with_window_size(10),
        );
        connected_server(&checker, "s1", 1).await;

        // 6 failures in 10 calls: 60% is unhealthy.
        for i in 0..10 {
            if i < 6 {
                checker.record_failure("s1").await;
            } else {
                checker.record_success("s1").await;
            }
        }
        let health = checker.check_server("s1").await;
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert!(health.error_rate >= 50.0);
    }

    #[tokio::test]
    async fn recent_error_degrades_even_with_low_rate() {
        let checker = HealthChecker::new(
            HealthCheckConfig::default().with_window_size(100),
        );
        connected_server(&checker, "s1", 2).await;
        for _ in 0..99 {
            checker.record_success("s1").await;
        }
        checker.record_failure("s1").await;

        let health = checker.check_server("s1").await;
        assert!(health.error_rate < 20.0);
        assert_eq!(health.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn zero_tools_is_degraded_at_minimum() {
        let checker = HealthChecker::new(HealthCheckConfig::default());
        connected_server(&checker, "s1", 0).await;
        checker.record_success("s1").await;
        assert_eq!(checker.check_server("s1").await.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn summary_and_filters() {
        let checker = HealthChecker::new(HealthCheckConfig::default());
        connected_server(&checker, "good", 3).await;
        checker.record_success("good").await;

        connected_server(&checker, "bad", 3).await;
        checker.set_connected("bad", false).await;

        checker.register_server("silent").await;

        let summary = checker.summary().await;
        assert_eq!(summary.total, 3);
        assert_eq!(summary.healthy, 1);
        assert_eq!(summary.unhealthy, 1);
        assert_eq!(summary.unknown, 1);

        assert_eq!(checker.unhealthy_servers().await, vec!["bad".to_string()]);
        assert!(checker.degraded_servers().await.is_empty());
    }
}
