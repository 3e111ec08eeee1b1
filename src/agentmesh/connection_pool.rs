//! Bounded, lifetime-capped pool of tool-server connections.
//!
//! Connections are keyed by server name and owned exclusively by the pool.
//! [`ConnectionPool::acquire`] first reuses an idle connection, then dials a
//! new one while the pool is under its `max_open` bound (dialing runs under
//! the retry primitive with a small budget), and otherwise parks the caller
//! in a FIFO waiter queue until a release hands a connection over, the
//! acquire timeout fires, or the caller's cancellation token trips.
//!
//! A background sweeper reaps connections that outlived `max_lifetime`
//! (including leaked in-use ones) and idle connections beyond
//! `max_idle_time` while more than `max_idle` connections sit idle.
//!
//! The dialing strategy is pluggable through [`PoolConnector`], which keeps
//! the pool independent of any concrete transport.

use std::collections::{HashMap, VecDeque};
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::agentmesh::retry::{self, Cancelled, RetryConfig};

/// Dials and tears down the pooled connection type.
#[async_trait]
pub trait PoolConnector: Send + Sync {
    /// The connection type the pool owns.
    type Connection: Send + Sync + 'static;

    /// Establish a connection to the named server.
    async fn connect(
        &self,
        server: &str,
    ) -> Result<Self::Connection, Box<dyn Error + Send + Sync>>;

    /// Tear a connection down. Must not fail; best effort.
    async fn disconnect(&self, conn: &Self::Connection);
}

/// Configuration for [`ConnectionPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle connections tolerated pool-wide before idle-time reaping kicks in.
    pub max_idle: usize,
    /// Maximum open connections pool-wide; 0 means unlimited.
    pub max_open: usize,
    /// Hard cap on any connection's age.
    pub max_lifetime: Duration,
    /// Idle age beyond which a connection is reapable (subject to `max_idle`).
    pub max_idle_time: Duration,
    /// Sweeper period.
    pub sweep_interval: Duration,
    /// How long an acquire waits for a connection before timing out.
    pub acquire_timeout: Duration,
    /// Retry budget applied while dialing a new connection.
    pub connect_retry: RetryConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: 4,
            max_open: 16,
            max_lifetime: Duration::from_secs(30 * 60),
            max_idle_time: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(30),
            connect_retry: RetryConfig::default()
                .with_max_retries(2)
                .with_backoff(Duration::from_millis(100)),
        }
    }
}

impl PoolConfig {
    /// Override the pool-wide idle tolerance (builder pattern).
    pub fn with_max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }

    /// Override the open-connection bound; 0 is unlimited (builder pattern).
    pub fn with_max_open(mut self, max_open: usize) -> Self {
        self.max_open = max_open;
        self
    }

    /// Override the lifetime cap (builder pattern).
    pub fn with_max_lifetime(mut self, max_lifetime: Duration) -> Self {
        self.max_lifetime = max_lifetime;
        self
    }

    /// Override the idle-age cap (builder pattern).
    pub fn with_max_idle_time(mut self, max_idle_time: Duration) -> Self {
        self.max_idle_time = max_idle_time;
        self
    }

    /// Override the sweeper period (builder pattern).
    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    /// Override the acquire wait timeout (builder pattern).
    pub fn with_acquire_timeout(mut self, acquire_timeout: Duration) -> Self {
        self.acquire_timeout = acquire_timeout;
        self
    }
}

/// Errors surfaced by pool operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The pool was closed; no further acquires are served.
    Closed,
    /// No connection became available within the acquire timeout.
    AcquireTimeout,
    /// The released handle does not belong to this pool (already reaped
    /// or double-released).
    UnknownConnection,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Closed => write!(f, "connection pool is closed"),
            PoolError::AcquireTimeout => {
                write!(f, "timed out waiting for a pooled connection")
            }
            PoolError::UnknownConnection => {
                write!(f, "released connection is not owned by this pool")
            }
        }
    }
}

impl Error for PoolError {}

/// An acquired connection. Hand it back with [`ConnectionPool::release`];
/// leaked handles are eventually reclaimed by max-lifetime reaping.
pub struct PooledHandle<T> {
    id: u64,
    server: String,
    conn: Arc<T>,
}

impl<T> PooledHandle<T> {
    /// Server this connection belongs to.
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Borrow the underlying connection.
    pub fn conn(&self) -> &T {
        &self.conn
    }
}

struct Slot<T> {
    server: String,
    conn: Arc<T>,
    created_at: Instant,
    last_used_at: Instant,
    in_use: bool,
}

struct Waiter {
    tx: oneshot::Sender<u64>,
    enqueued_at: Instant,
}

struct PoolState<T> {
    slots: HashMap<u64, Slot<T>>,
    idle: HashMap<String, VecDeque<u64>>,
    waiters: HashMap<String, VecDeque<Waiter>>,
    next_id: u64,
    open: usize,
    closed: bool,
}

/// Cumulative and instantaneous pool metrics.
#[derive(Debug, Clone, Default)]
pub struct PoolMetrics {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub waiters: usize,
    pub acquires: u64,
    pub releases: u64,
    /// Total time acquires spent parked in the waiter queue.
    pub cumulative_wait: Duration,
}

struct PoolShared<C: PoolConnector> {
    connector: Arc<C>,
    config: PoolConfig,
    state: Mutex<PoolState<C::Connection>>,
    acquires: AtomicU64,
    releases: AtomicU64,
    wait_nanos: AtomicU64,
}

/// Keyed connection pool. Cheap to clone; clones share state.
pub struct ConnectionPool<C: PoolConnector> {
    shared: Arc<PoolShared<C>>,
}

impl<C: PoolConnector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C: PoolConnector + 'static> ConnectionPool<C> {
    /// Create a pool over the supplied connector.
    pub fn new(connector: Arc<C>, config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                connector,
                config,
                state: Mutex::new(PoolState {
                    slots: HashMap::new(),
                    idle: HashMap::new(),
                    waiters: HashMap::new(),
                    next_id: 1,
                    open: 0,
                    closed: false,
                }),
                acquires: AtomicU64::new(0),
                releases: AtomicU64::new(0),
                wait_nanos: AtomicU64::new(0),
            }),
        }
    }

    /// Acquire a connection for `server`, reusing, dialing, or waiting as
    /// the pool bounds dictate.
    pub async fn acquire(
        &self,
        server: &str,
        token: &CancellationToken,
    ) -> Result<PooledHandle<C::Connection>, Box<dyn Error + Send + Sync>> {
        if token.is_cancelled() {
            return Err(Box::new(Cancelled));
        }
        self.shared.acquires.fetch_add(1, Ordering::Relaxed);

        let rx = {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed {
                return Err(Box::new(PoolError::Closed));
            }

            // 1. Reuse an idle connection.
            loop {
                let id = match state.idle.get_mut(server).and_then(|q| q.pop_front()) {
                    Some(id) => id,
                    None => break,
                };
                if let Some(slot) = state.slots.get_mut(&id) {
                    slot.in_use = true;
                    slot.last_used_at = Instant::now();
                    return Ok(PooledHandle {
                        id,
                        server: server.to_string(),
                        conn: slot.conn.clone(),
                    });
                }
            }

            // 2. Dial a new connection while under the open bound.
            let unlimited = self.shared.config.max_open == 0;
            if unlimited || state.open < self.shared.config.max_open {
                state.open += 1;
                None
            } else {
                // 3. Park in the waiter queue.
                let (tx, rx) = oneshot::channel();
                state
                    .waiters
                    .entry(server.to_string())
                    .or_insert_with(VecDeque::new)
                    .push_back(Waiter {
                        tx,
                        enqueued_at: Instant::now(),
                    });
                Some(rx)
            }
        };

        match rx {
            None => self.dial(server, token).await,
            Some(rx) => self.wait_for_release(server, rx, token).await,
        }
    }

    async fn dial(
        &self,
        server: &str,
        token: &CancellationToken,
    ) -> Result<PooledHandle<C::Connection>, Box<dyn Error + Send + Sync>> {
        let connector = self.shared.connector.clone();
        let result = retry::with_retry(&self.shared.config.connect_retry, token, |_| {
            let connector = connector.clone();
            let server = server.to_string();
            async move { connector.connect(&server).await }
        })
        .await;

        match result {
            Ok(conn) => {
                let conn = Arc::new(conn);
                let id;
                {
                    let mut state = self.shared.state.lock().unwrap();
                    if state.closed {
                        state.open -= 1;
                        drop(state);
                        self.shared.connector.disconnect(&conn).await;
                        return Err(Box::new(PoolError::Closed));
                    }
                    id = state.next_id;
                    state.next_id += 1;
                    state.slots.insert(
                        id,
                        Slot {
                            server: server.to_string(),
                            conn: conn.clone(),
                            created_at: Instant::now(),
                            last_used_at: Instant::now(),
                            in_use: true,
                        },
                    );
                }
                Ok(PooledHandle {
                    id,
                    server: server.to_string(),
                    conn,
                })
            }
            Err(err) => {
                self.shared.state.lock().unwrap().open -= 1;
                Err(err)
            }
        }
    }

    async fn wait_for_release(
        &self,
        server: &str,
        mut rx: oneshot::Receiver<u64>,
        token: &CancellationToken,
    ) -> Result<PooledHandle<C::Connection>, Box<dyn Error + Send + Sync>> {
        let started = Instant::now();
        let outcome = tokio::select! {
            received = &mut rx => Some(received),
            _ = tokio::time::sleep(self.shared.config.acquire_timeout) => None,
            _ = token.cancelled() => {
                self.shared
                    .wait_nanos
                    .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
                // Dropping rx makes the pending handoff fail; release will
                // re-idle the connection.
                return Err(Box::new(Cancelled));
            }
        };
        self.shared
            .wait_nanos
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);

        match outcome {
            Some(Ok(id)) => {
                let state = self.shared.state.lock().unwrap();
                let slot = state.slots.get(&id).ok_or(PoolError::UnknownConnection)?;
                Ok(PooledHandle {
                    id,
                    server: server.to_string(),
                    conn: slot.conn.clone(),
                })
            }
            // Sender dropped: the pool was closed underneath us.
            Some(Err(_)) => Err(Box::new(PoolError::Closed)),
            None => {
                // Timed out; a handoff may still have raced the timer.
                if let Ok(id) = rx.try_recv() {
                    let state = self.shared.state.lock().unwrap();
                    if let Some(slot) = state.slots.get(&id) {
                        return Ok(PooledHandle {
                            id,
                            server: server.to_string(),
                            conn: slot.conn.clone(),
                        });
                    }
                }
                Err(Box::new(PoolError::AcquireTimeout))
            }
        }
    }

    /// Return a connection to the pool: hand it to the oldest waiter for
    /// its server, or let it idle.
    pub fn release(&self, handle: PooledHandle<C::Connection>) -> Result<(), PoolError> {
        self.shared.releases.fetch_add(1, Ordering::Relaxed);
        let mut state = self.shared.state.lock().unwrap();

        let slot = state
            .slots
            .get_mut(&handle.id)
            .ok_or(PoolError::UnknownConnection)?;
        slot.in_use = false;
        slot.last_used_at = Instant::now();
        let server = slot.server.clone();

        // Direct handoff: first waiter whose receiver is still alive.
        loop {
            let waiter = match state.waiters.get_mut(&server).and_then(|q| q.pop_front()) {
                Some(waiter) => waiter,
                None => break,
            };
            if waiter.tx.send(handle.id).is_ok() {
                let slot = state.slots.get_mut(&handle.id).unwrap();
                slot.in_use = true;
                slot.last_used_at = Instant::now();
                return Ok(());
            }
            // Receiver gone (timeout or cancellation); try the next.
        }

        state
            .idle
            .entry(server)
            .or_insert_with(VecDeque::new)
            .push_back(handle.id);
        Ok(())
    }

    /// One sweep: reap connections beyond `max_lifetime` (leaked in-use
    /// ones included) and idle connections beyond `max_idle_time` while
    /// the pool-wide idle count exceeds `max_idle`.
    pub async fn sweep(&self) {
        let cfg = &self.shared.config;
        let doomed: Vec<(u64, Arc<C::Connection>)> = {
            let mut state = self.shared.state.lock().unwrap();
            let mut idle_count: usize =
                state.slots.values().filter(|s| !s.in_use).count();

            let mut doomed = Vec::new();
            let ids: Vec<u64> = state.slots.keys().copied().collect();
            for id in ids {
                let slot = state.slots.get(&id).unwrap();
                let over_lifetime = slot.created_at.elapsed() > cfg.max_lifetime;
                let over_idle = !slot.in_use
                    && slot.last_used_at.elapsed() > cfg.max_idle_time
                    && idle_count > cfg.max_idle;
                if over_lifetime || over_idle {
                    if !slot.in_use {
                        idle_count -= 1;
                    }
                    let slot = state.slots.remove(&id).unwrap();
                    if let Some(queue) = state.idle.get_mut(&slot.server) {
                        queue.retain(|qid| *qid != id);
                    }
                    state.open -= 1;
                    doomed.push((id, slot.conn));
                }
            }
            doomed
        };

        for (id, conn) in doomed {
            log::debug!("pool sweeper closing connection {}", id);
            self.shared.connector.disconnect(&conn).await;
        }
    }

    /// Background sweeper loop; runs until the token is cancelled.
    pub fn start_sweeper(&self, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.shared.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => pool.sweep().await,
                }
            }
        })
    }

    /// Close the pool: abort every waiter, close every connection, reject
    /// all subsequent acquires.
    pub async fn close(&self) {
        let (conns, waiters) = {
            let mut state = self.shared.state.lock().unwrap();
            state.closed = true;
            state.idle.clear();
            let conns: Vec<Arc<C::Connection>> =
                state.slots.drain().map(|(_, slot)| slot.conn).collect();
            state.open = 0;
            let waiters: Vec<Waiter> = state
                .waiters
                .drain()
                .flat_map(|(_, queue)| queue.into_iter())
                .collect();
            (conns, waiters)
        };

        // Dropping the senders unblocks waiters with PoolError::Closed.
        drop(waiters);
        for conn in conns {
            self.shared.connector.disconnect(&conn).await;
        }
    }

    /// Snapshot pool metrics.
    pub fn metrics(&self) -> PoolMetrics {
        let state = self.shared.state.lock().unwrap();
        let active = state.slots.values().filter(|s| s.in_use).count();
        PoolMetrics {
            total: state.slots.len(),
            active,
            idle: state.slots.len() - active,
            waiters: state.waiters.values().map(|q| q.len()).sum(),
            acquires: self.shared.acquires.load(Ordering::Relaxed),
            releases: self.shared.releases.load(Ordering::Relaxed),
            cumulative_wait: Duration::from_nanos(
                self.shared.wait_nanos.load(Ordering::Relaxed),
            ),
        }
    }
}
