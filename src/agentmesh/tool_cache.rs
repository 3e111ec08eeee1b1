//! Per-server tool catalog cache.
//!
//! Discovery against a tool server is a round trip; its result changes
//! rarely. The cache keeps each server's catalog for a TTL and bounds the
//! number of cached servers with a pluggable eviction policy:
//!
//! - **Lru**: evict the least recently accessed entry
//! - **Lfu**: evict the least frequently accessed entry
//! - **Fifo**: evict the oldest entry
//! - **Ttl**: evict any expired entry, falling back to Lru
//!
//! Expired entries are treated as misses on read and removed; a background
//! sweep ([`ToolCache::start_cleanup`]) removes them proactively. A
//! disabled cache always misses and ignores writes, so call sites need no
//! enabled/disabled branching.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::agentmesh::transport::ToolDescriptor;

/// Eviction policy applied when the cache is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    Lru,
    Lfu,
    Fifo,
    Ttl,
}

/// Configuration for [`ToolCache`].
#[derive(Debug, Clone)]
pub struct ToolCacheConfig {
    /// When false the cache is inert: every get misses, every set is a no-op.
    pub enabled: bool,
    /// Entry lifetime.
    pub ttl: Duration,
    /// Maximum number of cached servers.
    pub max_size: usize,
    /// Policy used to pick a victim at capacity.
    pub eviction: EvictionPolicy,
    /// Background cleanup period.
    pub cleanup_interval: Duration,
}

impl Default for ToolCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(5 * 60),
            max_size: 64,
            eviction: EvictionPolicy::Lru,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl ToolCacheConfig {
    /// Enable or disable the cache (builder pattern).
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Override the entry TTL (builder pattern).
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Override the capacity (builder pattern).
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Override the eviction policy (builder pattern).
    pub fn with_eviction(mut self, eviction: EvictionPolicy) -> Self {
        self.eviction = eviction;
        self
    }

    /// Override the cleanup period (builder pattern).
    pub fn with_cleanup_interval(mut self, cleanup_interval: Duration) -> Self {
        self.cleanup_interval = cleanup_interval;
        self
    }
}

struct CacheEntry {
    tools: Vec<ToolDescriptor>,
    cached_at: Instant,
    last_access: Instant,
    access_count: u64,
}

/// Cache statistics; `hit_rate` is derived.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
}

impl CacheStats {
    /// Hits over lookups, 0.0 before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// TTL-bounded tool catalog cache with pluggable eviction.
pub struct ToolCache {
    config: ToolCacheConfig,
    inner: Mutex<CacheInner>,
}

impl ToolCache {
    /// Create a cache with the supplied configuration.
    pub fn new(config: ToolCacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
        }
    }

    /// Look up a server's catalog. Hits return a copy and refresh the
    /// entry's recency/frequency bookkeeping; expired entries are removed
    /// and reported as misses.
    pub fn get(&self, server: &str) -> Option<Vec<ToolDescriptor>> {
        if !self.config.enabled {
            return None;
        }
        let mut inner = self.inner.lock().unwrap();
        match inner.entries.get_mut(server) {
            Some(entry) if entry.cached_at.elapsed() < self.config.ttl => {
                entry.last_access = Instant::now();
                entry.access_count += 1;
                let tools = entry.tools.clone();
                inner.hits += 1;
                Some(tools)
            }
            Some(_) => {
                inner.entries.remove(server);
                inner.misses += 1;
                None
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Insert or replace a server's catalog, evicting one entry first when
    /// the cache is at capacity.
    pub fn set(&self, server: &str, tools: Vec<ToolDescriptor>) {
        if !self.config.enabled {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if !inner.entries.contains_key(server)
            && inner.entries.len() >= self.config.max_size
        {
            if let Some(victim) = self.pick_victim(&inner.entries) {
                inner.entries.remove(&victim);
                inner.evictions += 1;
                log::debug!("tool cache evicted '{}'", victim);
            }
        }
        let now = Instant::now();
        inner.entries.insert(
            server.to_string(),
            CacheEntry {
                tools,
                cached_at: now,
                last_access: now,
                access_count: 0,
            },
        );
    }

    fn pick_victim(&self, entries: &HashMap<String, CacheEntry>) -> Option<String> {
        let by_lru = |entries: &HashMap<String, CacheEntry>| {
            entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone())
        };

        match self.config.eviction {
            EvictionPolicy::Lru => by_lru(entries),
            EvictionPolicy::Lfu => entries
                .iter()
                .min_by_key(|(_, e)| e.access_count)
                .map(|(k, _)| k.clone()),
            EvictionPolicy::Fifo => entries
                .iter()
                .min_by_key(|(_, e)| e.cached_at)
                .map(|(k, _)| k.clone()),
            EvictionPolicy::Ttl => entries
                .iter()
                .find(|(_, e)| e.cached_at.elapsed() >= self.config.ttl)
                .map(|(k, _)| k.clone())
                .or_else(|| by_lru(entries)),
        }
    }

    /// Drop one server's entry. Returns whether it was present.
    pub fn invalidate(&self, server: &str) -> bool {
        if !self.config.enabled {
            return false;
        }
        self.inner.lock().unwrap().entries.remove(server).is_some()
    }

    /// Drop every entry.
    pub fn invalidate_all(&self) {
        self.inner.lock().unwrap().entries.clear();
    }

    /// Remove expired entries; returns how many were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let ttl = self.config.ttl;
        let mut inner = self.inner.lock().unwrap();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| e.cached_at.elapsed() < ttl);
        before - inner.entries.len()
    }

    /// Background cleanup loop; runs until the token is cancelled.
    pub fn start_cleanup(
        self: std::sync::Arc<Self>,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let cache = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cache.config.cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {
                        let removed = cache.cleanup_expired();
                        if removed > 0 {
                            log::debug!("tool cache cleanup removed {} entries", removed);
                        }
                    }
                }
            }
        })
    }

    /// Snapshot hit/miss/eviction counters and current size.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            size: inner.entries.len(),
        }
    }
}
