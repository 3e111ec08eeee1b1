//! Message deduplication: a bloom filter fronting an authoritative store.
//!
//! Delivery in the messaging layer is at-most-once-useful: a handler body
//! must run at most once per message id within a TTL window. The check is
//! two-tier:
//!
//! 1. A bloom filter answers "definitely new" in O(ns) for the common
//!    case. Its false-positive rate is sized to ≤0.1% at the configured
//!    capacity; false negatives are impossible.
//! 2. An authoritative `id → first_seen` map resolves the "maybe seen"
//!    answers exactly, and enforces the TTL window: entries older than the
//!    TTL are treated as unseen again.
//!
//! A message is processed iff the authoritative store records it as unseen
//! and then marks it. Expiry is enforced lazily on lookup plus an explicit
//! [`Deduplicator::purge_expired`] sweep that also rebuilds the filter so
//! its false-positive rate does not degrade as old ids accumulate.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

/// Configuration for [`Deduplicator`].
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// TTL window within which a repeated id is a duplicate.
    pub ttl: Duration,
    /// Expected number of distinct ids live within one TTL window.
    pub expected_items: usize,
    /// Target false-positive probability for the bloom filter.
    pub false_positive_rate: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            expected_items: 100_000,
            false_positive_rate: 0.001,
        }
    }
}

impl DedupConfig {
    /// Override the TTL window (builder pattern).
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Override the expected live-id count (builder pattern).
    pub fn with_expected_items(mut self, expected_items: usize) -> Self {
        self.expected_items = expected_items;
        self
    }

    /// Override the target false-positive rate (builder pattern).
    pub fn with_false_positive_rate(mut self, rate: f64) -> Self {
        self.false_positive_rate = rate;
        self
    }
}

/// Fixed-size bloom filter with k index hashes derived from sha256.
///
/// The two 64-bit halves of the digest seed double hashing
/// (`h1 + i·h2 mod m`), the standard construction for k independent-enough
/// indexes from one hash invocation.
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: usize,
    num_hashes: u32,
}

impl BloomFilter {
    /// Size a filter for `expected_items` at the given false-positive rate.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = false_positive_rate.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;
        let m = (-(n * p.ln()) / (ln2 * ln2)).ceil().max(64.0) as usize;
        let k = ((m as f64 / n) * ln2).round().max(1.0) as u32;
        Self {
            bits: vec![0u64; (m + 63) / 64],
            num_bits: m,
            num_hashes: k,
        }
    }

    fn index_pair(key: &str) -> (u64, u64) {
        let digest = Sha256::digest(key.as_bytes());
        let mut h1 = [0u8; 8];
        let mut h2 = [0u8; 8];
        h1.copy_from_slice(&digest[0..8]);
        h2.copy_from_slice(&digest[8..16]);
        (u64::from_be_bytes(h1), u64::from_be_bytes(h2) | 1)
    }

    /// Set the k bits for `key`.
    pub fn insert(&mut self, key: &str) {
        let (h1, h2) = Self::index_pair(key);
        for i in 0..self.num_hashes {
            let bit = (h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits as u64) as usize;
            self.bits[bit / 64] |= 1u64 << (bit % 64);
        }
    }

    /// True when `key` may have been inserted; false means definitely not.
    pub fn may_contain(&self, key: &str) -> bool {
        let (h1, h2) = Self::index_pair(key);
        (0..self.num_hashes).all(|i| {
            let bit = (h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits as u64) as usize;
            self.bits[bit / 64] & (1u64 << (bit % 64)) != 0
        })
    }

    /// Clear every bit.
    pub fn clear(&mut self) {
        for word in &mut self.bits {
            *word = 0;
        }
    }

    /// Number of bits in the filter.
    pub fn num_bits(&self) -> usize {
        self.num_bits
    }

    /// Number of index hashes per key.
    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }
}

/// Counters describing a deduplicator's traffic.
#[derive(Debug, Clone, Default)]
pub struct DedupStats {
    /// Ids admitted for processing.
    pub admitted: u64,
    /// Ids rejected as duplicates within the TTL window.
    pub duplicates: u64,
    /// Checks short-circuited by a definite bloom negative.
    pub bloom_negatives: u64,
    /// Live entries in the authoritative store.
    pub live_entries: usize,
}

struct DedupInner {
    bloom: BloomFilter,
    seen: HashMap<String, Instant>,
    admitted: u64,
    duplicates: u64,
    bloom_negatives: u64,
}

/// Two-tier at-most-once admission filter.
pub struct Deduplicator {
    config: DedupConfig,
    inner: Mutex<DedupInner>,
}

impl Deduplicator {
    /// Create a deduplicator with the supplied configuration.
    pub fn new(config: DedupConfig) -> Self {
        let bloom = BloomFilter::new(config.expected_items, config.false_positive_rate);
        Self {
            config,
            inner: Mutex::new(DedupInner {
                bloom,
                seen: HashMap::new(),
                admitted: 0,
                duplicates: 0,
                bloom_negatives: 0,
            }),
        }
    }

    /// Admission check: returns true iff the id has not been recorded
    /// within the TTL window, marking it as seen in the same step.
    pub fn check_and_record(&self, id: &str) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();

        if !inner.bloom.may_contain(id) {
            inner.bloom_negatives += 1;
            inner.bloom.insert(id);
            inner.seen.insert(id.to_string(), now);
            inner.admitted += 1;
            return true;
        }

        match inner.seen.get(id) {
            Some(first_seen) if now.duration_since(*first_seen) < self.config.ttl => {
                inner.duplicates += 1;
                false
            }
            _ => {
                // Bloom false positive, or an entry that aged out of the
                // TTL window: both count as unseen.
                inner.seen.insert(id.to_string(), now);
                inner.admitted += 1;
                true
            }
        }
    }

    /// Non-mutating membership probe against the authoritative store.
    pub fn contains(&self, id: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.seen.get(id) {
            Some(first_seen) => first_seen.elapsed() < self.config.ttl,
            None => false,
        }
    }

    /// Drop entries older than the TTL and rebuild the bloom filter from
    /// the survivors.
    pub fn purge_expired(&self) -> usize {
        let ttl = self.config.ttl;
        let mut inner = self.inner.lock().unwrap();
        let before = inner.seen.len();
        inner.seen.retain(|_, first_seen| first_seen.elapsed() < ttl);
        let removed = before - inner.seen.len();
        if removed > 0 {
            inner.bloom.clear();
            let keys: Vec<String> = inner.seen.keys().cloned().collect();
            for key in &keys {
                inner.bloom.insert(key);
            }
        }
        removed
    }

    /// Snapshot traffic counters.
    pub fn stats(&self) -> DedupStats {
        let inner = self.inner.lock().unwrap();
        DedupStats {
            admitted: inner.admitted,
            duplicates: inner.duplicates,
            bloom_negatives: inner.bloom_negatives,
            live_entries: inner.seen.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sight_admits_replay_rejects() {
        let dedup = Deduplicator::new(DedupConfig::default());
        assert!(dedup.check_and_record("msg-1"));
        assert!(!dedup.check_and_record("msg-1"));
        assert!(dedup.check_and_record("msg-2"));

        let stats = dedup.stats();
        assert_eq!(stats.admitted, 2);
        assert_eq!(stats.duplicates, 1);
    }

    #[test]
    fn expired_entry_is_unseen_again() {
        let dedup = Deduplicator::new(
            DedupConfig::default().with_ttl(Duration::from_millis(10)),
        );
        assert!(dedup.check_and_record("msg-1"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(dedup.check_and_record("msg-1"));
    }

    #[test]
    fn purge_removes_expired_and_keeps_live() {
        let dedup = Deduplicator::new(
            DedupConfig::default().with_ttl(Duration::from_millis(30)),
        );
        assert!(dedup.check_and_record("old"));
        std::thread::sleep(Duration::from_millis(40));
        assert!(dedup.check_and_record("fresh"));

        let removed = dedup.purge_expired();
        assert_eq!(removed, 1);
        assert!(!dedup.contains("old"));
        assert!(dedup.contains("fresh"));
        // A replay of the live id is still a duplicate after the rebuild.
        assert!(!dedup.check_and_record("fresh"));
    }

    #[test]
    fn bloom_has_no_false_negatives() {
        let mut bloom = BloomFilter::new(1000, 0.001);
        for i in 0..1000 {
            bloom.insert(&format!("key-{}", i));
        }
        for i in 0..1000 {
            assert!(bloom.may_contain(&format!("key-{}", i)));
        }
    }

    #[test]
    fn bloom_false_positive_rate_is_bounded() {
        let mut bloom = BloomFilter::new(10_000, 0.001);
        for i in 0..10_000 {
            bloom.insert(&format!("member-{}", i));
        }

        let mut false_positives = 0usize;
        let probes = 20_000usize;
        for i in 0..probes {
            if bloom.may_contain(&format!("outsider-{}", i)) {
                false_positives += 1;
            }
        }
        // Target is 0.1%; allow generous slack for hash variance.
        let rate = false_positives as f64 / probes as f64;
        assert!(rate < 0.005, "false positive rate {} too high", rate);
    }

    #[test]
    fn sizing_follows_capacity() {
        let small = BloomFilter::new(100, 0.001);
        let large = BloomFilter::new(100_000, 0.001);
        assert!(large.num_bits() > small.num_bits());
        assert!(small.num_hashes() >= 1);
    }
}
