use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::constants::JANITOR_MAX_SWEEP;

/// Shared KV store backing the dedup layer and advisory state.
///
/// Mirrors the operation semantics the pipeline needs from its distributed
/// KV: atomic add-if-absent on sets, set-if-not-exists string locks with an
/// expiry, and plain hashes. All workers run inside one process, so a
/// process-wide store behind `Arc` gives every consumer the same view.
#[derive(Clone)]
pub struct KvStore {
    inner: Arc<RwLock<KvInner>>,
    stats: Arc<RwLock<KvStats>>,
}

struct KvInner {
    sets: HashMap<String, HashSet<String>>,
    locks: HashMap<String, DateTime<Utc>>,
    hashes: HashMap<String, HashMap<String, String>>,
}

#[derive(Debug, Clone, Default)]
pub struct KvStats {
    pub set_adds: u64,
    pub set_duplicates: u64,
    pub locks_acquired: u64,
    pub locks_contended: u64,
    pub locks_expired_swept: u64,
}

impl KvStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(KvInner {
                sets: HashMap::new(),
                locks: HashMap::new(),
                hashes: HashMap::new(),
            })),
            stats: Arc::new(RwLock::new(KvStats::default())),
        }
    }

    /// Atomic add-if-absent. Returns true when the member was inserted,
    /// false when it was already present.
    pub fn set_add(&self, set: &str, member: &str) -> bool {
        let mut inner = self.inner.write();
        let inserted = inner
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string());
        let mut stats = self.stats.write();
        if inserted {
            stats.set_adds += 1;
        } else {
            stats.set_duplicates += 1;
        }
        inserted
    }

    pub fn set_contains(&self, set: &str, member: &str) -> bool {
        let inner = self.inner.read();
        inner.sets.get(set).is_some_and(|s| s.contains(member))
    }

    pub fn set_remove(&self, set: &str, member: &str) -> bool {
        let mut inner = self.inner.write();
        inner.sets.get_mut(set).is_some_and(|s| s.remove(member))
    }

    pub fn set_len(&self, set: &str) -> usize {
        let inner = self.inner.read();
        inner.sets.get(set).map_or(0, |s| s.len())
    }

    /// Set-if-not-exists with expiry. Returns true when the lock was
    /// acquired; an expired lock counts as absent.
    pub fn lock_acquire(&self, key: &str, ttl: Duration) -> bool {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let held = inner.locks.get(key).is_some_and(|expires| *expires > now);
        if held {
            self.stats.write().locks_contended += 1;
            return false;
        }
        let ttl = ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::seconds(300));
        inner.locks.insert(key.to_string(), now + ttl);
        self.stats.write().locks_acquired += 1;
        true
    }

    /// Releases a lock regardless of remaining TTL
    pub fn lock_release(&self, key: &str) {
        self.inner.write().locks.remove(key);
    }

    pub fn lock_held(&self, key: &str) -> bool {
        let now = Utc::now();
        self.inner
            .read()
            .locks
            .get(key)
            .is_some_and(|expires| *expires > now)
    }

    /// Number of unexpired locks currently held
    pub fn live_lock_count(&self) -> usize {
        let now = Utc::now();
        self.inner
            .read()
            .locks
            .values()
            .filter(|expires| **expires > now)
            .count()
    }

    pub fn hash_set(&self, hash: &str, field: &str, value: &str) {
        self.inner
            .write()
            .hashes
            .entry(hash.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
    }

    pub fn hash_get(&self, hash: &str, field: &str) -> Option<String> {
        self.inner
            .read()
            .hashes
            .get(hash)
            .and_then(|h| h.get(field).cloned())
    }

    /// Removes expired locks, at most `JANITOR_MAX_SWEEP` per call so a
    /// large backlog cannot stall the janitor's tick
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let expired: Vec<String> = inner
            .locks
            .iter()
            .filter(|(_, expires)| **expires <= now)
            .take(JANITOR_MAX_SWEEP)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.locks.remove(key);
        }
        if !expired.is_empty() {
            self.stats.write().locks_expired_swept += expired.len() as u64;
            debug!("Swept {} expired locks", expired.len());
        }
        expired.len()
    }

    /// Drops every set, lock, and hash; part of shutdown
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.sets.clear();
        inner.locks.clear();
        inner.hashes.clear();
    }

    pub fn stats(&self) -> KvStats {
        self.stats.read().clone()
    }
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_add_is_atomic_dedup() {
        let kv = KvStore::new();
        assert!(kv.set_add("processed", "sig1:wallet1"));
        assert!(!kv.set_add("processed", "sig1:wallet1"));
        assert!(kv.set_add("processed", "sig1:wallet2"));
        assert_eq!(kv.set_len("processed"), 2);

        assert!(kv.set_remove("processed", "sig1:wallet1"));
        assert!(!kv.set_contains("processed", "sig1:wallet1"));
    }

    #[test]
    fn test_lock_cannot_be_double_acquired() {
        let kv = KvStore::new();
        assert!(kv.lock_acquire("processing_lock:sig1", Duration::from_secs(60)));
        assert!(!kv.lock_acquire("processing_lock:sig1", Duration::from_secs(60)));
        kv.lock_release("processing_lock:sig1");
        assert!(kv.lock_acquire("processing_lock:sig1", Duration::from_secs(60)));
    }

    #[test]
    fn test_expired_lock_is_reacquirable() {
        let kv = KvStore::new();
        assert!(kv.lock_acquire("processing_lock:sig1", Duration::from_millis(0)));
        // Zero TTL expires immediately
        assert!(kv.lock_acquire("processing_lock:sig1", Duration::from_secs(60)));
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let kv = KvStore::new();
        kv.lock_acquire("expired", Duration::from_millis(0));
        kv.lock_acquire("live", Duration::from_secs(60));
        let swept = kv.sweep_expired();
        assert_eq!(swept, 1);
        assert!(kv.lock_held("live"));
        assert!(!kv.lock_held("expired"));
    }

    #[test]
    fn test_hashes() {
        let kv = KvStore::new();
        kv.hash_set("latest_signature:wallet1", "signature", "sigA");
        assert_eq!(
            kv.hash_get("latest_signature:wallet1", "signature"),
            Some("sigA".to_string())
        );
        assert_eq!(kv.hash_get("latest_signature:wallet2", "signature"), None);
    }
}
