//! Replay cache for signed device messages.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// Entries between opportunistic sweeps of expired keys.
const CLEANUP_EVERY: u64 = 1024;

/// Remembers signatures seen within a TTL window.
pub struct ReplayCache {
    /// signature fingerprint -> expiry (unix seconds)
    seen: DashMap<String, i64>,
    ttl_secs: i64,
    inserts: AtomicU64,
}

impl ReplayCache {
    pub fn new(ttl_secs: i64) -> Self {
        Self {
            seen: DashMap::new(),
            ttl_secs,
            inserts: AtomicU64::new(0),
        }
    }

    /// Record `key` at `now`. Returns `false` if it was already seen and
    /// has not expired.
    pub fn check_and_insert(&self, key: &str, now: i64) -> bool {
        let fresh = match self.seen.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if *entry.get() > now {
                    false
                } else {
                    entry.insert(now + self.ttl_secs);
                    true
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now + self.ttl_secs);
                true
            }
        };

        if fresh && self.inserts.fetch_add(1, Ordering::Relaxed) % CLEANUP_EVERY == CLEANUP_EVERY - 1
        {
            self.cleanup_expired(now);
        }
        fresh
    }

    pub fn cleanup_expired(&self, now: i64) {
        self.seen.retain(|_, expires| *expires > now);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
