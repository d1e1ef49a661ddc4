//! In-process key-value cache with per-key expiry.
//!
//! Backs the device registry's read-mostly flag/secret caches and the replay
//! guard's nonce set. `add` is the insert-if-absent primitive: two concurrent
//! callers presenting the same key see exactly one success.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry {
    value: String,
    expires_at: Instant,
}

/// TTL cache shared across requests. Expired entries are dropped lazily on
/// read and swept opportunistically once the map grows past a watermark.
pub struct TtlCache {
    entries: Mutex<HashMap<String, Entry>>,
}

const SWEEP_WATERMARK: usize = 4096;

impl TtlCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: &str, value: &str, ttl: Duration) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() > SWEEP_WATERMARK {
            let now = Instant::now();
            entries.retain(|_, e| e.expires_at > now);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Insert only if the key is absent (or expired). Returns `true` when the
    /// insert happened, `false` when a live entry already holds the key.
    pub fn add(&self, key: &str, value: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() > SWEEP_WATERMARK {
            entries.retain(|_, e| e.expires_at > now);
        }
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => false,
            _ => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: value.to_string(),
                        expires_at: now + ttl,
                    },
                );
                true
            }
        }
    }

    pub fn forget(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
    }
}

impl Default for TtlCache {
    fn default() -> Self {
        Self::new()
    }
}
