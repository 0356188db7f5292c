//! Read-through cache for shortener entries.
//!
//! A read costs a full HTTP round-trip, so recently fetched entries are
//! kept in memory for a bounded lifetime. The bytes behind an identifier
//! never change for content-addressed services, which makes a stale entry
//! harmless; the lifetime only bounds memory and guards against a backend
//! that recycles identifiers.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

/// How long an entry stays servable after insertion.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Minimum interval between sweeps of expired entries.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug)]
struct Entry {
    data: Vec<u8>,
    inserted: Instant,
}

/// Identifier-to-bytes cache with per-entry expiry.
///
/// Not authoritative: a miss (or an expired hit) means the caller goes to
/// the shortener. Errors are never cached.
#[derive(Debug)]
pub struct ReadCache {
    entries: HashMap<String, Entry>,
    ttl: Duration,
    sweep_interval: Duration,
    last_sweep: Instant,
    enabled: bool,
}

impl ReadCache {
    pub fn new(ttl: Duration, sweep_interval: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            sweep_interval,
            last_sweep: Instant::now(),
            enabled: true,
        }
    }

    /// A cache that never stores anything. Every lookup misses, so all
    /// reads go straight to the shortener.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn get(&self, id: &str) -> Option<&[u8]> {
        let entry = self.entries.get(id)?;
        if entry.inserted.elapsed() > self.ttl {
            return None;
        }
        Some(&entry.data)
    }

    pub fn put(&mut self, id: String, data: Vec<u8>) {
        if !self.enabled {
            return;
        }
        if self.last_sweep.elapsed() >= self.sweep_interval {
            self.sweep();
        }
        self.entries.insert(
            id,
            Entry {
                data,
                inserted: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn sweep(&mut self) {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.inserted.elapsed() <= ttl);
        self.last_sweep = Instant::now();
        debug!(
            dropped = before - self.entries.len(),
            remaining = self.entries.len(),
            "swept expired cache entries"
        );
    }
}

impl Default for ReadCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_SWEEP_INTERVAL)
    }
}
