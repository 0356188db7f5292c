//! In-process shortener backed by a hash map.
//!
//! Intended for tests and offline experiments. Writes are deduplicated by
//! blake3 digest, so storing the same payload twice hands back the same
//! identifier, matching the behavior of the real services that make volume
//! rewrites cheap. Identifiers are fixed-width alphanumeric strings
//! allocated in insertion order.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Deserialize;
use tracing::trace;

use crate::{decode_opts, DriverError, Result, Shortener};

const DEFAULT_NODE_SIZE: usize = 6096;
const DEFAULT_ID_SIZE: usize = 8;

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Options for the `memory` driver.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MemoryOpts {
    pub node_size: usize,
    pub id_size: usize,
}

impl Default for MemoryOpts {
    fn default() -> Self {
        Self {
            node_size: DEFAULT_NODE_SIZE,
            id_size: DEFAULT_ID_SIZE,
        }
    }
}

#[derive(Debug, Default)]
struct Entries {
    by_id: HashMap<String, Vec<u8>>,
    by_digest: HashMap<[u8; 32], String>,
}

/// An in-memory [`Shortener`] with configurable geometry.
#[derive(Debug)]
pub struct Memory {
    node_size: usize,
    id_size: usize,
    entries: Mutex<Entries>,
}

impl Memory {
    /// Create a store with the given entry geometry.
    ///
    /// # Panics
    ///
    /// Panics if either size is zero.
    pub fn new(node_size: usize, id_size: usize) -> Self {
        assert!(node_size > 0, "node_size must be positive");
        assert!(id_size > 0, "id_size must be positive");
        Self {
            node_size,
            id_size,
            entries: Mutex::new(Entries::default()),
        }
    }

    pub(crate) fn from_opts(opts: &serde_yaml::Value) -> Result<Self> {
        let opts: MemoryOpts = decode_opts(opts)?;
        Ok(Self::new(opts.node_size, opts.id_size))
    }

    /// Number of distinct entries stored so far.
    pub fn entry_count(&self) -> usize {
        self.entries.lock().unwrap().by_id.len()
    }

    fn format_id(&self, n: u64) -> String {
        let mut chars = vec![ID_ALPHABET[0]; self.id_size];
        let mut n = n;
        for slot in chars.iter_mut().rev() {
            *slot = ID_ALPHABET[(n % ID_ALPHABET.len() as u64) as usize];
            n /= ID_ALPHABET.len() as u64;
        }
        String::from_utf8(chars).unwrap()
    }
}

impl Shortener for Memory {
    fn node_size(&self) -> usize {
        self.node_size
    }

    fn id_size(&self) -> usize {
        self.id_size
    }

    fn read(&self, id: &str) -> Result<Vec<u8>> {
        self.entries
            .lock()
            .unwrap()
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| DriverError::Parse(format!("no entry for id {id}")))
    }

    fn write(&self, data: &[u8]) -> Result<String> {
        debug_assert!(data.len() <= self.node_size, "payload exceeds node size");
        let digest = *blake3::hash(data).as_bytes();
        let mut entries = self.entries.lock().unwrap();
        if let Some(id) = entries.by_digest.get(&digest) {
            trace!(id = %id, "deduplicated write");
            return Ok(id.clone());
        }
        let id = self.format_id(entries.by_id.len() as u64);
        entries.by_id.insert(id.clone(), data.to_vec());
        entries.by_digest.insert(digest, id.clone());
        trace!(id = %id, len = data.len(), "stored entry");
        Ok(id)
    }
}
