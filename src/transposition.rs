//! Transposition table keyed by node content hash
//!
//! Structurally equivalent plan nodes share their evaluation: when a freshly
//! selected leaf's hash is already present, the engine inherits the stored
//! average instead of paying for another simulation.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

/// Stored evaluation for one content hash
#[derive(Clone, Copy, Debug)]
pub struct TranspositionEntry {
    pub average_score: f64,
    pub visits: u64,
}

/// JSON-serializable table snapshot
#[derive(Clone, Debug, Serialize)]
pub struct TranspositionStatus {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Hash-keyed cache of node evaluations
#[derive(Default)]
pub struct TranspositionTable {
    entries: DashMap<[u8; 32], TranspositionEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TranspositionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a stored evaluation, counting the hit or miss
    pub fn lookup(&self, hash: &[u8; 32]) -> Option<TranspositionEntry> {
        match self.entries.get(hash) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::SeqCst);
                Some(*entry)
            }
            None => {
                self.misses.fetch_add(1, Ordering::SeqCst);
                None
            }
        }
    }

    /// Store or refresh the evaluation for a hash
    pub fn store(&self, hash: [u8; 32], average_score: f64, visits: u64) {
        self.entries.insert(
            hash,
            TranspositionEntry {
                average_score,
                visits,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn status(&self) -> TranspositionStatus {
        TranspositionStatus {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::SeqCst),
            misses: self.misses.load(Ordering::SeqCst),
        }
    }
}
