//! Poll-generation bookkeeping for label instances.
//!
//! Each poll cycle bumps a generation counter; every gauge label-instance
//! written during the cycle is stamped with it. After a full cycle, any
//! tracked instance whose stamp is older than the current generation belongs
//! to a backend that disappeared and gets evicted. Counters never take part:
//! cumulative series must not vanish and reappear at zero.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use metrics::Key;

#[derive(Default)]
pub struct GenerationMap {
    generation: AtomicU64,
    seen: Mutex<HashMap<Key, u64>>,
}

impl GenerationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// The generation of the cycle currently in flight.
    pub fn current(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Starts a new poll cycle, returning its generation.
    pub fn begin(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Stamps a label instance as observed in the current generation.
    pub fn mark(&self, key: &Key) {
        let generation = self.current();
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        seen.insert(key.clone(), generation);
    }

    /// Removes and returns every instance not refreshed in the current
    /// generation. Must only run after all of the cycle's writes.
    pub fn sweep(&self) -> Vec<Key> {
        let current = self.current();
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        let stale: Vec<Key> = seen
            .iter()
            .filter(|(_, generation)| **generation < current)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            seen.remove(key);
        }
        stale
    }

    #[cfg(test)]
    pub(crate) fn tracked(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}
