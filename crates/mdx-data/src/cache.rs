use std::sync::Arc;

use mdx_types::InstrumentRecord;
use parking_lot::RwLock;

use crate::index::MasterIndex;

/// Search engine over the most recently published [`MasterIndex`].
///
/// Readers clone the current `Arc` and search outside the lock, so a rebuild
/// never blocks or tears a query: the old snapshot stays valid until its last
/// reader drops it.
#[derive(Debug, Default)]
pub struct IndexCache {
    current: RwLock<Option<Arc<MasterIndex>>>,
    stats: RwLock<SearchStats>,
}

impl IndexCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap in a fully built index.
    pub fn publish(&self, index: Arc<MasterIndex>) {
        tracing::debug!("Publishing index with {} symbols", index.len());
        *self.current.write() = Some(index);
        self.stats.write().swaps += 1;
    }

    pub fn clear(&self) {
        *self.current.write() = None;
    }

    pub fn current(&self) -> Option<Arc<MasterIndex>> {
        self.current.read().clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.current.read().is_some()
    }

    /// Prefix search; empty when nothing has been published.
    pub fn search(&self, query: &str, limit: usize) -> Vec<InstrumentRecord> {
        let results = match self.current() {
            Some(index) => index.prefix_search(query, limit).to_vec(),
            None => Vec::new(),
        };

        {
            let mut stats = self.stats.write();
            stats.searches += 1;
            if results.is_empty() {
                stats.misses += 1;
            } else {
                stats.hits += 1;
            }
        }

        results
    }

    pub fn get(&self, symbol: &str) -> Option<InstrumentRecord> {
        self.current()?.get(symbol).cloned()
    }

    pub fn get_stats(&self) -> SearchStats {
        self.stats.read().clone()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchStats {
    pub searches: u64,
    pub hits: u64,
    pub misses: u64,
    pub swaps: u64,
}

impl SearchStats {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }
}
