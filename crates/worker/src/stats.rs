//! Cache hit/miss counters for the lookup pipeline.

use std::sync::atomic::{AtomicI64, Ordering};

/// Lock-free counters, swapped to zero at the end of each run so every
/// run's row in the log carries only its own traffic.
#[derive(Debug, Default)]
pub struct LookupStats {
    /// Name resolved from the in-memory children map.
    pub memory_cache_hits: AtomicI64,
    /// Name resolved from the on-disk blob cache via the key index.
    pub disk_cache_hits: AtomicI64,
    /// Name resolved by asking the blob server.
    pub server_fetches: AtomicI64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub memory_cache_hits: i64,
    pub disk_cache_hits: i64,
    pub server_fetches: i64,
}

impl LookupStats {
    pub fn record_memory_hit(&self) {
        self.memory_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disk_hit(&self) {
        self.disk_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_server_fetch(&self) {
        self.server_fetches.fetch_add(1, Ordering::Relaxed);
    }

    /// Read and zero all three counters.
    pub fn swap_and_reset(&self) -> StatsSnapshot {
        StatsSnapshot {
            memory_cache_hits: self.memory_cache_hits.swap(0, Ordering::Relaxed),
            disk_cache_hits: self.disk_cache_hits.swap(0, Ordering::Relaxed),
            server_fetches: self.server_fetches.swap(0, Ordering::Relaxed),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            memory_cache_hits: self.memory_cache_hits.load(Ordering::Relaxed),
            disk_cache_hits: self.disk_cache_hits.load(Ordering::Relaxed),
            server_fetches: self.server_fetches.load(Ordering::Relaxed),
        }
    }
}
