use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheHealth {
    pub capacity: usize,
    pub cache_size: usize,
    pub dirty_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub total_flushes: u64,
    pub failed_flushes: u64,
    pub superseded_flushes: u64,
    pub last_flush_at_ms: Option<u64>,
    pub background_flush_running: bool,
}

#[derive(Debug, Default)]
pub(crate) struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    flushes: AtomicU64,
    failed_flushes: AtomicU64,
    superseded_flushes: AtomicU64,
    last_flush_at_ms: AtomicU64,
}

impl CacheStats {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self, now_ms: u64) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.last_flush_at_ms.fetch_max(now_ms, Ordering::Relaxed);
    }

    pub fn record_failed_flush(&self) {
        self.failed_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_superseded_flush(&self) {
        self.superseded_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fill(&self, health: &mut CacheHealth) {
        health.hits = self.hits.load(Ordering::Relaxed);
        health.misses = self.misses.load(Ordering::Relaxed);
        health.evictions = self.evictions.load(Ordering::Relaxed);
        health.total_flushes = self.flushes.load(Ordering::Relaxed);
        health.failed_flushes = self.failed_flushes.load(Ordering::Relaxed);
        health.superseded_flushes = self.superseded_flushes.load(Ordering::Relaxed);
        health.last_flush_at_ms = match self.last_flush_at_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        };
    }
}
