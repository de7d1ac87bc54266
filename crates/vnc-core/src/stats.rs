//! Cache-wide counters.
//!
//! Relaxed atomics throughout: the values pace the reclaimer and feed
//! reports, nothing depends on them being exact.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Read-only counter keys exposed next to the tunables.
pub const COUNTER_KEYS: [&str; 9] = [
    "live_vnodes",
    "free_vnodes",
    "recycles",
    "alloc_sleeps",
    "deferred_inactive",
    "reclaim_stalls",
    "lost_writes",
    "busy_skips",
    "batch_flushes",
];

#[derive(Debug, Default)]
pub struct CacheCounters {
    /// Vnodes handed out by the pool and not yet returned.
    pub live: AtomicU64,
    /// Live, undoomed vnodes with no holds.
    pub free: AtomicU64,
    pub recycles: AtomicU64,
    pub alloc_sleeps: AtomicU64,
    pub deferred_inactive: AtomicU64,
    pub reclaim_stalls: AtomicU64,
    pub lost_writes: AtomicU64,
    pub busy_skips: AtomicU64,
    pub batch_flushes: AtomicU64,
}

impl CacheCounters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Decrement without wrapping below zero.
    pub(crate) fn dec(counter: &AtomicU64) {
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    #[must_use]
    pub fn live(&self) -> u64 {
        self.live.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn free(&self) -> u64 {
        self.free.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            live_vnodes: self.live.load(Ordering::Relaxed),
            free_vnodes: self.free.load(Ordering::Relaxed),
            recycles: self.recycles.load(Ordering::Relaxed),
            alloc_sleeps: self.alloc_sleeps.load(Ordering::Relaxed),
            deferred_inactive: self.deferred_inactive.load(Ordering::Relaxed),
            reclaim_stalls: self.reclaim_stalls.load(Ordering::Relaxed),
            lost_writes: self.lost_writes.load(Ordering::Relaxed),
            busy_skips: self.busy_skips.load(Ordering::Relaxed),
            batch_flushes: self.batch_flushes.load(Ordering::Relaxed),
        }
    }
}

/// Immutable snapshot of [`CacheCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub live_vnodes: u64,
    pub free_vnodes: u64,
    pub recycles: u64,
    pub alloc_sleeps: u64,
    pub deferred_inactive: u64,
    pub reclaim_stalls: u64,
    pub lost_writes: u64,
    pub busy_skips: u64,
    pub batch_flushes: u64,
}

impl CacheStats {
    /// Value of one counter key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<u64> {
        let value = match key {
            "live_vnodes" => self.live_vnodes,
            "free_vnodes" => self.free_vnodes,
            "recycles" => self.recycles,
            "alloc_sleeps" => self.alloc_sleeps,
            "deferred_inactive" => self.deferred_inactive,
            "reclaim_stalls" => self.reclaim_stalls,
            "lost_writes" => self.lost_writes,
            "busy_skips" => self.busy_skips,
            "batch_flushes" => self.batch_flushes,
            _ => return None,
        };
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dec_saturates_at_zero() {
        let c = CacheCounters::new();
        CacheCounters::dec(&c.free);
        assert_eq!(c.free(), 0);
        CacheCounters::bump(&c.free);
        CacheCounters::add(&c.free, 2);
        CacheCounters::dec(&c.free);
        assert_eq!(c.free(), 2);
    }

    #[test]
    fn every_counter_key_resolves() {
        let c = CacheCounters::new();
        CacheCounters::add(&c.lost_writes, 3);
        let snap = c.snapshot();
        for key in COUNTER_KEYS {
            assert!(snap.get(key).is_some(), "{key}");
        }
        assert_eq!(snap.get("lost_writes"), Some(3));
        assert_eq!(snap.get("desired_vnodes"), None);
    }
}
