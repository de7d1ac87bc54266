//! Runtime tunables and construction-time configuration.
//!
//! [`Tunables`] is one plain struct published through an [`RcuCell`]; the
//! reclaimer, the syncer and allocators load a snapshot per pass and never
//! lock. Writers go through [`TunableStore`], which serializes
//! read-modify-write under a dedicated mutex and validates before publishing.
//!
//! The administrative surface is a flat key-value map (see [`TUNABLE_KEYS`]);
//! the read-only counters of [`CacheStats`](crate::stats::CacheStats) share
//! the same namespace at the [`VnodeCache`](crate::VnodeCache) level.
//!
//! # Logging
//!
//! - **INFO** `vnc::tunables`: `tunable_set` (one key changed)
//! - **INFO** `vnc::tunables`: `tunables_replaced` (whole struct swapped)

use crate::rcu::RcuCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use vnc_error::{Result, VnError};
use vnc_types::SyncDelayClass;

/// Writable tunable keys, in display order.
pub const TUNABLE_KEYS: [&str; 13] = [
    "desired_vnodes",
    "want_free_vnodes",
    "max_recycle_per_call",
    "file_delay",
    "dir_delay",
    "meta_delay",
    "resident_trigger",
    "max_force",
    "alloc_sleep_timeout_ms",
    "inactive_lock_wait_ms",
    "reclaim_tick_ms",
    "syncer_tick_ms",
    "flush_retries",
];

/// Upper bound on the reclaimer force level.
pub const MAX_FORCE_LIMIT: u32 = 8;

/// Knobs read by the pool, the reclaimer and the syncer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Tunables {
    /// Soft limit on live vnodes.
    pub desired_vnodes: u64,
    /// Idle population the reclaimer leaves alone.
    pub want_free_vnodes: u64,
    /// Recycle budget of one reclaimer pass.
    pub max_recycle_per_call: u64,
    /// Syncer delays, in ticks.
    pub file_delay: u32,
    pub dir_delay: u32,
    pub meta_delay: u32,
    /// Clean-buffer count above which a vnode is spared until force >= 1.
    pub resident_trigger: u64,
    pub max_force: u32,
    pub alloc_sleep_timeout_ms: u64,
    pub inactive_lock_wait_ms: u64,
    pub reclaim_tick_ms: u64,
    pub syncer_tick_ms: u64,
    /// Extra write attempts per dirty buffer before giving up.
    pub flush_retries: u32,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            desired_vnodes: 4096,
            want_free_vnodes: 1024,
            max_recycle_per_call: 256,
            file_delay: 30,
            dir_delay: 29,
            meta_delay: 28,
            resident_trigger: 8,
            max_force: 3,
            alloc_sleep_timeout_ms: 1000,
            inactive_lock_wait_ms: 10,
            reclaim_tick_ms: 1000,
            syncer_tick_ms: 1000,
            flush_retries: 3,
        }
    }
}

fn invalid(key: &str, reason: impl Into<String>) -> VnError {
    VnError::InvalidTunable {
        key: key.to_owned(),
        reason: reason.into(),
    }
}

fn narrow(key: &str, value: u64) -> Result<u32> {
    u32::try_from(value).map_err(|_| invalid(key, format!("{value} does not fit in 32 bits")))
}

impl Tunables {
    pub fn validate(&self) -> Result<()> {
        if self.desired_vnodes == 0 {
            return Err(invalid("desired_vnodes", "must be > 0"));
        }
        if self.want_free_vnodes > self.desired_vnodes {
            return Err(invalid(
                "want_free_vnodes",
                format!(
                    "{} exceeds desired_vnodes {}",
                    self.want_free_vnodes, self.desired_vnodes
                ),
            ));
        }
        if self.max_recycle_per_call == 0 {
            return Err(invalid("max_recycle_per_call", "must be > 0"));
        }
        for (key, delay) in [
            ("file_delay", self.file_delay),
            ("dir_delay", self.dir_delay),
            ("meta_delay", self.meta_delay),
        ] {
            if delay == 0 {
                return Err(invalid(key, "must be at least one tick"));
            }
        }
        if self.max_force > MAX_FORCE_LIMIT {
            return Err(invalid(
                "max_force",
                format!("{} exceeds {MAX_FORCE_LIMIT}", self.max_force),
            ));
        }
        for (key, ms) in [
            ("reclaim_tick_ms", self.reclaim_tick_ms),
            ("syncer_tick_ms", self.syncer_tick_ms),
        ] {
            if ms == 0 {
                return Err(invalid(key, "must be > 0"));
            }
        }
        Ok(())
    }

    /// Value of one key, `None` if the key is not a tunable.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<u64> {
        let value = match key {
            "desired_vnodes" => self.desired_vnodes,
            "want_free_vnodes" => self.want_free_vnodes,
            "max_recycle_per_call" => self.max_recycle_per_call,
            "file_delay" => u64::from(self.file_delay),
            "dir_delay" => u64::from(self.dir_delay),
            "meta_delay" => u64::from(self.meta_delay),
            "resident_trigger" => self.resident_trigger,
            "max_force" => u64::from(self.max_force),
            "alloc_sleep_timeout_ms" => self.alloc_sleep_timeout_ms,
            "inactive_lock_wait_ms" => self.inactive_lock_wait_ms,
            "reclaim_tick_ms" => self.reclaim_tick_ms,
            "syncer_tick_ms" => self.syncer_tick_ms,
            "flush_retries" => u64::from(self.flush_retries),
            _ => return None,
        };
        Some(value)
    }

    /// Set one key without validating the whole struct.
    pub fn set(&mut self, key: &str, value: u64) -> Result<()> {
        match key {
            "desired_vnodes" => self.desired_vnodes = value,
            "want_free_vnodes" => self.want_free_vnodes = value,
            "max_recycle_per_call" => self.max_recycle_per_call = value,
            "file_delay" => self.file_delay = narrow(key, value)?,
            "dir_delay" => self.dir_delay = narrow(key, value)?,
            "meta_delay" => self.meta_delay = narrow(key, value)?,
            "resident_trigger" => self.resident_trigger = value,
            "max_force" => self.max_force = narrow(key, value)?,
            "alloc_sleep_timeout_ms" => self.alloc_sleep_timeout_ms = value,
            "inactive_lock_wait_ms" => self.inactive_lock_wait_ms = value,
            "reclaim_tick_ms" => self.reclaim_tick_ms = value,
            "syncer_tick_ms" => self.syncer_tick_ms = value,
            "flush_retries" => self.flush_retries = narrow(key, value)?,
            other => return Err(VnError::NotFound(format!("tunable {other}"))),
        }
        Ok(())
    }

    /// Syncer delay for one class of dirty vnode.
    #[must_use]
    pub fn delay_for(&self, class: SyncDelayClass) -> u32 {
        match class {
            SyncDelayClass::File => self.file_delay,
            SyncDelayClass::Directory => self.dir_delay,
            SyncDelayClass::Metadata => self.meta_delay,
        }
    }

    #[must_use]
    pub fn alloc_sleep_timeout(&self) -> Duration {
        Duration::from_millis(self.alloc_sleep_timeout_ms)
    }

    #[must_use]
    pub fn inactive_lock_wait(&self) -> Duration {
        Duration::from_millis(self.inactive_lock_wait_ms)
    }

    #[must_use]
    pub fn reclaim_tick(&self) -> Duration {
        Duration::from_millis(self.reclaim_tick_ms)
    }

    #[must_use]
    pub fn syncer_tick(&self) -> Duration {
        Duration::from_millis(self.syncer_tick_ms)
    }
}

/// Published [`Tunables`] plus the writer lock.
#[derive(Debug)]
pub struct TunableStore {
    current: RcuCell<Tunables>,
    writer: Mutex<()>,
}

impl TunableStore {
    pub fn new(initial: Tunables) -> Result<Self> {
        initial.validate()?;
        Ok(Self {
            current: RcuCell::new(initial),
            writer: Mutex::new(()),
        })
    }

    /// Current snapshot. Cheap; daemons call this once per pass.
    #[must_use]
    pub fn load(&self) -> Arc<Tunables> {
        self.current.load_arc()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<u64> {
        self.current.load().get(key)
    }

    pub fn set(&self, key: &str, value: u64) -> Result<()> {
        let _writer = self.writer.lock();
        let mut next = Tunables::clone(&self.current.load());
        let old = next.get(key);
        next.set(key, value)?;
        next.validate()?;
        self.current.update(next);
        info!(target: "vnc::tunables", key, old, new = value, "tunable_set");
        Ok(())
    }

    pub fn replace(&self, tunables: Tunables) -> Result<()> {
        tunables.validate()?;
        let _writer = self.writer.lock();
        self.current.update(tunables);
        info!(target: "vnc::tunables", "tunables_replaced");
        Ok(())
    }

    /// Number of published updates.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.current.update_count()
    }
}

/// Construction-time layout of a [`VnodeCache`](crate::VnodeCache).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub tunables: Tunables,
    /// Per-CPU batch shards; 0 means one per available CPU.
    pub batch_count: usize,
    pub batch_size: usize,
    pub syncer_slots: usize,
    /// Bound on shutdown ticks, in whole rotations of the ring.
    pub syncer_shutdown_passes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            tunables: Tunables::default(),
            batch_count: 0,
            batch_size: 8,
            syncer_slots: 32,
            syncer_shutdown_passes: 2,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        self.tunables.validate()?;
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be > 0"));
        }
        if self.syncer_slots < 3 {
            return Err(invalid("syncer_slots", "ring needs at least 3 slots"));
        }
        Ok(())
    }

    /// Shard count after resolving the "one per CPU" default.
    #[must_use]
    pub fn resolved_batch_count(&self) -> usize {
        if self.batch_count > 0 {
            return self.batch_count;
        }
        std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Tunables::default().validate().expect("defaults");
        CacheConfig::default().validate().expect("defaults");
    }

    #[test]
    fn every_key_round_trips_through_get_and_set() {
        let mut t = Tunables::default();
        for (i, key) in TUNABLE_KEYS.iter().enumerate() {
            let value = 5 + i as u64;
            t.set(key, value).expect("set");
            assert_eq!(t.get(key), Some(value), "{key}");
        }
        assert_eq!(t.get("live_vnodes"), None);
    }

    #[test]
    fn set_rejects_unknown_key_and_oversized_value() {
        let mut t = Tunables::default();
        assert!(matches!(t.set("bogus", 1), Err(VnError::NotFound(_))));
        assert!(matches!(
            t.set("file_delay", u64::MAX),
            Err(VnError::InvalidTunable { .. })
        ));
    }

    #[test]
    fn validation_errors_name_the_key() {
        let mut t = Tunables {
            want_free_vnodes: 10,
            desired_vnodes: 5,
            ..Tunables::default()
        };
        match t.validate() {
            Err(VnError::InvalidTunable { key, .. }) => assert_eq!(key, "want_free_vnodes"),
            other => panic!("unexpected {other:?}"),
        }
        t.want_free_vnodes = 1;
        t.meta_delay = 0;
        assert!(t.validate().is_err());
    }

    #[test]
    fn store_rejects_invalid_update_and_keeps_old_value() {
        let store = TunableStore::new(Tunables::default()).expect("store");
        store.set("desired_vnodes", 2_000).expect("set");
        assert_eq!(store.get("desired_vnodes"), Some(2_000));

        let err = store.set("want_free_vnodes", 3_000).unwrap_err();
        assert!(matches!(err, VnError::InvalidTunable { .. }));
        assert_eq!(
            store.get("want_free_vnodes"),
            Some(Tunables::default().want_free_vnodes)
        );
        assert_eq!(store.generation(), 1);
    }

    #[test]
    fn delay_classes_map_to_delays() {
        let t = Tunables::default();
        assert_eq!(t.delay_for(SyncDelayClass::File), 30);
        assert_eq!(t.delay_for(SyncDelayClass::Directory), 29);
        assert_eq!(t.delay_for(SyncDelayClass::Metadata), 28);
    }

    #[test]
    fn tunables_deserialize_with_defaults() {
        let t: Tunables =
            serde_json::from_str(r#"{"desired_vnodes": 64, "want_free_vnodes": 16}"#)
                .expect("parse");
        assert_eq!(t.desired_vnodes, 64);
        assert_eq!(t.flush_retries, Tunables::default().flush_retries);
        assert!(serde_json::from_str::<Tunables>(r#"{"nope": 1}"#).is_err());
    }
}
