#![forbid(unsafe_code)]
//! Workload driver for the vnode cache.
//!
//! [`run_churn`] starts a cache with its daemons, hammers it from several
//! threads with open/write/close cycles and then waits for the reclaimer to
//! bring the population back under its trigger. The resulting
//! [`ChurnReport`] is what the CLI prints.
//!
//! # Logging
//!
//! - **INFO** `vnc::harness`: `churn_start`, `churn_done`
//! - **WARN** `vnc::harness`: `churn_unsettled`

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use vnc_core::{
    CacheConfig, CacheStats, InactiveOutcome, LogicalBlock, ReclaimPlan, Tunables, VnodeCache,
    VnodeId, VnodeLock, VnodeOps, VnodeType,
};

// ── In-memory filesystem ops ───────────────────────────────────────────

/// Filesystem stand-in that counts callbacks and discards data.
#[derive(Debug, Default)]
pub struct MemOps {
    /// Every n-th inactive call asks for the vnode to be doomed (0: never).
    pub doom_every: u64,
    inactive: AtomicU64,
    reclaimed: AtomicU64,
    written: AtomicU64,
}

impl MemOps {
    #[must_use]
    pub fn new(doom_every: u64) -> Self {
        Self {
            doom_every,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn inactive_calls(&self) -> u64 {
        self.inactive.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn reclaim_calls(&self) -> u64 {
        self.reclaimed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn blocks_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

impl VnodeOps for MemOps {
    fn on_inactive(&self, _lock: &mut VnodeLock<'_>) -> vnc_core::Result<InactiveOutcome> {
        let n = self.inactive.fetch_add(1, Ordering::Relaxed) + 1;
        if self.doom_every > 0 && n % self.doom_every == 0 {
            return Ok(InactiveOutcome::Doom);
        }
        Ok(InactiveOutcome::Keep)
    }

    fn on_reclaim(&self, lock: &mut VnodeLock<'_>) -> vnc_core::Result<()> {
        drop(lock.take_private());
        self.reclaimed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_buffer(&self, _: VnodeId, _: LogicalBlock, _: &[u8]) -> vnc_core::Result<()> {
        self.written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// ── Churn workload ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChurnConfig {
    pub cache: CacheConfig,
    pub threads: usize,
    /// Open/close cycles per thread.
    pub iterations: u64,
    /// Dirty one block every n-th cycle (0: never).
    pub write_every: u64,
    /// Close through the deferred path every n-th cycle (0: never).
    pub defer_every: u64,
    /// Every n-th opened vnode is a directory (0: never).
    pub dir_every: u64,
    pub doom_every: u64,
    /// How long to wait for the reclaimer after the workload stops.
    pub settle_timeout_ms: u64,
}

impl Default for ChurnConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig {
                tunables: Tunables {
                    desired_vnodes: 256,
                    want_free_vnodes: 64,
                    file_delay: 2,
                    dir_delay: 2,
                    meta_delay: 1,
                    alloc_sleep_timeout_ms: 100,
                    reclaim_tick_ms: 10,
                    syncer_tick_ms: 10,
                    ..Tunables::default()
                },
                syncer_slots: 8,
                ..CacheConfig::default()
            },
            threads: 4,
            iterations: 2_000,
            write_every: 8,
            defer_every: 13,
            dir_every: 16,
            doom_every: 0,
            settle_timeout_ms: 5_000,
        }
    }
}

impl ChurnConfig {
    /// Read a JSON churn config.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("invalid churn config {}", path.display()))?;
        config.cache.validate()?;
        Ok(config)
    }
}

/// Read a JSON tunables file; missing keys take their defaults.
pub fn load_tunables(path: &Path) -> Result<Tunables> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let tunables: Tunables = serde_json::from_str(&text)
        .with_context(|| format!("invalid tunables file {}", path.display()))?;
    tunables.validate()?;
    Ok(tunables)
}

#[derive(Debug, Clone, Serialize)]
pub struct ChurnReport {
    pub threads: usize,
    pub iterations: u64,
    pub duration_us: u64,
    /// Live count dropped below the reclaim trigger before the timeout.
    pub settled: bool,
    pub settle_us: u64,
    pub desired_vnodes: u64,
    pub want_free_vnodes: u64,
    pub stats: CacheStats,
    pub physical_slots: usize,
    pub inactive_calls: u64,
    pub reclaim_calls: u64,
    pub blocks_written: u64,
    /// Vnodes still queued on the syncer after shutdown.
    pub syncer_pending: usize,
    pub passed: bool,
}

fn churn_worker(
    cache: &VnodeCache,
    mount: &Arc<vnc_core::Mount>,
    config: &ChurnConfig,
    worker: u64,
) -> Result<()> {
    for i in 0..config.iterations {
        let cycle = i + worker;
        let vtype = if config.dir_every > 0 && cycle % config.dir_every == 0 {
            VnodeType::Directory
        } else {
            VnodeType::Regular
        };
        let vp = cache.acquire(Some(mount));
        cache.construct(&vp, mount, vtype, None)?;
        if config.write_every > 0 && cycle % config.write_every == 0 {
            #[expect(clippy::cast_possible_wrap)]
            let block = LogicalBlock((i % 4) as i64);
            cache.write_block(&vp, block, vec![0xA5; 64])?;
        }
        if config.defer_every > 0 && cycle % config.defer_every == 0 {
            cache.release_use_deferred(&vp);
        } else {
            cache.release_use(&vp);
        }
    }
    Ok(())
}

/// Drive `config.threads` workers against one mount, then wait for the
/// population to settle and stop the daemons.
pub fn run_churn(config: &ChurnConfig) -> Result<ChurnReport> {
    let cache = VnodeCache::new(config.cache.clone())?;
    let ops = Arc::new(MemOps::new(config.doom_every));
    let mount = cache.mount("churn", Arc::clone(&ops) as Arc<dyn VnodeOps>);
    let daemons = cache.spawn_daemons()?;
    info!(
        target: "vnc::harness",
        threads = config.threads,
        iterations = config.iterations,
        "churn_start"
    );

    let started = Instant::now();
    thread::scope(|scope| -> Result<()> {
        let handles: Vec<_> = (0..config.threads)
            .map(|worker| {
                let (cache, mount) = (&cache, &mount);
                scope.spawn(move || churn_worker(cache, mount, config, worker as u64))
            })
            .collect();
        for handle in handles {
            match handle.join() {
                Ok(result) => result?,
                Err(_) => bail!("churn worker panicked"),
            }
        }
        Ok(())
    })?;
    let duration = started.elapsed();

    let tunables = cache.tunables();
    let settle_started = Instant::now();
    let deadline = settle_started + Duration::from_millis(config.settle_timeout_ms);
    let settled = loop {
        if ReclaimPlan::compute(cache.stats().live_vnodes, &tunables).is_none() {
            break true;
        }
        if Instant::now() >= deadline {
            break false;
        }
        thread::sleep(Duration::from_millis(5));
    };
    let settle = settle_started.elapsed();
    if !settled {
        warn!(
            target: "vnc::harness",
            live = cache.stats().live_vnodes,
            desired = tunables.desired_vnodes,
            "churn_unsettled"
        );
    }

    daemons.shutdown();
    let stats = cache.stats();
    let syncer_pending = cache.syncer_pending();
    let report = ChurnReport {
        threads: config.threads,
        iterations: config.iterations,
        duration_us: u64::try_from(duration.as_micros()).unwrap_or(u64::MAX),
        settled,
        settle_us: u64::try_from(settle.as_micros()).unwrap_or(u64::MAX),
        desired_vnodes: tunables.desired_vnodes,
        want_free_vnodes: tunables.want_free_vnodes,
        stats,
        physical_slots: cache.physical_slots(),
        inactive_calls: ops.inactive_calls(),
        reclaim_calls: ops.reclaim_calls(),
        blocks_written: ops.blocks_written(),
        syncer_pending,
        passed: settled && syncer_pending == 0 && stats.free_vnodes <= stats.live_vnodes,
    };
    info!(
        target: "vnc::harness",
        passed = report.passed,
        live = stats.live_vnodes,
        recycles = stats.recycles,
        "churn_done"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn small() -> ChurnConfig {
        let mut config = ChurnConfig {
            threads: 3,
            iterations: 300,
            ..ChurnConfig::default()
        };
        config.cache.tunables.desired_vnodes = 32;
        config.cache.tunables.want_free_vnodes = 8;
        config.cache.tunables.reclaim_tick_ms = 2;
        config.cache.tunables.syncer_tick_ms = 2;
        config
    }

    #[test]
    fn churn_settles_and_drains() {
        let report = run_churn(&small()).expect("churn");
        assert!(report.passed, "{report:?}");
        assert!(report.stats.recycles > 0);
        assert!(report.blocks_written > 0);
        assert!(report.inactive_calls > 0);
        assert!(report.stats.live_vnodes >= report.want_free_vnodes);
    }

    #[test]
    fn doom_on_inactive_returns_vnodes() {
        let config = ChurnConfig {
            doom_every: 3,
            ..small()
        };
        let report = run_churn(&config).expect("churn");
        assert!(report.passed, "{report:?}");
        assert!(report.reclaim_calls > 0);
    }

    #[test]
    fn tunables_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, r#"{{"desired_vnodes": 100, "want_free_vnodes": 10}}"#).expect("write");
        let t = load_tunables(file.path()).expect("load");
        assert_eq!(t.desired_vnodes, 100);
        assert_eq!(t.max_force, Tunables::default().max_force);
    }

    #[test]
    fn invalid_tunables_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, r#"{{"desired_vnodes": 10, "want_free_vnodes": 20}}"#).expect("write");
        assert!(load_tunables(file.path()).is_err());

        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, r#"{{"desired": 10}}"#).expect("write");
        assert!(load_tunables(file.path()).is_err());
    }

    #[test]
    fn churn_config_loads_from_json() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(
            file,
            r#"{{"threads": 2, "iterations": 10, "cache": {{"syncer_slots": 16}}}}"#
        )
        .expect("write");
        let config = ChurnConfig::load(file.path()).expect("load");
        assert_eq!(config.threads, 2);
        assert_eq!(config.cache.syncer_slots, 16);
        assert_eq!(config.cache.tunables, Tunables::default());
    }
}
