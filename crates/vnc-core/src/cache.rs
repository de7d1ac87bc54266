//! The cache object: shared state, administrative surface, buffer
//! operations and the background daemons.
//!
//! # Logging
//!
//! - **TRACE** `vnc::buf`: `vnode_write`
//! - **INFO**  `vnc::pool`: `cache_created`, `mount_registered`
//! - **ERROR** `vnc::pool`: `daemon_panicked`

use crate::batch::BatchSet;
use crate::config::{CacheConfig, TUNABLE_KEYS, TunableStore, Tunables};
use crate::list::VnodeList;
use crate::mount::Mount;
use crate::ops::{OpsWriter, VnodeOps};
use crate::pool::Pool;
use crate::reclaim::run_reclaimer;
use crate::signal::Signal;
use crate::stats::{COUNTER_KEYS, CacheCounters, CacheStats};
use crate::syncer::{SyncItem, SyncerRing, run_syncer};
use crate::vnode::Vnode;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{error, info, trace};
use vnc_buf::{DirtyOutcome, FlushReport};
use vnc_error::{Result, VnError};
use vnc_types::{BlockRange, LogicalBlock, MountId, UpperEvent};

/// One row of [`VnodeCache::tunable_entries`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunableEntry {
    pub key: &'static str,
    pub value: u64,
    pub writable: bool,
}

pub struct VnodeCache {
    pub(crate) config: CacheConfig,
    pub(crate) tunables: TunableStore,
    pub(crate) stats: CacheCounters,
    pub(crate) pool: Pool,
    pub(crate) list: Mutex<VnodeList>,
    pub(crate) batches: BatchSet,
    pub(crate) syncer: Mutex<SyncerRing>,
    pub(crate) reclaim_signal: Signal,
    pub(crate) syncer_signal: Signal,
    /// Force level of the next non-stirred reclaimer pass.
    pub(crate) reclaim_force: AtomicU32,
    next_mount_id: AtomicU64,
}

impl fmt::Debug for VnodeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VnodeCache")
            .field("stats", &self.stats.snapshot())
            .field("physical_slots", &self.physical_slots())
            .finish_non_exhaustive()
    }
}

impl VnodeCache {
    pub fn new(config: CacheConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let tunables = TunableStore::new(config.tunables.clone())?;
        let batch_count = config.resolved_batch_count();
        let cache = Self {
            tunables,
            stats: CacheCounters::new(),
            pool: Pool::new(),
            list: Mutex::new(VnodeList::new()),
            batches: BatchSet::new(batch_count, config.batch_size),
            syncer: Mutex::new(SyncerRing::new(config.syncer_slots)),
            reclaim_signal: Signal::default(),
            syncer_signal: Signal::default(),
            reclaim_force: AtomicU32::new(0),
            next_mount_id: AtomicU64::new(1),
            config,
        };
        info!(
            target: "vnc::pool",
            desired = cache.config.tunables.desired_vnodes,
            want_free = cache.config.tunables.want_free_vnodes,
            batches = batch_count,
            syncer_slots = cache.config.syncer_slots,
            "cache_created"
        );
        Ok(Arc::new(cache))
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Register a filesystem instance. Its lazy list is swept by the syncer.
    pub fn mount(&self, name: &str, ops: Arc<dyn VnodeOps>) -> Arc<Mount> {
        let id = MountId(self.next_mount_id.fetch_add(1, Ordering::Relaxed));
        let mount = Mount::new(id, name, ops);
        let delay = self.tunables.load().meta_delay;
        self.enqueue_sync(SyncItem::Mount(Arc::clone(&mount)), delay);
        info!(target: "vnc::pool", mount = id.0, name, "mount_registered");
        mount
    }

    // ── Tunables and counters ──────────────────────────────────────────

    /// Current tunables snapshot.
    #[must_use]
    pub fn tunables(&self) -> Arc<Tunables> {
        self.tunables.load()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    /// Read a tunable or counter by key.
    pub fn tunable(&self, key: &str) -> Result<u64> {
        self.stats
            .snapshot()
            .get(key)
            .or_else(|| self.tunables.get(key))
            .ok_or_else(|| VnError::NotFound(format!("tunable {key}")))
    }

    /// Write a tunable. Counters are read-only.
    pub fn set_tunable(&self, key: &str, value: u64) -> Result<()> {
        if COUNTER_KEYS.contains(&key) {
            return Err(VnError::ReadOnly(key.to_owned()));
        }
        self.tunables.set(key, value)?;
        self.reclaim_signal.kick();
        Ok(())
    }

    /// Replace the whole tunable set at once.
    pub fn replace_tunables(&self, tunables: Tunables) -> Result<()> {
        self.tunables.replace(tunables)?;
        self.reclaim_signal.kick();
        Ok(())
    }

    /// Every key with its value, tunables first.
    #[must_use]
    pub fn tunable_entries(&self) -> Vec<TunableEntry> {
        let t = self.tunables.load();
        let stats = self.stats.snapshot();
        let writable = TUNABLE_KEYS.iter().filter_map(|&key| {
            t.get(key).map(|value| TunableEntry {
                key,
                value,
                writable: true,
            })
        });
        let counters = COUNTER_KEYS.iter().filter_map(|&key| {
            stats.get(key).map(|value| TunableEntry {
                key,
                value,
                writable: false,
            })
        });
        writable.chain(counters).collect()
    }

    // ── Buffers ────────────────────────────────────────────────────────

    fn require_live(vp: &Vnode) -> Result<()> {
        if vp.is_doomed() {
            return Err(VnError::Unavailable { vnode: vp.id().0 });
        }
        Ok(())
    }

    fn after_dirty(&self, vp: &Arc<Vnode>, outcome: DirtyOutcome) {
        if outcome == (DirtyOutcome::Dirtied { needs_sync: true }) {
            let delay = self.tunables.load().delay_for(vp.vtype().sync_class());
            self.enqueue_sync(
                SyncItem::Vnode {
                    vnode: Arc::clone(vp),
                    id: vp.id(),
                },
                delay,
            );
        }
    }

    /// Cache a clean block.
    pub fn attach_buffer(&self, vp: &Arc<Vnode>, block: LogicalBlock, bytes: Vec<u8>) -> Result<()> {
        Self::require_live(vp)?;
        vp.buffers().attach(block, bytes).map(drop)
    }

    /// Store `bytes` as the block's new contents and dirty it. The first
    /// dirty buffer puts the vnode on the syncer worklist. Fails with
    /// `Unavailable` once the vnode is being doomed.
    pub fn write_block(
        &self,
        vp: &Arc<Vnode>,
        block: LogicalBlock,
        bytes: Vec<u8>,
    ) -> Result<DirtyOutcome> {
        Self::require_live(vp)?;
        let outcome = vp.buffers().write(block, bytes)?;
        trace!(target: "vnc::buf", vnode = vp.id().0, block = block.0, ?outcome, "vnode_write");
        self.after_dirty(vp, outcome);
        Ok(outcome)
    }

    pub fn mark_dirty(&self, vp: &Arc<Vnode>, block: LogicalBlock) -> Result<DirtyOutcome> {
        Self::require_live(vp)?;
        let outcome = vp.buffers().mark_dirty(block)?;
        self.after_dirty(vp, outcome);
        Ok(outcome)
    }

    pub fn mark_clean(&self, vp: &Vnode, block: LogicalBlock) -> Result<()> {
        vp.buffers().mark_clean(block)
    }

    pub fn invalidate_range(&self, vp: &Vnode, range: BlockRange) -> usize {
        vp.buffers().invalidate_range(range)
    }

    #[must_use]
    pub fn has_cached_data(&self, vp: &Vnode) -> bool {
        vp.buffers().has_cached_data()
    }

    /// Write back the vnode's dirty buffers now, keeping them cached.
    pub fn sync_dirty(&self, vp: &Vnode) -> Result<FlushReport> {
        let mount = vp
            .mount()
            .ok_or_else(|| VnError::NotFound(format!("vnode {} has no mount", vp.id())))?;
        let retries = self.tunables.load().flush_retries;
        Ok(vp.buffers().sync_dirty(&OpsWriter(mount.ops()), retries))
    }

    // ── Name cache and upper layers ────────────────────────────────────

    /// Record a name-cache entry pointing at `vp`.
    pub fn add_namecache_ref(&self, vp: &Vnode) -> Result<u32> {
        let mut inner = vp.interlock();
        if vp.is_doomed() {
            return Err(VnError::Unavailable { vnode: vp.id().0 });
        }
        inner.namecache_refs += 1;
        Ok(inner.namecache_refs)
    }

    pub fn remove_namecache_ref(&self, vp: &Vnode) -> u32 {
        let mut inner = vp.interlock();
        inner.namecache_refs = inner.namecache_refs.saturating_sub(1);
        inner.namecache_refs
    }

    /// Tell stacked layers that the file behind `vp` was unlinked.
    pub fn notify_unlink(&self, vp: &Vnode) {
        if let Some(mount) = vp.mount() {
            mount.notify_upper(vp.id(), UpperEvent::Unlink);
        }
    }

    // ── Lists ──────────────────────────────────────────────────────────

    /// Splice every staged per-CPU batch onto the list tail.
    pub fn flush_batches(&self) -> usize {
        let flushed = self.batches.flush_all(&self.list);
        CacheCounters::add(&self.stats.batch_flushes, flushed as u64);
        flushed
    }

    /// Vnodes staged in per-CPU batches.
    #[must_use]
    pub fn batch_pending(&self) -> usize {
        self.batches.pending()
    }

    #[must_use]
    pub fn batch_shards(&self) -> usize {
        self.batches.shard_count()
    }

    /// Vnode slots on the global list.
    #[must_use]
    pub fn list_len(&self) -> usize {
        self.list.lock().len()
    }

    // ── Daemons ────────────────────────────────────────────────────────

    /// Start the reclaimer (`vnlru`) and syncer threads.
    pub fn spawn_daemons(self: &Arc<Self>) -> Result<Daemons> {
        self.reclaim_signal.reset();
        self.syncer_signal.reset();
        let mut daemons = Daemons {
            cache: Arc::clone(self),
            handles: Vec::with_capacity(2),
        };
        let cache = Arc::clone(self);
        daemons.handles.push(
            thread::Builder::new()
                .name("vnlru".to_owned())
                .spawn(move || run_reclaimer(&cache))?,
        );
        let cache = Arc::clone(self);
        daemons.handles.push(
            thread::Builder::new()
                .name("syncer".to_owned())
                .spawn(move || run_syncer(&cache))?,
        );
        Ok(daemons)
    }
}

/// Running background threads. Dropping stops and joins them.
pub struct Daemons {
    cache: Arc<VnodeCache>,
    handles: Vec<JoinHandle<()>>,
}

impl fmt::Debug for Daemons {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Daemons")
            .field("threads", &self.handles.len())
            .finish_non_exhaustive()
    }
}

impl Daemons {
    /// Stop both threads; the syncer drains its ring first.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.cache.reclaim_signal.shutdown();
        self.cache.syncer_signal.shutdown();
        for handle in self.handles.drain(..) {
            let name = handle.thread().name().unwrap_or("daemon").to_owned();
            if handle.join().is_err() {
                error!(target: "vnc::pool", thread = %name, "daemon_panicked");
            }
        }
    }
}

impl Drop for Daemons {
    fn drop(&mut self) {
        self.stop();
    }
}
