//! Delayed write-back work queue.
//!
//! A ring of `N` slots; the syncer thread advances one slot per tick and
//! visits the items in the slot it lands on. An item enqueued with delay `d`
//! goes to slot `(current + d) mod N`, with `d` clamped to `[1, N - 2]` so it
//! is never visited in the current tick and never wraps onto it.
//!
//! Two kinds of items live in the ring:
//!
//! - a vnode whose buffer object just got its first dirty buffer: written
//!   back when visited, re-queued at its type's delay while dirty data
//!   remains;
//! - a mount: drives the periodic lazy sweep and re-queues itself at the
//!   metadata delay until the mount starts unmounting.
//!
//! The ring lock is never held while an item is processed.
//!
//! # Logging
//!
//! - **TRACE** `vnc::syncer`: `syncer_enqueue`, `syncer_tick`
//! - **INFO**  `vnc::syncer`: `syncer_start`, `syncer_stop`
//! - **WARN**  `vnc::syncer`: `syncer_write_failed`

use crate::VnodeCache;
use crate::config::Tunables;
use crate::mount::Mount;
use crate::ops::OpsWriter;
use crate::vnode::Vnode;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{info, trace, warn};
use vnc_types::VnodeId;

/// One piece of syncer work.
pub enum SyncItem {
    /// `id` pins the incarnation; a reused slot is dropped when visited.
    Vnode { vnode: Arc<Vnode>, id: VnodeId },
    Mount(Arc<Mount>),
}

impl fmt::Debug for SyncItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vnode { id, .. } => f.debug_tuple("Vnode").field(id).finish(),
            Self::Mount(mount) => f.debug_tuple("Mount").field(&mount.id()).finish(),
        }
    }
}

#[derive(Debug)]
pub struct SyncerRing {
    slots: Vec<Vec<SyncItem>>,
    current: usize,
}

impl SyncerRing {
    #[must_use]
    pub fn new(slots: usize) -> Self {
        Self::starting_at(slots, 0)
    }

    /// Ring positioned at `current`. Fewer than 3 slots are rounded up.
    #[must_use]
    pub fn starting_at(slots: usize, current: usize) -> Self {
        let slots = slots.max(3);
        Self {
            slots: (0..slots).map(|_| Vec::new()).collect(),
            current: current % slots,
        }
    }

    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn current(&self) -> usize {
        self.current
    }

    /// Slot an item enqueued now with `delay` ticks lands in.
    #[must_use]
    pub fn slot_for(&self, delay: u32) -> usize {
        let n = self.slots.len();
        let delay = usize::try_from(delay).unwrap_or(usize::MAX).clamp(1, n - 2);
        (self.current + delay) % n
    }

    pub fn enqueue(&mut self, item: SyncItem, delay: u32) -> usize {
        let slot = self.slot_for(delay);
        self.slots[slot].push(item);
        slot
    }

    /// Step to the next slot and take its items.
    pub fn advance(&mut self) -> (usize, Vec<SyncItem>) {
        self.current = (self.current + 1) % self.slots.len();
        (self.current, std::mem::take(&mut self.slots[self.current]))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Vec::is_empty)
    }

    /// Queued vnode items (mount items excluded).
    #[must_use]
    pub fn pending_vnodes(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|item| matches!(item, SyncItem::Vnode { .. }))
            .count()
    }

    /// Slot holding the vnode item for `id`, if queued.
    #[must_use]
    pub fn slot_of(&self, id: VnodeId) -> Option<usize> {
        self.slots.iter().position(|items| {
            items
                .iter()
                .any(|item| matches!(item, SyncItem::Vnode { id: queued, .. } if *queued == id))
        })
    }
}

/// What one syncer tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncTick {
    pub slot: usize,
    pub visited: usize,
    /// Buffers written back.
    pub written: usize,
    pub requeued: usize,
    /// Vnode items whose lock was busy (re-queued with delay 1).
    pub busy: usize,
    /// Items dropped: stale incarnation, doomed vnode or unmounting mount.
    pub dropped: usize,
    /// Owed inactive calls completed by lazy sweeps.
    pub lazy_completed: usize,
}

enum VnodeSync {
    Written { written: usize, requeue: Option<u32> },
    Busy,
    Dropped,
}

impl VnodeCache {
    pub(crate) fn enqueue_sync(&self, item: SyncItem, delay: u32) -> usize {
        let id = match &item {
            SyncItem::Vnode { id, .. } => Some(id.0),
            SyncItem::Mount(_) => None,
        };
        let slot = self.syncer.lock().enqueue(item, delay);
        trace!(target: "vnc::syncer", vnode = id, delay, slot, "syncer_enqueue");
        slot
    }

    /// Advance the ring one slot and process what is there.
    pub fn syncer_tick(&self) -> SyncTick {
        let t = self.tunables.load();
        let (slot, items) = self.syncer.lock().advance();
        let mut tick = SyncTick {
            slot,
            ..SyncTick::default()
        };
        let mut requeue = Vec::new();
        for item in items {
            tick.visited += 1;
            match item {
                SyncItem::Vnode { vnode, id } => match self.sync_vnode(&vnode, id, &t) {
                    VnodeSync::Written { written, requeue: next } => {
                        tick.written += written;
                        if let Some(delay) = next {
                            requeue.push((SyncItem::Vnode { vnode, id }, delay));
                        }
                    }
                    VnodeSync::Busy => {
                        tick.busy += 1;
                        requeue.push((SyncItem::Vnode { vnode, id }, 1));
                    }
                    VnodeSync::Dropped => tick.dropped += 1,
                },
                SyncItem::Mount(mount) => {
                    if mount.is_unmounting() {
                        tick.dropped += 1;
                    } else {
                        tick.lazy_completed += self.lazy_sweep(&mount);
                        requeue.push((SyncItem::Mount(mount), t.meta_delay));
                    }
                }
            }
        }
        tick.requeued = requeue.len();
        if !requeue.is_empty() {
            let mut ring = self.syncer.lock();
            for (item, delay) in requeue {
                ring.enqueue(item, delay);
            }
        }
        trace!(
            target: "vnc::syncer",
            slot,
            visited = tick.visited,
            written = tick.written,
            requeued = tick.requeued,
            "syncer_tick"
        );
        tick
    }

    fn sync_vnode(&self, vp: &Arc<Vnode>, id: VnodeId, t: &Tunables) -> VnodeSync {
        if !self.try_hold(vp) {
            return VnodeSync::Dropped;
        }
        let outcome = self.sync_held(vp, id, t);
        self.drop_hold(vp);
        outcome
    }

    fn sync_held(&self, vp: &Vnode, id: VnodeId, t: &Tunables) -> VnodeSync {
        if vp.id() != id || vp.is_doomed() {
            return VnodeSync::Dropped;
        }
        let Some(mount) = vp.mount() else {
            return VnodeSync::Dropped;
        };
        let Some(lock) = vp.try_lock() else {
            return VnodeSync::Busy;
        };
        let report = vp
            .buffers()
            .sync_dirty(&OpsWriter(mount.ops()), t.flush_retries);
        drop(lock);
        if report.failed > 0 {
            warn!(
                target: "vnc::syncer",
                vnode = id.0,
                failed = report.failed,
                "syncer_write_failed"
            );
        }
        let requeue = vp
            .buffers()
            .settle_worklist()
            .then(|| t.delay_for(vp.vtype().sync_class()));
        VnodeSync::Written {
            written: report.written,
            requeue,
        }
    }

    /// Vnode items still queued.
    #[must_use]
    pub fn syncer_pending(&self) -> usize {
        self.syncer.lock().pending_vnodes()
    }

    /// Current ring position.
    #[must_use]
    pub fn syncer_current(&self) -> usize {
        self.syncer.lock().current()
    }

    #[must_use]
    pub fn syncer_slot_of(&self, id: VnodeId) -> Option<usize> {
        self.syncer.lock().slot_of(id)
    }
}

/// Syncer daemon body: tick every `syncer_tick`, then drain on shutdown.
pub(crate) fn run_syncer(cache: &VnodeCache) {
    info!(target: "vnc::syncer", slots = cache.config.syncer_slots, "syncer_start");
    loop {
        let tick = cache.tunables.load().syncer_tick();
        if cache.syncer_signal.wait(tick).shutdown {
            break;
        }
        cache.syncer_tick();
    }

    let bound = cache.config.syncer_shutdown_passes * cache.config.syncer_slots;
    let mut ticks = 0;
    while ticks < bound && cache.syncer_pending() > 0 {
        cache.syncer_tick();
        ticks += 1;
    }
    info!(
        target: "vnc::syncer",
        drain_ticks = ticks,
        remaining = cache.syncer_pending(),
        "syncer_stop"
    );
}
