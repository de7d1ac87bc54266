//! Object pool: physical vnode slots, incarnation ids and the soft limit.
//!
//! A physical slot is constructed once (buffer object allocated, slot linked
//! on the global list) and then reused many times: each reuse is a new
//! incarnation with a fresh [`VnodeId`]. Dead slots are cached for reuse
//! and only destroyed (unlinked, dropped) when [`VnodeCache::shrink`] trims
//! the pool back toward `desired_vnodes`.
//!
//! `acquire` never fails. Above the soft limit it first recycles an idle
//! vnode synchronously; if nothing is idle it stirs the reclaimer and sleeps
//! for at most `alloc_sleep_timeout`, then proceeds regardless.
//!
//! # Logging
//!
//! - **TRACE** `vnc::pool`: `vnode_acquire`, `vnode_release`, `vnode_lookup_stale`
//! - **DEBUG** `vnc::pool`: `slot_construct`, `slot_destroy`, `alloc_sleep`,
//!   `vnode_construct`, `vnode_construct_refused`

use crate::VnodeCache;
use crate::mount::Mount;
use crate::reclaim::ReclaimPlan;
use crate::stats::CacheCounters;
use crate::vnode::Vnode;
use parking_lot::{Condvar, Mutex, RwLock};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{debug, trace};
use vnc_error::{OrRaise, Result, Violation, ensure};
use vnc_types::{BlockRange, SlotIndex, UpperEvent, VnodeId, VnodeState, VnodeType};

const INDEX_SHARDS: usize = 16;

/// Route an id to an index shard (multiply, then xor-fold).
fn id_to_shard(id: VnodeId, shards: usize) -> usize {
    let mixed = id.0.wrapping_mul(0x517c_c1b7_2722_0a95);
    #[expect(clippy::cast_possible_truncation)] // intentional 64→32 fold
    let folded = (mixed ^ (mixed >> 32)) as u32;
    folded as usize % shards
}

/// Sharded `VnodeId -> SlotIndex` map for lookups.
#[derive(Debug)]
pub(crate) struct IdIndex {
    shards: Vec<RwLock<HashMap<VnodeId, SlotIndex>>>,
}

impl IdIndex {
    fn new() -> Self {
        Self {
            shards: (0..INDEX_SHARDS)
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
        }
    }

    fn shard(&self, id: VnodeId) -> &RwLock<HashMap<VnodeId, SlotIndex>> {
        &self.shards[id_to_shard(id, self.shards.len())]
    }

    fn insert(&self, id: VnodeId, slot: SlotIndex) {
        self.shard(id).write().insert(id, slot);
    }

    fn remove(&self, id: VnodeId, slot: SlotIndex) {
        let mut shard = self.shard(id).write();
        if shard.get(&id) == Some(&slot) {
            shard.remove(&id);
        }
    }

    fn get(&self, id: VnodeId) -> Option<SlotIndex> {
        self.shard(id).read().get(&id).copied()
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }
}

#[derive(Debug)]
pub(crate) struct Pool {
    slots: RwLock<Vec<Option<Arc<Vnode>>>>,
    /// Constructed slots whose vnode is dead and frozen, ready for reuse.
    dead: Mutex<Vec<SlotIndex>>,
    /// Destroyed slot indices available to the construction hook.
    retired: Mutex<Vec<SlotIndex>>,
    physical: AtomicUsize,
    index: IdIndex,
    next_id: AtomicU64,
    alloc_gate: Mutex<()>,
    alloc_cv: Condvar,
}

impl Pool {
    pub(crate) fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            dead: Mutex::new(Vec::new()),
            retired: Mutex::new(Vec::new()),
            physical: AtomicUsize::new(0),
            index: IdIndex::new(),
            next_id: AtomicU64::new(1),
            alloc_gate: Mutex::new(()),
            alloc_cv: Condvar::new(),
        }
    }

    pub(crate) fn slot(&self, slot: SlotIndex) -> Option<Arc<Vnode>> {
        self.slots.read().get(slot.as_usize()).cloned().flatten()
    }

    fn wake_allocators(&self) {
        let _gate = self.alloc_gate.lock();
        self.alloc_cv.notify_all();
    }
}

impl VnodeCache {
    /// Hand out a vnode: `Uninitialized`, one use reference and its implied
    /// hold. Blocks for at most `alloc_sleep_timeout` when over the limit.
    pub fn acquire(&self, owner_hint: Option<&Arc<Mount>>) -> Arc<Vnode> {
        let t = self.tunables.load();
        if self.stats.live() >= t.desired_vnodes
            && self.free_some(1) == 0
            && self.stats.live() >= t.desired_vnodes
        {
            self.wait_for_capacity(t.desired_vnodes, t.alloc_sleep_timeout());
        }

        let live = self.stats.live.fetch_add(1, Ordering::Relaxed) + 1;
        if ReclaimPlan::compute(live, &t).is_some() {
            self.reclaim_signal.kick();
        }

        let id = VnodeId(self.pool.next_id.fetch_add(1, Ordering::Relaxed));
        let reused = self.pool.dead.lock().pop();
        let vp = match reused.and_then(|slot| self.pool.slot(slot)) {
            Some(vp) => vp,
            None => self.construct_slot().or_raise(),
        };
        vp.reinit(id).or_raise();
        trace!(
            target: "vnc::pool",
            vnode = id.0,
            slot = vp.slot().0,
            reused = reused.is_some(),
            mount = owner_hint.map(|m| m.id().0),
            live,
            "vnode_acquire"
        );
        vp
    }

    fn wait_for_capacity(&self, desired: u64, timeout: std::time::Duration) {
        self.reclaim_signal.stir();
        let start = Instant::now();
        let deadline = start + timeout;
        let mut gate = self.pool.alloc_gate.lock();
        while self.stats.live() >= desired {
            if self.pool.alloc_cv.wait_until(&mut gate, deadline).timed_out() {
                break;
            }
        }
        drop(gate);
        CacheCounters::bump(&self.stats.alloc_sleeps);
        debug!(
            target: "vnc::pool",
            waited_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            live = self.stats.live(),
            desired,
            "alloc_sleep"
        );
    }

    /// Construction hook: a brand-new physical slot, linked at the list head.
    fn construct_slot(&self) -> std::result::Result<Arc<Vnode>, Violation> {
        let mut slots = self.pool.slots.write();
        let index = match self.pool.retired.lock().pop() {
            Some(slot) => slot,
            None => {
                let next = u32::try_from(slots.len())
                    .map_err(|_| Violation::new("pool_exhausted", "slot index overflow"))?;
                slots.push(None);
                SlotIndex(next)
            }
        };
        let vp = Arc::new(Vnode::new(index));
        slots[index.as_usize()] = Some(Arc::clone(&vp));
        drop(slots);
        self.pool.physical.fetch_add(1, Ordering::Relaxed);
        self.list.lock().insert_front(index);
        debug!(target: "vnc::pool", slot = index.0, "slot_construct");
        Ok(vp)
    }

    /// Return a dead, frozen vnode to the pool. Reached from the last
    /// `drop_hold` of a doomed vnode.
    pub(crate) fn release_to_pool(&self, vp: &Arc<Vnode>) {
        let id = vp.id();
        {
            let inner = vp.interlock();
            ensure(inner.state == VnodeState::Dead, "release_not_dead", || {
                format!("state {}", inner.state)
            })
            .and_then(|()| {
                ensure(inner.mount.is_none(), "dead_has_mount", || {
                    "owning mount still set".to_owned()
                })
            })
            .and_then(|()| {
                ensure(vp.buffers().is_empty(), "dead_has_buffers", || {
                    format!(
                        "{} clean, {} dirty",
                        vp.buffers().clean_count(),
                        vp.buffers().dirty_count()
                    )
                })
            })
            .and_then(|()| {
                ensure(vp.hold.is_frozen(), "release_unfrozen", || {
                    format!("hold {:?}", vp.hold_state())
                })
            })
            .map_err(|v| v.on_vnode(id.0))
            .or_raise();
        }
        self.batches.dequeue(vp);
        self.pool.index.remove(id, vp.slot());
        vp.buffers().set_owner(None);
        self.pool.dead.lock().push(vp.slot());
        CacheCounters::dec(&self.stats.live);
        self.pool.wake_allocators();
        trace!(target: "vnc::pool", vnode = id.0, slot = vp.slot().0, "vnode_release");
    }

    /// Attach an acquired vnode to its filesystem: `Uninitialized ->
    /// Constructed`, mount membership, optional private data.
    ///
    /// If the mount is unmounting the vnode is doomed, the caller's use
    /// reference is consumed and `Busy` is returned.
    pub fn construct(
        &self,
        vp: &Arc<Vnode>,
        mount: &Arc<Mount>,
        vtype: VnodeType,
        private: Option<Box<dyn Any + Send>>,
    ) -> Result<()> {
        let id = vp.id();
        let mut lock = vp.lock();
        let mut inner = vp.interlock();
        ensure(
            inner.state == VnodeState::Uninitialized && !vp.is_doomed(),
            "construct_state",
            || format!("construct in state {}", inner.state),
        )
        .and_then(|()| {
            ensure(vtype.is_reclaimable(), "construct_type", || {
                format!("cannot construct as {vtype}")
            })
        })
        .map_err(|v| v.on_vnode(id.0))
        .or_raise();

        if let Err(err) = mount.insert_member(vp) {
            vp.set_doomed();
            vp.buffers().seal();
            inner.transition(VnodeState::Destroying, id).or_raise();
            inner.transition(VnodeState::Dead, id).or_raise();
            inner.vtype = VnodeType::Bad;
            drop(inner);
            drop(lock);
            vp.buffers().invalidate_range(BlockRange::all());
            vp.buffers().clear_worklist();
            debug!(
                target: "vnc::pool",
                vnode = id.0,
                mount = mount.id().0,
                "vnode_construct_refused"
            );
            self.release_use(vp);
            return Err(err);
        }

        inner.vtype = vtype;
        inner.mount = Some(Arc::clone(mount));
        inner.transition(VnodeState::Constructed, id).or_raise();
        drop(inner);
        if let Some(private) = private {
            lock.set_private(private);
        }
        drop(lock);

        self.pool.index.insert(id, vp.slot());
        mount.notify_upper(id, UpperEvent::Exists);
        debug!(
            target: "vnc::pool",
            vnode = id.0,
            mount = mount.id().0,
            %vtype,
            "vnode_construct"
        );
        Ok(())
    }

    /// Find a live incarnation by id and return it held.
    ///
    /// `None` covers every "no longer valid" case: unknown id, slot reused by
    /// a newer incarnation, doomed, or frozen on its way back to the pool.
    pub fn lookup(&self, id: VnodeId) -> Option<Arc<Vnode>> {
        let slot = self.pool.index.get(id)?;
        let vp = self.pool.slot(slot)?;
        let seq = vp.seqc().read_begin()?;
        if !self.try_hold(&vp) {
            return None;
        }
        if vp.id() != id || vp.is_doomed() || !vp.seqc().validate(seq) {
            trace!(target: "vnc::pool", vnode = id.0, slot = slot.0, "vnode_lookup_stale");
            self.drop_hold(&vp);
            return None;
        }
        Some(vp)
    }

    /// Destruction hook over cached dead slots: unlink and drop them until
    /// the physical pool is no larger than `desired_vnodes`.
    pub fn shrink(&self) -> usize {
        let desired = usize::try_from(self.tunables.load().desired_vnodes).unwrap_or(usize::MAX);
        let mut destroyed = 0;
        while self.pool.physical.load(Ordering::Relaxed) > desired {
            let Some(slot) = self.pool.dead.lock().pop() else {
                break;
            };
            self.list.lock().remove(slot);
            if let Some(entry) = self.pool.slots.write().get_mut(slot.as_usize()) {
                *entry = None;
            }
            self.pool.retired.lock().push(slot);
            self.pool.physical.fetch_sub(1, Ordering::Relaxed);
            destroyed += 1;
            debug!(target: "vnc::pool", slot = slot.0, "slot_destroy");
        }
        destroyed
    }

    /// Physical slots currently constructed (live plus cached dead).
    #[must_use]
    pub fn physical_slots(&self) -> usize {
        self.pool.physical.load(Ordering::Relaxed)
    }

    /// Dead slots cached for reuse.
    #[must_use]
    pub fn cached_dead_slots(&self) -> usize {
        self.pool.dead.lock().len()
    }

    /// Constructed incarnations reachable through [`lookup`](Self::lookup).
    #[must_use]
    pub fn indexed_vnodes(&self) -> usize {
        self.pool.index.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_routing_is_stable_and_in_range() {
        for raw in [0_u64, 1, 2, 1 << 40, u64::MAX] {
            let shard = id_to_shard(VnodeId(raw), INDEX_SHARDS);
            assert!(shard < INDEX_SHARDS);
            assert_eq!(shard, id_to_shard(VnodeId(raw), INDEX_SHARDS));
        }
    }

    #[test]
    fn index_remove_ignores_other_slot() {
        let index = IdIndex::new();
        index.insert(VnodeId(5), SlotIndex(1));
        index.remove(VnodeId(5), SlotIndex(2));
        assert_eq!(index.get(VnodeId(5)), Some(SlotIndex(1)));
        index.remove(VnodeId(5), SlotIndex(1));
        assert_eq!(index.get(VnodeId(5)), None);
        assert_eq!(index.len(), 0);
    }
}
