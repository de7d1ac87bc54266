//! The vnode object.
//!
//! Field ownership:
//!
//! | Field | Protected by |
//! |-------|--------------|
//! | `hold`, `usecount`, `doomed`, `id` | atomics (lock-free readers) |
//! | type, state, mount, lazy/owed flags, name-cache refs | interlock |
//! | filesystem-private data | exclusive lock ([`VnodeLock`]) |
//! | buffer sets | the buffer object's own locks |
//! | `batch_tag` | the owning batch shard's lock |
//!
//! `doomed` is written only under the interlock but mirrored in an atomic so
//! scanners can filter without taking it.

use crate::mount::Mount;
use crate::refcount::{HoldCount, HoldState};
use crate::seqc::SeqCounter;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use vnc_buf::BufferObject;
use vnc_error::{Violation, ensure};
use vnc_types::{MountId, SlotIndex, VnodeId, VnodeState, VnodeType};

/// Filesystem-private payload attached to a vnode.
pub type Private = Option<Box<dyn Any + Send>>;

pub(crate) const NO_BATCH: usize = usize::MAX;

#[derive(Debug)]
pub(crate) struct VnodeInner {
    pub(crate) vtype: VnodeType,
    pub(crate) state: VnodeState,
    pub(crate) mount: Option<Arc<Mount>>,
    pub(crate) owe_inactive: bool,
    pub(crate) on_lazy: bool,
    pub(crate) namecache_refs: u32,
}

impl VnodeInner {
    pub(crate) fn transition(&mut self, next: VnodeState, id: VnodeId) -> Result<(), Violation> {
        ensure(self.state.can_transition_to(next), "state_transition", || {
            format!("{} -> {next}", self.state)
        })
        .map_err(|v| v.on_vnode(id.0))?;
        self.state = next;
        Ok(())
    }
}

pub struct Vnode {
    slot: SlotIndex,
    id: AtomicU64,
    pub(crate) hold: HoldCount,
    pub(crate) usecount: AtomicU32,
    seqc: SeqCounter,
    doomed: AtomicBool,
    batch_tag: AtomicUsize,
    lock: Mutex<Private>,
    interlock: Mutex<VnodeInner>,
    bufobj: BufferObject,
}

impl fmt::Debug for Vnode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vnode")
            .field("id", &self.id())
            .field("slot", &self.slot)
            .field("hold", &self.hold.state())
            .field("uses", &self.use_count())
            .field("doomed", &self.is_doomed())
            .finish_non_exhaustive()
    }
}

impl Vnode {
    /// A fresh physical slot: dead, frozen, owned by nobody.
    pub(crate) fn new(slot: SlotIndex) -> Self {
        Self {
            slot,
            id: AtomicU64::new(0),
            hold: HoldCount::frozen(),
            usecount: AtomicU32::new(0),
            seqc: SeqCounter::new(),
            doomed: AtomicBool::new(false),
            batch_tag: AtomicUsize::new(NO_BATCH),
            lock: Mutex::new(None),
            interlock: Mutex::new(VnodeInner {
                vtype: VnodeType::None,
                state: VnodeState::Dead,
                mount: None,
                owe_inactive: false,
                on_lazy: false,
                namecache_refs: 0,
            }),
            bufobj: BufferObject::new(),
        }
    }

    /// Hand a dead slot out again as incarnation `id` with one use reference
    /// and its implied hold.
    pub(crate) fn reinit(&self, id: VnodeId) -> Result<(), Violation> {
        let mut inner = self.interlock.lock();
        inner.transition(VnodeState::Uninitialized, id)?;
        ensure(self.bufobj.is_empty(), "reuse_with_buffers", || {
            format!(
                "{} clean, {} dirty",
                self.bufobj.clean_count(),
                self.bufobj.dirty_count()
            )
        })
        .map_err(|v| v.on_vnode(id.0))?;
        ensure(!self.bufobj.on_worklist(), "reuse_on_worklist", || {
            "previous incarnation left the syncer worklist flag set".to_owned()
        })
        .map_err(|v| v.on_vnode(id.0))?;
        inner.vtype = VnodeType::None;
        inner.mount = None;
        inner.owe_inactive = false;
        inner.on_lazy = false;
        inner.namecache_refs = 0;
        self.doomed.store(false, Ordering::Release);
        self.id.store(id.0, Ordering::Release);
        self.bufobj.set_owner(Some(id));
        self.usecount.store(1, Ordering::Release);
        self.hold.thaw(1).map_err(|v| v.on_vnode(id.0))?;
        Ok(())
    }

    #[must_use]
    pub fn id(&self) -> VnodeId {
        VnodeId(self.id.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn slot(&self) -> SlotIndex {
        self.slot
    }

    #[must_use]
    pub fn hold_count(&self) -> u32 {
        self.hold.count()
    }

    #[must_use]
    pub fn hold_state(&self) -> HoldState {
        self.hold.state()
    }

    #[must_use]
    pub fn use_count(&self) -> u32 {
        self.usecount.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_doomed(&self) -> bool {
        self.doomed.load(Ordering::Acquire)
    }

    pub(crate) fn set_doomed(&self) {
        self.doomed.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn vtype(&self) -> VnodeType {
        self.interlock.lock().vtype
    }

    #[must_use]
    pub fn state(&self) -> VnodeState {
        self.interlock.lock().state
    }

    #[must_use]
    pub fn mount(&self) -> Option<Arc<Mount>> {
        self.interlock.lock().mount.clone()
    }

    #[must_use]
    pub fn owes_inactive(&self) -> bool {
        self.interlock.lock().owe_inactive
    }

    #[must_use]
    pub fn on_lazy_list(&self) -> bool {
        self.interlock.lock().on_lazy
    }

    #[must_use]
    pub fn namecache_refs(&self) -> u32 {
        self.interlock.lock().namecache_refs
    }

    #[must_use]
    pub fn buffers(&self) -> &BufferObject {
        &self.bufobj
    }

    #[must_use]
    pub fn seqc(&self) -> &SeqCounter {
        &self.seqc
    }

    pub(crate) fn interlock(&self) -> MutexGuard<'_, VnodeInner> {
        self.interlock.lock()
    }

    pub(crate) fn batch_tag(&self) -> Option<usize> {
        match self.batch_tag.load(Ordering::Acquire) {
            NO_BATCH => None,
            shard => Some(shard),
        }
    }

    /// Only called with the batch shard lock held.
    pub(crate) fn set_batch_tag(&self, shard: Option<usize>) {
        self.batch_tag
            .store(shard.unwrap_or(NO_BATCH), Ordering::Release);
    }

    /// Take the exclusive lock, blocking.
    pub fn lock(&self) -> VnodeLock<'_> {
        VnodeLock {
            vnode: self,
            guard: self.lock.lock(),
        }
    }

    pub fn try_lock(&self) -> Option<VnodeLock<'_>> {
        self.lock.try_lock().map(|guard| VnodeLock { vnode: self, guard })
    }

    pub fn try_lock_for(&self, wait: Duration) -> Option<VnodeLock<'_>> {
        self.lock
            .try_lock_for(wait)
            .map(|guard| VnodeLock { vnode: self, guard })
    }

    /// Consistent view of the vnode, for reports and tests.
    #[must_use]
    pub fn info(&self) -> VnodeInfo {
        let inner = self.interlock.lock();
        VnodeInfo {
            id: self.id(),
            slot: self.slot,
            vtype: inner.vtype,
            state: inner.state,
            hold: self.hold_count(),
            frozen: self.hold.is_frozen(),
            uses: self.use_count(),
            doomed: self.is_doomed(),
            mount: inner.mount.as_ref().map(|m| m.id()),
            owe_inactive: inner.owe_inactive,
            on_lazy: inner.on_lazy,
            namecache_refs: inner.namecache_refs,
            clean_buffers: self.bufobj.clean_count(),
            dirty_buffers: self.bufobj.dirty_count(),
        }
    }
}

/// Point-in-time copy of a vnode's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VnodeInfo {
    pub id: VnodeId,
    pub slot: SlotIndex,
    pub vtype: VnodeType,
    pub state: VnodeState,
    pub hold: u32,
    pub frozen: bool,
    pub uses: u32,
    pub doomed: bool,
    pub mount: Option<MountId>,
    pub owe_inactive: bool,
    pub on_lazy: bool,
    pub namecache_refs: u32,
    pub clean_buffers: usize,
    pub dirty_buffers: usize,
}

/// Proof that the vnode's exclusive lock is held.
///
/// Doom and the `on_inactive`/`on_reclaim` callbacks take `&mut VnodeLock`,
/// so they cannot be reached without it.
pub struct VnodeLock<'a> {
    vnode: &'a Vnode,
    guard: MutexGuard<'a, Private>,
}

impl fmt::Debug for VnodeLock<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VnodeLock")
            .field("vnode", &self.vnode.id())
            .field("has_private", &self.guard.is_some())
            .finish()
    }
}

impl<'a> VnodeLock<'a> {
    #[must_use]
    pub fn vnode(&self) -> &'a Vnode {
        self.vnode
    }

    #[must_use]
    pub fn private<T: Any>(&self) -> Option<&T> {
        self.guard.as_ref().and_then(|p| p.downcast_ref::<T>())
    }

    pub fn private_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.guard.as_mut().and_then(|p| p.downcast_mut::<T>())
    }

    pub fn set_private(&mut self, private: Box<dyn Any + Send>) {
        *self.guard = Some(private);
    }

    pub fn take_private(&mut self) -> Private {
        self.guard.take()
    }

    #[must_use]
    pub fn has_private(&self) -> bool {
        self.guard.is_some()
    }
}
