//! Mounted filesystem instance as seen by the cache.
//!
//! A mount owns its member list and its lazy list (vnodes with deferred
//! inactive work), a busy count independent of vnode lifetimes, the
//! write-suspension flag the reclaimer honors, and the stacked layers that
//! want vnode events. Mount locks nest inside a vnode's interlock.

use crate::ops::{UpperLayer, VnodeOps};
use crate::vnode::Vnode;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::trace;
use vnc_error::{Result, VnError};
use vnc_types::{MountId, UpperEvent, VnodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnmountState {
    Mounted,
    Unmounting,
    /// Force unmount: buffers that cannot be written are discarded.
    Forced,
}

#[derive(Default)]
struct MountLists {
    members: BTreeMap<VnodeId, Arc<Vnode>>,
    lazy: BTreeMap<VnodeId, Arc<Vnode>>,
}

pub struct Mount {
    id: MountId,
    name: String,
    ops: Arc<dyn VnodeOps>,
    lists: Mutex<MountLists>,
    unmount: Mutex<UnmountState>,
    busy: AtomicU32,
    write_suspended: AtomicBool,
    upper: RwLock<Vec<Arc<dyn UpperLayer>>>,
}

impl fmt::Debug for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mount")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.unmount_state())
            .field("busy", &self.busy_count())
            .finish_non_exhaustive()
    }
}

impl Mount {
    pub fn new(id: MountId, name: impl Into<String>, ops: Arc<dyn VnodeOps>) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.into(),
            ops,
            lists: Mutex::new(MountLists::default()),
            unmount: Mutex::new(UnmountState::Mounted),
            busy: AtomicU32::new(0),
            write_suspended: AtomicBool::new(false),
            upper: RwLock::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn id(&self) -> MountId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn ops(&self) -> &dyn VnodeOps {
        self.ops.as_ref()
    }

    // ── Busy count (ref/unref) ─────────────────────────────────────────

    /// Take a reference on the mount itself. Returns the new count.
    pub fn busy(&self) -> u32 {
        self.busy.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn unbusy(&self) -> Result<u32> {
        self.busy
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map(|prev| prev - 1)
            .map_err(|_| VnError::Busy(format!("mount {} is not busy", self.id)))
    }

    #[must_use]
    pub fn busy_count(&self) -> u32 {
        self.busy.load(Ordering::Acquire)
    }

    // ── Write suspension ───────────────────────────────────────────────

    pub fn set_write_suspended(&self, suspended: bool) {
        self.write_suspended.store(suspended, Ordering::Release);
    }

    #[must_use]
    pub fn is_write_suspended(&self) -> bool {
        self.write_suspended.load(Ordering::Acquire)
    }

    // ── Unmount state ──────────────────────────────────────────────────

    #[must_use]
    pub fn unmount_state(&self) -> UnmountState {
        *self.unmount.lock()
    }

    #[must_use]
    pub fn is_unmounting(&self) -> bool {
        self.unmount_state() != UnmountState::Mounted
    }

    pub(crate) fn set_unmount_state(&self, state: UnmountState) {
        *self.unmount.lock() = state;
    }

    // ── Member and lazy lists ──────────────────────────────────────────

    /// Join the member list; refused once unmount has started.
    pub(crate) fn insert_member(&self, vp: &Arc<Vnode>) -> Result<()> {
        let state = self.unmount.lock();
        if *state != UnmountState::Mounted {
            return Err(VnError::Busy(format!("mount {} is unmounting", self.name)));
        }
        self.lists.lock().members.insert(vp.id(), Arc::clone(vp));
        drop(state);
        Ok(())
    }

    pub(crate) fn remove_member(&self, id: VnodeId) -> bool {
        let mut lists = self.lists.lock();
        lists.lazy.remove(&id);
        lists.members.remove(&id).is_some()
    }

    pub(crate) fn add_lazy(&self, vp: &Arc<Vnode>) {
        self.lists.lock().lazy.insert(vp.id(), Arc::clone(vp));
    }

    pub(crate) fn remove_lazy(&self, id: VnodeId) -> bool {
        self.lists.lock().lazy.remove(&id).is_some()
    }

    /// Snapshot of the member list, in id order.
    #[must_use]
    pub fn members(&self) -> Vec<Arc<Vnode>> {
        self.lists.lock().members.values().cloned().collect()
    }

    pub(crate) fn member_ids(&self) -> Vec<(VnodeId, Arc<Vnode>)> {
        self.lists
            .lock()
            .members
            .iter()
            .map(|(id, vp)| (*id, Arc::clone(vp)))
            .collect()
    }

    pub(crate) fn lazy_ids(&self) -> Vec<(VnodeId, Arc<Vnode>)> {
        self.lists
            .lock()
            .lazy
            .iter()
            .map(|(id, vp)| (*id, Arc::clone(vp)))
            .collect()
    }

    #[must_use]
    pub fn member_count(&self) -> usize {
        self.lists.lock().members.len()
    }

    #[must_use]
    pub fn lazy_count(&self) -> usize {
        self.lists.lock().lazy.len()
    }

    // ── Stacked layers ─────────────────────────────────────────────────

    pub fn register_upper(&self, layer: Arc<dyn UpperLayer>) {
        self.upper.write().push(layer);
    }

    /// Propagate a vnode event to every stacked layer.
    pub fn notify_upper(&self, vnode: VnodeId, event: UpperEvent) {
        let layers = self.upper.read();
        if layers.is_empty() {
            return;
        }
        trace!(
            target: "vnc::lifecycle",
            mount = self.id.0,
            vnode = vnode.0,
            ?event,
            listeners = layers.len(),
            "upper_notify"
        );
        for layer in layers.iter() {
            layer.notify(self.id, vnode, event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vnc_types::LogicalBlock;

    struct NullOps;

    impl VnodeOps for NullOps {
        fn write_buffer(&self, _: VnodeId, _: LogicalBlock, _: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(VnodeId, UpperEvent)>>);

    impl UpperLayer for Recorder {
        fn notify(&self, _mount: MountId, vnode: VnodeId, event: UpperEvent) {
            self.0.lock().push((vnode, event));
        }
    }

    #[test]
    fn busy_counts_balance() {
        let mp = Mount::new(MountId(1), "m", Arc::new(NullOps));
        assert_eq!(mp.busy(), 1);
        assert_eq!(mp.busy(), 2);
        assert_eq!(mp.unbusy().expect("unbusy"), 1);
        assert_eq!(mp.unbusy().expect("unbusy"), 0);
        assert!(mp.unbusy().is_err());
    }

    #[test]
    fn unmounting_mount_refuses_members() {
        let mp = Mount::new(MountId(1), "m", Arc::new(NullOps));
        let vp = Arc::new(Vnode::new(vnc_types::SlotIndex(0)));
        vp.reinit(VnodeId(4)).expect("reinit");
        mp.insert_member(&vp).expect("mounted");
        assert_eq!(mp.member_count(), 1);

        mp.set_unmount_state(UnmountState::Forced);
        assert!(matches!(mp.insert_member(&vp), Err(VnError::Busy(_))));
        assert!(mp.remove_member(VnodeId(4)));
        assert!(!mp.remove_member(VnodeId(4)));
    }

    #[test]
    fn upper_layers_receive_events_in_order() {
        let mp = Mount::new(MountId(2), "lower", Arc::new(NullOps));
        let rec = Arc::new(Recorder::default());
        mp.register_upper(Arc::clone(&rec) as Arc<dyn UpperLayer>);
        mp.notify_upper(VnodeId(7), UpperEvent::Reclaim);
        mp.notify_upper(VnodeId(7), UpperEvent::Destroyed);
        assert_eq!(
            *rec.0.lock(),
            vec![
                (VnodeId(7), UpperEvent::Reclaim),
                (VnodeId(7), UpperEvent::Destroyed)
            ]
        );
    }
}
