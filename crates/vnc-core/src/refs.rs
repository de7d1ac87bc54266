//! Reference model: holds and uses.
//!
//! A *hold* keeps the memory valid and the identity stable; a *use* means the
//! vnode is actively used for file operations. Every use carries one implied
//! hold, so the hold count is always at least the use count.
//!
//! Both counters have a lock-free fast path for the common "not the last
//! reference" case. The last release of either runs under the interlock:
//!
//! - last hold on a live vnode: free-candidate, staged in a per-CPU batch
//!   for the list tail;
//! - last hold on a doomed vnode: the counter is frozen and the vnode goes
//!   back to the pool;
//! - last use: `on_close`, then inactive processing, either immediately
//!   (exclusive lock obtained within `inactive_lock_wait`) or deferred to the
//!   mount's lazy list.
//!
//! # Logging
//!
//! - **TRACE** `vnc::refs`: `hold_drop_fast`, `use_release_last`
//! - **DEBUG** `vnc::refs`: `inactive_deferred`, `inactive_done`,
//!   `vnode_abandoned`, `lazy_sweep`
//! - **WARN**  `vnc::refs`: `inactive_failed`

use crate::VnodeCache;
use crate::mount::Mount;
use crate::ops::InactiveOutcome;
use crate::refcount::Release;
use crate::stats::CacheCounters;
use crate::vnode::{Vnode, VnodeLock};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, trace, warn};
use vnc_error::{OrRaise, Result, VnError, Violation, ensure};
use vnc_types::{BlockRange, UpperEvent, VnodeState, VnodeType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InactiveMode {
    /// Try the exclusive lock for a bounded time, defer if that fails.
    Normal,
    /// Always leave the work to the lazy sweep.
    Deferred,
}

impl VnodeCache {
    /// Lock-free hold attempt. `false` when the counter is frozen.
    pub fn try_hold(&self, vp: &Vnode) -> bool {
        match vp.hold.try_acquire() {
            Some(0) => {
                CacheCounters::dec(&self.stats.free);
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Take a hold; fails with `Unavailable` once the vnode is on its way
    /// back to the pool.
    pub fn hold(&self, vp: &Vnode) -> Result<()> {
        if self.try_hold(vp) {
            Ok(())
        } else {
            Err(VnError::Unavailable { vnode: vp.id().0 })
        }
    }

    pub fn drop_hold(&self, vp: &Arc<Vnode>) {
        if vp.hold.release_if_not_last() {
            trace!(target: "vnc::refs", vnode = vp.id().0, "hold_drop_fast");
            return;
        }
        self.drop_hold_locked(vp);
    }

    fn drop_hold_locked(&self, vp: &Arc<Vnode>) {
        let id = vp.id();
        let mut inner = vp.interlock();
        match vp.hold.release() {
            Err(violation) => violation.on_vnode(id.0).raise(),
            Ok(Release::Remaining(left)) => {
                let uses = vp.use_count();
                ensure(left >= uses, "hold_below_use", || {
                    format!("{left} holds for {uses} uses")
                })
                .map_err(|v| v.on_vnode(id.0))
                .or_raise();
                return;
            }
            Ok(Release::Last) => {}
        }

        let uses = vp.use_count();
        ensure(uses == 0, "hold_below_use", || {
            format!("last hold dropped with {uses} uses")
        })
        .map_err(|v| v.on_vnode(id.0))
        .or_raise();

        if inner.state == VnodeState::Uninitialized && !vp.is_doomed() {
            // Acquired from the pool but never constructed.
            vp.set_doomed();
            vp.buffers().seal();
            inner.transition(VnodeState::Destroying, id).or_raise();
            inner.transition(VnodeState::Dead, id).or_raise();
            inner.vtype = VnodeType::Bad;
            vp.buffers().invalidate_range(BlockRange::all());
            vp.buffers().clear_worklist();
            debug!(target: "vnc::refs", vnode = id.0, "vnode_abandoned");
        }

        if !vp.is_doomed() {
            CacheCounters::bump(&self.stats.free);
            if self.batches.enqueue(vp, &self.list).is_some() {
                CacheCounters::bump(&self.stats.batch_flushes);
            }
            return;
        }

        // A racing try_hold wins the freeze; its drop will come back here.
        if vp.hold.freeze() {
            drop(inner);
            self.release_to_pool(vp);
        } else {
            CacheCounters::bump(&self.stats.free);
        }
    }

    /// Turn an outstanding hold into a use reference (the hold becomes the
    /// use's implied hold).
    pub fn acquire_use(&self, vp: &Arc<Vnode>) -> Result<()> {
        let id = vp.id();
        let mut inner = vp.interlock();
        // Hold first: uses cannot grow while the interlock is held.
        let holds = vp.hold_count();
        let uses = vp.use_count();
        ensure(holds > uses, "use_without_hold", || {
            format!("{holds} holds for {uses} uses")
        })
        .map_err(|v| v.on_vnode(id.0))
        .or_raise();
        if vp.is_doomed() {
            return Err(VnError::Unavailable { vnode: id.0 });
        }
        if vp.usecount.fetch_add(1, Ordering::AcqRel) == 0 {
            inner.owe_inactive = false;
            if std::mem::take(&mut inner.on_lazy) {
                if let Some(mount) = &inner.mount {
                    mount.remove_lazy(id);
                }
            }
        }
        Ok(())
    }

    /// Hold plus use in one step.
    pub fn add_use(&self, vp: &Arc<Vnode>) -> Result<()> {
        self.hold(vp)?;
        if let Err(err) = self.acquire_use(vp) {
            self.drop_hold(vp);
            return Err(err);
        }
        Ok(())
    }

    /// Drop a use reference and its implied hold.
    pub fn release_use(&self, vp: &Arc<Vnode>) {
        self.release_use_impl(vp, InactiveMode::Normal);
        self.drop_hold(vp);
    }

    /// Drop a use reference but keep its hold for the caller.
    pub fn release_use_keep_hold(&self, vp: &Arc<Vnode>) {
        self.release_use_impl(vp, InactiveMode::Normal);
    }

    /// Drop a use reference; inactive processing always goes to the lazy
    /// sweep.
    pub fn release_use_deferred(&self, vp: &Arc<Vnode>) {
        self.release_use_impl(vp, InactiveMode::Deferred);
        self.drop_hold(vp);
    }

    /// Back out a provisional hold after a failed lock acquisition.
    pub fn abort_hold(&self, vp: &Arc<Vnode>) {
        self.drop_hold(vp);
    }

    /// Back out a provisional use. Never waits on the exclusive lock, which
    /// the caller just failed to get.
    pub fn abort_use(&self, vp: &Arc<Vnode>) {
        self.release_use_deferred(vp);
    }

    fn release_use_impl(&self, vp: &Arc<Vnode>, mode: InactiveMode) {
        let fast = vp
            .usecount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > 1).then(|| n - 1)
            })
            .is_ok();
        if fast {
            return;
        }

        let id = vp.id();
        let inner = vp.interlock();
        match vp
            .usecount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(1) => {}
            Ok(_) => return,
            Err(_) => Violation::new("use_underflow", "release of a vnode with no uses")
                .on_vnode(id.0)
                .raise(),
        }
        if vp.is_doomed() || inner.state != VnodeState::Constructed {
            return;
        }
        let Some(mount) = inner.mount.clone() else {
            return;
        };
        drop(inner);

        trace!(target: "vnc::refs", vnode = id.0, ?mode, "use_release_last");
        mount.ops().on_close(id, true);
        mount.notify_upper(id, UpperEvent::Idle);

        if mode == InactiveMode::Deferred {
            self.defer_inactive(vp, &mount);
            return;
        }
        let wait = self.tunables.load().inactive_lock_wait();
        match vp.try_lock_for(wait) {
            Some(mut lock) => {
                self.inactive_locked(vp, &mut lock);
            }
            None => self.defer_inactive(vp, &mount),
        }
    }

    /// Run `on_inactive` with the exclusive lock held, if still due.
    /// Returns whether the callback ran.
    pub(crate) fn inactive_locked(&self, vp: &Vnode, lock: &mut VnodeLock<'_>) -> bool {
        let id = vp.id();
        let mount = {
            let mut inner = vp.interlock();
            if vp.is_doomed() || vp.use_count() > 0 || inner.state != VnodeState::Constructed {
                return false;
            }
            let Some(mount) = inner.mount.clone() else {
                return false;
            };
            inner.owe_inactive = false;
            if std::mem::take(&mut inner.on_lazy) {
                mount.remove_lazy(id);
            }
            mount
        };
        match mount.ops().on_inactive(lock) {
            Ok(InactiveOutcome::Keep) => {}
            Ok(InactiveOutcome::Doom) => self.doom(lock),
            Err(err) => {
                let err = err.in_callback("on_inactive");
                warn!(target: "vnc::refs", vnode = id.0, error = %err, "inactive_failed");
            }
        }
        debug!(target: "vnc::refs", vnode = id.0, "inactive_done");
        true
    }

    fn defer_inactive(&self, vp: &Arc<Vnode>, mount: &Arc<Mount>) {
        let mut inner = vp.interlock();
        if vp.is_doomed() || vp.use_count() > 0 {
            return;
        }
        inner.owe_inactive = true;
        if !inner.on_lazy {
            inner.on_lazy = true;
            mount.add_lazy(vp);
        }
        drop(inner);
        CacheCounters::bump(&self.stats.deferred_inactive);
        debug!(
            target: "vnc::refs",
            vnode = vp.id().0,
            mount = mount.id().0,
            "inactive_deferred"
        );
    }

    /// Complete owed inactive processing for the mount's lazy list. Vnodes
    /// whose lock is busy stay queued. Returns how many completed.
    pub fn lazy_sweep(&self, mount: &Arc<Mount>) -> usize {
        let mut completed = 0;
        for (id, vp) in mount.lazy_ids() {
            if !self.try_hold(&vp) {
                continue;
            }
            let owed = {
                let mut inner = vp.interlock();
                let owed = vp.id() == id
                    && !vp.is_doomed()
                    && inner.owe_inactive
                    && vp.use_count() == 0;
                if !owed {
                    if vp.id() == id {
                        inner.on_lazy = false;
                    }
                    mount.remove_lazy(id);
                }
                owed
            };
            if owed {
                if let Some(mut lock) = vp.try_lock() {
                    if self.inactive_locked(&vp, &mut lock) {
                        completed += 1;
                    }
                }
            }
            self.drop_hold(&vp);
        }
        if completed > 0 {
            debug!(target: "vnc::refs", mount = mount.id().0, completed, "lazy_sweep");
        }
        completed
    }
}
