//! Lifecycle state machine: doom, explicit destroy, unmount.
//!
//! ```text
//! Uninitialized ──construct──▶ Constructed ──doom──▶ Destroying ──▶ Dead
//!       ▲                                                            │
//!       └──────────────────── pool reuse ◀───────────────────────────┘
//! ```
//!
//! Doom runs entirely under the vnode's exclusive lock and inside a
//! sequence-counter write section, so lock-free lookups either see the vnode
//! before it was doomed or fail validation. It is irreversible and
//! idempotent: a second doom of the same incarnation does nothing.
//!
//! Dirty data is written back before the filesystem releases its private
//! state. The buffer object is sealed first, so writers racing the doom get
//! `Unavailable` instead of leaving data behind the flush. Discarding dirty buffers is reserved for ownerless vnodes and
//! force unmount, and is counted in `lost_writes`.
//!
//! # Logging
//!
//! - **TRACE** `vnc::lifecycle`: `doom_repeat`
//! - **DEBUG** `vnc::lifecycle`: `vnode_doom`, `vnode_dead`
//! - **INFO**  `vnc::lifecycle`: `unmount_start`, `unmount_done`
//! - **WARN**  `vnc::lifecycle`: `ownerless_discard`, `inactive_failed`
//! - **ERROR** `vnc::lifecycle`: `reclaim_writeback_failed`

use crate::VnodeCache;
use crate::mount::{Mount, UnmountState};
use crate::ops::OpsWriter;
use crate::stats::CacheCounters;
use crate::vnode::{Vnode, VnodeLock};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, trace, warn};
use vnc_buf::{FlushMode, FlushPolicy};
use vnc_error::{OrRaise, Result, VnError, Violation, ensure};
use vnc_types::{BlockRange, UpperEvent, VnodeState, VnodeType};

impl VnodeCache {
    /// Doom the locked vnode: tear down its filesystem association and take
    /// it to `Dead`. The caller must hold a reference.
    pub fn doom(&self, lock: &mut VnodeLock<'_>) {
        let vp = lock.vnode();
        let id = vp.id();
        ensure(vp.hold_count() > 0, "doom_without_hold", || {
            format!("state {}", vp.state())
        })
        .map_err(|v| v.on_vnode(id.0))
        .or_raise();

        let (mount, active, owed) = {
            let mut inner = vp.interlock();
            if vp.is_doomed() {
                trace!(target: "vnc::lifecycle", vnode = id.0, "doom_repeat");
                return;
            }
            vp.seqc().write_begin();
            inner.transition(VnodeState::Destroying, id).or_raise();
            vp.set_doomed();
            vp.buffers().seal();
            let owed = std::mem::take(&mut inner.owe_inactive);
            if std::mem::take(&mut inner.on_lazy) {
                if let Some(mount) = &inner.mount {
                    mount.remove_lazy(id);
                }
            }
            (inner.mount.clone(), vp.use_count() > 0, owed)
        };
        debug!(
            target: "vnc::lifecycle",
            vnode = id.0,
            mount = mount.as_ref().map(|m| m.id().0),
            active,
            owed,
            "vnode_doom"
        );

        if let Some(mount) = &mount {
            mount.notify_upper(id, UpperEvent::Reclaim);
            if active {
                mount.ops().on_close(id, false);
            }
            if active || owed {
                if let Err(err) = mount.ops().on_inactive(lock) {
                    let err = err.in_callback("on_inactive");
                    warn!(target: "vnc::lifecycle", vnode = id.0, error = %err, "inactive_failed");
                }
            }
        }

        self.flush_for_reclaim(vp, mount.as_deref());
        vp.buffers().clear_worklist();

        if let Some(mount) = &mount {
            if let Err(err) = mount.ops().on_reclaim(lock) {
                Violation::new("reclaim_failed", err.in_callback("on_reclaim").to_string())
                    .on_vnode(id.0)
                    .raise();
            }
        }
        drop(lock.take_private());

        let refs = std::mem::take(&mut vp.interlock().namecache_refs);
        if let Some(mount) = &mount {
            if refs > 0 {
                mount.ops().purge_namecache(id, refs);
            }
            mount.remove_member(id);
        }

        {
            let mut inner = vp.interlock();
            inner.mount = None;
            inner.vtype = VnodeType::Bad;
            inner.transition(VnodeState::Dead, id).or_raise();
        }
        vp.seqc().write_end();

        ensure(vp.buffers().is_empty(), "dead_has_buffers", || {
            format!(
                "{} clean, {} dirty",
                vp.buffers().clean_count(),
                vp.buffers().dirty_count()
            )
        })
        .map_err(|v| v.on_vnode(id.0))
        .or_raise();

        if let Some(mount) = &mount {
            mount.notify_upper(id, UpperEvent::Destroyed);
        }
        debug!(target: "vnc::lifecycle", vnode = id.0, "vnode_dead");
    }

    fn flush_for_reclaim(&self, vp: &Vnode, mount: Option<&Mount>) {
        let id = vp.id();
        let Some(mount) = mount else {
            let dirty = vp.buffers().dirty_count();
            vp.buffers().invalidate_range(BlockRange::all());
            if dirty > 0 {
                CacheCounters::add(&self.stats.lost_writes, dirty as u64);
                warn!(target: "vnc::lifecycle", vnode = id.0, dirty, "ownerless_discard");
            }
            return;
        };

        let retries = self.tunables.load().flush_retries;
        let policy = if mount.unmount_state() == UnmountState::Forced {
            FlushPolicy::forced(retries)
        } else {
            FlushPolicy::normal(retries)
        };
        match vp
            .buffers()
            .flush_all(FlushMode::WriteBack, &OpsWriter(mount.ops()), policy)
        {
            Ok(report) => {
                CacheCounters::add(&self.stats.lost_writes, report.lost as u64);
            }
            Err(err) => {
                let dirty = vp.buffers().dirty_count();
                error!(
                    target: "vnc::lifecycle",
                    vnode = id.0,
                    mount = mount.id().0,
                    dirty,
                    error = %err,
                    "reclaim_writeback_failed"
                );
                vp.buffers().invalidate_range(BlockRange::all());
                CacheCounters::add(&self.stats.lost_writes, dirty as u64);
            }
        }
    }

    /// Destroy a vnode without losing data: on a normally mounted
    /// filesystem dirty buffers are written back first, and a write-back
    /// failure leaves the vnode intact.
    pub fn destroy(&self, lock: &mut VnodeLock<'_>) -> Result<()> {
        let vp = lock.vnode();
        if let Some(mount) = vp.mount() {
            if mount.unmount_state() != UnmountState::Forced && vp.buffers().dirty_count() > 0 {
                let retries = self.tunables.load().flush_retries;
                let report = vp.buffers().sync_dirty(&OpsWriter(mount.ops()), retries);
                if report.failed > 0 {
                    let block = vp.buffers().dirty_blocks().first().map_or(0, |b| b.0);
                    return Err(VnError::WriteBack {
                        vnode: vp.id().0,
                        block,
                        detail: format!("{} dirty buffers could not be written", report.failed),
                    });
                }
            }
        }
        self.doom(lock);
        Ok(())
    }

    /// Detach a mount: destroy (or, forced, doom) every member vnode.
    ///
    /// A non-forced unmount fails with `Busy` while any member is in use,
    /// and with the write-back error if a member's dirty data cannot be
    /// written; either way the mount stays mounted.
    pub fn unmount(&self, mount: &Arc<Mount>, force: bool) -> Result<()> {
        info!(
            target: "vnc::lifecycle",
            mount = mount.id().0,
            name = mount.name(),
            force,
            members = mount.member_count(),
            "unmount_start"
        );
        if !force {
            if let Some(vp) = mount.members().iter().find(|vp| vp.use_count() > 0) {
                return Err(VnError::Busy(format!(
                    "vnode {} on {} is in use",
                    vp.id(),
                    mount.name()
                )));
            }
        }
        mount.set_unmount_state(if force {
            UnmountState::Forced
        } else {
            UnmountState::Unmounting
        });

        let mut doomed = 0_usize;
        loop {
            let members = mount.member_ids();
            if members.is_empty() {
                break;
            }
            let mut skipped = 0_usize;
            for (id, vp) in members {
                if !self.try_hold(&vp) {
                    skipped += 1;
                    continue;
                }
                let result = if vp.id() == id {
                    let mut lock = vp.lock();
                    if force {
                        self.doom(&mut lock);
                        Ok(true)
                    } else if vp.use_count() > 0 {
                        Err(VnError::Busy(format!("vnode {id} is in use")))
                    } else {
                        self.destroy(&mut lock).map(|()| true)
                    }
                } else {
                    Ok(false)
                };
                self.drop_hold(&vp);
                match result {
                    Ok(true) => doomed += 1,
                    Ok(false) => skipped += 1,
                    Err(err) => {
                        mount.set_unmount_state(UnmountState::Mounted);
                        return Err(err);
                    }
                }
            }
            if skipped > 0 {
                thread::yield_now();
            }
        }

        info!(target: "vnc::lifecycle", mount = mount.id().0, doomed, "unmount_done");
        Ok(())
    }
}
