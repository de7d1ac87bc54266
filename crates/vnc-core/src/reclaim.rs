//! Reclamation engine.
//!
//! The background reclaimer (`vnlru`) keeps the live population between
//! `want_free_vnodes` and `desired_vnodes`. With `gap = desired - want_free`,
//! `hi = gap / 11` and `lo = hi / 2`, it sleeps while `live < desired - lo`
//! and otherwise recycles `max(1, live - (desired - hi))` vnodes, capped by
//! `max_recycle_per_call`. The hysteresis keeps it from waking for every
//! single allocation.
//!
//! A pass walks the global list forward from the reclaim-marker, wrapping
//! once to the head, so candidates are visited in list order. A vnode is a
//! candidate when nobody holds it, it is not doomed, its type is reclaimable
//! and its mount is not write-suspended. Beyond that, eligibility widens with
//! the force level:
//!
//! | Force | Also eligible |
//! |-------|---------------|
//! | 0 | clean vnodes with at most `resident_trigger` cached buffers |
//! | 1 | clean vnodes with any number of cached buffers |
//! | 2+ | directories still referenced by the name cache |
//!
//! Vnodes with dirty buffers are left to the syncer at every level. A pass
//! with no progress raises the force level for the next pass, up to
//! `max_force`; a pass at `max_force` with no progress is a stall and backs
//! off. Any progress resets the level. An allocator that had to sleep sets
//! *stir* mode: the next pass runs at `max_force` regardless of the plan.
//!
//! Allocation also recycles synchronously through [`VnodeCache::free_some`],
//! which walks from the free-marker instead.
//!
//! # Logging
//!
//! - **TRACE** `vnc::reclaim`: `recycle_skip`
//! - **DEBUG** `vnc::reclaim`: `vnlru_pass`, `vnlru_escalate`
//! - **INFO**  `vnc::reclaim`: `vnlru_start`, `vnlru_stop`, `force_reclaim`
//! - **WARN**  `vnc::reclaim`: `vnlru_stalled`

use crate::VnodeCache;
use crate::config::Tunables;
use crate::list::{Entry, Marker};
use crate::stats::CacheCounters;
use crate::vnode::Vnode;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use tracing::{debug, info, trace, warn};
use vnc_error::{Result, VnError};
use vnc_types::{VnodeId, VnodeState, VnodeType};

/// Force level used by the allocation-path recycler.
pub const ALLOC_PATH_FORCE: u32 = 2;

/// Reclaim ticks slept after a stalled pass.
pub const STALL_BACKOFF_TICKS: u32 = 10;

/// Thresholds and budget of one reclaimer pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReclaimPlan {
    pub live: u64,
    /// Live count at which the reclaimer wakes up (`desired - lo`).
    pub trigger: u64,
    /// Live count a pass aims for (`desired - hi`).
    pub goal: u64,
    /// Vnodes to recycle this pass.
    pub target: u64,
}

impl ReclaimPlan {
    /// `None` while `live` is below the trigger.
    #[must_use]
    pub fn compute(live: u64, t: &Tunables) -> Option<Self> {
        let gap = t.desired_vnodes.saturating_sub(t.want_free_vnodes);
        let hi = gap / 11;
        let lo = hi / 2;
        let trigger = t.desired_vnodes - lo;
        if live < trigger {
            return None;
        }
        let goal = t.desired_vnodes - hi;
        let target = live
            .saturating_sub(goal)
            .max(1)
            .min(t.max_recycle_per_call);
        Some(Self {
            live,
            trigger,
            goal,
            target,
        })
    }
}

/// Outcome of one reclaimer pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "step")]
pub enum ReclaimStep {
    /// Below the trigger and not stirred.
    Idle,
    Progress { recycled: u64, force: u32 },
    /// Nothing recycled; the next pass runs at `force`.
    Escalated { force: u32 },
    /// Nothing recycled at `max_force`.
    Stalled,
}

impl VnodeCache {
    /// Run one reclaimer pass.
    pub fn reclaim_step(&self) -> ReclaimStep {
        let stir = self.reclaim_signal.take_stir();
        let t = self.tunables.load();
        let plan = ReclaimPlan::compute(self.stats.live(), &t);
        let target = match (plan, stir) {
            (Some(plan), _) => plan.target,
            (None, true) => 1,
            (None, false) => return ReclaimStep::Idle,
        };
        self.flush_batches();

        let force = if stir {
            t.max_force
        } else {
            self.reclaim_force.load(Ordering::Relaxed).min(t.max_force)
        };
        let recycled = self.scan(Marker::Reclaim, target, force, &t);
        if recycled > 0 {
            self.reclaim_force.store(0, Ordering::Relaxed);
            let shrunk = self.shrink();
            debug!(
                target: "vnc::reclaim",
                recycled,
                target,
                force,
                stir,
                shrunk,
                live = self.stats.live(),
                "vnlru_pass"
            );
            return ReclaimStep::Progress { recycled, force };
        }
        if force < t.max_force {
            let next = force + 1;
            self.reclaim_force.store(next, Ordering::Relaxed);
            debug!(target: "vnc::reclaim", force = next, target, "vnlru_escalate");
            return ReclaimStep::Escalated { force: next };
        }
        self.reclaim_force.store(t.max_force, Ordering::Relaxed);
        CacheCounters::bump(&self.stats.reclaim_stalls);
        warn!(
            target: "vnc::reclaim",
            force,
            target,
            live = self.stats.live(),
            desired = t.desired_vnodes,
            "vnlru_stalled"
        );
        ReclaimStep::Stalled
    }

    /// Allocation-path recycler: recycle up to `n` idle vnodes starting at
    /// the free-marker. Returns how many were recycled.
    pub fn free_some(&self, n: u64) -> u64 {
        let t = self.tunables.load();
        self.scan(Marker::Free, n, ALLOC_PATH_FORCE.min(t.max_force), &t)
    }

    /// Walk forward from `marker`, recycling until `target` is met or one
    /// lap of the list is done.
    fn scan(&self, marker: Marker, target: u64, force: u32, t: &Tunables) -> u64 {
        let mut recycled = 0;
        let mut list = self.list.lock();
        let mut budget = list.len() + 2;
        let mut wrapped = false;
        while recycled < target && budget > 0 {
            let entry = match list.next_after(marker) {
                Some(entry) => entry,
                None if !wrapped => {
                    wrapped = true;
                    list.move_marker_to_front(marker);
                    continue;
                }
                None => break,
            };
            list.move_marker_after(marker, entry);
            budget -= 1;

            let Entry::Slot(slot) = entry else {
                continue;
            };
            let Some(vp) = self.pool.slot(slot) else {
                continue;
            };
            if vp.hold_count() > 0 || vp.is_doomed() || !self.try_hold(&vp) {
                continue;
            }
            drop(list);
            if self.try_recycle(&vp, force, t).is_ok() {
                recycled += 1;
            }
            self.drop_hold(&vp);
            list = self.list.lock();
        }
        recycled
    }

    /// Why `vp` cannot be recycled at `force`, if it cannot.
    fn recycle_blocker(vp: &Vnode, force: u32, t: &Tunables) -> Option<&'static str> {
        let inner = vp.interlock();
        if vp.is_doomed() {
            return Some("doomed");
        }
        if vp.use_count() > 0 {
            return Some("in use");
        }
        if !inner.vtype.is_reclaimable() || inner.state != VnodeState::Constructed {
            return Some("not reclaimable");
        }
        if inner.mount.as_ref().is_some_and(|m| m.is_write_suspended()) {
            return Some("mount write-suspended");
        }
        if inner.vtype == VnodeType::Directory && inner.namecache_refs > 0 && force < 2 {
            return Some("name cache references");
        }
        drop(inner);
        if vp.buffers().dirty_count() > 0 {
            return Some("dirty buffers");
        }
        if force < 1 && vp.buffers().clean_count() as u64 > t.resident_trigger {
            return Some("resident buffers");
        }
        None
    }

    /// Doom a held, idle vnode. The caller keeps its hold.
    fn try_recycle(&self, vp: &Arc<Vnode>, force: u32, t: &Tunables) -> Result<()> {
        let skip = |reason: &'static str| {
            trace!(target: "vnc::reclaim", vnode = vp.id().0, force, reason, "recycle_skip");
            Err(VnError::Busy(reason.to_owned()))
        };
        if let Some(reason) = Self::recycle_blocker(vp, force, t) {
            return skip(reason);
        }
        let Some(mut lock) = vp.try_lock() else {
            CacheCounters::bump(&self.stats.busy_skips);
            return skip("locked");
        };
        if let Some(reason) = Self::recycle_blocker(vp, force, t) {
            return skip(reason);
        }
        self.doom(&mut lock);
        drop(lock);
        CacheCounters::bump(&self.stats.recycles);
        Ok(())
    }

    /// Doom one idle vnode by id. `NotFound` if it does not exist, `Busy`
    /// while it has use references.
    pub fn force_reclaim(&self, id: VnodeId) -> Result<()> {
        let vp = self
            .lookup(id)
            .ok_or_else(|| VnError::NotFound(format!("vnode {id}")))?;
        let result = {
            let mut lock = vp.lock();
            if vp.use_count() > 0 {
                Err(VnError::Busy(format!("vnode {id} is in use")))
            } else {
                self.doom(&mut lock);
                Ok(())
            }
        };
        self.drop_hold(&vp);
        if result.is_ok() {
            CacheCounters::bump(&self.stats.recycles);
            info!(target: "vnc::reclaim", vnode = id.0, "force_reclaim");
        }
        result
    }
}

/// Reclaimer daemon body.
pub(crate) fn run_reclaimer(cache: &VnodeCache) {
    info!(target: "vnc::reclaim", "vnlru_start");
    while !cache.reclaim_signal.is_shutdown() {
        let tick = cache.tunables.load().reclaim_tick();
        match cache.reclaim_step() {
            ReclaimStep::Idle => {
                cache.reclaim_signal.wait(tick);
            }
            ReclaimStep::Progress { .. } | ReclaimStep::Escalated { .. } => thread::yield_now(),
            ReclaimStep::Stalled => {
                cache.reclaim_signal.wait(tick * STALL_BACKOFF_TICKS);
            }
        }
    }
    info!(target: "vnc::reclaim", "vnlru_stop");
}
