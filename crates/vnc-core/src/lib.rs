#![forbid(unsafe_code)]
//! Vnode cache and reclamation engine.
//!
//! A fixed-capacity pool of reusable file objects (vnodes) shared by every
//! mounted filesystem, with:
//!
//! - a dual reference model: *holds* keep memory and identity valid, *uses*
//!   mark active file operations (`use > 0` implies `hold > 0`);
//! - a global recency list with per-CPU batching of "move to tail" updates;
//! - a background reclaimer (`vnlru`) that keeps the live population between
//!   `want_free_vnodes` and `desired_vnodes`, escalating its force level when
//!   passes make no progress;
//! - a delayed write-back ring (the syncer) for dirty buffers and periodic
//!   lazy-list sweeps;
//! - per-vnode clean/dirty buffer sets (see [`vnc_buf`]).
//!
//! Filesystem behavior is injected per mount through [`VnodeOps`].
//!
//! # Lock Order
//!
//! ```text
//! vnode exclusive lock ─▶ vnode interlock ─▶ batch shard ─▶ global list ─▶ pool slots
//!                              │
//!                              └─▶ mount lists / unmount state
//! ```
//!
//! The syncer ring lock is a leaf and is never held across vnode operations.
//!
//! # Errors
//!
//! Operations return [`vnc_error::Result`]. Broken internal invariants are
//! [`Violation`](vnc_error::Violation)s and are raised (logged, then panic)
//! rather than returned.
//!
//! # Logging
//!
//! Every module documents its events; targets are `vnc::pool`, `vnc::refs`,
//! `vnc::list`, `vnc::reclaim`, `vnc::lifecycle`, `vnc::buf`, `vnc::syncer`,
//! `vnc::tunables` and `vnc::violation`.

pub(crate) mod batch;
pub mod cache;
pub mod config;
pub mod lifecycle;
pub mod list;
pub mod mount;
pub mod ops;
pub mod pool;
pub mod rcu;
pub mod reclaim;
pub mod refcount;
pub mod refs;
pub mod seqc;
pub(crate) mod signal;
pub mod stats;
pub mod syncer;
pub mod vnode;

pub use cache::{Daemons, TunableEntry, VnodeCache};
pub use config::{CacheConfig, MAX_FORCE_LIMIT, TUNABLE_KEYS, TunableStore, Tunables};
pub use mount::{Mount, UnmountState};
pub use ops::{InactiveOutcome, UpperLayer, VnodeOps};
pub use reclaim::{ALLOC_PATH_FORCE, ReclaimPlan, ReclaimStep, STALL_BACKOFF_TICKS};
pub use refcount::HoldState;
pub use stats::{COUNTER_KEYS, CacheStats};
pub use syncer::{SyncItem, SyncTick, SyncerRing};
pub use vnode::{Vnode, VnodeInfo, VnodeLock};

pub use vnc_buf::{Buffer, BufferObject, DirtyOutcome, FlushMode, FlushPolicy, FlushReport};
pub use vnc_error::{Result, VnError, Violation};
pub use vnc_types::{
    BlockRange, LogicalBlock, MountId, SlotIndex, SyncDelayClass, UpperEvent, VnodeId,
    VnodeState, VnodeType,
};
