//! Read-mostly snapshot cell backed by [`arc_swap::ArcSwap`].
//!
//! Readers (the reclaimer, the syncer, every allocation) call
//! [`RcuCell::load`] and never block. Writers publish a whole new value;
//! callers that need read-modify-write serialize externally, as
//! [`TunableStore`](crate::config::TunableStore) does with its writer mutex.
//!
//! # Logging
//!
//! - **DEBUG** `vnc::tunables`: `rcu_cell_update` (writer publishes a new value)

use arc_swap::ArcSwap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// A single RCU-protected value.
///
/// ```
/// use vnc_core::rcu::RcuCell;
///
/// let cell = RcuCell::new(42_u64);
/// assert_eq!(**cell.load(), 42);
/// cell.update(100);
/// assert_eq!(**cell.load(), 100);
/// assert_eq!(cell.update_count(), 1);
/// ```
pub struct RcuCell<T> {
    inner: ArcSwap<T>,
    update_count: AtomicU64,
}

impl<T: fmt::Debug> fmt::Debug for RcuCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RcuCell")
            .field("value", &*self.load_arc())
            .field("update_count", &self.update_count())
            .finish()
    }
}

impl<T> RcuCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: ArcSwap::from_pointee(value),
            update_count: AtomicU64::new(0),
        }
    }

    /// Borrow the current value without touching its reference count.
    ///
    /// Keep the guard short-lived; load an `Arc` with
    /// [`load_arc`](Self::load_arc) to keep a snapshot across blocking calls.
    #[inline]
    pub fn load(&self) -> arc_swap::Guard<Arc<T>> {
        self.inner.load()
    }

    #[inline]
    pub fn load_arc(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Publish a new value. Readers holding the old one keep seeing it until
    /// they drop their guard.
    pub fn update(&self, new_value: T) {
        self.inner.store(Arc::new(new_value));
        let count = self.update_count.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(target: "vnc::tunables", update_count = count, "rcu_cell_update");
    }

    #[must_use]
    pub fn update_count(&self) -> u64 {
        self.update_count.load(Ordering::Relaxed)
    }
}
