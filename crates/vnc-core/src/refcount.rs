//! Tagged hold counter.
//!
//! The hold count lives in the low 31 bits of one `AtomicU32`; the high bit
//! marks the counter *frozen*: the vnode is doomed, its last hold is gone and
//! it is on its way back to the pool. A frozen counter refuses lock-free
//! increments, so a racing lookup reports "unavailable" instead of reviving a
//! dying object. Callers see the tag only as [`HoldState`].

use std::sync::atomic::{AtomicU32, Ordering};
use vnc_error::Violation;

const FROZEN: u32 = 1 << 31;
const COUNT_MASK: u32 = FROZEN - 1;

/// Decoded hold counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldState {
    Live(u32),
    /// Zero holds, no new holds possible until the pool thaws the slot.
    Frozen,
}

/// Result of releasing one hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// The count reached zero; the caller owns the zero transition.
    Last,
    Remaining(u32),
}

#[derive(Debug)]
pub struct HoldCount(AtomicU32);

impl Default for HoldCount {
    fn default() -> Self {
        Self::new()
    }
}

impl HoldCount {
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// A counter that starts frozen (fresh pool slot).
    #[must_use]
    pub fn frozen() -> Self {
        Self(AtomicU32::new(FROZEN))
    }

    #[must_use]
    pub fn state(&self) -> HoldState {
        decode(self.0.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn count(&self) -> u32 {
        match self.state() {
            HoldState::Live(n) => n,
            HoldState::Frozen => 0,
        }
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.state() == HoldState::Frozen
    }

    /// Lock-free increment. Returns the previous count, or `None` when the
    /// counter is frozen.
    pub fn try_acquire(&self) -> Option<u32> {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| match decode(raw) {
                HoldState::Live(n) if n < COUNT_MASK => Some(raw + 1),
                HoldState::Live(_) | HoldState::Frozen => None,
            })
            .ok()
    }

    /// Decrement unless this would be the last hold.
    ///
    /// `false` sends the caller to the locked slow path.
    pub fn release_if_not_last(&self) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| match decode(raw) {
                HoldState::Live(n) if n > 1 => Some(raw - 1),
                HoldState::Live(_) | HoldState::Frozen => None,
            })
            .is_ok()
    }

    /// Unconditional decrement, for the slow path under the interlock.
    pub fn release(&self) -> Result<Release, Violation> {
        match self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| match decode(raw) {
                HoldState::Live(n) if n > 0 => Some(raw - 1),
                HoldState::Live(_) | HoldState::Frozen => None,
            }) {
            Ok(1) => Ok(Release::Last),
            Ok(prev) => Ok(Release::Remaining(prev - 1)),
            Err(raw) => Err(Violation::new(
                "hold_underflow",
                format!("release of {:?}", decode(raw)),
            )),
        }
    }

    /// Zero → frozen. Fails if a concurrent `try_acquire` got in first.
    pub fn freeze(&self) -> bool {
        self.0
            .compare_exchange(0, FROZEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Frozen → `count` holds; only the pool does this when reusing a slot.
    pub fn thaw(&self, count: u32) -> Result<(), Violation> {
        self.0
            .compare_exchange(FROZEN, count & COUNT_MASK, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|raw| {
                Violation::new("thaw_unfrozen", format!("thaw of {:?}", decode(raw)))
            })
    }
}

fn decode(raw: u32) -> HoldState {
    if raw & FROZEN == 0 {
        HoldState::Live(raw)
    } else {
        HoldState::Frozen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn acquire_and_release_track_count() {
        let hold = HoldCount::new();
        assert_eq!(hold.try_acquire(), Some(0));
        assert_eq!(hold.try_acquire(), Some(1));
        assert!(hold.release_if_not_last());
        assert!(!hold.release_if_not_last());
        assert_eq!(hold.release(), Ok(Release::Last));
        assert_eq!(hold.state(), HoldState::Live(0));
    }

    #[test]
    fn release_at_zero_is_a_violation() {
        let hold = HoldCount::new();
        let err = hold.release().unwrap_err();
        assert_eq!(err.check, "hold_underflow");
    }

    #[test]
    fn frozen_counter_refuses_acquire() {
        let hold = HoldCount::new();
        assert!(hold.freeze());
        assert_eq!(hold.state(), HoldState::Frozen);
        assert_eq!(hold.try_acquire(), None);
        assert!(!hold.release_if_not_last());
        assert!(hold.release().is_err());

        hold.thaw(1).expect("thaw");
        assert_eq!(hold.state(), HoldState::Live(1));
        assert!(hold.thaw(1).is_err());
    }

    #[test]
    fn freeze_fails_when_held() {
        let hold = HoldCount::new();
        hold.try_acquire();
        assert!(!hold.freeze());
        assert_eq!(hold.count(), 1);
    }

    #[test]
    fn concurrent_acquire_release_nets_out() {
        let hold = Arc::new(HoldCount::new());
        hold.try_acquire();
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let hold = Arc::clone(&hold);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..10_000 {
                        hold.try_acquire().expect("live");
                        assert!(hold.release_if_not_last());
                    }
                    // Odd threads leave one extra hold behind.
                    if i % 2 == 1 {
                        hold.try_acquire().expect("live");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(hold.state(), HoldState::Live(5));
    }
}
