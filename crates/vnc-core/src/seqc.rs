//! Per-vnode sequence counter.
//!
//! Writers bracket a mutation with [`SeqCounter::write_begin`] and
//! [`SeqCounter::write_end`]; nested writers are counted in `users` and only
//! the outermost pair moves the sequence. An odd sequence means a write is in
//! progress. Lock-free readers sample with [`SeqCounter::read_begin`] and
//! confirm nothing changed with [`SeqCounter::validate`].

use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Default)]
pub struct SeqCounter {
    seq: AtomicU32,
    users: AtomicU32,
}

impl SeqCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter a write section. Callers hold the vnode's exclusive lock until
    /// the matching `write_end`; the interlock may be dropped in between.
    pub fn write_begin(&self) {
        if self.users.fetch_add(1, Ordering::AcqRel) == 0 {
            self.seq.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn write_end(&self) {
        if self.users.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.seq.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Snapshot for a lock-free read, `None` while a write is in progress.
    #[must_use]
    pub fn read_begin(&self) -> Option<u32> {
        let seq = self.seq.load(Ordering::Acquire);
        (seq & 1 == 0).then_some(seq)
    }

    #[must_use]
    pub fn validate(&self, seq: u32) -> bool {
        self.seq.load(Ordering::Acquire) == seq
    }

    #[must_use]
    pub fn in_write(&self) -> bool {
        self.seq.load(Ordering::Acquire) & 1 == 1
    }

    #[must_use]
    pub fn users(&self) -> u32 {
        self.users.load(Ordering::Acquire)
    }
}
