#![forbid(unsafe_code)]
//! Buffer association layer.
//!
//! Every vnode owns one [`BufferObject`]: two ordered sets (clean and dirty)
//! of cached I/O buffers keyed by [`LogicalBlock`]. Ordered maps rather than
//! hash maps, because invalidating a block interval (truncate, reclaim) is a
//! primary operation.
//!
//! Writing a buffer back is delegated to a [`BufferWriter`], implemented by
//! the filesystem that owns the vnode.
//!
//! # Locking
//!
//! Each buffer has its own lock (held while its bytes are read, modified or
//! written back). The set lock nests inside buffer locks; code holding the set
//! lock only ever *tries* a buffer lock, and waits for a contended buffer
//! with the set lock dropped before rescanning.
//!
//! A dying vnode *seals* its object before the final flush: from then on no
//! buffer can be attached or dirtied, so nothing slips in behind the flush.
//! Setting the next owner reopens it.
//!
//! # Logging
//!
//! - **TRACE** `vnc::buf`: `buf_attach`, `buf_invalidate_wait`, `buf_write_retry`
//! - **DEBUG** `vnc::buf`: `buf_flush_done`, `buf_discard_dirty`
//! - **WARN**  `vnc::buf`: `buf_forced_discard` (data lost on a forced flush)

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, trace, warn};
use vnc_error::{Result, VnError};
use vnc_types::{BlockRange, LogicalBlock, VnodeId};

/// Write-back seam implemented by filesystem-specific code.
pub trait BufferWriter: Send + Sync {
    /// Persist one dirty block. `data` is stable for the duration of the call
    /// (the buffer lock is held).
    fn write_buffer(&self, owner: VnodeId, block: LogicalBlock, data: &[u8]) -> Result<()>;
}

/// One cached block of I/O data.
#[derive(Debug)]
pub struct Buffer {
    block: LogicalBlock,
    data: Mutex<Vec<u8>>,
    dirty: AtomicBool,
    attached: AtomicBool,
}

impl Buffer {
    fn new(block: LogicalBlock, bytes: Vec<u8>) -> Self {
        Self {
            block,
            data: Mutex::new(bytes),
            dirty: AtomicBool::new(false),
            attached: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn block(&self) -> LogicalBlock {
        self.block
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// False once the buffer has been invalidated or flushed out of its
    /// buffer object.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Lock the buffer, blocking while another thread has it.
    pub fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, Vec<u8>>> {
        self.data.try_lock()
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    fn detach(&self) {
        self.dirty.store(false, Ordering::Release);
        self.attached.store(false, Ordering::Release);
    }
}

#[derive(Debug, Default)]
struct BufSets {
    clean: BTreeMap<LogicalBlock, Arc<Buffer>>,
    dirty: BTreeMap<LogicalBlock, Arc<Buffer>>,
    on_worklist: bool,
    sealed: bool,
}

impl BufSets {
    fn get(&self, block: LogicalBlock) -> Option<&Arc<Buffer>> {
        self.clean.get(&block).or_else(|| self.dirty.get(&block))
    }

    fn remove(&mut self, block: LogicalBlock) -> Option<Arc<Buffer>> {
        self.clean
            .remove(&block)
            .or_else(|| self.dirty.remove(&block))
    }

    fn in_range(&self, range: BlockRange) -> Vec<Arc<Buffer>> {
        let bounds = range.start()..=range.end();
        self.clean
            .range(bounds.clone())
            .chain(self.dirty.range(bounds))
            .map(|(_, buf)| Arc::clone(buf))
            .collect()
    }

    fn to_dirty(&mut self, block: LogicalBlock) -> Option<bool> {
        if self.dirty.contains_key(&block) {
            return Some(false);
        }
        let buf = self.clean.remove(&block)?;
        buf.dirty.store(true, Ordering::Release);
        self.dirty.insert(block, buf);
        Some(true)
    }

    fn to_clean(&mut self, block: LogicalBlock) -> Option<()> {
        if self.clean.contains_key(&block) {
            return Some(());
        }
        let buf = self.dirty.remove(&block)?;
        buf.dirty.store(false, Ordering::Release);
        self.clean.insert(block, buf);
        Some(())
    }
}

/// Flush mode for [`BufferObject::flush_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// Drop everything, dirty data included.
    Discard,
    /// Write dirty buffers back first, then drop everything.
    WriteBack,
}

/// Retry/discard policy for write-back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    /// Additional attempts after the first failed write of a buffer.
    pub max_retries: u32,
    /// Discard buffers whose write-back keeps failing. Only the ownerless and
    /// force-unmount paths set this.
    pub forced: bool,
}

impl FlushPolicy {
    #[must_use]
    pub fn normal(max_retries: u32) -> Self {
        Self {
            max_retries,
            forced: false,
        }
    }

    #[must_use]
    pub fn forced(max_retries: u32) -> Self {
        Self {
            max_retries,
            forced: true,
        }
    }
}

/// What a flush or sync did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Dirty buffers successfully written back.
    pub written: usize,
    /// Buffers removed from the object (clean, or dirty under `Discard`).
    pub discarded: usize,
    /// Dirty buffers dropped after write-back kept failing (forced only).
    pub lost: usize,
    /// Dirty buffers left dirty after write-back kept failing.
    pub failed: usize,
    /// Write attempts beyond the first, across all buffers.
    pub retries: usize,
}

/// Result of dirtying a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyOutcome {
    AlreadyDirty,
    /// `needs_sync` is true when the object just joined the syncer worklist;
    /// the caller must enqueue it.
    Dirtied { needs_sync: bool },
}

const NO_OWNER: u64 = 0;

/// Per-vnode clean/dirty buffer collections.
///
/// The owner is the current vnode incarnation; `VnodeId(0)` is reserved for
/// "no owner" and buffers cannot be attached while the object is ownerless.
#[derive(Debug)]
pub struct BufferObject {
    owner: AtomicU64,
    sets: Mutex<BufSets>,
    invalidate_waits: AtomicU64,
}

impl Default for BufferObject {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferObject {
    #[must_use]
    pub fn new() -> Self {
        Self {
            owner: AtomicU64::new(NO_OWNER),
            sets: Mutex::new(BufSets::default()),
            invalidate_waits: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn owner(&self) -> Option<VnodeId> {
        match self.owner.load(Ordering::Acquire) {
            NO_OWNER => None,
            id => Some(VnodeId(id)),
        }
    }

    /// Set the owning incarnation. A new owner also reopens a sealed object.
    pub fn set_owner(&self, owner: Option<VnodeId>) {
        let mut sets = self.sets.lock();
        if owner.is_some() {
            sets.sealed = false;
        }
        self.owner
            .store(owner.map_or(NO_OWNER, |id| id.0), Ordering::Release);
    }

    /// Refuse new and newly dirtied buffers until the next owner is set.
    pub fn seal(&self) {
        self.sets.lock().sealed = true;
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sets.lock().sealed
    }

    fn sealed_error(&self) -> VnError {
        VnError::Unavailable {
            vnode: self.owner.load(Ordering::Acquire),
        }
    }

    fn require_owner(&self) -> Result<VnodeId> {
        self.owner()
            .ok_or_else(|| VnError::NotFound("buffer object has no owning vnode".to_owned()))
    }

    /// Insert a new clean buffer.
    pub fn attach(&self, block: LogicalBlock, bytes: Vec<u8>) -> Result<Arc<Buffer>> {
        let owner = self.require_owner()?;
        let mut sets = self.sets.lock();
        if sets.sealed {
            return Err(self.sealed_error());
        }
        if sets.get(block).is_some() {
            return Err(VnError::Exists(format!("vnode {owner} block {block}")));
        }
        let buf = Arc::new(Buffer::new(block, bytes));
        sets.clean.insert(block, Arc::clone(&buf));
        drop(sets);
        trace!(target: "vnc::buf", vnode = owner.0, block = block.0, "buf_attach");
        Ok(buf)
    }

    #[must_use]
    pub fn lookup(&self, block: LogicalBlock) -> Option<Arc<Buffer>> {
        self.sets.lock().get(block).cloned()
    }

    /// Replace a block's contents and dirty it, attaching it first if absent.
    pub fn write(&self, block: LogicalBlock, bytes: Vec<u8>) -> Result<DirtyOutcome> {
        let buf = match self.lookup(block) {
            Some(buf) => buf,
            None => self.attach(block, Vec::new())?,
        };
        let mut data = buf.lock();
        if !buf.is_attached() {
            return Err(VnError::Busy(format!(
                "block {block} was invalidated during write"
            )));
        }
        // Dirty first: a sealed object must not see its clean data change.
        let outcome = self.mark_dirty(block)?;
        *data = bytes;
        drop(data);
        Ok(outcome)
    }

    /// Move a buffer from the clean set to the dirty set.
    pub fn mark_dirty(&self, block: LogicalBlock) -> Result<DirtyOutcome> {
        let mut sets = self.sets.lock();
        if sets.sealed {
            return Err(self.sealed_error());
        }
        match sets.to_dirty(block) {
            None => Err(VnError::NotFound(format!("block {block}"))),
            Some(false) => Ok(DirtyOutcome::AlreadyDirty),
            Some(true) => {
                let needs_sync = !sets.on_worklist;
                sets.on_worklist = true;
                Ok(DirtyOutcome::Dirtied { needs_sync })
            }
        }
    }

    /// Move a buffer from the dirty set to the clean set.
    pub fn mark_clean(&self, block: LogicalBlock) -> Result<()> {
        self.sets
            .lock()
            .to_clean(block)
            .ok_or_else(|| VnError::NotFound(format!("block {block}")))
    }

    /// Remove and discard every buffer whose block lies in `range`, from both
    /// sets. Buffers locked elsewhere are waited for and the scan restarts.
    ///
    /// Returns the number of buffers removed; repeating the call is a no-op.
    pub fn invalidate_range(&self, range: BlockRange) -> usize {
        let mut removed = 0;
        loop {
            let mut sets = self.sets.lock();
            let mut blocked = None;
            for buf in sets.in_range(range) {
                let Some(guard) = buf.try_lock() else {
                    blocked = Some(buf);
                    break;
                };
                let _ = sets.remove(buf.block);
                buf.detach();
                drop(guard);
                removed += 1;
            }
            drop(sets);

            let Some(buf) = blocked else {
                return removed;
            };
            self.invalidate_waits.fetch_add(1, Ordering::Relaxed);
            trace!(
                target: "vnc::buf",
                vnode = self.owner().map(|id| id.0),
                block = buf.block.0,
                "buf_invalidate_wait"
            );
            drop(buf.lock());
        }
    }

    /// Write one dirty buffer back, retrying up to `max_retries` times.
    ///
    /// `Ok(false)` means there was nothing to write (raced with invalidation
    /// or a concurrent write-back).
    fn write_one(
        &self,
        owner: VnodeId,
        buf: &Buffer,
        writer: &dyn BufferWriter,
        max_retries: u32,
        report: &mut FlushReport,
    ) -> Result<bool> {
        let data = buf.lock();
        if !buf.is_attached() || !buf.is_dirty() {
            return Ok(false);
        }
        let mut attempt = 0_u32;
        loop {
            match writer.write_buffer(owner, buf.block, &data) {
                Ok(()) => {
                    let _ = self.sets.lock().to_clean(buf.block);
                    drop(data);
                    return Ok(true);
                }
                Err(err) if attempt < max_retries => {
                    attempt += 1;
                    report.retries += 1;
                    trace!(
                        target: "vnc::buf",
                        vnode = owner.0,
                        block = buf.block.0,
                        attempt,
                        error = %err,
                        "buf_write_retry"
                    );
                }
                Err(err) => {
                    return Err(VnError::WriteBack {
                        vnode: owner.0,
                        block: buf.block.0,
                        detail: err.to_string(),
                    });
                }
            }
        }
    }

    fn dirty_snapshot(&self) -> Vec<Arc<Buffer>> {
        self.sets.lock().dirty.values().cloned().collect()
    }

    fn discard(&self, buf: &Buffer) {
        let mut sets = self.sets.lock();
        if let Some(removed) = sets.remove(buf.block) {
            removed.detach();
        }
    }

    /// Write back every dirty buffer, leaving it attached and clean.
    ///
    /// Failures stay dirty and are counted in `failed`.
    pub fn sync_dirty(&self, writer: &dyn BufferWriter, max_retries: u32) -> FlushReport {
        let mut report = FlushReport::default();
        let Some(owner) = self.owner() else {
            return report;
        };
        for buf in self.dirty_snapshot() {
            match self.write_one(owner, &buf, writer, max_retries, &mut report) {
                Ok(true) => report.written += 1,
                Ok(false) => {}
                Err(_) => report.failed += 1,
            }
        }
        report
    }

    /// Drain both sets.
    ///
    /// With [`FlushMode::WriteBack`], dirty buffers are written first; a
    /// buffer that still fails after `policy.max_retries` retries is
    /// discarded (forced policy, counted as `lost`) or left dirty, in which
    /// case the first failure is returned after the clean buffers are gone.
    pub fn flush_all(
        &self,
        mode: FlushMode,
        writer: &dyn BufferWriter,
        policy: FlushPolicy,
    ) -> Result<FlushReport> {
        let mut report = FlushReport::default();
        let owner = self.owner().unwrap_or(VnodeId(NO_OWNER));

        if mode == FlushMode::WriteBack {
            let mut failure = None;
            // Writers may re-dirty buffers while we flush; a few rounds
            // catch the stragglers.
            for _round in 0..=policy.max_retries {
                let dirty = self.dirty_snapshot();
                if dirty.is_empty() {
                    break;
                }
                for buf in dirty {
                    match self.write_one(owner, &buf, writer, policy.max_retries, &mut report) {
                        Ok(true) => report.written += 1,
                        Ok(false) => {}
                        Err(err) if policy.forced => {
                            warn!(
                                target: "vnc::buf",
                                vnode = owner.0,
                                block = buf.block.0,
                                error = %err,
                                "buf_forced_discard"
                            );
                            self.discard(&buf);
                            report.lost += 1;
                        }
                        Err(err) => {
                            report.failed += 1;
                            failure.get_or_insert(err);
                        }
                    }
                }
                if failure.is_some() {
                    break;
                }
            }
            if let Some(err) = failure {
                report.discarded += self.invalidate_clean();
                return Err(err);
            }
        }

        let dirty_left = self.dirty_count();
        if dirty_left > 0 {
            debug!(
                target: "vnc::buf",
                vnode = owner.0,
                dirty = dirty_left,
                ?mode,
                "buf_discard_dirty"
            );
        }
        report.discarded += self.invalidate_range(BlockRange::all());
        debug!(
            target: "vnc::buf",
            vnode = owner.0,
            written = report.written,
            discarded = report.discarded,
            lost = report.lost,
            "buf_flush_done"
        );
        Ok(report)
    }

    fn invalidate_clean(&self) -> usize {
        let clean: Vec<LogicalBlock> = self.sets.lock().clean.keys().copied().collect();
        clean
            .into_iter()
            .map(|block| {
                // Single-block ranges never fail to build.
                BlockRange::new(block, block).map_or(0, |range| {
                    let still_clean = self
                        .lookup(block)
                        .is_some_and(|buf| !buf.is_dirty());
                    if still_clean {
                        self.invalidate_range(range)
                    } else {
                        0
                    }
                })
            })
            .sum()
    }

    #[must_use]
    pub fn clean_count(&self) -> usize {
        self.sets.lock().clean.len()
    }

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.sets.lock().dirty.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        let sets = self.sets.lock();
        sets.clean.is_empty() && sets.dirty.is_empty()
    }

    /// Whether any buffer (clean or dirty) is cached.
    #[must_use]
    pub fn has_cached_data(&self) -> bool {
        !self.is_empty()
    }

    #[must_use]
    pub fn dirty_blocks(&self) -> Vec<LogicalBlock> {
        self.sets.lock().dirty.keys().copied().collect()
    }

    #[must_use]
    pub fn clean_blocks(&self) -> Vec<LogicalBlock> {
        self.sets.lock().clean.keys().copied().collect()
    }

    /// Whether the object is queued on the syncer worklist.
    #[must_use]
    pub fn on_worklist(&self) -> bool {
        self.sets.lock().on_worklist
    }

    /// Leave the worklist unless dirty buffers remain. Returns whether the
    /// object is still on it.
    pub fn settle_worklist(&self) -> bool {
        let mut sets = self.sets.lock();
        if sets.dirty.is_empty() {
            sets.on_worklist = false;
        }
        sets.on_worklist
    }

    /// Force the object off the worklist (teardown).
    pub fn clear_worklist(&self) {
        self.sets.lock().on_worklist = false;
    }

    /// How many times invalidation had to wait for a locked buffer.
    #[must_use]
    pub fn invalidate_waits(&self) -> u64 {
        self.invalidate_waits.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct RecordingWriter {
        written: Mutex<Vec<(LogicalBlock, Vec<u8>)>>,
        /// Fail this many calls before succeeding.
        failures_left: AtomicUsize,
    }

    impl RecordingWriter {
        fn failing(times: usize) -> Self {
            Self {
                written: Mutex::new(Vec::new()),
                failures_left: AtomicUsize::new(times),
            }
        }
    }

    impl BufferWriter for RecordingWriter {
        fn write_buffer(&self, _owner: VnodeId, block: LogicalBlock, data: &[u8]) -> Result<()> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(VnError::Io(std::io::Error::other("injected")));
            }
            self.written.lock().push((block, data.to_vec()));
            Ok(())
        }
    }

    fn owned() -> BufferObject {
        let bo = BufferObject::new();
        bo.set_owner(Some(VnodeId(1)));
        bo
    }

    fn range(start: i64, end: i64) -> BlockRange {
        BlockRange::new(LogicalBlock(start), LogicalBlock(end)).expect("range")
    }

    #[test]
    fn attach_requires_owner() {
        let bo = BufferObject::new();
        assert!(matches!(
            bo.attach(LogicalBlock(0), vec![]),
            Err(VnError::NotFound(_))
        ));
    }

    #[test]
    fn sealed_object_refuses_new_dirty_data() {
        let bo = owned();
        bo.attach(LogicalBlock(0), vec![1]).expect("attach");
        bo.seal();
        assert!(bo.is_sealed());
        assert!(matches!(
            bo.attach(LogicalBlock(1), vec![]),
            Err(VnError::Unavailable { vnode: 1 })
        ));
        assert!(matches!(
            bo.mark_dirty(LogicalBlock(0)),
            Err(VnError::Unavailable { .. })
        ));
        assert!(matches!(
            bo.write(LogicalBlock(0), vec![2]),
            Err(VnError::Unavailable { .. })
        ));
        assert_eq!(bo.dirty_count(), 0);
        assert!(!bo.on_worklist());

        // Teardown still works on a sealed object.
        assert_eq!(bo.invalidate_range(BlockRange::all()), 1);
        bo.set_owner(None);
        assert!(bo.is_sealed());
        bo.set_owner(Some(VnodeId(2)));
        assert!(!bo.is_sealed());
        assert_eq!(
            bo.write(LogicalBlock(0), vec![3]).expect("write"),
            DirtyOutcome::Dirtied { needs_sync: true }
        );
    }

    #[test]
    fn attach_rejects_duplicate_block() {
        let bo = owned();
        bo.attach(LogicalBlock(3), vec![1]).expect("attach");
        bo.mark_dirty(LogicalBlock(3)).expect("dirty");
        assert!(matches!(
            bo.attach(LogicalBlock(3), vec![2]),
            Err(VnError::Exists(_))
        ));
    }

    #[test]
    fn dirty_and_clean_move_between_sets() {
        let bo = owned();
        let buf = bo.attach(LogicalBlock(-1), vec![0; 4]).expect("attach");
        assert_eq!((bo.clean_count(), bo.dirty_count()), (1, 0));

        assert_eq!(
            bo.mark_dirty(LogicalBlock(-1)).expect("dirty"),
            DirtyOutcome::Dirtied { needs_sync: true }
        );
        assert!(buf.is_dirty());
        assert_eq!((bo.clean_count(), bo.dirty_count()), (0, 1));
        assert_eq!(
            bo.mark_dirty(LogicalBlock(-1)).expect("dirty again"),
            DirtyOutcome::AlreadyDirty
        );

        bo.mark_clean(LogicalBlock(-1)).expect("clean");
        assert!(!buf.is_dirty());
        assert_eq!((bo.clean_count(), bo.dirty_count()), (1, 0));

        // Still on the worklist until the syncer settles it.
        assert_eq!(
            bo.mark_dirty(LogicalBlock(-1)).expect("dirty"),
            DirtyOutcome::Dirtied { needs_sync: false }
        );
        assert!(bo.mark_dirty(LogicalBlock(99)).is_err());
    }

    #[test]
    fn invalidate_range_removes_from_both_sets_and_repeats_as_noop() {
        let bo = owned();
        for block in 0..10 {
            bo.attach(LogicalBlock(block), vec![]).expect("attach");
        }
        for block in [2, 4, 8] {
            bo.mark_dirty(LogicalBlock(block)).expect("dirty");
        }

        let stale = bo.lookup(LogicalBlock(4)).expect("lookup");
        assert_eq!(bo.invalidate_range(range(3, 8)), 6);
        assert!(!stale.is_attached());
        assert_eq!(bo.clean_blocks(), vec![LogicalBlock(0), LogicalBlock(1), LogicalBlock(9)]);
        assert_eq!(bo.dirty_blocks(), vec![LogicalBlock(2)]);

        assert_eq!(bo.invalidate_range(range(3, 8)), 0);
        assert_eq!(bo.clean_count() + bo.dirty_count(), 4);
    }

    #[test]
    fn invalidate_waits_for_locked_buffer() {
        let bo = Arc::new(owned());
        let buf = bo.attach(LogicalBlock(7), vec![1, 2, 3]).expect("attach");

        let guard = buf.lock();
        let bo2 = Arc::clone(&bo);
        let handle = thread::spawn(move || bo2.invalidate_range(BlockRange::all()));

        thread::sleep(Duration::from_millis(50));
        assert!(buf.is_attached(), "invalidate must not steal a locked buffer");
        drop(guard);

        assert_eq!(handle.join().expect("join"), 1);
        assert!(!buf.is_attached());
        assert!(bo.invalidate_waits() >= 1);
        assert!(bo.is_empty());
    }

    #[test]
    fn write_attaches_and_dirties() {
        let bo = owned();
        assert_eq!(
            bo.write(LogicalBlock(5), vec![9; 8]).expect("write"),
            DirtyOutcome::Dirtied { needs_sync: true }
        );
        let buf = bo.lookup(LogicalBlock(5)).expect("present");
        assert_eq!(buf.snapshot(), vec![9; 8]);
        assert!(buf.is_dirty());
    }

    #[test]
    fn sync_dirty_writes_and_keeps_buffers() {
        let bo = owned();
        bo.write(LogicalBlock(1), vec![1]).expect("write");
        bo.write(LogicalBlock(2), vec![2]).expect("write");
        let writer = RecordingWriter::default();

        let report = bo.sync_dirty(&writer, 0);
        assert_eq!(report.written, 2);
        assert_eq!(bo.dirty_count(), 0);
        assert_eq!(bo.clean_count(), 2);
        assert!(!bo.settle_worklist());
        assert_eq!(writer.written.lock().len(), 2);
    }

    #[test]
    fn flush_write_back_retries_then_succeeds() {
        let bo = owned();
        bo.write(LogicalBlock(1), vec![1]).expect("write");
        bo.attach(LogicalBlock(2), vec![2]).expect("attach");
        let writer = RecordingWriter::failing(2);

        let report = bo
            .flush_all(FlushMode::WriteBack, &writer, FlushPolicy::normal(3))
            .expect("flush");
        assert_eq!(report.written, 1);
        assert_eq!(report.retries, 2);
        assert_eq!(report.discarded, 2);
        assert!(bo.is_empty());
    }

    #[test]
    fn flush_unforced_failure_keeps_dirty_data() {
        let bo = owned();
        bo.write(LogicalBlock(1), vec![1]).expect("write");
        bo.attach(LogicalBlock(2), vec![2]).expect("attach");
        let writer = RecordingWriter::failing(usize::MAX);

        let err = bo
            .flush_all(FlushMode::WriteBack, &writer, FlushPolicy::normal(2))
            .unwrap_err();
        assert!(matches!(err, VnError::WriteBack { block: 1, .. }));
        assert_eq!(bo.dirty_blocks(), vec![LogicalBlock(1)]);
        assert_eq!(bo.clean_count(), 0);
    }

    #[test]
    fn flush_forced_failure_discards_with_loss() {
        let bo = owned();
        bo.write(LogicalBlock(1), vec![1]).expect("write");
        let writer = RecordingWriter::failing(usize::MAX);

        let report = bo
            .flush_all(FlushMode::WriteBack, &writer, FlushPolicy::forced(1))
            .expect("forced flush never fails");
        assert_eq!(report.lost, 1);
        assert_eq!(report.retries, 1);
        assert!(bo.is_empty());
    }

    #[test]
    fn flush_discard_skips_writer() {
        let bo = owned();
        bo.write(LogicalBlock(1), vec![1]).expect("write");
        bo.attach(LogicalBlock(2), vec![]).expect("attach");
        let writer = RecordingWriter::default();

        let report = bo
            .flush_all(FlushMode::Discard, &writer, FlushPolicy::normal(0))
            .expect("discard");
        assert_eq!(report.discarded, 2);
        assert_eq!(report.written, 0);
        assert!(writer.written.lock().is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn invalidate_removes_exactly_the_range(
            blocks in proptest::collection::btree_set(-50_i64..50, 0..40),
            dirty_mask in proptest::collection::vec(any::<bool>(), 40),
            start in -60_i64..60,
            len in 0_i64..40,
        ) {
            let bo = owned();
            for (idx, block) in blocks.iter().enumerate() {
                bo.attach(LogicalBlock(*block), vec![]).expect("attach");
                if dirty_mask[idx] {
                    bo.mark_dirty(LogicalBlock(*block)).expect("dirty");
                }
            }
            let r = range(start, start + len);
            let expected_gone: BTreeSet<i64> =
                blocks.iter().copied().filter(|b| r.contains(LogicalBlock(*b))).collect();

            prop_assert_eq!(bo.invalidate_range(r), expected_gone.len());
            let remaining: BTreeSet<i64> = bo
                .clean_blocks()
                .into_iter()
                .chain(bo.dirty_blocks())
                .map(|b| b.0)
                .collect();
            let expected: BTreeSet<i64> = blocks.difference(&expected_gone).copied().collect();
            prop_assert_eq!(remaining, expected);
            prop_assert_eq!(bo.invalidate_range(r), 0);
        }
    }
}
