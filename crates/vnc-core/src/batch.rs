//! Per-CPU staging of "move to tail" requests.
//!
//! When a vnode's last hold goes away it becomes a free candidate and belongs
//! at the list tail. Taking the global list lock for every such transition
//! would serialize all CPUs, so the vnode is parked in a small per-CPU batch
//! instead and the whole batch is spliced under one list-lock acquisition
//! once full.
//!
//! A thread is mapped to a shard through a thread-local index handed out
//! from a global counter (there is no safe way to ask for the current CPU).
//! Each staged vnode records its shard in its batch tag so teardown can pull
//! it back out. Staging is an optimization only: a vnode sitting in a batch
//! is still linked somewhere on the list and scanners treat it normally.
//!
//! # Logging
//!
//! - **TRACE** `vnc::list`: `batch_flush` (one shard spliced to the tail)

use crate::list::VnodeList;
use crate::vnode::Vnode;
use parking_lot::Mutex;
use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::trace;

thread_local! {
    static THREAD_BATCH_ID: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Next thread-local batch id.
static NEXT_BATCH_ID: AtomicUsize = AtomicUsize::new(0);

fn thread_batch_id() -> usize {
    THREAD_BATCH_ID.with(|cell| {
        cell.get().unwrap_or_else(|| {
            let id = NEXT_BATCH_ID.fetch_add(1, Ordering::Relaxed);
            cell.set(Some(id));
            id
        })
    })
}

#[derive(Debug)]
pub(crate) struct BatchSet {
    shards: Vec<Mutex<Vec<Arc<Vnode>>>>,
    size: usize,
}

impl BatchSet {
    pub(crate) fn new(count: usize, size: usize) -> Self {
        let count = count.max(1);
        let size = size.max(1);
        Self {
            shards: (0..count)
                .map(|_| Mutex::new(Vec::with_capacity(size)))
                .collect(),
            size,
        }
    }

    pub(crate) fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn current_shard(&self) -> usize {
        thread_batch_id() % self.shards.len()
    }

    /// Stage `vp` on the calling thread's shard. Returns the number of vnodes
    /// spliced if the shard filled up and was flushed.
    pub(crate) fn enqueue(&self, vp: &Arc<Vnode>, list: &Mutex<VnodeList>) -> Option<usize> {
        let shard = self.current_shard();
        let mut batch = self.shards[shard].lock();
        if vp.batch_tag().is_some() {
            return None;
        }
        vp.set_batch_tag(Some(shard));
        batch.push(Arc::clone(vp));
        if batch.len() < self.size {
            return None;
        }
        Some(Self::splice(shard, &mut batch, list))
    }

    fn splice(shard: usize, batch: &mut Vec<Arc<Vnode>>, list: &Mutex<VnodeList>) -> usize {
        let count = batch.len();
        let mut list = list.lock();
        for vp in batch.drain(..) {
            list.move_to_back(vp.slot());
            vp.set_batch_tag(None);
        }
        drop(list);
        trace!(target: "vnc::list", shard, count, "batch_flush");
        count
    }

    /// Pull `vp` out of whatever shard holds it.
    pub(crate) fn dequeue(&self, vp: &Vnode) -> bool {
        let Some(shard) = vp.batch_tag() else {
            return false;
        };
        let Some(slot) = self.shards.get(shard) else {
            return false;
        };
        let mut batch = slot.lock();
        let Some(pos) = batch.iter().position(|queued| std::ptr::eq(queued.as_ref(), vp)) else {
            return false;
        };
        batch.swap_remove(pos);
        vp.set_batch_tag(None);
        true
    }

    /// Splice every non-empty shard. Returns the number of shards flushed.
    pub(crate) fn flush_all(&self, list: &Mutex<VnodeList>) -> usize {
        let mut flushed = 0;
        for (shard, slot) in self.shards.iter().enumerate() {
            let mut batch = slot.lock();
            if !batch.is_empty() {
                Self::splice(shard, &mut batch, list);
                flushed += 1;
            }
        }
        flushed
    }

    /// Vnodes currently staged across all shards.
    pub(crate) fn pending(&self) -> usize {
        self.shards.iter().map(|slot| slot.lock().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::list::Entry;
    use vnc_types::SlotIndex;

    fn setup(n: u32) -> (Mutex<VnodeList>, Vec<Arc<Vnode>>) {
        let mut list = VnodeList::new();
        let vnodes = (0..n)
            .map(|i| {
                list.insert_front(SlotIndex(i));
                Arc::new(Vnode::new(SlotIndex(i)))
            })
            .collect();
        (Mutex::new(list), vnodes)
    }

    fn tail_slots(list: &Mutex<VnodeList>, n: usize) -> Vec<u32> {
        let entries = list.lock().entries();
        entries[entries.len() - n..]
            .iter()
            .filter_map(|e| match e {
                Entry::Slot(s) => Some(s.0),
                Entry::Marker(_) => None,
            })
            .collect()
    }

    #[test]
    fn full_batch_flushes_to_tail() {
        let (list, vnodes) = setup(4);
        let batches = BatchSet::new(1, 2);

        assert_eq!(batches.enqueue(&vnodes[3], &list), None);
        assert_eq!(vnodes[3].batch_tag(), Some(0));
        assert_eq!(batches.enqueue(&vnodes[1], &list), Some(2));
        assert_eq!(vnodes[3].batch_tag(), None);
        assert_eq!(tail_slots(&list, 2), vec![3, 1]);
        assert_eq!(batches.pending(), 0);
    }

    #[test]
    fn double_enqueue_is_ignored() {
        let (list, vnodes) = setup(2);
        let batches = BatchSet::new(1, 8);
        batches.enqueue(&vnodes[0], &list);
        batches.enqueue(&vnodes[0], &list);
        assert_eq!(batches.pending(), 1);
    }

    #[test]
    fn dequeue_removes_staged_vnode() {
        let (list, vnodes) = setup(3);
        let batches = BatchSet::new(2, 8);
        batches.enqueue(&vnodes[0], &list);
        batches.enqueue(&vnodes[2], &list);
        assert!(batches.dequeue(&vnodes[0]));
        assert!(!batches.dequeue(&vnodes[0]));
        assert_eq!(batches.pending(), 1);

        assert_eq!(batches.flush_all(&list), 1);
        assert_eq!(tail_slots(&list, 1), vec![2]);
        assert_eq!(batches.flush_all(&list), 0);
    }
}
