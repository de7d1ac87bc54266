//! Global recency list.
//!
//! Doubly-linked list over array indices instead of pointers: node 0 is the
//! free-marker, node 1 the reclaim-marker, and pool slot `i` is node `i + 2`.
//! Markers are permanent; pool slots are linked by the pool's construction
//! hook and unlinked by its destruction hook.
//!
//! The head holds recently constructed vnodes; vnodes whose last hold went
//! away are moved to the tail in batches (see [`crate::batch`]). Scanners
//! walk forward from a marker, moving the marker past each entry they look at
//! so the next walk resumes there.
//!
//! The whole structure sits behind one mutex owned by the cache.

use vnc_types::SlotIndex;

const NIL: u32 = u32::MAX;

/// Permanent scanner position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// Allocation-path recycler position.
    Free,
    /// Background reclaimer position.
    Reclaim,
}

impl Marker {
    fn node(self) -> u32 {
        match self {
            Self::Free => 0,
            Self::Reclaim => 1,
        }
    }
}

/// One list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    Marker(Marker),
    Slot(SlotIndex),
}

#[derive(Debug, Clone, Copy)]
struct Link {
    prev: u32,
    next: u32,
    linked: bool,
}

const UNLINKED: Link = Link {
    prev: NIL,
    next: NIL,
    linked: false,
};

#[derive(Debug)]
pub struct VnodeList {
    links: Vec<Link>,
    head: u32,
    tail: u32,
    slots_linked: usize,
}

impl Default for VnodeList {
    fn default() -> Self {
        Self::new()
    }
}

fn slot_node(slot: SlotIndex) -> u32 {
    slot.0 + 2
}

fn node_entry(node: u32) -> Entry {
    match node {
        0 => Entry::Marker(Marker::Free),
        1 => Entry::Marker(Marker::Reclaim),
        n => Entry::Slot(SlotIndex(n - 2)),
    }
}

impl VnodeList {
    /// Empty list holding only the two markers: reclaim-marker first.
    #[must_use]
    pub fn new() -> Self {
        let mut list = Self {
            links: vec![UNLINKED; 2],
            head: NIL,
            tail: NIL,
            slots_linked: 0,
        };
        list.push_front(Marker::Free.node());
        list.push_front(Marker::Reclaim.node());
        list
    }

    fn idx(node: u32) -> usize {
        node as usize
    }

    fn ensure_node(&mut self, node: u32) {
        let needed = Self::idx(node) + 1;
        if self.links.len() < needed {
            self.links.resize(needed, UNLINKED);
        }
    }

    fn push_front(&mut self, node: u32) {
        let old_head = self.head;
        self.links[Self::idx(node)] = Link {
            prev: NIL,
            next: old_head,
            linked: true,
        };
        if old_head == NIL {
            self.tail = node;
        } else {
            self.links[Self::idx(old_head)].prev = node;
        }
        self.head = node;
    }

    fn push_back(&mut self, node: u32) {
        let old_tail = self.tail;
        self.links[Self::idx(node)] = Link {
            prev: old_tail,
            next: NIL,
            linked: true,
        };
        if old_tail == NIL {
            self.head = node;
        } else {
            self.links[Self::idx(old_tail)].next = node;
        }
        self.tail = node;
    }

    fn insert_after(&mut self, anchor: u32, node: u32) {
        let next = self.links[Self::idx(anchor)].next;
        self.links[Self::idx(node)] = Link {
            prev: anchor,
            next,
            linked: true,
        };
        self.links[Self::idx(anchor)].next = node;
        if next == NIL {
            self.tail = node;
        } else {
            self.links[Self::idx(next)].prev = node;
        }
    }

    fn unlink(&mut self, node: u32) -> bool {
        let Some(link) = self.links.get(Self::idx(node)).copied() else {
            return false;
        };
        if !link.linked {
            return false;
        }
        if link.prev == NIL {
            self.head = link.next;
        } else {
            self.links[Self::idx(link.prev)].next = link.next;
        }
        if link.next == NIL {
            self.tail = link.prev;
        } else {
            self.links[Self::idx(link.next)].prev = link.prev;
        }
        self.links[Self::idx(node)] = UNLINKED;
        true
    }

    /// Link a newly constructed slot at the head.
    pub fn insert_front(&mut self, slot: SlotIndex) {
        let node = slot_node(slot);
        self.ensure_node(node);
        if self.unlink(node) {
            self.slots_linked -= 1;
        }
        self.push_front(node);
        self.slots_linked += 1;
    }

    /// Move a slot to the tail (free-candidate end). Unlinked slots are
    /// ignored; returns whether the slot moved.
    pub fn move_to_back(&mut self, slot: SlotIndex) -> bool {
        let node = slot_node(slot);
        if !self.unlink(node) {
            return false;
        }
        self.push_back(node);
        true
    }

    pub fn remove(&mut self, slot: SlotIndex) -> bool {
        let removed = self.unlink(slot_node(slot));
        if removed {
            self.slots_linked -= 1;
        }
        removed
    }

    #[must_use]
    pub fn contains(&self, slot: SlotIndex) -> bool {
        self.links
            .get(Self::idx(slot_node(slot)))
            .is_some_and(|link| link.linked)
    }

    /// Entry right after the marker, `None` at the tail.
    #[must_use]
    pub fn next_after(&self, marker: Marker) -> Option<Entry> {
        match self.links[Self::idx(marker.node())].next {
            NIL => None,
            node => Some(node_entry(node)),
        }
    }

    /// Reposition the marker right after `entry`.
    pub fn move_marker_after(&mut self, marker: Marker, entry: Entry) {
        let anchor = match entry {
            Entry::Marker(other) => other.node(),
            Entry::Slot(slot) => slot_node(slot),
        };
        let anchored = self
            .links
            .get(Self::idx(anchor))
            .is_some_and(|link| link.linked);
        if anchor == marker.node() || !anchored {
            return;
        }
        self.unlink(marker.node());
        self.insert_after(anchor, marker.node());
    }

    /// Reposition the marker at the head (scan wrap-around).
    pub fn move_marker_to_front(&mut self, marker: Marker) {
        self.unlink(marker.node());
        self.push_front(marker.node());
    }

    /// Number of linked pool slots (markers excluded).
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots_linked
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots_linked == 0
    }

    /// Entries head to tail.
    #[must_use]
    pub fn entries(&self) -> Vec<Entry> {
        let mut out = Vec::with_capacity(self.slots_linked + 2);
        let mut node = self.head;
        while node != NIL {
            out.push(node_entry(node));
            node = self.links[Self::idx(node)].next;
        }
        out
    }
}
