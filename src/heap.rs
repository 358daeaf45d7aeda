//! Indexed max-heap keyed by [`crate::types::heap_order`], with a back
//! pointer per entry so the owner can fix an entry's position after its
//! priority changes without a linear scan (spec §3, `TxEntry.heap_index`).

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::types::TxId;

/// One slot in the heap array.
#[derive(Debug, Clone)]
struct Slot {
    tx_id: TxId,
    priority: i32,
    received_at: std::time::Instant,
}

fn slot_order(a: &Slot, b: &Slot) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.received_at.cmp(&b.received_at))
        .then_with(|| a.tx_id.cmp(&b.tx_id))
}

/// A binary max-heap (root = highest priority) over `TxId`s, supporting
/// O(log n) push/pop/remove/fix via an auxiliary `TxId -> index` map.
#[derive(Debug, Default)]
pub struct IndexedHeap {
    slots: Vec<Slot>,
    index: HashMap<TxId, usize>,
}

impl IndexedHeap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, tx_id: &TxId) -> bool {
        self.index.contains_key(tx_id)
    }

    pub fn position(&self, tx_id: &TxId) -> Option<usize> {
        self.index.get(tx_id).copied()
    }

    /// Pushes a new entry. Caller must ensure `tx_id` is not already present.
    pub fn push(&mut self, tx_id: TxId, priority: i32, received_at: std::time::Instant) {
        debug_assert!(!self.index.contains_key(&tx_id));
        let idx = self.slots.len();
        self.slots.push(Slot {
            tx_id,
            priority,
            received_at,
        });
        self.index.insert(tx_id, idx);
        self.sift_up(idx);
    }

    /// Returns the highest-priority id without removing it.
    pub fn peek(&self) -> Option<TxId> {
        self.slots.first().map(|s| s.tx_id)
    }

    /// Removes and returns the highest-priority id.
    pub fn pop(&mut self) -> Option<TxId> {
        if self.slots.is_empty() {
            return None;
        }
        let top = self.swap_remove(0);
        Some(top)
    }

    /// Removes an arbitrary entry by id, if present.
    pub fn remove(&mut self, tx_id: &TxId) -> bool {
        match self.index.get(tx_id).copied() {
            Some(idx) => {
                self.swap_remove(idx);
                true
            }
            None => false,
        }
    }

    /// Updates `priority` for an existing entry and restores heap order.
    pub fn fix(&mut self, tx_id: &TxId, new_priority: i32) {
        if let Some(&idx) = self.index.get(tx_id) {
            self.slots[idx].priority = new_priority;
            self.sift_down(idx);
            self.sift_up(idx);
        }
    }

    /// Snapshots current ids in heap order (root-first, not fully sorted
    /// below the root). Callers needing a total order should `pop()`
    /// repeatedly or sort the result with [`crate::types::heap_order`].
    pub fn ids(&self) -> Vec<TxId> {
        self.slots.iter().map(|s| s.tx_id).collect()
    }

    fn swap_remove(&mut self, idx: usize) -> TxId {
        let last = self.slots.len() - 1;
        self.slots.swap(idx, last);
        let removed = self.slots.pop().expect("non-empty");
        self.index.remove(&removed.tx_id);
        if idx < self.slots.len() {
            self.index.insert(self.slots[idx].tx_id, idx);
            self.sift_down(idx);
            self.sift_up(idx);
        }
        removed.tx_id
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if slot_order(&self.slots[idx], &self.slots[parent]) == Ordering::Less {
                self.swap(idx, parent);
                idx = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        let len = self.slots.len();
        loop {
            let left = 2 * idx + 1;
            let right = 2 * idx + 2;
            let mut best = idx;
            if left < len && slot_order(&self.slots[left], &self.slots[best]) == Ordering::Less {
                best = left;
            }
            if right < len && slot_order(&self.slots[right], &self.slots[best]) == Ordering::Less {
                best = right;
            }
            if best == idx {
                break;
            }
            self.swap(idx, best);
            idx = best;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.slots.swap(a, b);
        self.index.insert(self.slots[a].tx_id, a);
        self.index.insert(self.slots[b].tx_id, b);
    }
}
