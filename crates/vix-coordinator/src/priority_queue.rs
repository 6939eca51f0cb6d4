use std::collections::HashMap;

use vix_core::types::UniqueId;

/// Keyed min-heap over worker load.
///
/// The top entry is the worker with the fewest in-flight tasks; ties break on
/// insertion sequence so selection is deterministic. Priorities are adjusted
/// in place (`inc_priority` / `update_priority`) with the heap re-sifted
/// around the touched entry.
#[derive(Debug, Default)]
pub struct PriorityQueue {
    heap: Vec<Entry>,
    pos: HashMap<UniqueId, usize>,
    next_seq: u64,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    node_id: UniqueId,
    priority: i64,
    seq: u64,
}

impl Entry {
    fn rank(&self) -> (i64, u64) {
        (self.priority, self.seq)
    }
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, node_id: UniqueId) -> bool {
        self.pos.contains_key(&node_id)
    }

    /// Inserts with priority 0. Returns false (and leaves the existing entry
    /// untouched) if the node is already present.
    pub fn push(&mut self, node_id: UniqueId) -> bool {
        if self.pos.contains_key(&node_id) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let idx = self.heap.len();
        self.heap.push(Entry {
            node_id,
            priority: 0,
            seq,
        });
        self.pos.insert(node_id, idx);
        self.sift_up(idx);
        true
    }

    pub fn remove(&mut self, node_id: UniqueId) -> bool {
        let Some(idx) = self.pos.remove(&node_id) else {
            return false;
        };
        let last = self.heap.len() - 1;
        self.heap.swap(idx, last);
        self.heap.pop();
        if idx < self.heap.len() {
            self.pos.insert(self.heap[idx].node_id, idx);
            let idx = self.sift_up(idx);
            self.sift_down(idx);
        }
        true
    }

    /// The lowest-loaded worker, without removing it.
    pub fn peek(&self) -> Option<(UniqueId, i64)> {
        self.heap.first().map(|e| (e.node_id, e.priority))
    }

    pub fn priority(&self, node_id: UniqueId) -> Option<i64> {
        self.pos.get(&node_id).map(|&idx| self.heap[idx].priority)
    }

    pub fn inc_priority(&mut self, node_id: UniqueId, delta: i64) {
        let Some(&idx) = self.pos.get(&node_id) else {
            return;
        };
        self.heap[idx].priority += delta;
        let idx = self.sift_up(idx);
        self.sift_down(idx);
    }

    pub fn update_priority(&mut self, node_id: UniqueId, priority: i64) {
        let Some(&idx) = self.pos.get(&node_id) else {
            return;
        };
        self.heap[idx].priority = priority;
        let idx = self.sift_up(idx);
        self.sift_down(idx);
    }

    fn sift_up(&mut self, mut idx: usize) -> usize {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.heap[idx].rank() >= self.heap[parent].rank() {
                break;
            }
            self.swap(idx, parent);
            idx = parent;
        }
        idx
    }

    fn sift_down(&mut self, mut idx: usize) {
        loop {
            let mut smallest = idx;
            for child in [2 * idx + 1, 2 * idx + 2] {
                if child < self.heap.len() && self.heap[child].rank() < self.heap[smallest].rank()
                {
                    smallest = child;
                }
            }
            if smallest == idx {
                return;
            }
            self.swap(idx, smallest);
            idx = smallest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.pos.insert(self.heap[a].node_id, a);
        self.pos.insert(self.heap[b].node_id, b);
    }
}
