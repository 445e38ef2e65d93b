use std::collections::HashMap;

use crate::dispatch::QueueEntry;

struct Slot {
    entry: QueueEntry,
    sequence: u64,
}

/// Binary max-heap of entries keyed by `QueueEntry::key`. Equal priorities
/// come out in insertion order. Not synchronized; callers lock around it.
#[derive(Default)]
pub struct PriorityQueue {
    heap: Vec<Slot>,
    positions: HashMap<String, usize>,
    next_sequence: u64,
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

    pub fn contains(&self, key: &str) -> bool {
        self.positions.contains_key(key)
    }

    /// Adds an entry unless one with the same key is already queued.
    pub fn push(&mut self, mut entry: QueueEntry) -> bool {
        if self.positions.contains_key(&entry.key) {
            return false;
        }
        let index = self.heap.len();
        entry.index = index;
        self.positions.insert(entry.key.clone(), index);
        self.heap.push(Slot { entry, sequence: self.next_sequence });
        self.next_sequence += 1;
        self.sift_up(index);
        true
    }

    pub fn pop(&mut self) -> Option<QueueEntry> {
        if self.heap.is_empty() {
            None
        } else {
            Some(self.remove_at(0))
        }
    }

    pub fn peek(&self) -> Option<&QueueEntry> {
        self.heap.first().map(|slot| &slot.entry)
    }

    pub fn remove(&mut self, key: &str) -> Option<QueueEntry> {
        let index = *self.positions.get(key)?;
        Some(self.remove_at(index))
    }

    /// Changes the priority of a queued entry and restores heap order.
    pub fn update_priority(&mut self, key: &str, priority: i32) -> bool {
        let Some(&index) = self.positions.get(key) else {
            return false;
        };
        self.heap[index].entry.priority = priority;
        self.fix(index);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.heap.iter().map(|slot| &slot.entry)
    }

    fn remove_at(&mut self, index: usize) -> QueueEntry {
        let last = self.heap.len() - 1;
        if index != last {
            self.swap(index, last);
        }
        let slot = self.heap.swap_remove(last);
        self.positions.remove(&slot.entry.key);
        if index < self.heap.len() {
            self.fix(index);
        }
        slot.entry
    }

    fn fix(&mut self, index: usize) {
        if !self.sift_down(index) {
            self.sift_up(index);
        }
    }

    // true when a is served before b
    fn before(&self, a: usize, b: usize) -> bool {
        let (a, b) = (&self.heap[a], &self.heap[b]);
        a.entry.priority > b.entry.priority || (a.entry.priority == b.entry.priority && a.sequence < b.sequence)
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        for index in [a, b] {
            self.heap[index].entry.index = index;
            if let Some(position) = self.positions.get_mut(&self.heap[index].entry.key) {
                *position = index;
            }
        }
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if !self.before(index, parent) {
                break;
            }
            self.swap(index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, start: usize) -> bool {
        let mut index = start;
        loop {
            let left = 2 * index + 1;
            if left >= self.heap.len() {
                break;
            }
            let right = left + 1;
            let child = if right < self.heap.len() && self.before(right, left) { right } else { left };
            if !self.before(child, index) {
                break;
            }
            self.swap(index, child);
            index = child;
        }
        index > start
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        for index in 1..self.heap.len() {
            let parent = (index - 1) / 2;
            assert!(!self.before(index, parent), "heap order broken at {}", index);
        }
        assert_eq!(self.positions.len(), self.heap.len());
        for (index, slot) in self.heap.iter().enumerate() {
            assert_eq!(slot.entry.index, index);
            assert_eq!(self.positions[&slot.entry.key], index);
        }
    }
}
