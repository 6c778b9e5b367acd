//! LRU Tracker Module
//!
//! Implements Least Recently Used tracking for cache eviction.

use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug)]
struct Node<K> {
    key: K,
    prev: Option<usize>,
    next: Option<usize>,
}

// == LRU Tracker ==
/// Tracks access order for LRU eviction strategy.
///
/// Keys live in a doubly linked list stored in a slab, with a hash index from
/// key to slot:
/// - Head = Most recently used
/// - Tail = Least recently used
///
/// `touch`, `remove` and `evict_oldest` are all O(1). Every indexed key has
/// exactly one linked node and every linked node is indexed.
#[derive(Debug)]
pub struct LruTracker<K> {
    nodes: Vec<Option<Node<K>>>,
    free: Vec<usize>,
    index: HashMap<K, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<K> Default for LruTracker<K> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
        }
    }
}

impl<K: Hash + Eq + Clone> LruTracker<K> {
    // == Constructor ==
    /// Creates a new empty LRU tracker.
    pub fn new() -> Self {
        Self::default()
    }

    // == Touch ==
    /// Marks a key as recently used (moves to front).
    ///
    /// If the key is new it is linked in at the front.
    pub fn touch(&mut self, key: &K) {
        if let Some(&idx) = self.index.get(key) {
            if self.head != Some(idx) {
                self.unlink(idx);
                self.push_front(idx);
            }
            return;
        }

        let node = Node {
            key: key.clone(),
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.index.insert(key.clone(), idx);
        self.push_front(idx);
    }

    // == Remove ==
    /// Removes a key from the tracker. Returns whether it was tracked.
    pub fn remove(&mut self, key: &K) -> bool {
        match self.index.remove(key) {
            Some(idx) => {
                self.unlink(idx);
                self.release(idx);
                true
            }
            None => false,
        }
    }

    // == Evict Oldest ==
    /// Returns and removes the least recently used key.
    ///
    /// Returns None if tracker is empty.
    pub fn evict_oldest(&mut self) -> Option<K> {
        let idx = self.tail?;
        self.unlink(idx);
        let node = self.release(idx)?;
        self.index.remove(&node.key);
        Some(node.key)
    }

    // == Peek Oldest ==
    /// Returns the least recently used key without removing it.
    pub fn peek_oldest(&self) -> Option<&K> {
        self.tail.and_then(|idx| self.node(idx)).map(|node| &node.key)
    }

    // == Length ==
    /// Returns the number of tracked keys.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    // == Is Empty ==
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    // == Contains ==
    /// Checks if a key is being tracked.
    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    // == Clear ==
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
    }

    // == Iterate ==
    /// Iterates keys from most to least recently used.
    pub fn iter(&self) -> impl Iterator<Item = &K> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let node = self.node(cursor?)?;
            cursor = node.next;
            Some(&node.key)
        })
    }

    /// Walks the list and checks it against the index.
    pub(crate) fn check_invariants(&self) -> bool {
        let mut seen = 0;
        let mut prev = None;
        let mut cursor = self.head;

        while let Some(idx) = cursor {
            let Some(node) = self.node(idx) else {
                return false;
            };
            if node.prev != prev || self.index.get(&node.key) != Some(&idx) {
                return false;
            }
            seen += 1;
            if seen > self.index.len() {
                return false;
            }
            prev = Some(idx);
            cursor = node.next;
        }

        prev == self.tail && seen == self.index.len()
    }

    fn node(&self, idx: usize) -> Option<&Node<K>> {
        self.nodes.get(idx).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, idx: usize) -> Option<&mut Node<K>> {
        self.nodes.get_mut(idx).and_then(Option::as_mut)
    }

    fn unlink(&mut self, idx: usize) {
        let Some((prev, next)) = self.node(idx).map(|node| (node.prev, node.next)) else {
            return;
        };

        match prev.and_then(|p| self.node_mut(p)) {
            Some(prev_node) => prev_node.next = next,
            None => self.head = next,
        }
        match next.and_then(|n| self.node_mut(n)) {
            Some(next_node) => next_node.prev = prev,
            None => self.tail = prev,
        }
        if let Some(node) = self.node_mut(idx) {
            node.prev = None;
            node.next = None;
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(node) = self.node_mut(idx) {
            node.prev = None;
            node.next = old_head;
        }
        match old_head.and_then(|h| self.node_mut(h)) {
            Some(head) => head.prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
    }

    fn release(&mut self, idx: usize) -> Option<Node<K>> {
        let node = self.nodes.get_mut(idx)?.take()?;
        self.free.push(idx);
        Some(node)
    }
}
