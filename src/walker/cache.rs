//! Descriptor cache
//!
//! Tracks how many descriptors the walk may still open and which open
//! descriptors can be given back when it runs out. Nodes with an open
//! descriptor sit on an intrusive LRU list (most recent at the head) unless
//! they are pinned. Root-depth nodes are always inserted at the head and
//! everything else right after them, so the top of each tree stays open
//! longest.
//!
//! The cache only does bookkeeping. Actually closing an evicted descriptor,
//! possibly on a worker thread, is up to the engine.

use crate::fs::Stat;
use crate::walker::node::{NodeId, Nodes};

/// Ceiling on simultaneously open directory streams
///
/// Streams carry a read buffer, so they are capped separately from plain
/// descriptors.
pub const MAX_DIR_HANDLES: usize = 1024;

/// Free-list of reusable buffers
#[derive(Debug)]
pub(crate) struct Pool<T> {
    free: Vec<T>,
    limit: usize,
}

impl<T: Default> Pool<T> {
    pub fn new(limit: usize) -> Self {
        Self {
            free: Vec::new(),
            limit,
        }
    }

    /// Take a buffer, allocating if the pool is empty
    pub fn take(&mut self) -> T {
        self.free.pop().unwrap_or_default()
    }

    /// Hand a buffer back
    pub fn give(&mut self, item: T) {
        if self.free.len() < self.limit {
            self.free.push(item);
        }
    }

    /// Buffers available for reuse
    pub fn available(&self) -> usize {
        self.free.len()
    }
}

/// LRU cache of open descriptors
#[derive(Debug)]
pub(crate) struct ResourceCache {
    head: Option<NodeId>,
    tail: Option<NodeId>,
    /// Insertion point; the last root-depth node inserted
    target: Option<NodeId>,
    /// Descriptors that may still be opened
    capacity: usize,
    budget: usize,
    peak: usize,
    /// Open directory streams, and their cap
    dirs: usize,
    dir_limit: usize,
    /// Buffers for asynchronous stat requests
    pub stat_bufs: Pool<Box<Stat>>,
}

impl ResourceCache {
    pub fn new(budget: usize) -> Self {
        let dir_limit = (budget / 2).clamp(1, MAX_DIR_HANDLES);
        Self {
            head: None,
            tail: None,
            target: None,
            capacity: budget,
            budget,
            peak: 0,
            dirs: 0,
            dir_limit,
            stat_bufs: Pool::new(dir_limit),
        }
    }

    /// Descriptors that may be opened without evicting anything
    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Descriptors currently counted as open
    pub fn open_count(&self) -> usize {
        self.budget - self.capacity
    }

    /// Most descriptors ever open at once
    pub fn peak(&self) -> usize {
        self.peak
    }

    /// Least recently used evictable node
    pub fn lru_tail(&self) -> Option<NodeId> {
        self.tail
    }

    /// Claim a descriptor slot, if one is free
    pub fn try_reserve(&mut self) -> bool {
        if self.capacity == 0 {
            return false;
        }
        self.capacity -= 1;
        self.peak = self.peak.max(self.open_count());
        true
    }

    /// Give back a descriptor slot
    pub fn release(&mut self) {
        debug_assert!(self.capacity < self.budget);
        self.capacity += 1;
    }

    /// The OS ran out of descriptors before the budget did
    ///
    /// Lowers the budget to what is open right now.
    pub fn shrink(&mut self) {
        self.budget -= self.capacity;
        self.capacity = 0;
    }

    /// Check if another directory stream may be opened speculatively
    pub fn dir_available(&self) -> bool {
        self.dirs < self.dir_limit
    }

    pub fn add_dir(&mut self) {
        self.dirs += 1;
    }

    pub fn remove_dir(&mut self) {
        debug_assert!(self.dirs > 0);
        self.dirs -= 1;
    }

    /// Start tracking a node whose descriptor just became live
    pub fn add(&mut self, nodes: &mut Nodes, id: NodeId) {
        debug_assert!(nodes[id].fd.is_some());
        if nodes[id].pincount == 0 {
            self.lru_insert(nodes, id);
        }
    }

    /// Stop tracking a node whose descriptor is about to be released
    pub fn remove(&mut self, nodes: &mut Nodes, id: NodeId) {
        if nodes[id].in_lru {
            self.lru_remove(nodes, id);
        }
    }

    /// Protect a node's descriptor from eviction
    pub fn pin(&mut self, nodes: &mut Nodes, id: NodeId) {
        debug_assert!(nodes[id].fd.is_some());
        if nodes[id].pincount == 0 && nodes[id].in_lru {
            self.lru_remove(nodes, id);
        }
        nodes[id].pincount += 1;
    }

    /// Drop one pin, making the descriptor evictable again once unpinned
    pub fn unpin(&mut self, nodes: &mut Nodes, id: NodeId) {
        let node = &mut nodes[id];
        debug_assert!(node.pincount > 0);
        node.pincount -= 1;
        if node.pincount == 0 && node.fd.is_some() && !node.closing {
            self.lru_insert(nodes, id);
        }
    }

    fn lru_insert(&mut self, nodes: &mut Nodes, id: NodeId) {
        debug_assert!(!nodes[id].in_lru);
        let prev = self.target;
        let next = match prev {
            Some(p) => nodes[p].lru_next,
            None => self.head,
        };

        {
            let node = &mut nodes[id];
            node.lru_prev = prev;
            node.lru_next = next;
            node.in_lru = true;
        }
        match prev {
            Some(p) => nodes[p].lru_next = Some(id),
            None => self.head = Some(id),
        }
        match next {
            Some(n) => nodes[n].lru_prev = Some(id),
            None => self.tail = Some(id),
        }

        if nodes[id].depth == 0 {
            self.target = Some(id);
        }
    }

    fn lru_remove(&mut self, nodes: &mut Nodes, id: NodeId) {
        let (prev, next) = {
            let node = &mut nodes[id];
            debug_assert!(node.in_lru);
            node.in_lru = false;
            (node.lru_prev.take(), node.lru_next.take())
        };

        if self.target == Some(id) {
            self.target = prev;
        }
        match prev {
            Some(p) => nodes[p].lru_next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => nodes[n].lru_prev = prev,
            None => self.tail = prev,
        }
    }

    #[cfg(test)]
    fn lru_order(&self, nodes: &Nodes) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cur = self.head;
        while let Some(id) = cur {
            out.push(id);
            cur = nodes[id].lru_next;
        }
        out
    }
}
