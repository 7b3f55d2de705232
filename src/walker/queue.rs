//! Three-stage work queue
//!
//! The engine keeps two of these, one for directories to open and one for
//! files to visit. Items move through three intrusive lists:
//!
//! ```text
//!   push ──► buffer ──flush──► waiting ──detach──► (service) ──attach──► ready ──► pop
//! ```
//!
//! `buffer` stages a batch so it can be sorted or pushed as a block onto a
//! stack. `waiting` holds items that still need service (an open or a stat),
//! which may run on the control thread or on the async dispatcher. `ready`
//! holds items that can be popped.
//!
//! With [`QueueFlags::ORDER`] an item goes onto `ready` as soon as it is
//! flushed, in its logical position. Pop then refuses to return an item
//! whose service is still in flight, so completions arriving out of order
//! cannot reorder the output.

use crate::walker::node::{NodeId, Nodes, QueueState};
use bitflags::bitflags;

bitflags! {
    /// Queue behaviour
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct QueueFlags: u8 {
        /// Stage pushes in a buffer until flushed
        const BUFFER = 1 << 0;
        /// Stack order: each flushed batch goes in front
        const LIFO = 1 << 1;
        /// Keep pop order equal to logical order across async completions
        const ORDER = 1 << 2;
        /// Alternate async dispatch with synchronous service
        const BALANCE = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    /// `queue_next`, shared by buffer and waiting
    Queue,
    /// `ready_next`
    Ready,
}

fn next_mut(nodes: &mut Nodes, id: NodeId, link: Link) -> &mut Option<NodeId> {
    match link {
        Link::Queue => &mut nodes[id].queue_next,
        Link::Ready => &mut nodes[id].ready_next,
    }
}

/// Intrusive singly-linked list with a tail pointer
#[derive(Debug, Default, Clone, Copy)]
struct SList {
    head: Option<NodeId>,
    tail: Option<NodeId>,
}

impl SList {
    fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    fn append(&mut self, nodes: &mut Nodes, link: Link, id: NodeId) {
        *next_mut(nodes, id, link) = None;
        match self.tail {
            Some(tail) => *next_mut(nodes, tail, link) = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
    }

    fn prepend(&mut self, nodes: &mut Nodes, link: Link, id: NodeId) {
        *next_mut(nodes, id, link) = self.head;
        if self.head.is_none() {
            self.tail = Some(id);
        }
        self.head = Some(id);
    }

    fn pop_front(&mut self, nodes: &mut Nodes, link: Link) -> Option<NodeId> {
        let id = self.head?;
        self.head = next_mut(nodes, id, link).take();
        if self.head.is_none() {
            self.tail = None;
        }
        Some(id)
    }

    /// Move all of `other` to the end of this list
    fn extend(&mut self, nodes: &mut Nodes, link: Link, other: SList) {
        let Some(head) = other.head else { return };
        match self.tail {
            Some(tail) => *next_mut(nodes, tail, link) = Some(head),
            None => self.head = Some(head),
        }
        self.tail = other.tail;
    }

    /// Move all of `other` to the front of this list, keeping its order
    fn splice_front(&mut self, nodes: &mut Nodes, link: Link, other: SList) {
        let (Some(head), Some(tail)) = (other.head, other.tail) else {
            return;
        };
        *next_mut(nodes, tail, link) = self.head;
        if self.head.is_none() {
            self.tail = Some(tail);
        }
        self.head = Some(head);
    }

    fn collect(&self, nodes: &Nodes, link: Link) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cur = self.head;
        while let Some(id) = cur {
            out.push(id);
            cur = match link {
                Link::Queue => nodes[id].queue_next,
                Link::Ready => nodes[id].ready_next,
            };
        }
        out
    }
}

/// A buffer → waiting → ready queue of nodes
#[derive(Debug)]
pub(crate) struct WorkQueue {
    flags: QueueFlags,
    buffer: SList,
    waiting: SList,
    ready: SList,
    /// Items pushed and not yet popped
    size: usize,
    /// Items with service in flight
    ioqueued: usize,
    /// Synchronous minus asynchronous services
    imbalance: isize,
}

impl WorkQueue {
    pub fn new(flags: QueueFlags) -> Self {
        Self {
            flags,
            buffer: SList::default(),
            waiting: SList::default(),
            ready: SList::default(),
            size: 0,
            ioqueued: 0,
            imbalance: 0,
        }
    }

    pub fn flags(&self) -> QueueFlags {
        self.flags
    }

    #[cfg(test)]
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Items whose service is in flight
    #[cfg(test)]
    pub fn ioqueued(&self) -> usize {
        self.ioqueued
    }

    /// Next item waiting for service
    pub fn waiting_head(&self) -> Option<NodeId> {
        self.waiting.head
    }

    /// Check if the buffer holds unflushed items
    pub fn has_buffered(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Whether a new async dispatch is allowed right now
    pub fn balanced(&self) -> bool {
        !self.flags.contains(QueueFlags::BALANCE) || self.imbalance >= 0
    }

    /// Add an item
    pub fn push(&mut self, nodes: &mut Nodes, id: NodeId) {
        debug_assert!(nodes[id].queue_state.is_empty());

        if self.flags.contains(QueueFlags::BUFFER) {
            nodes[id].queue_state = QueueState::BUFFERED;
            self.buffer.append(nodes, Link::Queue, id);
        } else {
            let order = self.flags.contains(QueueFlags::ORDER);
            nodes[id].queue_state = if order {
                QueueState::WAITING | QueueState::READY
            } else {
                QueueState::WAITING
            };

            if self.flags.contains(QueueFlags::LIFO) {
                self.waiting.prepend(nodes, Link::Queue, id);
                if order {
                    self.ready.prepend(nodes, Link::Ready, id);
                }
            } else {
                self.waiting.append(nodes, Link::Queue, id);
                if order {
                    self.ready.append(nodes, Link::Ready, id);
                }
            }
        }

        self.size += 1;
    }

    /// Make everything in the buffer visible, as one batch
    pub fn flush(&mut self, nodes: &mut Nodes) {
        if self.buffer.is_empty() {
            return;
        }

        let batch = std::mem::take(&mut self.buffer);
        let order = self.flags.contains(QueueFlags::ORDER);

        let mut ready = SList::default();
        for id in batch.collect(nodes, Link::Queue) {
            let node = &mut nodes[id];
            node.queue_state.remove(QueueState::BUFFERED);
            node.queue_state.insert(QueueState::WAITING);
            if order {
                node.queue_state.insert(QueueState::READY);
                ready.append(nodes, Link::Ready, id);
            }
        }

        if self.flags.contains(QueueFlags::LIFO) {
            self.waiting.splice_front(nodes, Link::Queue, batch);
            self.ready.splice_front(nodes, Link::Ready, ready);
        } else {
            self.waiting.extend(nodes, Link::Queue, batch);
            self.ready.extend(nodes, Link::Ready, ready);
        }
    }

    /// Sort the buffer by name
    pub fn sort_buffer(&mut self, nodes: &mut Nodes) {
        let mut ids = self.buffer.collect(nodes, Link::Queue);
        if ids.len() < 2 {
            return;
        }
        ids.sort_by(|&a, &b| nodes[a].name.cmp(&nodes[b].name));

        self.buffer = SList::default();
        for id in ids {
            self.buffer.append(nodes, Link::Queue, id);
        }
    }

    /// Take the next waiting item to start servicing it
    pub fn detach(&mut self, nodes: &mut Nodes, is_async: bool) -> Option<NodeId> {
        let id = self.waiting.pop_front(nodes, Link::Queue)?;
        let node = &mut nodes[id];
        node.queue_state.remove(QueueState::WAITING);
        if is_async {
            node.queue_state.insert(QueueState::IOQUEUED);
            self.ioqueued += 1;
            self.imbalance -= 1;
        }
        Some(id)
    }

    /// Service for `id` is done
    pub fn attach(&mut self, nodes: &mut Nodes, id: NodeId, is_async: bool) {
        if is_async {
            debug_assert!(nodes[id].queue_state.contains(QueueState::IOQUEUED));
            nodes[id].queue_state.remove(QueueState::IOQUEUED);
            self.ioqueued -= 1;
        }

        if !self.flags.contains(QueueFlags::ORDER) {
            nodes[id].queue_state.insert(QueueState::READY);
            self.ready.append(nodes, Link::Ready, id);
        }
    }

    /// Move the next waiting item straight to ready
    pub fn skip(&mut self, nodes: &mut Nodes) -> Option<NodeId> {
        let id = self.detach(nodes, false)?;
        self.attach(nodes, id, false);
        Some(id)
    }

    /// Pop the next item
    ///
    /// An item taken from `waiting` without async service must be serviced
    /// synchronously by the caller. `None` with a non-empty queue means
    /// the caller has to wait for an async completion first.
    pub fn pop(&mut self, nodes: &mut Nodes) -> Option<NodeId> {
        debug_assert!(self.buffer.is_empty(), "pop before flush");

        if self.flags.contains(QueueFlags::ORDER) {
            let head = self.ready.head?;
            let state = nodes[head].queue_state;
            if state.contains(QueueState::IOQUEUED) {
                return None;
            }
            if state.contains(QueueState::WAITING) {
                debug_assert_eq!(self.waiting.head, Some(head));
                self.skip(nodes);
                self.imbalance += 1;
            }
        } else if self.ready.is_empty() {
            if self.waiting.is_empty() {
                return None;
            }
            if self.ioqueued > 0 && !self.flags.contains(QueueFlags::BALANCE) {
                return None;
            }
            self.skip(nodes);
            self.imbalance += 1;
        }

        let id = self.ready.pop_front(nodes, Link::Ready)?;
        nodes[id].queue_state = QueueState::empty();
        self.size -= 1;
        Some(id)
    }

    /// Forget every item, for teardown
    pub fn clear(&mut self) {
        *self = Self::new(self.flags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FileType;

    fn make(nodes: &mut Nodes, names: &[&str]) -> Vec<NodeId> {
        names
            .iter()
            .map(|n| nodes.create(None, n.as_bytes(), FileType::File))
            .collect()
    }

    fn drain(queue: &mut WorkQueue, nodes: &mut Nodes) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(id) = queue.pop(nodes) {
            out.push(String::from_utf8(nodes[id].name.to_vec()).unwrap());
        }
        out
    }

    #[test]
    fn test_fifo() {
        let mut nodes = Nodes::new();
        let mut queue = WorkQueue::new(QueueFlags::empty());
        for id in make(&mut nodes, &["a", "b", "c"]) {
            queue.push(&mut nodes, id);
        }
        assert_eq!(queue.size(), 3);
        assert_eq!(drain(&mut queue, &mut nodes), vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_lifo_batches_keep_order() {
        let mut nodes = Nodes::new();
        let mut queue = WorkQueue::new(QueueFlags::BUFFER | QueueFlags::LIFO);

        for id in make(&mut nodes, &["a", "b"]) {
            queue.push(&mut nodes, id);
        }
        queue.flush(&mut nodes);
        for id in make(&mut nodes, &["c", "d"]) {
            queue.push(&mut nodes, id);
        }
        queue.flush(&mut nodes);

        assert_eq!(drain(&mut queue, &mut nodes), vec!["c", "d", "a", "b"]);
    }

    #[test]
    fn test_sort_buffer() {
        let mut nodes = Nodes::new();
        let mut queue = WorkQueue::new(QueueFlags::BUFFER);
        for id in make(&mut nodes, &["zeta", "alpha", "mid"]) {
            queue.push(&mut nodes, id);
        }
        assert!(queue.has_buffered());
        queue.sort_buffer(&mut nodes);
        queue.flush(&mut nodes);
        assert_eq!(drain(&mut queue, &mut nodes), vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_async_completions_out_of_order() {
        let mut nodes = Nodes::new();
        let mut queue = WorkQueue::new(QueueFlags::empty());
        let ids = make(&mut nodes, &["a", "b"]);
        for &id in &ids {
            queue.push(&mut nodes, id);
        }

        let a = queue.detach(&mut nodes, true).unwrap();
        let b = queue.detach(&mut nodes, true).unwrap();
        assert_eq!(queue.ioqueued(), 2);
        assert_eq!(queue.pop(&mut nodes), None);

        queue.attach(&mut nodes, b, true);
        queue.attach(&mut nodes, a, true);
        assert_eq!(drain(&mut queue, &mut nodes), vec!["b", "a"]);
    }

    #[test]
    fn test_strict_order_waits_for_head() {
        let mut nodes = Nodes::new();
        let mut queue = WorkQueue::new(QueueFlags::BUFFER | QueueFlags::ORDER);
        let ids = make(&mut nodes, &["a", "b", "c"]);
        for &id in &ids {
            queue.push(&mut nodes, id);
        }
        queue.flush(&mut nodes);

        let a = queue.detach(&mut nodes, true).unwrap();
        let b = queue.detach(&mut nodes, true).unwrap();
        queue.attach(&mut nodes, b, true);

        // "b" is done but "a" is not
        assert_eq!(queue.pop(&mut nodes), None);
        queue.attach(&mut nodes, a, true);

        // "c" was never serviced; pop services it synchronously
        assert_eq!(drain(&mut queue, &mut nodes), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_skip_needs_no_service() {
        let mut nodes = Nodes::new();
        let mut queue = WorkQueue::new(QueueFlags::empty());
        let ids = make(&mut nodes, &["a"]);
        queue.push(&mut nodes, ids[0]);
        assert_eq!(queue.skip(&mut nodes), Some(ids[0]));
        assert_eq!(queue.waiting_head(), None);
        assert_eq!(queue.pop(&mut nodes), Some(ids[0]));
    }

    #[test]
    fn test_balance() {
        let mut nodes = Nodes::new();
        let mut queue = WorkQueue::new(QueueFlags::BALANCE);
        for id in make(&mut nodes, &["a", "b", "c"]) {
            queue.push(&mut nodes, id);
        }

        assert!(queue.balanced());
        let a = queue.detach(&mut nodes, true).unwrap();
        assert!(!queue.balanced());

        // A forced synchronous service restores the balance
        assert_eq!(queue.pop(&mut nodes).map(|id| nodes[id].name.to_vec()), Some(b"b".to_vec()));
        assert!(queue.balanced());

        queue.attach(&mut nodes, a, true);
        assert_eq!(drain(&mut queue, &mut nodes), vec!["a", "c"]);
    }

    #[test]
    fn test_unbalanced_queue_ignores_counter() {
        let mut nodes = Nodes::new();
        let mut queue = WorkQueue::new(QueueFlags::empty());
        for id in make(&mut nodes, &["a", "b"]) {
            queue.push(&mut nodes, id);
        }
        queue.detach(&mut nodes, true).unwrap();
        assert!(queue.balanced());
        // Multiple workers: wait for the completion instead of working
        assert_eq!(queue.pop(&mut nodes), None);
    }
}
