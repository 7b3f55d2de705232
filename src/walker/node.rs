//! File nodes and the arena that owns them
//!
//! A [`FileNode`] stands for one path the engine has decided to come back
//! to: a directory waiting to be opened, or a file waiting to be visited.
//! Nodes live in a generational arena and refer to each other by
//! [`NodeId`]. Each node sits in up to three lists at once, each with its
//! own link fields:
//!
//! - a work queue (`queue_next` for buffer/waiting, `ready_next` for ready)
//! - the descriptor LRU (`lru_prev`/`lru_next`)
//! - the pending-close list (`close_next`)
//!
//! Children hold a strong reference on their parent. A node is freed, and
//! its descriptor released, at the exact moment its count drops to zero.

use crate::fs::{Dir, FileType, StatCache};
use bitflags::bitflags;
use std::os::unix::io::RawFd;

/// Handle to a node in a [`Nodes`] arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

bitflags! {
    /// Where a node is in its work queue
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct QueueState: u8 {
        /// On the buffer list
        const BUFFERED = 1 << 0;
        /// On the waiting list
        const WAITING = 1 << 1;
        /// Being serviced by the async dispatcher
        const IOQUEUED = 1 << 2;
        /// On the ready list
        const READY = 1 << 3;
    }
}

/// One encountered path segment
#[derive(Debug)]
pub(crate) struct FileNode {
    /// Parent directory, `None` for roots
    pub parent: Option<NodeId>,
    /// The root of this node's tree
    pub root: NodeId,
    /// Distance from the root (root = 0)
    pub depth: usize,
    /// Strong references: one for the queue holding it, one per live child
    pub refcount: usize,
    /// Pins protecting the descriptor from eviction
    pub pincount: usize,

    /// Open descriptor, if any
    pub fd: Option<RawFd>,
    /// Open directory stream, if any; `fd` is its descriptor
    pub dir: Option<Dir>,
    /// Errno from a failed asynchronous open
    pub open_error: Option<i32>,

    /// Cached type
    pub file_type: FileType,
    /// Cached device and inode
    pub dev_ino: Option<(u64, u64)>,
    /// Cached stat results
    pub stats: StatCache,
    /// Stat is needed before the visit
    pub needs_stat: bool,
    /// Pushed for reading; gets a post-order visit when freed
    pub descended: bool,

    /// Offset of the name within the full path
    pub name_off: usize,
    /// The name itself (the full path, for roots)
    pub name: Box<[u8]>,

    pub queue_state: QueueState,
    pub queue_next: Option<NodeId>,
    pub ready_next: Option<NodeId>,

    pub in_lru: bool,
    pub lru_prev: Option<NodeId>,
    pub lru_next: Option<NodeId>,

    pub closing: bool,
    pub close_next: Option<NodeId>,
}

impl FileNode {
    /// Length of this node's full path
    pub fn path_len(&self) -> usize {
        self.name_off + self.name.len()
    }

    /// Offset of a child's name within the full path
    pub fn child_name_off(&self) -> usize {
        if self.name.ends_with(b"/") {
            self.path_len()
        } else {
            self.path_len() + 1
        }
    }
}

struct Slot {
    generation: u32,
    node: Option<FileNode>,
}

/// Arena of file nodes
///
/// Freed slots go on a free list and are recycled; the generation counter
/// catches stale ids in debug builds.
#[derive(Default)]
pub(crate) struct Nodes {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl Nodes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live nodes
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.live
    }

    /// Create a node
    ///
    /// A child takes a reference on its parent. The new node starts with one
    /// reference of its own, owned by whichever queue it is pushed onto.
    pub fn create(&mut self, parent: Option<NodeId>, name: &[u8], file_type: FileType) -> NodeId {
        let (root, depth, name_off) = match parent {
            Some(p) => {
                let parent = &mut self[p];
                parent.refcount += 1;
                (Some(parent.root), parent.depth + 1, parent.child_name_off())
            }
            None => (None, 0, 0),
        };

        let node = FileNode {
            parent,
            root: NodeId {
                index: 0,
                generation: 0,
            },
            depth,
            refcount: 1,
            pincount: 0,
            fd: None,
            dir: None,
            open_error: None,
            file_type,
            dev_ino: None,
            stats: if file_type == FileType::Whiteout {
                StatCache::for_whiteout()
            } else {
                StatCache::new()
            },
            needs_stat: false,
            descended: false,
            name_off,
            name: name.into(),
            queue_state: QueueState::empty(),
            queue_next: None,
            ready_next: None,
            in_lru: false,
            lru_prev: None,
            lru_next: None,
            closing: false,
            close_next: None,
        };

        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.generation = slot.generation.wrapping_add(1);
                slot.node = Some(node);
                NodeId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                NodeId {
                    index,
                    generation: 0,
                }
            }
        };

        self[id].root = root.unwrap_or(id);
        self.live += 1;
        id
    }

    /// Remove a node from the arena, returning it
    ///
    /// The caller has already released its descriptor and dropped its
    /// reference on the parent.
    pub fn remove(&mut self, id: NodeId) -> FileNode {
        let slot = &mut self.slots[id.index as usize];
        debug_assert_eq!(slot.generation, id.generation, "stale node id");
        let node = slot.node.take().unwrap_or_else(|| panic!("node {id:?} freed twice"));
        self.free.push(id.index);
        self.live -= 1;
        node
    }

    /// Ids of every live node
    pub fn ids(&self) -> Vec<NodeId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.node.is_some())
            .map(|(index, slot)| NodeId {
                index: index as u32,
                generation: slot.generation,
            })
            .collect()
    }

    /// Walk up from `id` (inclusive) to its root
    pub fn ancestors(&self, id: NodeId) -> Ancestors<'_> {
        Ancestors {
            nodes: self,
            next: Some(id),
        }
    }

    /// Nearest strict ancestor with an open descriptor
    pub fn open_base(&self, id: NodeId) -> Option<NodeId> {
        self.ancestors(id).skip(1).find(|&a| self[a].fd.is_some())
    }
}

impl std::ops::Index<NodeId> for Nodes {
    type Output = FileNode;

    fn index(&self, id: NodeId) -> &FileNode {
        let slot = &self.slots[id.index as usize];
        debug_assert_eq!(slot.generation, id.generation, "stale node id");
        slot.node
            .as_ref()
            .unwrap_or_else(|| panic!("node {id:?} used after free"))
    }
}

impl std::ops::IndexMut<NodeId> for Nodes {
    fn index_mut(&mut self, id: NodeId) -> &mut FileNode {
        let slot = &mut self.slots[id.index as usize];
        debug_assert_eq!(slot.generation, id.generation, "stale node id");
        slot.node
            .as_mut()
            .unwrap_or_else(|| panic!("node {id:?} used after free"))
    }
}

/// Iterator from a node up to its root
pub(crate) struct Ancestors<'a> {
    nodes: &'a Nodes,
    next: Option<NodeId>,
}

impl Iterator for Ancestors<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.next?;
        self.next = self.nodes[id].parent;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_links_parent() {
        let mut nodes = Nodes::new();
        let root = nodes.create(None, b"/data", FileType::Directory);
        let child = nodes.create(Some(root), b"sub", FileType::Directory);
        let leaf = nodes.create(Some(child), b"file", FileType::File);

        assert_eq!(nodes[root].refcount, 2);
        assert_eq!(nodes[child].refcount, 2);
        assert_eq!(nodes[leaf].refcount, 1);
        assert_eq!(nodes[leaf].depth, 2);
        assert_eq!(nodes[leaf].root, root);
        assert_eq!(nodes[root].root, root);
        assert_eq!(nodes.len(), 3);
    }

    #[test]
    fn test_name_offsets() {
        let mut nodes = Nodes::new();
        let root = nodes.create(None, b"/data", FileType::Directory);
        let child = nodes.create(Some(root), b"sub", FileType::Directory);
        assert_eq!(nodes[child].name_off, 6); // "/data/"
        assert_eq!(nodes[child].path_len(), 9);

        let slash = nodes.create(None, b"/", FileType::Directory);
        let top = nodes.create(Some(slash), b"etc", FileType::Directory);
        assert_eq!(nodes[top].name_off, 1); // "/"
    }

    #[test]
    fn test_slots_are_recycled() {
        let mut nodes = Nodes::new();
        let a = nodes.create(None, b"a", FileType::File);
        nodes.remove(a);
        let b = nodes.create(None, b"b", FileType::File);
        assert_ne!(a, b);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes.ids(), vec![b]);
    }

    #[test]
    fn test_ancestors_and_base() {
        let mut nodes = Nodes::new();
        let root = nodes.create(None, b"r", FileType::Directory);
        let mid = nodes.create(Some(root), b"m", FileType::Directory);
        let leaf = nodes.create(Some(mid), b"l", FileType::Directory);

        let chain: Vec<_> = nodes.ancestors(leaf).collect();
        assert_eq!(chain, vec![leaf, mid, root]);

        assert_eq!(nodes.open_base(leaf), None);
        nodes[root].fd = Some(7);
        assert_eq!(nodes.open_base(leaf), Some(root));
        assert_eq!(nodes.open_base(root), None);
    }
}
