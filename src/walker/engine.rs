//! The traversal engine
//!
//! One control thread drives the whole walk:
//!
//! ```text
//! roots ──visit──► dirq ──open──► read entries ──┬── visit now
//!                   ▲                             └── fileq ──(stat)──► visit
//!                   └───────── Continue on a directory ◄──────────────┘
//! ```
//!
//! Opens and stats may be handed to the async dispatcher; completions are
//! consumed here, on the control thread, so the queues and the descriptor
//! cache are never shared. Every directory holds a reference on its parent,
//! and a node is freed (with its post-order visit, if any) the moment its
//! last reference goes away.

use crate::error::{Result, WalkerError, WorkerError};
use crate::fs::dir::{close_fd, open_dirfd, Dir, DirEntry, AT_FDCWD};
use crate::fs::{FileType, MountTable, StatCache, StatFlags};
use crate::walker::cache::ResourceCache;
use crate::walker::dispatcher::{AsyncDispatcher, Completion, Request};
use crate::walker::node::{NodeId, Nodes};
use crate::walker::options::{Action, Strategy, WalkFlags};
use crate::walker::queue::{QueueFlags, WorkQueue};
use crate::walker::visit::{Visit, VisitKind};
use crate::walker::WalkStats;
use std::ffi::{CStr, CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use tracing::{debug, trace};

/// The callback as the engine sees it
pub(crate) type Callback<'a> = dyn FnMut(&Visit<'_>) -> Action + 'a;

/// Parameters of a single engine pass
pub(crate) struct Pass<'a> {
    pub roots: &'a [PathBuf],
    pub flags: WalkFlags,
    /// `Bfs` or `Dfs`; deepening runs on top of `Dfs`
    pub strategy: Strategy,
    pub budget: usize,
    pub mount_table: Option<&'a dyn MountTable>,
}

/// Why the control loop stopped early
enum Halt {
    /// The callback asked to stop
    Stopped,
    /// A fatal error
    Failed(WalkerError),
}

impl From<WorkerError> for Halt {
    fn from(e: WorkerError) -> Self {
        Halt::Failed(e.into())
    }
}

type Step<T = ()> = std::result::Result<T, Halt>;

/// An open descriptor not (yet) owned by a node
enum Handle {
    Dir(Dir),
    Fd(RawFd),
}

/// Something about to get a pre-order visit
struct Target {
    parent: Option<NodeId>,
    depth: usize,
    name_off: usize,
    file_type: FileType,
}

/// What to do with a file after its pre-order visit
enum Decision {
    /// Not visited at all
    Skip,
    /// Visited, nothing further
    Leaf,
    /// Visited, and its contents should be read
    Descend {
        file_type: FileType,
        dev_ino: Option<(u64, u64)>,
    },
    /// A mount point visited without its contents; still owes a post visit
    Withheld {
        file_type: FileType,
        dev_ino: Option<(u64, u64)>,
    },
}

fn errno_of(err: &std::io::Error) -> i32 {
    err.raw_os_error().unwrap_or(libc::EIO)
}

fn stat_flags_for(flags: WalkFlags, depth: usize) -> StatFlags {
    let follow = if depth == 0 {
        flags.intersects(WalkFlags::FOLLOW_ROOTS | WalkFlags::FOLLOW_ALL)
    } else {
        flags.contains(WalkFlags::FOLLOW_ALL)
    };
    if follow {
        StatFlags::TRYFOLLOW
    } else {
        StatFlags::NOFOLLOW
    }
}

/// Copy a node's name (and separator) into its place in `path`
fn write_name(path: &mut [u8], nodes: &Nodes, id: NodeId) {
    let node = &nodes[id];
    path[node.name_off..node.path_len()].copy_from_slice(&node.name);
    if let Some(parent) = node.parent {
        let parent_len = nodes[parent].path_len();
        if node.name_off > parent_len {
            path[parent_len] = b'/';
        }
    }
}

fn depth_of(nodes: &Nodes, id: Option<NodeId>) -> isize {
    id.map_or(-1, |id| nodes[id].depth as isize)
}

pub(crate) struct Engine<'a, 'c> {
    pass: &'a Pass<'a>,
    flags: WalkFlags,
    callback: &'a mut Callback<'c>,
    ioq: Option<&'a mut AsyncDispatcher<NodeId>>,
    stats: &'a mut WalkStats,

    nodes: Nodes,
    cache: ResourceCache,
    dirq: WorkQueue,
    fileq: WorkQueue,

    /// Path of the file being worked on
    path: Vec<u8>,
    /// The node whose path (or a descendant's) is in `path`
    previous: Option<NodeId>,
    /// Directories waiting for their pins to drop before being unwrapped
    to_close: Option<NodeId>,
    /// First fatal error noticed outside the normal call chain
    error: Option<WalkerError>,
}

impl<'a, 'c> Engine<'a, 'c> {
    pub fn new(
        pass: &'a Pass<'a>,
        ioq: Option<&'a mut AsyncDispatcher<NodeId>>,
        callback: &'a mut Callback<'c>,
        stats: &'a mut WalkStats,
    ) -> Self {
        let flags = pass.flags;

        let mut dirq_flags = QueueFlags::empty();
        let mut fileq_flags = QueueFlags::BUFFER;
        if pass.strategy == Strategy::Dfs {
            dirq_flags |= QueueFlags::BUFFER | QueueFlags::LIFO;
        }
        if flags.contains(WalkFlags::SORT) {
            dirq_flags |= QueueFlags::ORDER;
            fileq_flags |= QueueFlags::ORDER;
        }
        if ioq.as_ref().is_some_and(|q| q.threads() == 1) {
            dirq_flags |= QueueFlags::BALANCE;
            fileq_flags |= QueueFlags::BALANCE;
        }

        Self {
            pass,
            flags,
            callback,
            ioq,
            stats,
            nodes: Nodes::new(),
            cache: ResourceCache::new(pass.budget),
            dirq: WorkQueue::new(dirq_flags),
            fileq: WorkQueue::new(fileq_flags),
            path: Vec::with_capacity(libc::PATH_MAX as usize),
            previous: None,
            to_close: None,
            error: None,
        }
    }

    /// Run the pass to completion, then release everything
    pub fn run(mut self) -> Result<()> {
        let result = self.walk();
        self.teardown();
        let deferred = self.error.take();

        match result {
            Err(Halt::Failed(e)) => Err(e),
            Ok(()) | Err(Halt::Stopped) => deferred.map_or(Ok(()), Err),
        }
    }

    fn walk(&mut self) -> Step {
        debug!(
            roots = self.pass.roots.len(),
            strategy = %self.pass.strategy,
            budget = self.pass.budget,
            "Starting pass"
        );

        let roots = self.pass.roots;
        for root in roots {
            let id = self
                .nodes
                .create(None, root.as_os_str().as_bytes(), FileType::Unknown);
            self.visit_node(id)?;
            self.check()?;
        }

        loop {
            self.drain(false);
            self.close_pending();
            self.check()?;
            self.fill_ioq()?;

            if let Some(id) = self.fileq.pop(&mut self.nodes) {
                self.visit_node(id)?;
                continue;
            }

            // Files still in flight; with strict order they go first
            if !self.fileq.is_empty()
                && (self.fileq.flags().contains(QueueFlags::ORDER) || self.dirq.is_empty())
            {
                self.wait()?;
                continue;
            }

            self.dirq.flush(&mut self.nodes);
            if let Some(id) = self.dirq.pop(&mut self.nodes) {
                self.read_dir(id)?;
                continue;
            }

            if self.dirq.is_empty() && self.fileq.is_empty() {
                return Ok(());
            }
            self.wait()?;
        }
    }

    /// Surface an error recorded out of band
    fn check(&mut self) -> Step {
        match self.error.take() {
            Some(e) => Err(Halt::Failed(e)),
            None => Ok(()),
        }
    }

    fn defer(&mut self, err: WalkerError) {
        self.error.get_or_insert(err);
    }

    fn path_buf(&self) -> PathBuf {
        PathBuf::from(OsStr::from_bytes(&self.path))
    }

    /// Block until at least one async completion has been handled
    fn wait(&mut self) -> Step {
        if self.drain(true) == 0 {
            self.check()?;
            return Err(WorkerError::Disconnected.into());
        }
        Ok(())
    }

    /// Make `path` hold the path of `id`, reusing the prefix shared with
    /// the previous node
    fn build_path(&mut self, id: NodeId) {
        let len = self.nodes[id].path_len();
        self.path.resize(len, 0);

        let nodes = &self.nodes;
        let mut a = Some(id);
        let mut b = self.previous;
        while depth_of(nodes, a) > depth_of(nodes, b) {
            if let Some(n) = a {
                write_name(&mut self.path, nodes, n);
                a = nodes[n].parent;
            }
        }
        while depth_of(nodes, b) > depth_of(nodes, a) {
            b = b.and_then(|n| nodes[n].parent);
        }
        while a != b {
            if let Some(n) = a {
                write_name(&mut self.path, nodes, n);
                a = nodes[n].parent;
            }
            b = b.and_then(|n| nodes[n].parent);
        }

        self.previous = Some(id);
    }

    fn must_stat(&self, file_type: FileType, depth: usize, name: &[u8]) -> bool {
        let flags = self.flags;
        if flags.contains(WalkFlags::STAT) {
            return true;
        }

        let mounts = flags.intersects(WalkFlags::SKIP_MOUNTS | WalkFlags::PRUNE_MOUNTS);
        let needed = match file_type {
            FileType::Unknown => true,
            FileType::Directory => mounts || flags.contains(WalkFlags::DETECT_CYCLES),
            FileType::Symlink => stat_flags_for(flags, depth).contains(StatFlags::FOLLOW),
            _ => false,
        };

        needed
            || (mounts
                && self
                    .pass
                    .mount_table
                    .is_some_and(|table| table.might_be_mount(name)))
    }

    fn must_buffer(&self, entry: &DirEntry, depth: usize) -> bool {
        self.flags.intersects(WalkFlags::SORT | WalkFlags::BUFFER)
            || (self.ioq.is_some() && self.must_stat(entry.file_type, depth, &entry.name))
    }

    /// Descriptor and relative path offset for `*at()` calls on a child of
    /// `parent` whose name starts at `name_off`
    fn at_for(&mut self, parent: Option<NodeId>, name_off: usize) -> (RawFd, usize) {
        let Some(parent) = parent else {
            return (AT_FDCWD, 0);
        };
        if let Some(fd) = self.nodes[parent].fd {
            return (fd, name_off);
        }
        if self.path.len() >= libc::PATH_MAX as usize && self.open_node(parent, false).is_ok() {
            if let Some(fd) = self.nodes[parent].fd {
                return (fd, name_off);
            }
        }
        (AT_FDCWD, 0)
    }

    fn pre_visit(&mut self, target: &Target, stats: &StatCache) -> Step<Decision> {
        let flags = self.flags;
        let stat_flags = stat_flags_for(flags, target.depth);
        let (at_fd, at_off) = self.at_for(target.parent, target.name_off);

        let mut file_type = target.file_type;
        let mut errno = None;
        let mut dev_ino = None;
        let mut loop_len = None;

        if self.must_stat(file_type, target.depth, &self.path[target.name_off..]) {
            match stats.get(at_fd, &self.path[at_off..], stat_flags) {
                Ok(st) => {
                    file_type = st.file_type();
                    dev_ino = Some(st.dev_ino());
                }
                Err(e) => {
                    errno = Some(e);
                    file_type = FileType::Error;
                }
            }
        } else if let Some(Ok(st)) = stats.cached(stat_flags) {
            file_type = st.file_type();
            dev_ino = Some(st.dev_ino());
        }

        if file_type == FileType::Directory && flags.contains(WalkFlags::DETECT_CYCLES) {
            if let (Some(parent), Some(id)) = (target.parent, dev_ino) {
                let nodes = &self.nodes;
                if let Some(ancestor) = nodes.ancestors(parent).find(|&a| nodes[a].dev_ino == Some(id)) {
                    errno = Some(libc::ELOOP);
                    file_type = FileType::Error;
                    loop_len = Some(nodes[ancestor].path_len());
                }
            }
        }

        let mut mount_pruned = false;
        if errno.is_none() && flags.intersects(WalkFlags::SKIP_MOUNTS | WalkFlags::PRUNE_MOUNTS) {
            if let (Some(parent), Some((dev, _))) = (target.parent, dev_ino) {
                let crossed = self.nodes[parent]
                    .dev_ino
                    .is_some_and(|(parent_dev, _)| parent_dev != dev);
                if crossed {
                    if flags.contains(WalkFlags::SKIP_MOUNTS) {
                        trace!(path = %self.path_buf().display(), "Skipping mount point");
                        return Ok(Decision::Skip);
                    }
                    mount_pruned = true;
                }
            }
        }

        if let Some(e) = errno {
            if !flags.contains(WalkFlags::RECOVER) {
                return Err(Halt::Failed(WalkerError::path(self.path_buf(), e)));
            }
        }

        let root_len = match target.parent {
            Some(parent) => self.nodes[self.nodes[parent].root].path_len(),
            None => self.path.len(),
        };

        let visit = Visit {
            path: &self.path,
            root_len,
            name_off: target.name_off,
            depth: target.depth,
            kind: VisitKind::Pre,
            file_type,
            errno,
            read_error: false,
            loop_len,
            at_fd,
            at_off,
            stat_flags,
            stats,
        };

        match (self.callback)(&visit) {
            Action::Stop => Err(Halt::Stopped),
            Action::Prune => Ok(Decision::Leaf),
            Action::Continue if file_type == FileType::Directory => {
                if mount_pruned {
                    Ok(Decision::Withheld { file_type, dev_ino })
                } else {
                    Ok(Decision::Descend { file_type, dev_ino })
                }
            }
            Action::Continue => Ok(Decision::Leaf),
        }
    }

    /// Visit a root or a queued file
    fn visit_node(&mut self, id: NodeId) -> Step {
        self.build_path(id);

        let target = {
            let node = &self.nodes[id];
            Target {
                parent: node.parent,
                depth: node.depth,
                name_off: node.name_off,
                file_type: node.file_type,
            }
        };

        let stats = std::mem::take(&mut self.nodes[id].stats);
        let decision = self.pre_visit(&target, &stats);
        self.nodes[id].stats = stats;

        match decision? {
            Decision::Descend { file_type, dev_ino } => {
                let node = &mut self.nodes[id];
                node.file_type = file_type;
                node.dev_ino = dev_ino;
                node.descended = true;
                self.dirq.push(&mut self.nodes, id);
                Ok(())
            }
            Decision::Withheld { file_type, dev_ino } => {
                let node = &mut self.nodes[id];
                node.file_type = file_type;
                node.dev_ino = dev_ino;
                node.descended = true;
                self.gc(id)
            }
            Decision::Leaf | Decision::Skip => self.gc(id),
        }
    }

    /// Visit a directory entry right away, without a node of its own
    fn visit_entry(&mut self, dir: NodeId, entry: DirEntry) -> Step {
        let target = Target {
            parent: Some(dir),
            depth: self.nodes[dir].depth + 1,
            name_off: self.nodes[dir].child_name_off(),
            file_type: entry.file_type,
        };
        let stats = if entry.file_type == FileType::Whiteout {
            StatCache::for_whiteout()
        } else {
            StatCache::new()
        };

        let (file_type, dev_ino, read) = match self.pre_visit(&target, &stats)? {
            Decision::Descend { file_type, dev_ino } => (file_type, dev_ino, true),
            Decision::Withheld { file_type, dev_ino } => (file_type, dev_ino, false),
            Decision::Leaf | Decision::Skip => return Ok(()),
        };

        let child = self.nodes.create(Some(dir), &entry.name, file_type);
        let node = &mut self.nodes[child];
        node.dev_ino = dev_ino;
        node.stats = stats;
        node.descended = true;
        if read {
            self.dirq.push(&mut self.nodes, child);
            Ok(())
        } else {
            self.gc(child)
        }
    }

    fn post_visit(&mut self, id: NodeId) -> Step {
        self.build_path(id);
        let (parent, name_off) = (self.nodes[id].parent, self.nodes[id].name_off);
        let (at_fd, at_off) = self.at_for(parent, name_off);

        let node = &self.nodes[id];
        let visit = Visit {
            path: &self.path,
            root_len: self.nodes[node.root].path_len(),
            name_off,
            depth: node.depth,
            kind: VisitKind::Post,
            file_type: node.file_type,
            errno: None,
            read_error: false,
            loop_len: None,
            at_fd,
            at_off,
            stat_flags: stat_flags_for(self.flags, node.depth),
            stats: &node.stats,
        };

        match (self.callback)(&visit) {
            Action::Stop => Err(Halt::Stopped),
            Action::Continue | Action::Prune => Ok(()),
        }
    }

    /// Report a failure to open or read directory `id`
    ///
    /// `path` must hold the directory's path.
    fn dir_error(&mut self, id: NodeId, errno: i32) -> Step {
        trace!(path = %self.path_buf().display(), errno, "Directory error");
        if !self.flags.contains(WalkFlags::RECOVER) {
            return Err(Halt::Failed(WalkerError::path(self.path_buf(), errno)));
        }

        let (parent, name_off) = (self.nodes[id].parent, self.nodes[id].name_off);
        let (at_fd, at_off) = self.at_for(parent, name_off);

        let node = &self.nodes[id];
        let visit = Visit {
            path: &self.path,
            root_len: self.nodes[node.root].path_len(),
            name_off,
            depth: node.depth,
            kind: VisitKind::Pre,
            file_type: FileType::Error,
            errno: Some(errno),
            read_error: true,
            loop_len: None,
            at_fd,
            at_off,
            stat_flags: stat_flags_for(self.flags, node.depth),
            stats: &node.stats,
        };

        match (self.callback)(&visit) {
            Action::Stop => Err(Halt::Stopped),
            Action::Continue | Action::Prune => Ok(()),
        }
    }

    /// Open a popped directory and visit or queue everything in it
    fn read_dir(&mut self, id: NodeId) -> Step {
        self.build_path(id);

        if self.nodes[id].dir.is_none() {
            let opened = match self.nodes[id].open_error.take() {
                Some(e) => Err(e),
                None => {
                    if self.nodes[id].fd.is_some() {
                        self.close_node(id, false);
                    }
                    self.open_node(id, true)
                }
            };
            if let Err(e) = opened {
                self.dir_error(id, e)?;
                return self.gc(id);
            }
        }

        trace!(path = %self.path_buf().display(), "Reading directory");
        self.stats.dirs_opened += 1;
        self.cache.pin(&mut self.nodes, id);

        let dir_len = self.nodes[id].path_len();
        let child_off = self.nodes[id].child_name_off();
        let child_depth = self.nodes[id].depth + 1;
        let mut read_error = None;

        loop {
            let next = match self.nodes[id].dir.as_mut() {
                Some(dir) => dir.read_next(),
                None => break,
            };
            let entry = match next {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    read_error = Some(errno_of(&e));
                    break;
                }
            };

            if entry.file_type == FileType::Whiteout && !self.flags.contains(WalkFlags::WHITEOUTS) {
                continue;
            }

            self.path.truncate(dir_len);
            if child_off > dir_len {
                self.path.push(b'/');
            }
            self.path.extend_from_slice(&entry.name);

            if self.must_buffer(&entry, child_depth) {
                let needs_stat = self.must_stat(entry.file_type, child_depth, &entry.name);
                let child = self.nodes.create(Some(id), &entry.name, entry.file_type);
                self.nodes[child].needs_stat = needs_stat;
                self.fileq.push(&mut self.nodes, child);
            } else {
                self.visit_entry(id, entry)?;
            }
        }

        self.path.truncate(dir_len);
        if let Some(e) = read_error {
            self.dir_error(id, e)?;
        }

        self.cache.unpin(&mut self.nodes, id);
        self.finish_dir(id);

        if self.flags.contains(WalkFlags::SORT) {
            self.fileq.sort_buffer(&mut self.nodes);
        }
        self.fileq.flush(&mut self.nodes);
        debug_assert!(!self.fileq.has_buffered());

        self.gc(id)
    }

    /// Drop one reference to `id`, freeing it and any ancestors that
    /// become unreferenced
    fn gc(&mut self, id: NodeId) -> Step {
        let mut halt = None;
        let mut cur = Some(id);

        while let Some(n) = cur {
            let node = &mut self.nodes[n];
            node.refcount -= 1;
            if node.refcount > 0 {
                break;
            }

            if node.descended && self.flags.contains(WalkFlags::POST_ORDER) && halt.is_none() {
                if let Err(h) = self.post_visit(n) {
                    halt = Some(h);
                }
            }

            cur = self.free(n);
        }

        halt.map_or(Ok(()), Err)
    }

    /// Release a node with no references left; returns its parent
    fn free(&mut self, id: NodeId) -> Option<NodeId> {
        if self.nodes[id].closing {
            self.unlink_close(id);
        }
        self.close_node(id, true);
        if self.previous == Some(id) {
            self.previous = self.nodes[id].parent;
        }
        self.nodes.remove(id).parent
    }

    // Descriptor management

    /// Claim a descriptor slot, evicting if necessary
    fn reserve(&mut self) -> std::result::Result<(), i32> {
        loop {
            if self.cache.try_reserve() {
                return Ok(());
            }
            if self.drain(false) > 0 {
                continue;
            }
            if let Some(tail) = self.cache.lru_tail() {
                self.close_node(tail, false);
                continue;
            }
            if self.ioq.as_ref().is_some_and(|q| q.pending() > 0) {
                self.drain(true);
                continue;
            }
            return Err(libc::EMFILE);
        }
    }

    /// Open `rel` relative to `at_fd` inside the budget
    fn open_reserved(
        &mut self,
        at_fd: RawFd,
        rel: &CStr,
        want_dir: bool,
    ) -> std::result::Result<Handle, i32> {
        loop {
            self.reserve()?;

            let opened = if want_dir {
                Dir::open(at_fd, rel).map(Handle::Dir)
            } else {
                open_dirfd(at_fd, rel).map(Handle::Fd)
            };

            match opened {
                Ok(handle) => return Ok(handle),
                Err(e) => {
                    self.cache.release();
                    let errno = errno_of(&e);
                    if errno == libc::EMFILE || errno == libc::ENFILE {
                        if let Some(tail) = self.cache.lru_tail() {
                            debug!(
                                open = self.cache.open_count(),
                                "Descriptor limit reached below budget, shrinking cache"
                            );
                            self.cache.shrink();
                            self.close_node(tail, false);
                            continue;
                        }
                    }
                    return Err(errno);
                }
            }
        }
    }

    fn install(&mut self, id: NodeId, handle: Handle) {
        let node = &mut self.nodes[id];
        match handle {
            Handle::Dir(dir) => {
                node.fd = Some(dir.fd());
                node.dir = Some(dir);
                self.cache.add_dir();
            }
            Handle::Fd(fd) => node.fd = Some(fd),
        }
        self.cache.add(&mut self.nodes, id);
    }

    /// Open `id` relative to its nearest open ancestor
    ///
    /// `path` must hold the path of `id` or of one of its descendants.
    fn open_node(&mut self, id: NodeId, want_dir: bool) -> std::result::Result<(), i32> {
        let base = self.nodes.open_base(id);
        let (at_fd, rel_off) = match base {
            Some(b) => (self.nodes[b].fd.unwrap_or(AT_FDCWD), self.nodes[b].child_name_off()),
            None => (AT_FDCWD, 0),
        };
        let end = self.nodes[id].path_len();
        let rel = CString::new(&self.path[rel_off..end]).map_err(|_| libc::EINVAL)?;

        if let Some(b) = base {
            self.cache.pin(&mut self.nodes, b);
        }
        let opened = self.open_reserved(at_fd, &rel, want_dir);
        if let Some(b) = base {
            self.cache.unpin(&mut self.nodes, b);
        }

        let handle = match opened {
            Err(libc::ENAMETOOLONG) => self.open_long(id, want_dir)?,
            opened => opened?,
        };
        self.install(id, handle);
        Ok(())
    }

    /// Open `id` one path component at a time, for paths over `PATH_MAX`
    fn open_long(&mut self, id: NodeId, want_dir: bool) -> std::result::Result<Handle, i32> {
        let base = self.nodes.open_base(id);
        let mut chain: Vec<NodeId> = self
            .nodes
            .ancestors(id)
            .take_while(|&a| Some(a) != base)
            .collect();
        chain.reverse();
        trace!(components = chain.len(), "Opening long path by components");

        let mut cur = base;
        if let Some(b) = cur {
            self.cache.pin(&mut self.nodes, b);
        }

        let mut result = Err(libc::ENAMETOOLONG);
        for (i, &component) in chain.iter().enumerate() {
            let at_fd = cur.and_then(|b| self.nodes[b].fd).unwrap_or(AT_FDCWD);
            let name = match CString::new(&self.nodes[component].name[..]) {
                Ok(name) => name,
                Err(_) => {
                    result = Err(libc::EINVAL);
                    break;
                }
            };

            if i + 1 == chain.len() {
                result = self.open_reserved(at_fd, &name, want_dir);
                break;
            }

            if self.nodes[component].fd.is_none() {
                match self.open_reserved(at_fd, &name, false) {
                    Ok(handle) => self.install(component, handle),
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            }

            self.cache.pin(&mut self.nodes, component);
            if let Some(b) = cur {
                self.cache.unpin(&mut self.nodes, b);
            }
            cur = Some(component);
        }

        if let Some(b) = cur {
            self.cache.unpin(&mut self.nodes, b);
        }
        result
    }

    /// Close whatever descriptor `id` holds
    fn close_node(&mut self, id: NodeId, allow_async: bool) {
        self.cache.remove(&mut self.nodes, id);
        let node = &mut self.nodes[id];
        let handle = match node.dir.take() {
            Some(dir) => {
                node.fd = None;
                self.cache.remove_dir();
                Handle::Dir(dir)
            }
            None => match node.fd.take() {
                Some(fd) => Handle::Fd(fd),
                None => return,
            },
        };
        self.close_handle(handle, allow_async);
    }

    fn close_handle(&mut self, handle: Handle, allow_async: bool) {
        if allow_async {
            if let Some(ioq) = self.ioq.as_deref_mut() {
                if ioq.capacity() > 0 {
                    let request = match handle {
                        Handle::Dir(dir) => Request::CloseDir { dir },
                        Handle::Fd(fd) => Request::Close { fd },
                    };
                    // The slot is released when the completion arrives
                    if let Err(e) = ioq.submit(request) {
                        self.cache.release();
                        self.defer(e.into());
                    }
                    return;
                }
            }
        }

        let closed = match handle {
            Handle::Dir(dir) => dir.close(),
            Handle::Fd(fd) => close_fd(fd),
        };
        if let Err(e) = closed {
            debug!(error = %e, "Failed to close descriptor");
        }
        self.cache.release();
    }

    /// Done reading `id`: free its stream, keeping a plain descriptor if
    /// children still need it
    fn finish_dir(&mut self, id: NodeId) {
        if self.nodes[id].dir.is_none() {
            return;
        }
        if self.nodes[id].pincount > 0 {
            // Async stats are still using the stream's descriptor
            let node = &mut self.nodes[id];
            node.closing = true;
            node.close_next = self.to_close;
            self.to_close = Some(id);
            self.cache.remove(&mut self.nodes, id);
            return;
        }
        self.unwrap_dir(id);
    }

    fn unwrap_dir(&mut self, id: NodeId) {
        self.cache.remove(&mut self.nodes, id);
        let Some(dir) = self.nodes[id].dir.take() else {
            return;
        };
        self.nodes[id].fd = None;
        self.cache.remove_dir();

        if self.nodes[id].refcount > 1 && self.reserve().is_ok() {
            match dir.unwrap() {
                Ok(fd) => {
                    // The stream's slot is free again; the dup keeps the reserved one
                    self.cache.release();
                    self.nodes[id].fd = Some(fd);
                    self.cache.add(&mut self.nodes, id);
                }
                Err(e) => {
                    debug!(error = %e, "Failed to unwrap directory stream");
                    self.cache.release();
                    self.cache.release();
                }
            }
        } else {
            self.close_handle(Handle::Dir(dir), true);
        }
    }

    /// Unwrap pending directories whose pins have dropped
    fn close_pending(&mut self) {
        let mut prev: Option<NodeId> = None;
        let mut cur = self.to_close;
        while let Some(id) = cur {
            let next = self.nodes[id].close_next;
            if self.nodes[id].pincount == 0 {
                match prev {
                    Some(p) => self.nodes[p].close_next = next,
                    None => self.to_close = next,
                }
                let node = &mut self.nodes[id];
                node.closing = false;
                node.close_next = None;
                self.unwrap_dir(id);
            } else {
                prev = Some(id);
            }
            cur = next;
        }
    }

    fn unlink_close(&mut self, id: NodeId) {
        let mut prev: Option<NodeId> = None;
        let mut cur = self.to_close;
        while let Some(n) = cur {
            let next = self.nodes[n].close_next;
            if n == id {
                match prev {
                    Some(p) => self.nodes[p].close_next = next,
                    None => self.to_close = next,
                }
                break;
            }
            prev = Some(n);
            cur = next;
        }
        let node = &mut self.nodes[id];
        node.closing = false;
        node.close_next = None;
    }

    // Async I/O

    /// Hand queued opens and stats to the dispatcher while it has room
    fn fill_ioq(&mut self) -> Step {
        let Some(ioq) = self.ioq.as_deref_mut() else {
            return Ok(());
        };

        while ioq.capacity() > 0 && self.dirq.balanced() {
            let Some(id) = self.dirq.waiting_head() else {
                break;
            };
            let node = &self.nodes[id];
            if node.dir.is_some() || node.fd.is_some() {
                self.dirq.skip(&mut self.nodes);
                continue;
            }
            // Roots are always opened synchronously
            let Some(parent) = node.parent else { break };
            let Some(dirfd) = self.nodes[parent].fd else {
                break;
            };
            if !self.cache.dir_available() {
                break;
            }
            let Ok(path) = CString::new(&node.name[..]) else {
                break;
            };
            if !self.cache.try_reserve() {
                break;
            }

            self.cache.add_dir();
            self.cache.pin(&mut self.nodes, parent);
            self.dirq.detach(&mut self.nodes, true);
            ioq.submit(Request::OpenDir {
                tag: id,
                dirfd,
                path,
            })?;
        }

        while ioq.capacity() > 0 && self.fileq.balanced() {
            let Some(id) = self.fileq.waiting_head() else {
                break;
            };
            let node = &self.nodes[id];
            let flags = stat_flags_for(self.flags, node.depth);
            if !node.needs_stat || node.stats.cached(flags).is_some() {
                self.fileq.skip(&mut self.nodes);
                continue;
            }
            let Some(parent) = node.parent else { break };
            let Some(dirfd) = self.nodes[parent].fd else {
                break;
            };
            let Ok(path) = CString::new(&node.name[..]) else {
                break;
            };

            let buf = self.cache.stat_bufs.take();
            self.cache.pin(&mut self.nodes, parent);
            self.fileq.detach(&mut self.nodes, true);
            ioq.submit(Request::Stat {
                tag: id,
                dirfd,
                path,
                flags,
                buf,
            })?;
        }

        Ok(())
    }

    /// Handle available completions; with `block`, wait for at least one
    ///
    /// Returns how many were handled.
    fn drain(&mut self, block: bool) -> usize {
        let mut handled = 0;
        loop {
            let Some(ioq) = self.ioq.as_deref_mut() else {
                return handled;
            };
            match ioq.pop(block && handled == 0) {
                Ok(Some(completion)) => {
                    self.complete(completion);
                    handled += 1;
                }
                Ok(None) => return handled,
                Err(e) => {
                    self.defer(e.into());
                    return handled;
                }
            }
        }
    }

    fn complete(&mut self, completion: Completion<NodeId>) {
        match completion {
            Completion::OpenDir { tag, result } => {
                if let Some(parent) = self.nodes[tag].parent {
                    self.cache.unpin(&mut self.nodes, parent);
                }
                match result {
                    Ok(dir) => {
                        let node = &mut self.nodes[tag];
                        node.fd = Some(dir.fd());
                        node.dir = Some(dir);
                        self.cache.add(&mut self.nodes, tag);
                    }
                    Err(e) => {
                        self.cache.release();
                        self.cache.remove_dir();
                        // Out of descriptors or cancelled: retry synchronously later
                        if !matches!(e, libc::EMFILE | libc::ENFILE | libc::ECANCELED) {
                            self.nodes[tag].open_error = Some(e);
                        }
                    }
                }
                self.dirq.attach(&mut self.nodes, tag, true);
            }
            Completion::Stat {
                tag,
                flags,
                buf,
                result,
            } => {
                if let Some(parent) = self.nodes[tag].parent {
                    self.cache.unpin(&mut self.nodes, parent);
                }
                match result {
                    Ok(()) => self.nodes[tag].stats.fill(flags, Ok(*buf)),
                    Err(libc::ECANCELED) => {}
                    Err(e) => self.nodes[tag].stats.fill(flags, Err(e)),
                }
                self.cache.stat_bufs.give(buf);
                self.fileq.attach(&mut self.nodes, tag, true);
            }
            Completion::Close { result } | Completion::CloseDir { result } => {
                self.cache.release();
                if let Err(errno) = result {
                    debug!(errno, "Async close failed");
                }
            }
        }
    }

    /// Cancel async work, drain it, and close every descriptor still held
    fn teardown(&mut self) {
        if let Some(ioq) = self.ioq.as_deref_mut() {
            ioq.cancel();
        }
        while self.ioq.as_ref().is_some_and(|q| q.pending() > 0) {
            if self.drain(true) == 0 {
                break;
            }
        }
        if let Some(ioq) = self.ioq.as_deref_mut() {
            ioq.resume();
        }

        let live = self.nodes.ids();
        if !live.is_empty() {
            debug!(nodes = live.len(), "Releasing nodes left at teardown");
        }
        for id in live {
            self.close_node(id, false);
        }

        self.dirq.clear();
        self.fileq.clear();
        self.to_close = None;
        self.previous = None;
        self.nodes = Nodes::new();
        trace!(pooled = self.cache.stat_bufs.available(), "Engine torn down");
        self.stats.peak_open = self.stats.peak_open.max(self.cache.peak());
    }
}
