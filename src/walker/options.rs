//! Walk options: flags, strategies and callback results

use crate::error::ConfigError;
use crate::fs::MountTable;
use bitflags::bitflags;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Smallest usable descriptor budget: one for a directory, one for its child
pub const MIN_DESCRIPTOR_BUDGET: usize = 2;

/// Maximum reasonable dispatcher thread count
pub const MAX_THREADS: usize = 512;

bitflags! {
    /// Behaviour switches for a walk
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WalkFlags: u16 {
        /// Stat every file, even when the directory entry gives its type
        const STAT = 1 << 0;
        /// Report per-file errors to the callback instead of aborting
        const RECOVER = 1 << 1;
        /// Visit directories again after their descendants
        const POST_ORDER = 1 << 2;
        /// Follow symlinks given as roots
        const FOLLOW_ROOTS = 1 << 3;
        /// Follow every symlink
        const FOLLOW_ALL = 1 << 4;
        /// Report directory cycles as ELOOP instead of descending
        const DETECT_CYCLES = 1 << 5;
        /// Leave mount points and everything below them out entirely
        const SKIP_MOUNTS = 1 << 6;
        /// Visit mount points but not their contents
        const PRUNE_MOUNTS = 1 << 7;
        /// Visit the entries of each directory in sorted order
        const SORT = 1 << 8;
        /// Buffer each directory's entries before visiting any of them
        const BUFFER = 1 << 9;
        /// Report BSD whiteout entries
        const WHITEOUTS = 1 << 10;
    }
}

/// Traversal order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Strategy {
    /// Breadth-first
    #[default]
    Bfs,
    /// Depth-first
    Dfs,
    /// Iterative deepening: repeated depth-first passes, one level deeper each time
    Ids,
    /// Exponential deepening: like `Ids`, doubling the depth each pass
    Eds,
}

impl Strategy {
    /// Short name
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Bfs => "bfs",
            Strategy::Dfs => "dfs",
            Strategy::Ids => "ids",
            Strategy::Eds => "eds",
        }
    }
}

impl FromStr for Strategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bfs" => Ok(Strategy::Bfs),
            "dfs" => Ok(Strategy::Dfs),
            "ids" => Ok(Strategy::Ids),
            "eds" => Ok(Strategy::Eds),
            _ => Err(ConfigError::UnsupportedStrategy {
                name: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the callback wants done after a visit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Keep walking
    Continue,
    /// Skip this directory's descendants (and its post-order visit)
    Prune,
    /// Stop the whole walk
    Stop,
}

/// Everything a walk needs besides the callback
pub struct WalkArgs<'a> {
    /// Paths to start from, visited in order
    pub roots: Vec<PathBuf>,

    /// Behaviour switches
    pub flags: WalkFlags,

    /// Traversal order
    pub strategy: Strategy,

    /// Maximum descriptors open at once
    pub descriptor_budget: usize,

    /// Background worker threads; 0 walks fully synchronously
    pub threads: usize,

    /// Mount table for mount point detection
    pub mount_table: Option<&'a dyn MountTable>,
}

impl<'a> WalkArgs<'a> {
    /// Arguments for walking `roots` with default settings
    pub fn new<I, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            roots: roots.into_iter().map(Into::into).collect(),
            flags: WalkFlags::RECOVER,
            strategy: Strategy::Bfs,
            descriptor_budget: 64,
            threads: 0,
            mount_table: None,
        }
    }

    /// Set the flags
    pub fn flags(mut self, flags: WalkFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the strategy
    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the descriptor budget
    pub fn descriptor_budget(mut self, budget: usize) -> Self {
        self.descriptor_budget = budget;
        self
    }

    /// Set the number of background threads
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Set the mount table
    pub fn mount_table(mut self, mount_table: &'a dyn MountTable) -> Self {
        self.mount_table = Some(mount_table);
        self
    }

    /// Reject arguments the engine cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.descriptor_budget < MIN_DESCRIPTOR_BUDGET {
            return Err(ConfigError::BudgetTooSmall {
                budget: self.descriptor_budget,
                min: MIN_DESCRIPTOR_BUDGET,
            });
        }
        if self.threads > MAX_THREADS {
            return Err(ConfigError::InvalidThreadCount {
                count: self.threads,
                max: MAX_THREADS,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for WalkArgs<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalkArgs")
            .field("roots", &self.roots)
            .field("flags", &self.flags)
            .field("strategy", &self.strategy)
            .field("descriptor_budget", &self.descriptor_budget)
            .field("threads", &self.threads)
            .field("mount_table", &self.mount_table.is_some())
            .finish()
    }
}
