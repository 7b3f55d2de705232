//! Filesystem facades
//!
//! The traversal engine never calls the OS directly. Everything it needs
//! goes through these narrow wrappers:
//!
//! - [`dir`]: open, read and close directory streams
//! - [`stat`]: stat with follow / no-follow / try-follow, plus the per-file
//!   result cache
//! - [`mounts`]: mount point hints and filesystem type lookup
//!
//! The wrappers are plain functions over raw descriptors, so they can run
//! on the control thread or on an async dispatcher worker alike.

pub mod dir;
pub mod mounts;
pub mod stat;
pub mod types;

pub use dir::{Dir, DirEntry, AT_FDCWD};
pub use mounts::{MountEntry, MountTable, SystemMounts};
pub use stat::{stat_at, StatCache, StatFlags};
pub use types::{FileType, Stat};
