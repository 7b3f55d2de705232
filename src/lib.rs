//! fs-walker - Descriptor-Bounded Directory Traversal
//!
//! A directory tree walker in the style of `find`, built around a fixed
//! budget of open file descriptors. Trees of any width or depth are walked
//! without ever holding more descriptors than the budget allows.
//!
//! # Features
//!
//! - **Four Strategies**: breadth-first (the default), depth-first,
//!   iterative deepening and exponential deepening.
//!
//! - **Bounded Descriptors**: open directories live in an LRU cache and are
//!   evicted (then reopened relative to an ancestor) when the budget runs
//!   out. Paths longer than `PATH_MAX` are opened one component at a time.
//!
//! - **Background I/O**: opens and stats can be handed to a small thread
//!   pool while the control thread keeps visiting. Results are identical
//!   with or without it.
//!
//! - **Callback Control**: every file is handed to a callback that can
//!   prune a directory or stop the walk. Post-order visits, cycle detection,
//!   symlink following and mount point handling are all opt-in flags.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       walk(args, callback)                      │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Control Thread (Engine)                     │
//! │   ┌───────────┐   ┌───────────┐   ┌─────────────────────────┐   │
//! │   │   dirq    │   │   fileq   │   │ ResourceCache (fd LRU)  │   │
//! │   └─────┬─────┘   └─────┬─────┘   └─────────────────────────┘   │
//! │         └───────┬───────┘                                       │
//! │                 ▼                                               │
//! │       ┌──────────────────┐                                      │
//! │       │ AsyncDispatcher  │── opendir / stat / close ──┐         │
//! │       └──────────────────┘                            │         │
//! └───────────────────────────────────────────────────────┼─────────┘
//!                                                         ▼
//!            ┌───────────┐  ┌───────────┐         ┌───────────┐
//!            │walker-io-0│  │walker-io-1│   ...   │walker-io-N│
//!            └───────────┘  └───────────┘         └───────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use fs_walker::walker::{walk, Action, WalkArgs, WalkFlags};
//!
//! let args = WalkArgs::new(["/srv/data"])
//!     .flags(WalkFlags::RECOVER | WalkFlags::SORT)
//!     .threads(2);
//!
//! walk(&args, |visit| {
//!     println!("{}", visit.path().display());
//!     if visit.name() == ".git" {
//!         Action::Prune
//!     } else {
//!         Action::Continue
//!     }
//! })?;
//! # Ok::<(), fs_walker::WalkerError>(())
//! ```

pub mod config;
pub mod error;
pub mod fs;
pub mod progress;
pub mod walker;

pub use config::{CliArgs, WalkConfig};
pub use error::{Result, WalkerError};
pub use walker::{walk, walk_with_stats, Action, Strategy, Visit, WalkArgs, WalkFlags, WalkStats};
