//! Directory traversal
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!                 │   walk() / walk_with_stats() │
//!                 └──────────────┬───────────────┘
//!                                │ Ids / Eds
//!                 ┌──────────────▼───────────────┐
//!                 │  deepening (depth windows)   │
//!                 └──────────────┬───────────────┘
//!                                │ Bfs / Dfs
//!   ┌────────────────────────────▼────────────────────────────┐
//!   │                 Engine (control thread)                  │
//!   │  dirq / fileq (WorkQueue)   ResourceCache (fd LRU)       │
//!   │  Nodes (refcounted arena)   path buffer                  │
//!   └────────────────────────────┬────────────────────────────┘
//!                                │ Request / Completion
//!                 ┌──────────────▼───────────────┐
//!                 │ AsyncDispatcher (N threads)  │
//!                 └──────────────────────────────┘
//! ```

mod cache;
mod deepening;
mod dispatcher;
mod engine;
mod node;
mod options;
mod pathset;
mod queue;
mod visit;

pub use cache::MAX_DIR_HANDLES;
pub use options::{Action, Strategy, WalkArgs, WalkFlags, MAX_THREADS, MIN_DESCRIPTOR_BUDGET};
pub use pathset::PathSet;
pub use visit::{Visit, VisitKind};

use crate::error::Result;
use dispatcher::AsyncDispatcher;
use engine::{Engine, Pass};
use node::NodeId;
use tracing::{debug, info};

/// Instrumentation gathered over one walk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkStats {
    /// Visits delivered to the callback
    pub visits: u64,
    /// Directories opened for reading, counted once per pass
    pub dirs_opened: u64,
    /// Most descriptors open at the same time
    pub peak_open: usize,
    /// Error visits delivered to the callback
    pub errors: u64,
    /// Engine passes run (more than one only for deepening strategies)
    pub passes: u32,
}

/// Walk `args.roots`, calling `callback` for every file found
///
/// The callback's [`Action`] controls the walk: `Prune` skips a directory's
/// contents, `Stop` ends the walk early (still returning `Ok`).
pub fn walk<F>(args: &WalkArgs<'_>, callback: F) -> Result<()>
where
    F: FnMut(&Visit<'_>) -> Action,
{
    walk_with_stats(args, callback).map(|_| ())
}

/// Like [`walk`], also returning statistics about the traversal
pub fn walk_with_stats<F>(args: &WalkArgs<'_>, mut callback: F) -> Result<WalkStats>
where
    F: FnMut(&Visit<'_>) -> Action,
{
    args.validate()?;

    let mut stats = WalkStats::default();
    if args.roots.is_empty() {
        return Ok(stats);
    }

    info!(
        roots = args.roots.len(),
        strategy = %args.strategy,
        threads = args.threads,
        budget = args.descriptor_budget,
        "Starting walk"
    );

    let mut ioq = if args.threads > 0 {
        Some(AsyncDispatcher::<NodeId>::new(args.threads)?)
    } else {
        None
    };

    let pass = Pass {
        roots: &args.roots,
        flags: args.flags,
        strategy: args.strategy,
        budget: args.descriptor_budget,
        mount_table: args.mount_table,
    };

    let (mut visits, mut errors) = (0u64, 0u64);
    let mut counted = |visit: &Visit<'_>| {
        visits += 1;
        if visit.is_error() {
            errors += 1;
        }
        callback(visit)
    };

    let result = match args.strategy {
        Strategy::Bfs | Strategy::Dfs => {
            stats.passes += 1;
            Engine::new(&pass, ioq.as_mut(), &mut counted, &mut stats).run()
        }
        Strategy::Ids | Strategy::Eds => deepening::walk_deepening(
            &pass,
            args.strategy,
            ioq.as_mut(),
            &mut counted,
            &mut stats,
        ),
    };
    stats.visits = visits;
    stats.errors = errors;

    let shutdown = match ioq {
        Some(ioq) => ioq.shutdown(),
        None => Ok(()),
    };
    result?;
    shutdown?;

    info!(
        visits = stats.visits,
        errors = stats.errors,
        dirs = stats.dirs_opened,
        "Walk complete"
    );
    debug!(peak_open = stats.peak_open, passes = stats.passes, "Walk resources");

    Ok(stats)
}
