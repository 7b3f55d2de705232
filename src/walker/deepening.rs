//! Iterative and exponential deepening
//!
//! Both strategies are built from repeated depth-first passes, each one
//! bounded to a window of depths `[min, max)`:
//!
//! - iterative deepening grows the window one level at a time
//!   (`[0, 1)`, `[1, 2)`, `[2, 3)`, ...)
//! - exponential deepening doubles it (`[0, 1)`, `[1, 2)`, `[2, 4)`, ...)
//!
//! Only visits inside the window reach the caller. Everything shallower was
//! delivered by an earlier pass and is walked through silently; directories
//! at the bottom edge are pruned so the next pass has something to do.
//!
//! Post-order visits need a second phase, since a directory's post visit
//! must follow everything under it. Iterative deepening walks the windows
//! back up from the deepest level; exponential deepening does one full pass
//! that delivers only post visits.

use crate::error::Result;
use crate::fs::FileType;
use crate::walker::dispatcher::AsyncDispatcher;
use crate::walker::engine::{Callback, Engine, Pass};
use crate::walker::node::NodeId;
use crate::walker::options::{Action, Strategy, WalkFlags};
use crate::walker::pathset::PathSet;
use crate::walker::visit::Visit;
use crate::walker::WalkStats;
use tracing::debug;

/// Depth window of one pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    min: usize,
    max: usize,
}

impl Window {
    fn contains(&self, depth: usize) -> bool {
        self.min <= depth && depth < self.max
    }

    /// The window after this one, for a deepening strategy
    fn deeper(self, strategy: Strategy) -> Self {
        match strategy {
            Strategy::Eds => Window {
                min: self.max,
                max: self.max.saturating_mul(2),
            },
            _ => Window {
                min: self.max,
                max: self.max + 1,
            },
        }
    }
}

/// State shared across the passes of one deepening walk
struct Deepening {
    strategy: Strategy,
    /// Directories the caller pruned; never descended again
    pruned: PathSet,
    /// No directory was cut off at the bottom of the last pass
    bottom: bool,
    stopped: bool,
}

impl Deepening {
    fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            pruned: PathSet::new(),
            bottom: true,
            stopped: false,
        }
    }

    /// Filter one visit of a pre-order pass over `window`
    fn pre_visit(&mut self, window: Window, visit: &Visit<'_>, callback: &mut Callback<'_>) -> Action {
        let depth = visit.depth();

        if visit.is_error() {
            // A read error belongs to the level below the directory
            let level = if visit.is_read_error() { depth + 1 } else { depth };
            if window.contains(level) {
                return self.deliver(visit, callback);
            }
            return Action::Continue;
        }

        if depth < window.min {
            if visit.file_type() == FileType::Directory && self.pruned.contains(visit.path_bytes()) {
                return Action::Prune;
            }
            return Action::Continue;
        }

        match self.deliver(visit, callback) {
            Action::Prune => {
                if visit.file_type() == FileType::Directory {
                    self.pruned.insert(visit.path_bytes());
                }
                Action::Prune
            }
            Action::Continue
                if visit.file_type() == FileType::Directory && depth + 1 >= window.max =>
            {
                self.bottom = false;
                Action::Prune
            }
            action => action,
        }
    }

    /// Filter one visit of a post-order pass delivering depths in `window`
    fn post_visit(&mut self, window: Window, visit: &Visit<'_>, callback: &mut Callback<'_>) -> Action {
        if visit.is_post() {
            if window.contains(visit.depth()) {
                return self.deliver(visit, callback);
            }
            return Action::Continue;
        }

        if visit.is_error() {
            return Action::Continue;
        }
        if visit.file_type() == FileType::Directory
            && (visit.depth() >= window.max || self.pruned.contains(visit.path_bytes()))
        {
            return Action::Prune;
        }
        Action::Continue
    }

    fn deliver(&mut self, visit: &Visit<'_>, callback: &mut Callback<'_>) -> Action {
        let action = callback(visit);
        if action == Action::Stop {
            self.stopped = true;
        }
        action
    }
}

fn run_pass(
    pass: &Pass<'_>,
    ioq: Option<&mut AsyncDispatcher<NodeId>>,
    stats: &mut WalkStats,
    filter: &mut Callback<'_>,
) -> Result<()> {
    stats.passes += 1;
    Engine::new(pass, ioq, filter, stats).run()
}

/// Walk `base.roots` with iterative (`Ids`) or exponential (`Eds`) deepening
pub(crate) fn walk_deepening(
    base: &Pass<'_>,
    strategy: Strategy,
    mut ioq: Option<&mut AsyncDispatcher<NodeId>>,
    callback: &mut Callback<'_>,
    stats: &mut WalkStats,
) -> Result<()> {
    let pre = Pass {
        flags: base.flags - WalkFlags::POST_ORDER,
        strategy: Strategy::Dfs,
        ..*base
    };
    let mut state = Deepening::new(strategy);
    let mut window = Window { min: 0, max: 1 };

    loop {
        debug!(strategy = %strategy, min = window.min, max = window.max, "Deepening pass");
        state.bottom = true;
        run_pass(&pre, ioq.as_deref_mut(), stats, &mut |visit: &Visit<'_>| {
            state.pre_visit(window, visit, &mut *callback)
        })?;

        if state.stopped {
            return Ok(());
        }
        if state.bottom {
            break;
        }
        window = window.deeper(strategy);
    }

    if !base.flags.contains(WalkFlags::POST_ORDER) {
        return Ok(());
    }

    let post = Pass {
        strategy: Strategy::Dfs,
        ..*base
    };
    let windows: Vec<Window> = match state.strategy {
        Strategy::Eds => vec![Window {
            min: 0,
            max: usize::MAX,
        }],
        // Nothing below `window.max - 1` has contents, so its post visits start one level up
        _ => (0..window.max.saturating_sub(1))
            .rev()
            .map(|depth| Window {
                min: depth,
                max: depth + 1,
            })
            .collect(),
    };

    for window in windows {
        debug!(strategy = %strategy, min = window.min, max = window.max, "Post-order pass");
        run_pass(&post, ioq.as_deref_mut(), stats, &mut |visit: &Visit<'_>| {
            state.post_visit(window, visit, &mut *callback)
        })?;
        if state.stopped {
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_windows_grow() {
        let start = Window { min: 0, max: 1 };

        let ids = start.deeper(Strategy::Ids).deeper(Strategy::Ids);
        assert_eq!(ids, Window { min: 2, max: 3 });

        let eds = start.deeper(Strategy::Eds).deeper(Strategy::Eds);
        assert_eq!(eds, Window { min: 2, max: 4 });
        assert!(eds.contains(3));
        assert!(!eds.contains(4));
    }

    #[test]
    fn test_eds_saturates() {
        let w = Window {
            min: 1,
            max: usize::MAX / 2 + 1,
        };
        assert_eq!(w.deeper(Strategy::Eds).max, usize::MAX);
    }
}
