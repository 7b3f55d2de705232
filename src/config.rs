//! Configuration types for fs-walker
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - Runtime configuration with validation
//! - Translation of the configuration into [`WalkArgs`]

use crate::error::ConfigError;
use crate::fs::MountTable;
use crate::walker::{Strategy, WalkArgs, WalkFlags, MAX_THREADS, MIN_DESCRIPTOR_BUDGET};
use clap::Parser;
use regex::Regex;
use std::ffi::OsStr;
use std::path::PathBuf;

/// Cap on the default thread count
const DEFAULT_MAX_THREADS: usize = 8;

/// Descriptors kept back from the budget for stdio, logging and the like
const RESERVED_FDS: usize = 16;

/// Budget used when the descriptor limit can't be read or is unlimited
const FALLBACK_BUDGET: usize = 1024;

/// Upper end of the inferred budget
const MAX_INFERRED_BUDGET: usize = 4096;

/// Descriptor-bounded directory walker
#[derive(Parser, Debug, Clone)]
#[command(
    name = "fs-walker",
    version,
    about = "Descriptor-bounded directory walker",
    long_about = "Walks one or more directory trees and prints every path found.\n\n\
                  Directories are read breadth-first by default, with a fixed budget of open\n\
                  file descriptors no matter how wide or deep the tree is. Opens and stats can\n\
                  be handed to background threads with -j.",
    after_help = "EXAMPLES:\n    \
        fs-walker /srv/data\n    \
        fs-walker -s dfs --sort -j 0 .\n    \
        fs-walker -s ids --max-depth 3 /usr\n    \
        fs-walker -L --xdev -e '^\\.snapshot$' /mnt/share -p\n    \
        fs-walker -0 . | xargs -0 ls -ld"
)]
pub struct CliArgs {
    /// Paths to walk
    #[arg(value_name = "PATH", default_value = ".")]
    pub roots: Vec<PathBuf>,

    /// Search strategy: bfs, dfs, ids or eds
    #[arg(short = 's', long, default_value = "bfs", value_name = "NAME")]
    pub strategy: String,

    /// Background I/O threads (0 = fully synchronous)
    #[arg(
        short = 'j',
        long,
        default_value_t = default_threads(),
        value_name = "NUM"
    )]
    pub threads: usize,

    /// Maximum open file descriptors (default: derived from RLIMIT_NOFILE)
    #[arg(long, value_name = "NUM")]
    pub budget: Option<usize>,

    /// Follow all symbolic links (implies --cycles)
    #[arg(short = 'L', long = "follow")]
    pub follow_all: bool,

    /// Follow symbolic links given on the command line
    #[arg(short = 'H')]
    pub follow_roots: bool,

    /// Print directories after their contents
    #[arg(short = 'd', long = "depth")]
    pub post_order: bool,

    /// Stat every file, even when the directory entry gives its type
    #[arg(long)]
    pub stat: bool,

    /// Visit the entries of each directory in sorted order
    #[arg(long)]
    pub sort: bool,

    /// Read each directory fully before visiting its entries
    #[arg(long)]
    pub buffer: bool,

    /// Report directory cycles instead of descending into them
    #[arg(long)]
    pub cycles: bool,

    /// Don't descend into other filesystems
    #[arg(long)]
    pub xdev: bool,

    /// Leave out mount points entirely
    #[arg(long, conflicts_with = "xdev")]
    pub skip_mounts: bool,

    /// Report whiteout entries
    #[arg(long)]
    pub whiteouts: bool,

    /// Abort on the first error instead of reporting it and continuing
    #[arg(long)]
    pub no_recover: bool,

    /// Don't print anything shallower than this
    #[arg(long, value_name = "NUM")]
    pub min_depth: Option<usize>,

    /// Don't descend below this depth
    #[arg(long, value_name = "NUM")]
    pub max_depth: Option<usize>,

    /// Skip names matching pattern (can be repeated)
    #[arg(short = 'e', long = "exclude", value_name = "REGEX", action = clap::ArgAction::Append)]
    pub exclude_patterns: Vec<String>,

    /// Separate output paths with NUL instead of newline
    #[arg(short = '0', long)]
    pub print0: bool,

    /// Quiet mode - don't print paths
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Show a progress spinner on stderr
    #[arg(short = 'p', long)]
    pub progress: bool,

    /// Print a summary when the walk finishes
    #[arg(long)]
    pub summary: bool,
}

fn default_threads() -> usize {
    num_cpus::get().min(DEFAULT_MAX_THREADS)
}

/// Descriptor budget derived from the soft `RLIMIT_NOFILE`
pub fn default_budget() -> usize {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: limit is a valid out-pointer
    let ret = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    if ret != 0 || limit.rlim_cur == libc::RLIM_INFINITY {
        return FALLBACK_BUDGET;
    }

    usize::try_from(limit.rlim_cur)
        .unwrap_or(FALLBACK_BUDGET)
        .saturating_sub(RESERVED_FDS)
        .clamp(MIN_DESCRIPTOR_BUDGET, MAX_INFERRED_BUDGET)
}

/// Validated runtime configuration
#[derive(Debug, Clone)]
pub struct WalkConfig {
    /// Paths to walk
    pub roots: Vec<PathBuf>,

    /// Search strategy
    pub strategy: Strategy,

    /// Background I/O threads
    pub threads: usize,

    /// Maximum open descriptors
    pub descriptor_budget: usize,

    /// Engine flags
    pub flags: WalkFlags,

    /// Shallowest depth printed
    pub min_depth: usize,

    /// Deepest depth visited
    pub max_depth: Option<usize>,

    /// Compiled exclude patterns, matched against file names
    pub exclude_patterns: Vec<Regex>,

    /// NUL-separated output
    pub print0: bool,

    /// Print paths to stdout
    pub print_paths: bool,

    /// Verbose logging
    pub verbose: bool,

    /// Show progress spinner
    pub show_progress: bool,

    /// Print summary at the end
    pub show_summary: bool,
}

impl WalkConfig {
    /// Create and validate configuration from CLI arguments
    pub fn from_args(args: CliArgs) -> Result<Self, ConfigError> {
        if args.roots.is_empty() {
            return Err(ConfigError::NoRoots);
        }

        let strategy: Strategy = args.strategy.parse()?;

        if args.threads > MAX_THREADS {
            return Err(ConfigError::InvalidThreadCount {
                count: args.threads,
                max: MAX_THREADS,
            });
        }

        let descriptor_budget = args.budget.unwrap_or_else(default_budget);
        if descriptor_budget < MIN_DESCRIPTOR_BUDGET {
            return Err(ConfigError::BudgetTooSmall {
                budget: descriptor_budget,
                min: MIN_DESCRIPTOR_BUDGET,
            });
        }

        let min_depth = args.min_depth.unwrap_or(0);
        if let Some(max) = args.max_depth {
            if min_depth > max {
                return Err(ConfigError::InvalidDepthRange {
                    min: min_depth,
                    max,
                });
            }
        }

        // Compile exclude patterns
        let exclude_patterns = args
            .exclude_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| ConfigError::InvalidExcludePattern {
                    pattern: p.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut flags = WalkFlags::empty();
        let switches = [
            (!args.no_recover, WalkFlags::RECOVER),
            (args.stat, WalkFlags::STAT),
            (args.post_order, WalkFlags::POST_ORDER),
            (args.follow_roots, WalkFlags::FOLLOW_ROOTS),
            (args.follow_all, WalkFlags::FOLLOW_ALL | WalkFlags::DETECT_CYCLES),
            (args.cycles, WalkFlags::DETECT_CYCLES),
            (args.xdev, WalkFlags::PRUNE_MOUNTS),
            (args.skip_mounts, WalkFlags::SKIP_MOUNTS),
            (args.sort, WalkFlags::SORT),
            (args.buffer, WalkFlags::BUFFER),
            (args.whiteouts, WalkFlags::WHITEOUTS),
        ];
        for (on, flag) in switches {
            if on {
                flags |= flag;
            }
        }

        Ok(Self {
            roots: args.roots,
            strategy,
            threads: args.threads,
            descriptor_budget,
            flags,
            min_depth,
            max_depth: args.max_depth,
            exclude_patterns,
            print0: args.print0,
            print_paths: !args.quiet,
            verbose: args.verbose,
            show_progress: args.progress,
            show_summary: args.summary,
        })
    }

    /// Check if a file name should be excluded
    pub fn is_excluded(&self, name: &OsStr) -> bool {
        if self.exclude_patterns.is_empty() {
            return false;
        }
        let name = name.to_string_lossy();
        self.exclude_patterns.iter().any(|re| re.is_match(&name))
    }

    /// Whether the walk needs the system mount table
    pub fn needs_mount_table(&self) -> bool {
        self.flags
            .intersects(WalkFlags::PRUNE_MOUNTS | WalkFlags::SKIP_MOUNTS)
    }

    /// Engine arguments for this configuration
    pub fn walk_args<'a>(&self, mount_table: Option<&'a dyn MountTable>) -> WalkArgs<'a> {
        let mut args = WalkArgs::new(self.roots.iter().cloned())
            .flags(self.flags)
            .strategy(self.strategy)
            .descriptor_budget(self.descriptor_budget)
            .threads(self.threads);
        if let Some(table) = mount_table {
            args = args.mount_table(table);
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Result<WalkConfig, ConfigError> {
        let mut full = vec!["fs-walker"];
        full.extend_from_slice(argv);
        WalkConfig::from_args(CliArgs::try_parse_from(full).unwrap())
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.roots, vec![PathBuf::from(".")]);
        assert_eq!(config.strategy, Strategy::Bfs);
        assert_eq!(config.flags, WalkFlags::RECOVER);
        assert!(config.threads <= DEFAULT_MAX_THREADS);
        assert!(config.descriptor_budget >= MIN_DESCRIPTOR_BUDGET);
        assert!(config.print_paths);
    }

    #[test]
    fn test_flags() {
        let config = parse(&["-L", "-d", "--sort", "--xdev", "--no-recover", "a", "b"]).unwrap();
        assert!(config.flags.contains(WalkFlags::FOLLOW_ALL));
        assert!(config.flags.contains(WalkFlags::DETECT_CYCLES));
        assert!(config.flags.contains(WalkFlags::POST_ORDER));
        assert!(config.flags.contains(WalkFlags::SORT));
        assert!(config.flags.contains(WalkFlags::PRUNE_MOUNTS));
        assert!(!config.flags.contains(WalkFlags::RECOVER));
        assert!(config.needs_mount_table());
        assert_eq!(config.roots.len(), 2);
    }

    #[test]
    fn test_strategy() {
        assert_eq!(parse(&["-s", "eds"]).unwrap().strategy, Strategy::Eds);
        assert!(matches!(
            parse(&["-s", "astar"]),
            Err(ConfigError::UnsupportedStrategy { .. })
        ));
    }

    #[test]
    fn test_validation() {
        assert_eq!(
            parse(&["--budget", "1"]).unwrap_err(),
            ConfigError::BudgetTooSmall { budget: 1, min: 2 }
        );
        assert!(matches!(
            parse(&["-j", "100000"]),
            Err(ConfigError::InvalidThreadCount { .. })
        ));
        assert_eq!(
            parse(&["--min-depth", "3", "--max-depth", "1"]).unwrap_err(),
            ConfigError::InvalidDepthRange { min: 3, max: 1 }
        );
        assert!(matches!(
            parse(&["-e", "(unclosed"]),
            Err(ConfigError::InvalidExcludePattern { .. })
        ));
    }

    #[test]
    fn test_exclude_pattern() {
        let config = parse(&["-e", r"^\.snapshot$", "-e", r"\.tmp$"]).unwrap();
        assert!(config.is_excluded(OsStr::new(".snapshot")));
        assert!(config.is_excluded(OsStr::new("scratch.tmp")));
        assert!(!config.is_excluded(OsStr::new("data.snapshot.txt")));
    }

    #[test]
    fn test_walk_args() {
        let config = parse(&["-j", "0", "--budget", "8", "-s", "dfs", "root"]).unwrap();
        let args = config.walk_args(None);
        assert_eq!(args.threads, 0);
        assert_eq!(args.descriptor_budget, 8);
        assert_eq!(args.strategy, Strategy::Dfs);
        assert_eq!(args.roots, vec![PathBuf::from("root")]);
        assert!(args.mount_table.is_none());
    }
}
