//! fs-walker - descriptor-bounded directory walker
//!
//! Entry point for the CLI application.

use anyhow::{Context, Result};
use clap::Parser;
use fs_walker::config::{CliArgs, WalkConfig};
use fs_walker::error::{ErrorClass, WalkerError};
use fs_walker::fs::{FileType, MountTable, SystemMounts};
use fs_walker::progress::{print_summary, ProgressReporter, Tally};
use fs_walker::walker::{walk_with_stats, Action, Visit, WalkFlags};
use std::io::{self, BufWriter, Write};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns whether the walk finished without per-file errors
fn run() -> Result<bool> {
    // Parse CLI arguments
    let args = CliArgs::parse();

    // Setup logging
    setup_logging(args.verbose)?;

    // Validate and create config
    let config = WalkConfig::from_args(args).context("Invalid configuration")?;

    let mounts = if config.needs_mount_table() {
        Some(SystemMounts::load().context("Failed to read the mount table")?)
    } else {
        None
    };
    let walk_args = config.walk_args(mounts.as_ref().map(|m| m as &dyn MountTable));

    // Setup signal handler for graceful shutdown
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, shutting down...");
        flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    let progress = config.show_progress.then(ProgressReporter::new);
    if let Some(ref p) = progress {
        p.set_status("Walking...");
    }

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let mut tally = Tally::default();
    let mut write_error: Option<io::Error> = None;
    let post_order = config.flags.contains(WalkFlags::POST_ORDER);
    let terminator = if config.print0 { b'\0' } else { b'\n' };
    let started = Instant::now();

    let result = walk_with_stats(&walk_args, |visit: &Visit<'_>| {
        if interrupted.load(Ordering::Relaxed) {
            return Action::Stop;
        }

        if let (Some(errno), Some(err)) = (visit.errno(), visit.error()) {
            let path = visit.path().display();
            match ErrorClass::of(errno) {
                ErrorClass::Loop => match visit.loop_ancestor() {
                    Some(ancestor) => {
                        warn!(%path, ancestor = %ancestor.display(), "Filesystem loop detected")
                    }
                    None => warn!(%path, "{}", err),
                },
                ErrorClass::TooManyFiles => error!(%path, "Out of file descriptors: {}", err),
                _ if visit.is_read_error() => warn!(%path, "Cannot read directory: {}", err),
                _ => warn!(%path, "{}", err),
            }
            tally.record(FileType::Error, None);
            return Action::Continue;
        }

        let depth = visit.depth();
        let is_dir = visit.file_type() == FileType::Directory;

        if visit.is_pre() && depth > 0 && config.is_excluded(visit.name()) {
            return Action::Prune;
        }

        let at_bottom = config.max_depth.is_some_and(|max| depth >= max);
        let action = if is_dir && at_bottom {
            Action::Prune
        } else {
            Action::Continue
        };

        // With post-order, directories print on the way back up unless pruned here
        let print_now = if visit.is_post() {
            true
        } else {
            !(post_order && is_dir && action == Action::Continue)
        };
        if visit.is_pre() {
            let size = visit
                .cached_stat(visit.stat_flags())
                .and_then(|st| st.ok().map(|st| st.size));
            tally.record(visit.file_type(), size);
            if let Some(ref p) = progress {
                p.update(&tally);
            }
        }

        if print_now && config.print_paths && depth >= config.min_depth {
            let written = out
                .write_all(visit.path_bytes())
                .and_then(|()| out.write_all(&[terminator]));
            if let Err(e) = written {
                write_error = Some(e);
                return Action::Stop;
            }
        }

        action
    });

    let completed = result.is_ok() && write_error.is_none() && !interrupted.load(Ordering::SeqCst);
    if let Some(ref p) = progress {
        if completed {
            p.finish("Walk completed");
        } else {
            p.finish("Walk stopped");
        }
    }

    let stats = result.context("Walk failed")?;
    if let Some(e) = write_error {
        // A closed pipe is a normal way for a consumer to stop reading
        if e.kind() == io::ErrorKind::BrokenPipe {
            return Ok(true);
        }
        return Err(e).context("Failed to write output");
    }
    out.flush().context("Failed to write output")?;

    if config.show_summary {
        print_summary(&tally, &stats, started.elapsed(), completed);
    }

    if interrupted.load(Ordering::SeqCst) {
        return Err(WalkerError::Interrupted.into());
    }

    if stats.errors > 0 {
        info!(errors = stats.errors, "Walk completed with errors");
        return Ok(false);
    }

    Ok(true)
}

fn setup_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("fs_walker=debug,warn")
    } else {
        EnvFilter::new("fs_walker=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    Ok(())
}
