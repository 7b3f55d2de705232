//! Progress reporting for the walker
//!
//! Provides a live spinner using indicatif and a console-styled summary.

use crate::fs::FileType;
use crate::walker::WalkStats;
use console::style;
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

/// How often the spinner message is refreshed, in visits
const UPDATE_EVERY: u64 = 1024;

/// Running totals gathered from visits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub dirs: u64,
    pub files: u64,
    pub others: u64,
    pub errors: u64,
    /// Bytes in regular files, when stat data was available
    pub bytes: u64,
}

impl Tally {
    /// Count one visit
    pub fn record(&mut self, file_type: FileType, size: Option<u64>) {
        match file_type {
            FileType::Directory => self.dirs += 1,
            FileType::File => {
                self.files += 1;
                self.bytes += size.unwrap_or(0);
            }
            FileType::Error => self.errors += 1,
            _ => self.others += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.dirs + self.files + self.others
    }
}

/// Progress reporter that displays walk status on stderr
pub struct ProgressReporter {
    bar: ProgressBar,
    started: Instant,
}

impl ProgressReporter {
    /// Create a new progress reporter
    pub fn new() -> Self {
        let bar = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr());

        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .expect("Invalid progress template")
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );

        bar.enable_steady_tick(Duration::from_millis(100));

        Self {
            bar,
            started: Instant::now(),
        }
    }

    /// Update the display, throttled to every few thousand visits
    pub fn update(&self, tally: &Tally) {
        let total = tally.total() + tally.errors;
        if total % UPDATE_EVERY != 0 {
            return;
        }

        let secs = self.started.elapsed().as_secs_f64();
        let rate = if secs > 0.0 { total as f64 / secs } else { 0.0 };

        self.bar.set_message(format!(
            "Dirs: {} | Files: {} | Errors: {} | Rate: {:.0}/s",
            format_number(tally.dirs),
            format_number(tally.files),
            format_number(tally.errors),
            rate,
        ));
    }

    /// Set a status message
    pub fn set_status(&self, status: &str) {
        self.bar.set_message(status.to_string());
    }

    /// Finish the progress display with a final message
    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a number with thousands separators
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let bytes: Vec<_> = s.bytes().rev().collect();

    let chunks: Vec<String> = bytes
        .chunks(3)
        .map(|chunk| chunk.iter().rev().map(|&b| b as char).collect::<String>())
        .collect();

    chunks.into_iter().rev().collect::<Vec<_>>().join(",")
}

/// Print a summary of the walk to stderr
pub fn print_summary(tally: &Tally, stats: &WalkStats, duration: Duration, completed: bool) {
    let secs = duration.as_secs_f64();
    let rate = if secs > 0.0 {
        stats.visits as f64 / secs
    } else {
        0.0
    };

    let title = if completed {
        style("Walk Complete").green().bold()
    } else {
        style("Walk Stopped").yellow().bold()
    };

    eprintln!();
    eprintln!("{}", title);
    eprintln!("{}", style("─".repeat(50)).dim());
    eprintln!("  {} {}", style("Directories:").bold(), format_number(tally.dirs));
    eprintln!("  {} {}", style("Files:").bold(), format_number(tally.files));
    if tally.others > 0 {
        eprintln!("  {} {}", style("Other:").bold(), format_number(tally.others));
    }
    if tally.bytes > 0 {
        eprintln!("  {} {}", style("Total Size:").bold(), format_size(tally.bytes, BINARY));
    }
    eprintln!(
        "  {} {:.1}s ({:.0} visits/sec)",
        style("Duration:").bold(),
        secs,
        rate
    );
    eprintln!(
        "  {} {} opened, {} peak descriptors, {} pass{}",
        style("Resources:").bold(),
        format_number(stats.dirs_opened),
        stats.peak_open,
        stats.passes,
        if stats.passes == 1 { "" } else { "es" }
    );
    if stats.errors > 0 {
        eprintln!(
            "  {} {}",
            style("Errors:").yellow().bold(),
            format_number(stats.errors)
        );
    }
    eprintln!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234567), "1,234,567");
        assert_eq!(format_number(1234567890), "1,234,567,890");
    }

    #[test]
    fn test_tally() {
        let mut tally = Tally::default();
        tally.record(FileType::Directory, None);
        tally.record(FileType::File, Some(100));
        tally.record(FileType::File, None);
        tally.record(FileType::Symlink, None);
        tally.record(FileType::Error, None);
        assert_eq!(tally.dirs, 1);
        assert_eq!(tally.files, 2);
        assert_eq!(tally.bytes, 100);
        assert_eq!(tally.errors, 1);
        assert_eq!(tally.total(), 4);
    }
}
