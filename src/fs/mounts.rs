//! Mount table
//!
//! The engine asks two questions of the mount table: could an entry name be
//! a mount point (so it must be stat'd even when its type is known), and what
//! filesystem does a stat'd file live on.

use crate::fs::types::Stat;
use std::collections::{HashMap, HashSet};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Mount table queries consumed by the engine
pub trait MountTable {
    /// Check if an entry with this name might be a mount point
    fn might_be_mount(&self, name: &[u8]) -> bool;

    /// Filesystem type of the mount a file lives on
    fn lookup_fstype(&self, stat: &Stat) -> &str;
}

/// A single mount point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Device number of the mounted filesystem
    pub dev: u64,

    /// Local mount point path
    pub mount_point: PathBuf,

    /// Raw filesystem type string from the OS
    pub fstype: String,
}

/// The mount table of the running system
#[derive(Debug, Clone, Default)]
pub struct SystemMounts {
    entries: Vec<MountEntry>,
    by_dev: HashMap<u64, usize>,
    basenames: HashSet<Box<[u8]>>,
}

impl SystemMounts {
    /// Load the current process's mount table
    ///
    /// On platforms without `/proc/self/mountinfo` this returns an empty table.
    pub fn load() -> io::Result<Self> {
        if !cfg!(target_os = "linux") {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string("/proc/self/mountinfo")?;
        let mounts = Self::parse_mountinfo(&text);
        debug!(mounts = mounts.len(), "Loaded mount table");
        Ok(mounts)
    }

    /// Parse the contents of a `mountinfo` file
    ///
    /// Malformed lines are skipped.
    pub fn parse_mountinfo(text: &str) -> Self {
        let entries = text.lines().filter_map(parse_mountinfo_line).collect();
        Self::from_entries(entries)
    }

    /// Build a table from already-parsed entries
    pub fn from_entries(entries: Vec<MountEntry>) -> Self {
        let mut by_dev = HashMap::new();
        let mut basenames = HashSet::new();
        for (i, entry) in entries.iter().enumerate() {
            // Later mounts shadow earlier ones on the same device
            by_dev.insert(entry.dev, i);
            if let Some(name) = entry.mount_point.file_name() {
                basenames.insert(name.as_bytes().into());
            }
        }
        Self {
            entries,
            by_dev,
            basenames,
        }
    }

    /// All mount entries, in table order
    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    /// Number of mounts
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the table is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check if a path is exactly a mount point
    pub fn is_mount_point(&self, path: &Path) -> bool {
        self.entries.iter().any(|e| e.mount_point == path)
    }
}

impl MountTable for SystemMounts {
    fn might_be_mount(&self, name: &[u8]) -> bool {
        self.basenames.contains(name)
    }

    fn lookup_fstype(&self, stat: &Stat) -> &str {
        self.by_dev
            .get(&stat.dev)
            .map(|&i| self.entries[i].fstype.as_str())
            .unwrap_or("unknown")
    }
}

/// Encode a device number the way glibc's `makedev` does
pub fn makedev(major: u32, minor: u32) -> u64 {
    let (major, minor) = (major as u64, minor as u64);
    ((major & 0xffff_f000) << 32)
        | ((major & 0x0000_0fff) << 8)
        | ((minor & 0xffff_ff00) << 12)
        | (minor & 0x0000_00ff)
}

// 36 35 98:0 /mnt1 /mnt/parent rw,noatime master:1 - ext3 /dev/root rw
fn parse_mountinfo_line(line: &str) -> Option<MountEntry> {
    let (mount, fs) = line.split_once(" - ")?;
    let mut fields = mount.split(' ');
    let dev = fields.nth(2)?;
    let mount_point = fields.nth(1)?;
    let fstype = fs.split(' ').next()?;

    let (major, minor) = dev.split_once(':')?;
    let dev = makedev(major.parse().ok()?, minor.parse().ok()?);

    Some(MountEntry {
        dev,
        mount_point: PathBuf::from(std::ffi::OsStr::from_bytes(&unescape(mount_point))),
        fstype: fstype.to_string(),
    })
}

/// Decode the `\040`-style octal escapes used for spaces and friends
fn unescape(field: &str) -> Vec<u8> {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits.iter().fold(0u32, |acc, d| acc * 8 + (d - b'0') as u32);
                if let Ok(byte) = u8::try_from(value) {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
23 22 0:21 / /proc rw,nosuid shared:12 - proc proc rw
24 22 0:45 / /mnt/my\\040disk rw shared:30 - tmpfs tmpfs rw
garbage line
";

    #[test]
    fn test_parse_mountinfo() {
        let mounts = SystemMounts::parse_mountinfo(SAMPLE);
        assert_eq!(mounts.len(), 3);
        assert_eq!(mounts.entries()[0].dev, makedev(8, 1));
        assert_eq!(mounts.entries()[1].mount_point, PathBuf::from("/proc"));
        assert_eq!(mounts.entries()[2].mount_point, PathBuf::from("/mnt/my disk"));
        assert!(mounts.is_mount_point(Path::new("/proc")));
    }

    #[test]
    fn test_might_be_mount() {
        let mounts = SystemMounts::parse_mountinfo(SAMPLE);
        assert!(mounts.might_be_mount(b"proc"));
        assert!(mounts.might_be_mount(b"my disk"));
        assert!(!mounts.might_be_mount(b"home"));
    }

    #[test]
    fn test_lookup_fstype() {
        let mounts = SystemMounts::parse_mountinfo(SAMPLE);
        let st = Stat {
            dev: makedev(0, 21),
            ..Stat::default()
        };
        assert_eq!(mounts.lookup_fstype(&st), "proc");
        let other = Stat {
            dev: 12345,
            ..Stat::default()
        };
        assert_eq!(mounts.lookup_fstype(&other), "unknown");
    }

    #[test]
    fn test_makedev() {
        assert_eq!(makedev(8, 1), 0x801);
        assert_eq!(makedev(0, 45), 45);
    }
}
