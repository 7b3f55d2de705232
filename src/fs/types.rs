//! File types and stat snapshots
//!
//! These are the plain-data types the syscall facades hand back to the
//! engine. `Stat` is a copyable snapshot of `struct stat`, so it can be
//! cached per node, shared between the follow and no-follow slots, and sent
//! back from worker threads without borrowing anything.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// `S_IFWHT`, the BSD whiteout file type
pub const S_IFWHT: u32 = 0o160000;

/// `DT_WHT`, the BSD whiteout directory entry type
const DT_WHT: u8 = 14;

/// Type of filesystem entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FileType {
    /// Type not known yet (no `d_type`, no stat)
    Unknown = 0,
    /// Named pipe (FIFO)
    Fifo = 1,
    /// Character device
    CharDevice = 2,
    /// Directory
    Directory = 4,
    /// Block device
    BlockDevice = 6,
    /// Regular file
    File = 8,
    /// Symbolic link
    Symlink = 10,
    /// Unix socket
    Socket = 12,
    /// BSD whiteout
    Whiteout = 14,
    /// The path could not be examined; the visit carries an errno
    Error = 255,
}

impl FileType {
    /// Convert from mode bits
    pub fn from_mode(mode: u32) -> Self {
        match mode & 0o170000 {
            0o100000 => FileType::File,        // S_IFREG
            0o040000 => FileType::Directory,   // S_IFDIR
            0o120000 => FileType::Symlink,     // S_IFLNK
            0o060000 => FileType::BlockDevice, // S_IFBLK
            0o020000 => FileType::CharDevice,  // S_IFCHR
            0o010000 => FileType::Fifo,        // S_IFIFO
            0o140000 => FileType::Socket,      // S_IFSOCK
            S_IFWHT => FileType::Whiteout,
            _ => FileType::Unknown,
        }
    }

    /// Convert from a `dirent::d_type` value
    pub fn from_dirent(d_type: u8) -> Self {
        match d_type {
            libc::DT_REG => FileType::File,
            libc::DT_DIR => FileType::Directory,
            libc::DT_LNK => FileType::Symlink,
            libc::DT_BLK => FileType::BlockDevice,
            libc::DT_CHR => FileType::CharDevice,
            libc::DT_FIFO => FileType::Fifo,
            libc::DT_SOCK => FileType::Socket,
            DT_WHT => FileType::Whiteout,
            _ => FileType::Unknown,
        }
    }

    /// Check if this is a regular file
    pub fn is_file(&self) -> bool {
        *self == FileType::File
    }

    /// Check if this is a directory
    pub fn is_dir(&self) -> bool {
        *self == FileType::Directory
    }

    /// Check if this is a symbolic link
    pub fn is_symlink(&self) -> bool {
        *self == FileType::Symlink
    }

    /// Short name, as printed by `find -printf %y`
    pub fn as_char(&self) -> char {
        match self {
            FileType::Unknown => 'U',
            FileType::Fifo => 'p',
            FileType::CharDevice => 'c',
            FileType::Directory => 'd',
            FileType::BlockDevice => 'b',
            FileType::File => 'f',
            FileType::Symlink => 'l',
            FileType::Socket => 's',
            FileType::Whiteout => 'w',
            FileType::Error => '?',
        }
    }
}

/// Snapshot of a `struct stat`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    /// Device the file lives on
    pub dev: u64,

    /// Inode number
    pub ino: u64,

    /// Type and permission bits
    pub mode: u32,

    /// Number of hard links
    pub nlink: u64,

    /// User ID
    pub uid: u32,

    /// Group ID
    pub gid: u32,

    /// Device ID, for special files
    pub rdev: u64,

    /// File size in bytes
    pub size: u64,

    /// Preferred I/O block size
    pub blksize: u64,

    /// 512-byte blocks allocated
    pub blocks: u64,

    /// Last access time (seconds since epoch)
    pub atime: i64,

    /// Last modification time (seconds since epoch)
    pub mtime: i64,

    /// Last status change time (seconds since epoch)
    pub ctime: i64,
}

impl Stat {
    /// Copy the fields out of a raw `struct stat`
    #[allow(clippy::unnecessary_cast)]
    pub fn from_raw(st: &libc::stat) -> Self {
        Self {
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
            mode: st.st_mode as u32,
            nlink: st.st_nlink as u64,
            uid: st.st_uid as u32,
            gid: st.st_gid as u32,
            rdev: st.st_rdev as u64,
            size: st.st_size as u64,
            blksize: st.st_blksize as u64,
            blocks: st.st_blocks as u64,
            atime: st.st_atime as i64,
            mtime: st.st_mtime as i64,
            ctime: st.st_ctime as i64,
        }
    }

    /// A zeroed buffer of the whiteout type, for whiteouts that cannot be stat'd
    pub fn whiteout() -> Self {
        Self {
            mode: S_IFWHT,
            ..Self::default()
        }
    }

    /// Get the file type from mode bits
    pub fn file_type(&self) -> FileType {
        FileType::from_mode(self.mode)
    }

    /// Device and inode, the identity used for cycle detection
    pub fn dev_ino(&self) -> (u64, u64) {
        (self.dev, self.ino)
    }

    /// Permission bits without the type
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }

    /// Get mtime as SystemTime
    pub fn mtime_as_system_time(&self) -> SystemTime {
        to_system_time(self.mtime)
    }

    /// Get atime as SystemTime
    pub fn atime_as_system_time(&self) -> SystemTime {
        to_system_time(self.atime)
    }
}

fn to_system_time(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_type_from_mode() {
        assert_eq!(FileType::from_mode(0o100644), FileType::File);
        assert_eq!(FileType::from_mode(0o040755), FileType::Directory);
        assert_eq!(FileType::from_mode(0o120777), FileType::Symlink);
        assert_eq!(FileType::from_mode(0o160000), FileType::Whiteout);
        assert_eq!(FileType::from_mode(0), FileType::Unknown);
    }

    #[test]
    fn test_file_type_from_dirent() {
        assert_eq!(FileType::from_dirent(libc::DT_DIR), FileType::Directory);
        assert_eq!(FileType::from_dirent(libc::DT_LNK), FileType::Symlink);
        assert_eq!(FileType::from_dirent(libc::DT_UNKNOWN), FileType::Unknown);
        assert_eq!(FileType::from_dirent(14), FileType::Whiteout);
    }

    #[test]
    fn test_file_type_predicates() {
        assert!(FileType::File.is_file());
        assert!(!FileType::Directory.is_file());
        assert!(FileType::Directory.is_dir());
        assert!(FileType::Symlink.is_symlink());
        assert_eq!(FileType::Directory.as_char(), 'd');
        assert_eq!(FileType::Fifo.as_char(), 'p');
    }

    #[test]
    fn test_whiteout_stat() {
        let st = Stat::whiteout();
        assert_eq!(st.file_type(), FileType::Whiteout);
        assert_eq!(st.size, 0);
        assert_eq!(st.dev_ino(), (0, 0));
        assert_eq!(st.permissions(), 0);
    }

    #[test]
    fn test_time_conversion() {
        let st = Stat {
            mtime: 1_000,
            atime: -5,
            ..Stat::default()
        };
        assert_eq!(
            st.mtime_as_system_time(),
            UNIX_EPOCH + Duration::from_secs(1_000)
        );
        assert!(st.atime_as_system_time() < UNIX_EPOCH);
    }
}
