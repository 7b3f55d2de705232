//! The per-file view handed to walk callbacks

use crate::fs::{FileType, Stat, StatCache, StatFlags};
use std::ffi::OsStr;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;

/// Whether a visit happens before or after a directory's contents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VisitKind {
    /// Before the contents (every file gets one)
    Pre,
    /// After the contents (directories only, with post-order enabled)
    Post,
}

/// A read-only view of the file being visited
///
/// Borrowed from the engine for the duration of one callback. Stat data is
/// computed on first use and cached, so asking twice costs one syscall.
pub struct Visit<'a> {
    pub(crate) path: &'a [u8],
    pub(crate) root_len: usize,
    pub(crate) name_off: usize,
    pub(crate) depth: usize,
    pub(crate) kind: VisitKind,
    pub(crate) file_type: FileType,
    pub(crate) errno: Option<i32>,
    pub(crate) read_error: bool,
    pub(crate) loop_len: Option<usize>,
    pub(crate) at_fd: RawFd,
    pub(crate) at_off: usize,
    pub(crate) stat_flags: StatFlags,
    pub(crate) stats: &'a StatCache,
}

fn as_path(bytes: &[u8]) -> &Path {
    Path::new(OsStr::from_bytes(bytes))
}

impl<'a> Visit<'a> {
    /// Full path of the file
    pub fn path(&self) -> &'a Path {
        as_path(self.path)
    }

    /// Full path as raw bytes
    pub fn path_bytes(&self) -> &'a [u8] {
        self.path
    }

    /// Offset of the file name within the path
    pub fn name_offset(&self) -> usize {
        self.name_off
    }

    /// The file name (the whole path, for a root)
    pub fn name(&self) -> &'a OsStr {
        OsStr::from_bytes(&self.path[self.name_off..])
    }

    /// The root path this file was found under
    pub fn root(&self) -> &'a Path {
        as_path(&self.path[..self.root_len])
    }

    /// Depth below the root (root = 0)
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn kind(&self) -> VisitKind {
        self.kind
    }

    pub fn is_pre(&self) -> bool {
        self.kind == VisitKind::Pre
    }

    pub fn is_post(&self) -> bool {
        self.kind == VisitKind::Post
    }

    /// File type, or [`FileType::Error`] for an error visit
    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    /// Raw errno for an error visit
    pub fn errno(&self) -> Option<i32> {
        self.errno
    }

    /// The error for an error visit, as an `io::Error`
    pub fn error(&self) -> Option<io::Error> {
        self.errno.map(io::Error::from_raw_os_error)
    }

    pub fn is_error(&self) -> bool {
        self.errno.is_some()
    }

    /// Whether this error came from reading the directory at [`path`](Self::path)
    ///
    /// Such visits have no name of their own; the error belongs to the
    /// directory's contents rather than the directory.
    pub fn is_read_error(&self) -> bool {
        self.read_error
    }

    /// For a loop error, the ancestor the loop leads back to
    pub fn loop_ancestor(&self) -> Option<&'a Path> {
        self.loop_len.map(|len| as_path(&self.path[..len]))
    }

    /// Descriptor that [`at_path`](Self::at_path) is relative to
    ///
    /// Only valid during the callback. May be `AT_FDCWD`.
    pub fn at_fd(&self) -> RawFd {
        self.at_fd
    }

    /// Path relative to [`at_fd`](Self::at_fd), for `*at()` calls
    pub fn at_path(&self) -> &'a Path {
        as_path(&self.path[self.at_off..])
    }

    /// Stat flags used for this file
    pub fn stat_flags(&self) -> StatFlags {
        self.stat_flags
    }

    /// Stat the file with the flags in effect
    pub fn stat(&self) -> io::Result<&'a Stat> {
        self.stat_with(self.stat_flags)
    }

    /// Stat the file with specific flags
    pub fn stat_with(&self, flags: StatFlags) -> io::Result<&'a Stat> {
        self.stats
            .get(self.at_fd, &self.path[self.at_off..], flags)
            .map_err(io::Error::from_raw_os_error)
    }

    /// A stat result that is already cached, without making a syscall
    pub fn cached_stat(&self, flags: StatFlags) -> Option<io::Result<&'a Stat>> {
        self.stats
            .cached(flags)
            .map(|r| r.map_err(io::Error::from_raw_os_error))
    }
}

impl std::fmt::Debug for Visit<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Visit")
            .field("path", &self.path())
            .field("depth", &self.depth)
            .field("kind", &self.kind)
            .field("file_type", &self.file_type)
            .field("errno", &self.errno)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::AT_FDCWD;
    use tempfile::tempdir;

    fn visit<'a>(path: &'a [u8], stats: &'a StatCache) -> Visit<'a> {
        Visit {
            path,
            root_len: 4,
            name_off: 5,
            depth: 1,
            kind: VisitKind::Pre,
            file_type: FileType::File,
            errno: None,
            read_error: false,
            loop_len: None,
            at_fd: AT_FDCWD,
            at_off: 0,
            stat_flags: StatFlags::NOFOLLOW,
            stats,
        }
    }

    #[test]
    fn test_accessors() {
        let stats = StatCache::new();
        let v = visit(b"root/file", &stats);
        assert_eq!(v.path(), Path::new("root/file"));
        assert_eq!(v.root(), Path::new("root"));
        assert_eq!(v.name(), OsStr::new("file"));
        assert!(v.is_pre());
        assert!(!v.is_error());
        assert!(v.error().is_none());
    }

    #[test]
    fn test_error_visit() {
        let stats = StatCache::new();
        let mut v = visit(b"root/loop", &stats);
        v.errno = Some(libc::ELOOP);
        v.file_type = FileType::Error;
        v.loop_len = Some(4);
        assert_eq!(v.error().unwrap().raw_os_error(), Some(libc::ELOOP));
        assert_eq!(v.loop_ancestor(), Some(Path::new("root")));
    }

    #[test]
    fn test_lazy_stat() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("data");
        std::fs::write(&file, b"hello").unwrap();
        let path = file.as_os_str().as_bytes();

        let stats = StatCache::new();
        let v = visit(path, &stats);
        assert!(v.cached_stat(StatFlags::NOFOLLOW).is_none());
        assert_eq!(v.stat().unwrap().size, 5);
        assert!(v.cached_stat(StatFlags::NOFOLLOW).is_some());
    }
}
