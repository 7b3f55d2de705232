//! Directory facade
//!
//! Thin wrappers over `openat`/`fdopendir`/`readdir`/`closedir`. A [`Dir`]
//! owns both the `DIR*` and the descriptor behind it; dropping it closes
//! both. All descriptors are opened `O_CLOEXEC`.

use crate::fs::types::FileType;
use std::ffi::CStr;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;

/// Resolve paths relative to the current working directory
pub const AT_FDCWD: RawFd = libc::AT_FDCWD;

const DIR_FLAGS: libc::c_int = libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC;

fn errno_ptr() -> *mut libc::c_int {
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    unsafe {
        libc::__error()
    }
    #[cfg(not(any(target_os = "macos", target_os = "ios", target_os = "freebsd")))]
    unsafe {
        libc::__errno_location()
    }
}

fn set_errno(value: libc::c_int) {
    unsafe {
        *errno_ptr() = value;
    }
}

/// One entry read from a directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name, without any path
    pub name: Box<[u8]>,

    /// Type from `d_type`, possibly [`FileType::Unknown`]
    pub file_type: FileType,
}

/// An open directory stream
#[derive(Debug)]
pub struct Dir {
    dirp: NonNull<libc::DIR>,
    fd: RawFd,
}

// The stream is only ever used by one thread at a time; it is opened on a
// worker and handed to the control thread through a channel.
unsafe impl Send for Dir {}

impl Dir {
    /// Open `path` relative to `at` (or [`AT_FDCWD`])
    pub fn open(at: RawFd, path: &CStr) -> io::Result<Self> {
        let fd = open_dirfd(at, path)?;
        // SAFETY: fd is a directory descriptor we own
        let dirp = unsafe { libc::fdopendir(fd) };
        match NonNull::new(dirp) {
            Some(dirp) => Ok(Self { dirp, fd }),
            None => {
                let err = io::Error::last_os_error();
                unsafe {
                    libc::close(fd);
                }
                Err(err)
            }
        }
    }

    /// The descriptor behind this stream
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Read the next entry, skipping `.` and `..`
    ///
    /// Returns `Ok(None)` at end of directory.
    pub fn read_next(&mut self) -> io::Result<Option<DirEntry>> {
        loop {
            // SAFETY: dirp is a live stream owned by self
            let ent = unsafe {
                set_errno(0);
                libc::readdir(self.dirp.as_ptr())
            };

            if ent.is_null() {
                let err = io::Error::last_os_error();
                return match err.raw_os_error() {
                    Some(0) | None => Ok(None),
                    Some(_) => Err(err),
                };
            }

            // SAFETY: readdir returned a valid entry that lives until the next call
            let (name, d_type) = unsafe {
                let name = CStr::from_ptr((*ent).d_name.as_ptr());
                (name.to_bytes(), (*ent).d_type)
            };

            if name == b"." || name == b".." {
                continue;
            }

            return Ok(Some(DirEntry {
                name: name.into(),
                file_type: FileType::from_dirent(d_type),
            }));
        }
    }

    /// Close the stream and its descriptor
    pub fn close(self) -> io::Result<()> {
        let dirp = self.dirp;
        std::mem::forget(self);
        // SAFETY: ownership of dirp was just taken from self
        if unsafe { libc::closedir(dirp.as_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Release the stream but keep a descriptor to the same directory
    ///
    /// The descriptor is duplicated before the stream is closed, so for a
    /// moment both are open.
    pub fn unwrap(self) -> io::Result<RawFd> {
        // SAFETY: self.fd is open for as long as self lives
        let fd = unsafe { libc::fcntl(self.fd, libc::F_DUPFD_CLOEXEC, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        if let Err(e) = self.close() {
            let _ = close_fd(fd);
            return Err(e);
        }
        Ok(fd)
    }
}

impl Drop for Dir {
    fn drop(&mut self) {
        unsafe {
            libc::closedir(self.dirp.as_ptr());
        }
    }
}

/// Open a bare directory descriptor, without a stream
pub fn open_dirfd(at: RawFd, path: &CStr) -> io::Result<RawFd> {
    // SAFETY: path is NUL-terminated
    let fd = unsafe { libc::openat(at, path.as_ptr(), DIR_FLAGS) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Close a descriptor
pub fn close_fd(fd: RawFd) -> io::Result<()> {
    if unsafe { libc::close(fd) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    use tempfile::tempdir;

    fn c_path(path: &std::path::Path) -> CString {
        CString::new(path.as_os_str().as_bytes()).unwrap()
    }

    #[test]
    fn test_read_entries() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("file.txt"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let mut handle = Dir::open(AT_FDCWD, &c_path(dir.path())).unwrap();
        let mut names = Vec::new();
        while let Some(entry) = handle.read_next().unwrap() {
            names.push(String::from_utf8(entry.name.to_vec()).unwrap());
        }
        names.sort();
        assert_eq!(names, vec!["file.txt", "sub"]);
        handle.close().unwrap();
    }

    #[test]
    fn test_open_relative() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("child")).unwrap();

        let parent = Dir::open(AT_FDCWD, &c_path(dir.path())).unwrap();
        let child = Dir::open(parent.fd(), c"child").unwrap();
        assert!(child.fd() >= 0);
        assert_ne!(child.fd(), parent.fd());
    }

    #[test]
    fn test_open_missing() {
        let dir = tempdir().unwrap();
        let err = Dir::open(AT_FDCWD, &c_path(&dir.path().join("missing"))).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn test_unwrap_keeps_directory_reachable() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("inner")).unwrap();

        let handle = Dir::open(AT_FDCWD, &c_path(dir.path())).unwrap();
        let fd = handle.unwrap().unwrap();
        let inner = open_dirfd(fd, c"inner").unwrap();
        close_fd(inner).unwrap();
        close_fd(fd).unwrap();
    }
}
