//! Stat facade and the per-file stat cache

use crate::error::is_nonexistence;
use crate::fs::types::Stat;
use bitflags::bitflags;
use std::cell::OnceCell;
use std::ffi::{CStr, CString};
use std::io;
use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;

bitflags! {
    /// How symbolic links are treated by a stat call
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StatFlags: u8 {
        /// Follow symbolic links
        const FOLLOW = 1 << 0;
        /// Stat the link itself
        const NOFOLLOW = 1 << 1;
        /// Follow, falling back to the link itself if the target is gone
        const TRYFOLLOW = Self::FOLLOW.bits() | Self::NOFOLLOW.bits();
        /// Skip remote attribute synchronisation where the platform allows it
        const NOSYNC = 1 << 2;
    }
}

impl StatFlags {
    /// Which cache slot a single (non-try) request lands in
    fn slot(self) -> Slot {
        if self.contains(StatFlags::NOFOLLOW) && !self.contains(StatFlags::FOLLOW) {
            Slot::NoFollow
        } else {
            Slot::Follow
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Follow,
    NoFollow,
}

fn fstatat(dirfd: RawFd, path: Option<&CStr>, follow: bool) -> io::Result<Stat> {
    let mut st = MaybeUninit::<libc::stat>::uninit();
    // SAFETY: st is a valid out-pointer, path is NUL-terminated
    let ret = unsafe {
        match path {
            Some(path) => {
                let flags = if follow { 0 } else { libc::AT_SYMLINK_NOFOLLOW };
                libc::fstatat(dirfd, path.as_ptr(), st.as_mut_ptr(), flags)
            }
            None => libc::fstat(dirfd, st.as_mut_ptr()),
        }
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: the call succeeded and filled st
    Ok(Stat::from_raw(unsafe { &st.assume_init() }))
}

/// Stat `path` relative to `dirfd`, or `dirfd` itself when `path` is `None`
pub fn stat_at(dirfd: RawFd, path: Option<&CStr>, flags: StatFlags) -> io::Result<Stat> {
    if flags.contains(StatFlags::TRYFOLLOW) {
        return match fstatat(dirfd, path, true) {
            Err(e) if e.raw_os_error().is_some_and(is_nonexistence) => {
                fstatat(dirfd, path, false)
            }
            result => result,
        };
    }
    fstatat(dirfd, path, !flags.contains(StatFlags::NOFOLLOW))
}

/// Cached stat results for one file
///
/// Two slots are kept, one per symlink mode. A no-follow result that turns
/// out not to be a symlink answers follow requests too. Errors are cached
/// as raw errnos, the same whether the stat ran here or on a worker.
#[derive(Debug, Clone, Default)]
pub struct StatCache {
    follow: OnceCell<Result<Stat, i32>>,
    nofollow: OnceCell<Result<Stat, i32>>,
    whiteout: bool,
}

impl StatCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cache for a directory entry reported as a whiteout
    pub fn for_whiteout() -> Self {
        Self {
            whiteout: true,
            ..Self::default()
        }
    }

    /// Record a result computed elsewhere (e.g. on a worker thread)
    ///
    /// Ignored if the slot is already filled.
    pub fn fill(&self, flags: StatFlags, result: Result<Stat, i32>) {
        let result = self.fix_whiteout(result);

        if flags.contains(StatFlags::TRYFOLLOW) {
            // A symlink here means following it failed and the link itself was stat'd
            match result {
                Ok(st) if st.file_type().is_symlink() => {
                    let _ = self.follow.set(Err(libc::ENOENT));
                    let _ = self.nofollow.set(Ok(st));
                }
                Err(e) if is_nonexistence(e) => {
                    let _ = self.follow.set(Err(e));
                    let _ = self.nofollow.set(Err(e));
                }
                result => {
                    let _ = self.follow.set(result);
                }
            }
            return;
        }

        match flags.slot() {
            Slot::NoFollow => {
                if let Ok(st) = &result {
                    if !st.file_type().is_symlink() {
                        let _ = self.follow.set(Ok(*st));
                    }
                }
                let _ = self.nofollow.set(result);
            }
            Slot::Follow => {
                let _ = self.follow.set(result);
            }
        }
    }

    /// Look at a cached result without making a syscall
    pub fn cached(&self, flags: StatFlags) -> Option<Result<&Stat, i32>> {
        if flags.contains(StatFlags::TRYFOLLOW) {
            return match self.follow.get()? {
                Err(e) if is_nonexistence(*e) => self.cached(StatFlags::NOFOLLOW),
                result => Some(result.as_ref().map_err(|e| *e)),
            };
        }
        let cell = match flags.slot() {
            Slot::Follow => &self.follow,
            Slot::NoFollow => &self.nofollow,
        };
        cell.get().map(|result| result.as_ref().map_err(|e| *e))
    }

    /// Get the stat for `path` relative to `dirfd`, computing it if needed
    pub fn get(&self, dirfd: RawFd, path: &[u8], flags: StatFlags) -> Result<&Stat, i32> {
        if flags.contains(StatFlags::TRYFOLLOW) {
            let nosync = flags & StatFlags::NOSYNC;
            return match self.get(dirfd, path, StatFlags::FOLLOW | nosync) {
                Err(e) if is_nonexistence(e) => {
                    self.get(dirfd, path, StatFlags::NOFOLLOW | nosync)
                }
                result => result,
            };
        }

        let slot = flags.slot();
        let cell = match slot {
            Slot::Follow => &self.follow,
            Slot::NoFollow => &self.nofollow,
        };
        let result = cell.get_or_init(|| {
            let result = CString::new(path)
                .map_err(|_| libc::EINVAL)
                .and_then(|path| {
                    stat_at(dirfd, Some(&path), flags)
                        .map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))
                });
            self.fix_whiteout(result)
        });

        if slot == Slot::NoFollow {
            if let Ok(st) = result {
                if !st.file_type().is_symlink() {
                    let _ = self.follow.set(Ok(*st));
                }
            }
        }

        result.as_ref().map_err(|e| *e)
    }

    /// A whiteout that fails with ENOENT becomes a zeroed whiteout stat
    fn fix_whiteout(&self, result: Result<Stat, i32>) -> Result<Stat, i32> {
        match result {
            Err(libc::ENOENT) if self.whiteout => Ok(Stat::whiteout()),
            result => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::dir::AT_FDCWD;
    use crate::fs::types::FileType;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::fs::symlink;
    use tempfile::tempdir;

    fn bytes(path: &std::path::Path) -> &[u8] {
        path.as_os_str().as_bytes()
    }

    #[test]
    fn test_tryfollow_is_both_modes() {
        assert!(StatFlags::TRYFOLLOW.contains(StatFlags::FOLLOW));
        assert!(StatFlags::TRYFOLLOW.contains(StatFlags::NOFOLLOW));
    }

    #[test]
    fn test_follow_and_nofollow() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("target");
        let link = dir.path().join("link");
        std::fs::write(&target, b"data").unwrap();
        symlink(&target, &link).unwrap();

        let cache = StatCache::new();
        let lst = cache.get(AT_FDCWD, bytes(&link), StatFlags::NOFOLLOW).unwrap();
        assert_eq!(lst.file_type(), FileType::Symlink);
        let st = cache.get(AT_FDCWD, bytes(&link), StatFlags::FOLLOW).unwrap();
        assert_eq!(st.file_type(), FileType::File);
        assert_eq!(st.size, 4);
    }

    #[test]
    fn test_nofollow_shared_with_follow() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, b"abc").unwrap();

        let cache = StatCache::new();
        cache.get(AT_FDCWD, bytes(&file), StatFlags::NOFOLLOW).unwrap();
        // The follow slot was filled without a second syscall
        let follow = cache.cached(StatFlags::FOLLOW).unwrap().unwrap();
        assert_eq!(follow.size, 3);
    }

    #[test]
    fn test_tryfollow_broken_link() {
        let dir = tempdir().unwrap();
        let link = dir.path().join("dangling");
        symlink(dir.path().join("nowhere"), &link).unwrap();

        let cache = StatCache::new();
        let st = cache.get(AT_FDCWD, bytes(&link), StatFlags::TRYFOLLOW).unwrap();
        assert_eq!(st.file_type(), FileType::Symlink);
        assert_eq!(
            cache.cached(StatFlags::FOLLOW).unwrap().unwrap_err(),
            libc::ENOENT
        );
    }

    #[test]
    fn test_errors_are_cached() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing");

        let cache = StatCache::new();
        let err = cache.get(AT_FDCWD, bytes(&missing), StatFlags::FOLLOW).unwrap_err();
        assert_eq!(err, libc::ENOENT);
        std::fs::write(&missing, b"").unwrap();
        // Still the cached error
        assert_eq!(
            cache.get(AT_FDCWD, bytes(&missing), StatFlags::FOLLOW).unwrap_err(),
            libc::ENOENT
        );
    }

    #[test]
    fn test_whiteout_synthesized() {
        let dir = tempdir().unwrap();
        let cache = StatCache::for_whiteout();
        let st = cache
            .get(AT_FDCWD, bytes(&dir.path().join("gone")), StatFlags::NOFOLLOW)
            .unwrap();
        assert_eq!(st.file_type(), FileType::Whiteout);
    }

    #[test]
    fn test_fill_from_worker() {
        let cache = StatCache::new();
        cache.fill(StatFlags::FOLLOW, Err(libc::EACCES));
        assert_eq!(cache.cached(StatFlags::FOLLOW), Some(Err(libc::EACCES)));
        assert_eq!(cache.cached(StatFlags::NOFOLLOW), None);
    }

    #[test]
    fn test_fill_tryfollow_dangling() {
        let link = Stat {
            mode: libc::S_IFLNK as u32 | 0o777,
            ..Stat::default()
        };
        let cache = StatCache::new();
        cache.fill(StatFlags::TRYFOLLOW, Ok(link));
        assert_eq!(cache.cached(StatFlags::FOLLOW), Some(Err(libc::ENOENT)));
        let st = cache.cached(StatFlags::TRYFOLLOW).unwrap().unwrap();
        assert_eq!(st.file_type(), FileType::Symlink);
    }

    #[test]
    fn test_stat_fd_itself() {
        let dir = tempdir().unwrap();
        let handle = crate::fs::dir::Dir::open(
            AT_FDCWD,
            &CString::new(bytes(dir.path())).unwrap(),
        )
        .unwrap();
        let st = stat_at(handle.fd(), None, StatFlags::FOLLOW).unwrap();
        assert_eq!(st.file_type(), FileType::Directory);
    }
}
