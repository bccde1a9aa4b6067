// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Filesystem backend abstraction
//!
//! The session engine only ever talks to a backend through [`Backend`]. All
//! methods are synchronous; the engine calls them from worker threads.

pub mod local;

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::error::FsResult;

/// Opaque token for an open file or directory stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: i64,
}

/// `lstat`/`fstat` result
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileAttr {
    pub dev: u64,
    pub ino: u64,
    /// Full `st_mode` including the file type bits.
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
}

impl FileAttr {
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFLNK
    }

    pub fn is_device(&self) -> bool {
        matches!(self.mode & libc::S_IFMT, libc::S_IFCHR | libc::S_IFBLK)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FsStats {
    pub fs_type: u32,
    pub bsize: u32,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub fsid: u64,
    pub namelen: u32,
}

/// One entry produced by a directory stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u64,
    /// Stream position just after this entry (suitable for `seekdir`).
    pub offset: u64,
    /// `DT_*` type byte.
    pub kind: u8,
    /// Host bytes, not necessarily UTF-8.
    pub name: OsString,
}

/// Owner applied to newly created objects
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

/// Timestamp update for `utimens`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetTime {
    Omit,
    Now,
    At(Timespec),
}

/// Operation table every backend provides.
///
/// Paths are relative to the export root; the root itself is the empty path.
/// Names and link targets are passed as host bytes.
#[cfg_attr(test, mockall::automock)]
pub trait Backend: Send + Sync {
    /// Whether handles are identified by their path, in which case renames
    /// must be fenced against concurrent path users.
    fn is_path_based(&self) -> bool;

    /// Resolve `name` inside `dir`.
    fn lookup(&self, dir: &Path, name: &OsStr) -> FsResult<PathBuf> {
        Ok(match name.as_bytes() {
            b"." => dir.to_path_buf(),
            b".." => dir.parent().map(Path::to_path_buf).unwrap_or_default(),
            _ => dir.join(name),
        })
    }

    fn lstat(&self, path: &Path) -> FsResult<FileAttr>;
    fn fstat(&self, handle: HandleId) -> FsResult<FileAttr>;

    fn open(&self, path: &Path, flags: i32) -> FsResult<HandleId>;
    fn create(&self, path: &Path, flags: i32, mode: u32, cred: Credentials)
        -> FsResult<HandleId>;
    fn close(&self, handle: HandleId) -> FsResult<()>;

    fn opendir(&self, path: &Path) -> FsResult<HandleId>;
    fn readdir(&self, handle: HandleId) -> FsResult<Option<DirEntry>>;
    fn telldir(&self, handle: HandleId) -> FsResult<u64>;
    fn seekdir(&self, handle: HandleId, offset: u64) -> FsResult<()>;
    fn rewinddir(&self, handle: HandleId) -> FsResult<()>;
    fn closedir(&self, handle: HandleId) -> FsResult<()>;

    fn read(&self, handle: HandleId, offset: u64, buf: &mut [u8]) -> FsResult<usize>;
    fn write(&self, handle: HandleId, offset: u64, data: &[u8]) -> FsResult<usize>;
    fn fsync(&self, handle: HandleId, datasync: bool) -> FsResult<()>;

    fn mkdir(&self, path: &Path, mode: u32, cred: Credentials) -> FsResult<()>;
    fn mknod(&self, path: &Path, mode: u32, rdev: u64, cred: Credentials) -> FsResult<()>;
    fn symlink(&self, target: &OsStr, path: &Path, cred: Credentials) -> FsResult<()>;
    fn link(&self, existing: &Path, new_path: &Path) -> FsResult<()>;
    fn readlink(&self, path: &Path) -> FsResult<OsString>;
    fn rename(&self, from: &Path, to: &Path) -> FsResult<()>;
    fn unlink(&self, path: &Path, remove_dir: bool) -> FsResult<()>;
    fn remove(&self, path: &Path) -> FsResult<()>;

    fn truncate(&self, path: &Path, size: u64) -> FsResult<()>;
    fn chmod(&self, path: &Path, mode: u32) -> FsResult<()>;
    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> FsResult<()>;
    fn utimens(&self, path: &Path, atime: SetTime, mtime: SetTime) -> FsResult<()>;
    fn statfs(&self, path: &Path) -> FsResult<FsStats>;

    fn getxattr(&self, path: &Path, name: &str) -> FsResult<Vec<u8>>;
    fn listxattr(&self, path: &Path) -> FsResult<Vec<u8>>;
    fn setxattr(&self, path: &Path, name: &str, value: &[u8], flags: i32) -> FsResult<()>;
    fn removexattr(&self, path: &Path, name: &str) -> FsResult<()>;
}
