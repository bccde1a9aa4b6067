// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Passthrough backend over a host directory tree

use std::collections::HashMap;
use std::ffi::{CString, OsStr, OsString};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::{DirBuilderExt, DirEntryExt, FileExt, MetadataExt, OpenOptionsExt};
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    Backend, Credentials, DirEntry, FileAttr, FsStats, HandleId, SetTime, Timespec,
};
use crate::error::{FsError, FsResult};

const XATTR_UID: &str = "user.virtfs.uid";
const XATTR_GID: &str = "user.virtfs.gid";
const XATTR_MODE: &str = "user.virtfs.mode";
const XATTR_RDEV: &str = "user.virtfs.rdev";

/// How client credentials are applied to host files
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecurityModel {
    /// Ownership changes go straight to the host.
    #[default]
    Passthrough,
    /// Credentials live in `user.virtfs.*` xattrs; special files become
    /// regular files.
    MappedXattr,
    /// Like passthrough, but permission failures on chown are ignored.
    None,
}

impl FromStr for SecurityModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "passthrough" => Ok(SecurityModel::Passthrough),
            "mapped-xattr" | "mapped" => Ok(SecurityModel::MappedXattr),
            "none" => Ok(SecurityModel::None),
            other => Err(format!(
                "invalid security model '{other}' (expected passthrough, mapped-xattr or none)"
            )),
        }
    }
}

/// Snapshot of a directory taken at `opendir`
struct DirStream {
    entries: Vec<DirEntry>,
    pos: usize,
}

/// Backend that serves a host directory tree.
pub struct LocalBackend {
    root: PathBuf,
    model: SecurityModel,
    next_id: AtomicU64,
    files: Mutex<HashMap<HandleId, Arc<File>>>,
    dirs: Mutex<HashMap<HandleId, DirStream>>,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>, model: SecurityModel) -> FsResult<Self> {
        let root = root.into();
        let meta = fs::metadata(&root)?;
        if !meta.is_dir() {
            return Err(FsError::from_errno(libc::ENOTDIR));
        }
        Ok(Self {
            root,
            model,
            next_id: AtomicU64::new(1),
            files: Mutex::new(HashMap::new()),
            dirs: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn security_model(&self) -> SecurityModel {
        self.model
    }

    fn host_path(&self, path: &Path) -> PathBuf {
        if path.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }

    fn alloc_id(&self) -> HandleId {
        HandleId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn file(&self, handle: HandleId) -> FsResult<Arc<File>> {
        self.files
            .lock()
            .get(&handle)
            .cloned()
            .ok_or_else(|| FsError::from_errno(libc::EBADF))
    }

    fn with_dir<T>(
        &self,
        handle: HandleId,
        f: impl FnOnce(&mut DirStream) -> T,
    ) -> FsResult<T> {
        let mut dirs = self.dirs.lock();
        let stream = dirs.get_mut(&handle).ok_or_else(|| FsError::from_errno(libc::EBADF))?;
        Ok(f(stream))
    }

    fn insert_file(&self, file: File) -> HandleId {
        let id = self.alloc_id();
        self.files.lock().insert(id, Arc::new(file));
        id
    }

    /// Apply the owner of a freshly created object.
    fn post_create(&self, host: &Path, mode: u32, rdev: u64, cred: Credentials) -> FsResult<()> {
        match self.model {
            SecurityModel::MappedXattr => {
                set_u64_xattr(host, XATTR_UID, cred.uid as u64)?;
                set_u64_xattr(host, XATTR_GID, cred.gid as u64)?;
                set_u64_xattr(host, XATTR_MODE, mode as u64)?;
                if rdev != 0 {
                    set_u64_xattr(host, XATTR_RDEV, rdev)?;
                }
                Ok(())
            }
            SecurityModel::Passthrough => {
                std::os::unix::fs::lchown(host, Some(cred.uid), Some(cred.gid))?;
                Ok(())
            }
            SecurityModel::None => {
                if let Err(err) = std::os::unix::fs::lchown(host, Some(cred.uid), Some(cred.gid)) {
                    if err.raw_os_error() != Some(libc::EPERM) {
                        return Err(err.into());
                    }
                }
                Ok(())
            }
        }
    }

    fn mapped_mode(&self, host: &Path) -> Option<u32> {
        if self.model != SecurityModel::MappedXattr {
            return None;
        }
        get_u64_xattr(host, XATTR_MODE).map(|m| m as u32)
    }

    fn apply_mapped(&self, host: &Path, attr: &mut FileAttr) {
        if self.model != SecurityModel::MappedXattr {
            return;
        }
        if let Some(uid) = get_u64_xattr(host, XATTR_UID) {
            attr.uid = uid as u32;
        }
        if let Some(gid) = get_u64_xattr(host, XATTR_GID) {
            attr.gid = gid as u32;
        }
        if let Some(mode) = get_u64_xattr(host, XATTR_MODE) {
            attr.mode = mode as u32;
        }
        if let Some(rdev) = get_u64_xattr(host, XATTR_RDEV) {
            attr.rdev = rdev;
        }
    }

    fn snapshot_dir(&self, path: &Path) -> FsResult<Vec<DirEntry>> {
        let host = self.host_path(path);
        let here = fs::symlink_metadata(&host)?;
        let parent_host = path
            .parent()
            .map(|p| self.host_path(p))
            .unwrap_or_else(|| host.clone());
        let parent = fs::symlink_metadata(&parent_host)?;

        let mut entries = vec![
            DirEntry {
                ino: here.ino(),
                offset: 1,
                kind: libc::DT_DIR,
                name: OsString::from("."),
            },
            DirEntry {
                ino: parent.ino(),
                offset: 2,
                kind: libc::DT_DIR,
                name: OsString::from(".."),
            },
        ];
        for entry in fs::read_dir(&host)? {
            let entry = entry?;
            let kind = entry.file_type().map(dirent_kind).unwrap_or(libc::DT_UNKNOWN);
            entries.push(DirEntry {
                ino: entry.ino(),
                offset: entries.len() as u64 + 1,
                kind,
                name: entry.file_name(),
            });
        }
        Ok(entries)
    }
}

impl Backend for LocalBackend {
    fn is_path_based(&self) -> bool {
        true
    }

    fn lstat(&self, path: &Path) -> FsResult<FileAttr> {
        let host = self.host_path(path);
        let meta = fs::symlink_metadata(&host)?;
        let mut attr = attr_from_metadata(&meta);
        self.apply_mapped(&host, &mut attr);
        Ok(attr)
    }

    fn fstat(&self, handle: HandleId) -> FsResult<FileAttr> {
        let file = self.file(handle)?;
        Ok(attr_from_metadata(&file.metadata()?))
    }

    fn open(&self, path: &Path, flags: i32) -> FsResult<HandleId> {
        let host = self.host_path(path);
        let file = open_options(flags).open(&host)?;
        Ok(self.insert_file(file))
    }

    fn create(
        &self,
        path: &Path,
        flags: i32,
        mode: u32,
        cred: Credentials,
    ) -> FsResult<HandleId> {
        let host = self.host_path(path);
        let host_mode = match self.model {
            SecurityModel::MappedXattr => 0o600,
            _ => mode & 0o7777,
        };
        let read_only = flags & libc::O_ACCMODE == libc::O_RDONLY;
        // std refuses O_CREAT without write access; create first, then open.
        let mut options = if read_only {
            let mut o = OpenOptions::new();
            o.write(true).custom_flags(libc::O_NOFOLLOW | libc::O_CLOEXEC);
            o
        } else {
            open_options(flags & !libc::O_CREAT)
        };
        options.mode(host_mode);
        if flags & libc::O_EXCL != 0 {
            options.create_new(true);
        } else {
            options.create(true);
        }
        let mut file = options.open(&host)?;
        if let Err(err) = self.post_create(&host, libc::S_IFREG | (mode & 0o7777), 0, cred) {
            let _ = fs::remove_file(&host);
            return Err(err);
        }
        if read_only {
            file = open_options(flags & !(libc::O_CREAT | libc::O_EXCL)).open(&host)?;
        }
        Ok(self.insert_file(file))
    }

    fn close(&self, handle: HandleId) -> FsResult<()> {
        self.files
            .lock()
            .remove(&handle)
            .map(drop)
            .ok_or_else(|| FsError::from_errno(libc::EBADF))
    }

    fn opendir(&self, path: &Path) -> FsResult<HandleId> {
        let entries = self.snapshot_dir(path)?;
        let id = self.alloc_id();
        self.dirs.lock().insert(id, DirStream { entries, pos: 0 });
        Ok(id)
    }

    fn readdir(&self, handle: HandleId) -> FsResult<Option<DirEntry>> {
        self.with_dir(handle, |stream| {
            let entry = stream.entries.get(stream.pos).cloned();
            if entry.is_some() {
                stream.pos += 1;
            }
            entry
        })
    }

    fn telldir(&self, handle: HandleId) -> FsResult<u64> {
        self.with_dir(handle, |stream| stream.pos as u64)
    }

    fn seekdir(&self, handle: HandleId, offset: u64) -> FsResult<()> {
        self.with_dir(handle, |stream| {
            stream.pos = (offset as usize).min(stream.entries.len());
        })
    }

    fn rewinddir(&self, handle: HandleId) -> FsResult<()> {
        self.with_dir(handle, |stream| stream.pos = 0)
    }

    fn closedir(&self, handle: HandleId) -> FsResult<()> {
        self.dirs
            .lock()
            .remove(&handle)
            .map(drop)
            .ok_or_else(|| FsError::from_errno(libc::EBADF))
    }

    fn read(&self, handle: HandleId, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        Ok(self.file(handle)?.read_at(buf, offset)?)
    }

    fn write(&self, handle: HandleId, offset: u64, data: &[u8]) -> FsResult<usize> {
        Ok(self.file(handle)?.write_at(data, offset)?)
    }

    fn fsync(&self, handle: HandleId, datasync: bool) -> FsResult<()> {
        let file = self.file(handle)?;
        if datasync {
            file.sync_data()?;
        } else {
            file.sync_all()?;
        }
        Ok(())
    }

    fn mkdir(&self, path: &Path, mode: u32, cred: Credentials) -> FsResult<()> {
        let host = self.host_path(path);
        let host_mode = match self.model {
            SecurityModel::MappedXattr => 0o700,
            _ => mode & 0o7777,
        };
        fs::DirBuilder::new().mode(host_mode).create(&host)?;
        if let Err(err) = self.post_create(&host, libc::S_IFDIR | (mode & 0o7777), 0, cred) {
            let _ = fs::remove_dir(&host);
            return Err(err);
        }
        Ok(())
    }

    fn mknod(&self, path: &Path, mode: u32, rdev: u64, cred: Credentials) -> FsResult<()> {
        let host = self.host_path(path);
        if self.model == SecurityModel::MappedXattr {
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&host)?;
        } else {
            let kind = nix::sys::stat::SFlag::from_bits_truncate(mode & libc::S_IFMT);
            let perm = nix::sys::stat::Mode::from_bits_truncate(mode & 0o7777);
            nix::sys::stat::mknod(&host, kind, perm, rdev as libc::dev_t)?;
        }
        if let Err(err) = self.post_create(&host, mode, rdev, cred) {
            let _ = fs::remove_file(&host);
            return Err(err);
        }
        Ok(())
    }

    fn symlink(&self, target: &OsStr, path: &Path, cred: Credentials) -> FsResult<()> {
        let host = self.host_path(path);
        if self.model == SecurityModel::MappedXattr {
            // Stored as a regular file holding the target.
            let file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&host)?;
            file.write_all_at(target.as_bytes(), 0)?;
        } else {
            std::os::unix::fs::symlink(target, &host)?;
        }
        if let Err(err) = self.post_create(&host, libc::S_IFLNK | 0o777, 0, cred) {
            let _ = fs::remove_file(&host);
            return Err(err);
        }
        Ok(())
    }

    fn link(&self, existing: &Path, new_path: &Path) -> FsResult<()> {
        fs::hard_link(self.host_path(existing), self.host_path(new_path))?;
        Ok(())
    }

    fn readlink(&self, path: &Path) -> FsResult<OsString> {
        let host = self.host_path(path);
        if let Some(mode) = self.mapped_mode(&host) {
            if mode & libc::S_IFMT == libc::S_IFLNK {
                return Ok(OsString::from_vec(fs::read(&host)?));
            }
        }
        Ok(fs::read_link(&host)?.into_os_string())
    }

    fn rename(&self, from: &Path, to: &Path) -> FsResult<()> {
        fs::rename(self.host_path(from), self.host_path(to))?;
        Ok(())
    }

    fn unlink(&self, path: &Path, remove_dir: bool) -> FsResult<()> {
        let host = self.host_path(path);
        if remove_dir {
            fs::remove_dir(&host)?;
        } else {
            fs::remove_file(&host)?;
        }
        Ok(())
    }

    fn remove(&self, path: &Path) -> FsResult<()> {
        let host = self.host_path(path);
        if fs::symlink_metadata(&host)?.is_dir() {
            fs::remove_dir(&host)?;
        } else {
            fs::remove_file(&host)?;
        }
        Ok(())
    }

    fn truncate(&self, path: &Path, size: u64) -> FsResult<()> {
        let size = i64::try_from(size).map_err(|_| FsError::from_errno(libc::EFBIG))?;
        nix::unistd::truncate(&self.host_path(path), size)?;
        Ok(())
    }

    fn chmod(&self, path: &Path, mode: u32) -> FsResult<()> {
        let host = self.host_path(path);
        if self.model == SecurityModel::MappedXattr {
            let current = match get_u64_xattr(&host, XATTR_MODE) {
                Some(m) => m as u32,
                None => fs::symlink_metadata(&host)?.mode(),
            };
            let updated = (current & libc::S_IFMT) | (mode & 0o7777);
            return set_u64_xattr(&host, XATTR_MODE, updated as u64);
        }
        if fs::symlink_metadata(&host)?.file_type().is_symlink() {
            return Err(FsError::Unsupported);
        }
        fs::set_permissions(&host, fs::Permissions::from_mode(mode & 0o7777))?;
        Ok(())
    }

    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> FsResult<()> {
        let host = self.host_path(path);
        match self.model {
            SecurityModel::MappedXattr => {
                if let Some(uid) = uid {
                    set_u64_xattr(&host, XATTR_UID, uid as u64)?;
                }
                if let Some(gid) = gid {
                    set_u64_xattr(&host, XATTR_GID, gid as u64)?;
                }
                Ok(())
            }
            SecurityModel::Passthrough => {
                std::os::unix::fs::lchown(&host, uid, gid)?;
                Ok(())
            }
            SecurityModel::None => match std::os::unix::fs::lchown(&host, uid, gid) {
                Err(err) if err.raw_os_error() == Some(libc::EPERM) => Ok(()),
                other => Ok(other?),
            },
        }
    }

    fn utimens(&self, path: &Path, atime: SetTime, mtime: SetTime) -> FsResult<()> {
        let c_path = cpath(&self.host_path(path))?;
        let times = [to_timespec(atime), to_timespec(mtime)];
        // SAFETY: c_path is NUL-terminated and times has two entries.
        let rc = unsafe {
            libc::utimensat(
                libc::AT_FDCWD,
                c_path.as_ptr(),
                times.as_ptr(),
                libc::AT_SYMLINK_NOFOLLOW,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn statfs(&self, path: &Path) -> FsResult<FsStats> {
        let host = self.host_path(path);
        let vfs = nix::sys::statvfs::statvfs(&host)?;
        let fs_type = nix::sys::statfs::statfs(&host)?.filesystem_type().0 as u32;
        Ok(FsStats {
            fs_type,
            bsize: vfs.block_size() as u32,
            blocks: vfs.blocks() as u64,
            bfree: vfs.blocks_free() as u64,
            bavail: vfs.blocks_available() as u64,
            files: vfs.files() as u64,
            ffree: vfs.files_free() as u64,
            fsid: vfs.filesystem_id() as u64,
            namelen: vfs.name_max() as u32,
        })
    }

    fn getxattr(&self, path: &Path, name: &str) -> FsResult<Vec<u8>> {
        lgetxattr(&self.host_path(path), name)
    }

    fn listxattr(&self, path: &Path) -> FsResult<Vec<u8>> {
        let list = llistxattr(&self.host_path(path))?;
        if self.model != SecurityModel::MappedXattr {
            return Ok(list);
        }
        // Hide the credential attributes from clients.
        let mut visible = Vec::with_capacity(list.len());
        for name in list.split(|b| *b == 0).filter(|n| !n.is_empty()) {
            if !name.starts_with(b"user.virtfs.") {
                visible.extend_from_slice(name);
                visible.push(0);
            }
        }
        Ok(visible)
    }

    fn setxattr(&self, path: &Path, name: &str, value: &[u8], flags: i32) -> FsResult<()> {
        lsetxattr(&self.host_path(path), name, value, flags)
    }

    fn removexattr(&self, path: &Path, name: &str) -> FsResult<()> {
        let c_path = cpath(&self.host_path(path))?;
        let c_name = cname(name)?;
        // SAFETY: both arguments are NUL-terminated.
        let rc = unsafe { libc::lremovexattr(c_path.as_ptr(), c_name.as_ptr()) };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }
}

impl Drop for LocalBackend {
    fn drop(&mut self) {
        let files = self.files.get_mut().len();
        let dirs = self.dirs.get_mut().len();
        if files + dirs > 0 {
            debug!(files, dirs, "closing handles left open at backend drop");
        }
    }
}

fn attr_from_metadata(meta: &fs::Metadata) -> FileAttr {
    FileAttr {
        dev: meta.dev(),
        ino: meta.ino(),
        mode: meta.mode(),
        nlink: meta.nlink(),
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev(),
        size: meta.size(),
        blksize: meta.blksize(),
        blocks: meta.blocks(),
        atime: Timespec {
            sec: meta.atime(),
            nsec: meta.atime_nsec(),
        },
        mtime: Timespec {
            sec: meta.mtime(),
            nsec: meta.mtime_nsec(),
        },
        ctime: Timespec {
            sec: meta.ctime(),
            nsec: meta.ctime_nsec(),
        },
    }
}

fn dirent_kind(ft: fs::FileType) -> u8 {
    if ft.is_dir() {
        libc::DT_DIR
    } else if ft.is_symlink() {
        libc::DT_LNK
    } else if ft.is_file() {
        libc::DT_REG
    } else if ft.is_char_device() {
        libc::DT_CHR
    } else if ft.is_block_device() {
        libc::DT_BLK
    } else if ft.is_fifo() {
        libc::DT_FIFO
    } else if ft.is_socket() {
        libc::DT_SOCK
    } else {
        libc::DT_UNKNOWN
    }
}

/// Build `OpenOptions` from host `O_*` flags. The last path component is
/// never followed.
fn open_options(flags: i32) -> OpenOptions {
    let mut options = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => options.write(true),
        libc::O_RDWR => options.read(true).write(true),
        _ => options.read(true),
    };
    options.custom_flags((flags & !libc::O_ACCMODE) | libc::O_NOFOLLOW | libc::O_CLOEXEC);
    options
}

fn to_timespec(time: SetTime) -> libc::timespec {
    match time {
        SetTime::Omit => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
        SetTime::Now => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_NOW,
        },
        SetTime::At(ts) => libc::timespec {
            tv_sec: ts.sec as libc::time_t,
            tv_nsec: ts.nsec as libc::c_long,
        },
    }
}

fn cpath(path: &Path) -> FsResult<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| FsError::InvalidArgument)
}

fn cname(name: &str) -> FsResult<CString> {
    CString::new(name).map_err(|_| FsError::InvalidArgument)
}

fn lgetxattr(path: &Path, name: &str) -> FsResult<Vec<u8>> {
    let c_path = cpath(path)?;
    let c_name = cname(name)?;
    loop {
        // SAFETY: a null buffer with size 0 queries the value length.
        let size = unsafe {
            libc::lgetxattr(c_path.as_ptr(), c_name.as_ptr(), std::ptr::null_mut(), 0)
        };
        if size < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let mut buf = vec![0u8; size as usize];
        if buf.is_empty() {
            return Ok(buf);
        }
        // SAFETY: buf is valid for buf.len() bytes.
        let got = unsafe {
            libc::lgetxattr(
                c_path.as_ptr(),
                c_name.as_ptr(),
                buf.as_mut_ptr().cast(),
                buf.len(),
            )
        };
        if got < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ERANGE) {
                continue;
            }
            return Err(err.into());
        }
        buf.truncate(got as usize);
        return Ok(buf);
    }
}

fn llistxattr(path: &Path) -> FsResult<Vec<u8>> {
    let c_path = cpath(path)?;
    loop {
        // SAFETY: a null buffer with size 0 queries the list length.
        let size = unsafe { libc::llistxattr(c_path.as_ptr(), std::ptr::null_mut(), 0) };
        if size < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let mut buf = vec![0u8; size as usize];
        if buf.is_empty() {
            return Ok(buf);
        }
        // SAFETY: buf is valid for buf.len() bytes.
        let got =
            unsafe { libc::llistxattr(c_path.as_ptr(), buf.as_mut_ptr().cast(), buf.len()) };
        if got < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ERANGE) {
                continue;
            }
            return Err(err.into());
        }
        buf.truncate(got as usize);
        return Ok(buf);
    }
}

fn lsetxattr(path: &Path, name: &str, value: &[u8], flags: i32) -> FsResult<()> {
    let c_path = cpath(path)?;
    let c_name = cname(name)?;
    // SAFETY: value is valid for value.len() bytes.
    let rc = unsafe {
        libc::lsetxattr(
            c_path.as_ptr(),
            c_name.as_ptr(),
            value.as_ptr().cast(),
            value.len(),
            flags,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

fn get_u64_xattr(path: &Path, name: &str) -> Option<u64> {
    let raw = lgetxattr(path, name).ok()?;
    let bytes: [u8; 8] = raw.as_slice().try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

fn set_u64_xattr(path: &Path, name: &str, value: u64) -> FsResult<()> {
    lsetxattr(path, name, &value.to_le_bytes(), 0)
}
