// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory path-based backend used by unit and scenario tests

use std::collections::{BTreeMap, HashMap};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::backend::{
    Backend, Credentials, DirEntry, FileAttr, FsStats, HandleId, SetTime, Timespec,
};
use crate::error::{FsError, FsResult};

pub const ROOT_DEV: u64 = 1;
const FIRST_AUTO_INO: u64 = 1000;

/// Nodes are identified the way the host identifies files: by device and inode.
type NodeKey = (u64, u64);

#[derive(Clone, Debug, Default)]
struct Node {
    attr: FileAttr,
    data: Vec<u8>,
    target: OsString,
    xattrs: BTreeMap<String, Vec<u8>>,
}

enum Handle {
    File { key: NodeKey },
    Dir { entries: Vec<DirEntry>, pos: usize },
}

#[derive(Default)]
struct Tree {
    names: BTreeMap<PathBuf, NodeKey>,
    nodes: HashMap<NodeKey, Node>,
}

impl Tree {
    fn key(&self, path: &Path) -> FsResult<NodeKey> {
        self.names.get(path).copied().ok_or(FsError::NotFound)
    }

    fn node(&self, path: &Path) -> FsResult<&Node> {
        let key = self.key(path)?;
        self.nodes.get(&key).ok_or(FsError::NotFound)
    }

    fn node_mut(&mut self, path: &Path) -> FsResult<&mut Node> {
        let key = self.key(path)?;
        self.nodes.get_mut(&key).ok_or(FsError::NotFound)
    }

    fn children(&self, dir: &Path) -> Vec<(OsString, NodeKey)> {
        self.names
            .iter()
            .filter(|(path, _)| path.parent() == Some(dir))
            .filter_map(|(path, key)| Some((path.file_name()?.to_os_string(), *key)))
            .collect()
    }

    fn check_parent(&self, path: &Path) -> FsResult<()> {
        let parent = path.parent().ok_or(FsError::InvalidArgument)?;
        if !self.node(parent)?.attr.is_dir() {
            return Err(FsError::from_errno(libc::ENOTDIR));
        }
        if self.names.contains_key(path) {
            return Err(FsError::AlreadyExists);
        }
        Ok(())
    }
}

#[derive(Default)]
struct Gate {
    armed: bool,
    blocked: usize,
    interrupt: Option<bool>,
}

/// A backend that keeps everything in memory
///
/// Writes can be held at a gate to simulate a slow device, and open/close
/// calls are counted so tests can observe descriptor reclaim.
pub struct MemBackend {
    tree: Mutex<Tree>,
    handles: Mutex<HashMap<u64, Handle>>,
    next_handle: AtomicU64,
    next_ino: AtomicU64,
    opens: AtomicUsize,
    closes: AtomicUsize,
    gate: Mutex<Gate>,
    gate_changed: Condvar,
}

impl Default for MemBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemBackend {
    /// An empty export containing only the root directory.
    pub fn new() -> Self {
        let backend = Self {
            tree: Mutex::new(Tree::default()),
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            next_ino: AtomicU64::new(FIRST_AUTO_INO),
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            gate: Mutex::new(Gate::default()),
            gate_changed: Condvar::new(),
        };
        backend.insert(PathBuf::new(), libc::S_IFDIR | 0o755, ROOT_DEV, None, Vec::new());
        backend
    }

    fn insert(&self, path: PathBuf, mode: u32, dev: u64, ino: Option<u64>, data: Vec<u8>) {
        let ino = ino.unwrap_or_else(|| self.next_ino.fetch_add(1, Ordering::SeqCst));
        let attr = FileAttr {
            dev,
            ino,
            mode,
            nlink: 1,
            size: data.len() as u64,
            blksize: 4096,
            ..FileAttr::default()
        };
        let mut tree = self.tree.lock();
        tree.names.insert(path, (dev, ino));
        tree.nodes.insert(
            (dev, ino),
            Node {
                attr,
                data,
                ..Node::default()
            },
        );
    }

    pub fn with_dir(self, path: &str) -> Self {
        self.insert(path.into(), libc::S_IFDIR | 0o755, ROOT_DEV, None, Vec::new());
        self
    }

    pub fn with_file(self, path: &str, contents: &[u8]) -> Self {
        self.insert(path.into(), libc::S_IFREG | 0o644, ROOT_DEV, None, contents.to_vec());
        self
    }

    /// A regular file with an explicit device and inode number.
    pub fn with_file_on(self, path: &str, dev: u64, ino: u64, contents: &[u8]) -> Self {
        self.insert(path.into(), libc::S_IFREG | 0o644, dev, Some(ino), contents.to_vec());
        self
    }

    /// A directory that is the root of another mounted device.
    pub fn with_dir_on(self, path: &str, dev: u64) -> Self {
        self.insert(path.into(), libc::S_IFDIR | 0o755, dev, None, Vec::new());
        self
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        let tree = self.tree.lock();
        tree.node(Path::new(path)).ok().map(|n| n.data.clone())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.tree.lock().names.contains_key(Path::new(path))
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Handles currently open.
    pub fn open_handles(&self) -> usize {
        self.handles.lock().len()
    }

    /// Hold every subsequent write until [`release_writes`](Self::release_writes).
    pub fn hold_writes(&self) {
        let mut gate = self.gate.lock();
        gate.armed = true;
        gate.interrupt = None;
    }

    /// Writes currently waiting at the gate.
    pub fn blocked_writes(&self) -> usize {
        self.gate.lock().blocked
    }

    /// Let held writes go; with `interrupt` they fail with `EINTR` instead.
    pub fn release_writes(&self, interrupt: bool) {
        let mut gate = self.gate.lock();
        gate.armed = false;
        gate.interrupt = Some(interrupt);
        self.gate_changed.notify_all();
    }

    fn pass_gate(&self) -> FsResult<()> {
        let mut gate = self.gate.lock();
        if !gate.armed {
            return Ok(());
        }
        gate.blocked += 1;
        while gate.interrupt.is_none() {
            self.gate_changed.wait(&mut gate);
        }
        gate.blocked -= 1;
        match gate.interrupt {
            Some(true) => Err(FsError::from_errno(libc::EINTR)),
            _ => Ok(()),
        }
    }

    fn new_handle(&self, handle: Handle) -> HandleId {
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.handles.lock().insert(id, handle);
        self.opens.fetch_add(1, Ordering::SeqCst);
        HandleId(id)
    }

    fn drop_handle(&self, handle: HandleId) -> FsResult<()> {
        self.handles
            .lock()
            .remove(&handle.0)
            .ok_or_else(|| FsError::from_errno(libc::EBADF))?;
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn file_key(&self, handle: HandleId) -> FsResult<NodeKey> {
        match self.handles.lock().get(&handle.0) {
            Some(Handle::File { key }) => Ok(*key),
            _ => Err(FsError::from_errno(libc::EBADF)),
        }
    }

    fn with_dir_handle<T>(
        &self,
        handle: HandleId,
        f: impl FnOnce(&[DirEntry], &mut usize) -> T,
    ) -> FsResult<T> {
        match self.handles.lock().get_mut(&handle.0) {
            Some(Handle::Dir { entries, pos }) => Ok(f(entries, pos)),
            _ => Err(FsError::from_errno(libc::EBADF)),
        }
    }

    fn make_node(&self, path: &Path, mode: u32, cred: Credentials) -> FsResult<()> {
        let dev = {
            let tree = self.tree.lock();
            tree.check_parent(path)?;
            tree.node(path.parent().unwrap_or(Path::new("")))?.attr.dev
        };
        self.insert(path.to_path_buf(), mode, dev, None, Vec::new());
        let mut tree = self.tree.lock();
        let node = tree.node_mut(path)?;
        node.attr.uid = cred.uid;
        node.attr.gid = cred.gid;
        Ok(())
    }
}

fn dirent_kind(mode: u32) -> u8 {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => libc::DT_DIR,
        libc::S_IFLNK => libc::DT_LNK,
        libc::S_IFREG => libc::DT_REG,
        _ => libc::DT_UNKNOWN,
    }
}

impl Backend for MemBackend {
    fn is_path_based(&self) -> bool {
        true
    }

    fn lstat(&self, path: &Path) -> FsResult<FileAttr> {
        Ok(self.tree.lock().node(path)?.attr.clone())
    }

    fn fstat(&self, handle: HandleId) -> FsResult<FileAttr> {
        let key = self.file_key(handle)?;
        let tree = self.tree.lock();
        Ok(tree.nodes.get(&key).ok_or(FsError::NotFound)?.attr.clone())
    }

    fn open(&self, path: &Path, flags: i32) -> FsResult<HandleId> {
        let key = {
            let mut tree = self.tree.lock();
            let key = tree.key(path)?;
            let node = tree.node_mut(path)?;
            if node.attr.is_dir() {
                return Err(FsError::from_errno(libc::EISDIR));
            }
            if flags & libc::O_TRUNC != 0 {
                node.data.clear();
                node.attr.size = 0;
            }
            key
        };
        Ok(self.new_handle(Handle::File { key }))
    }

    fn create(
        &self,
        path: &Path,
        flags: i32,
        mode: u32,
        cred: Credentials,
    ) -> FsResult<HandleId> {
        if self.tree.lock().names.contains_key(path) {
            if flags & libc::O_EXCL != 0 {
                return Err(FsError::AlreadyExists);
            }
            return self.open(path, flags);
        }
        self.make_node(path, libc::S_IFREG | (mode & 0o7777), cred)?;
        self.open(path, flags & !libc::O_TRUNC)
    }

    fn close(&self, handle: HandleId) -> FsResult<()> {
        self.drop_handle(handle)
    }

    fn opendir(&self, path: &Path) -> FsResult<HandleId> {
        let entries = {
            let tree = self.tree.lock();
            let dir = tree.node(path)?;
            if !dir.attr.is_dir() {
                return Err(FsError::from_errno(libc::ENOTDIR));
            }
            let mut entries = vec![
                (OsString::from("."), dir.attr.ino, libc::DT_DIR),
                (OsString::from(".."), dir.attr.ino, libc::DT_DIR),
            ];
            for (name, key) in tree.children(path) {
                let mode = tree.nodes.get(&key).map_or(0, |n| n.attr.mode);
                entries.push((name, key.1, dirent_kind(mode)));
            }
            entries
                .into_iter()
                .enumerate()
                .map(|(i, (name, ino, kind))| DirEntry {
                    ino,
                    offset: i as u64 + 1,
                    kind,
                    name,
                })
                .collect()
        };
        Ok(self.new_handle(Handle::Dir { entries, pos: 0 }))
    }

    fn readdir(&self, handle: HandleId) -> FsResult<Option<DirEntry>> {
        self.with_dir_handle(handle, |entries, pos| {
            let entry = entries.get(*pos).cloned();
            if entry.is_some() {
                *pos += 1;
            }
            entry
        })
    }

    fn telldir(&self, handle: HandleId) -> FsResult<u64> {
        self.with_dir_handle(handle, |_, pos| *pos as u64)
    }

    fn seekdir(&self, handle: HandleId, offset: u64) -> FsResult<()> {
        self.with_dir_handle(handle, |entries, pos| {
            *pos = (offset as usize).min(entries.len());
        })
    }

    fn rewinddir(&self, handle: HandleId) -> FsResult<()> {
        self.seekdir(handle, 0)
    }

    fn closedir(&self, handle: HandleId) -> FsResult<()> {
        self.drop_handle(handle)
    }

    fn read(&self, handle: HandleId, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        let key = self.file_key(handle)?;
        let tree = self.tree.lock();
        let data = &tree.nodes.get(&key).ok_or(FsError::NotFound)?.data;
        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write(&self, handle: HandleId, offset: u64, data: &[u8]) -> FsResult<usize> {
        let key = self.file_key(handle)?;
        self.pass_gate()?;
        let mut tree = self.tree.lock();
        let node = tree.nodes.get_mut(&key).ok_or(FsError::NotFound)?;
        let end = offset as usize + data.len();
        if node.data.len() < end {
            node.data.resize(end, 0);
        }
        node.data[offset as usize..end].copy_from_slice(data);
        node.attr.size = node.data.len() as u64;
        Ok(data.len())
    }

    fn fsync(&self, handle: HandleId, _datasync: bool) -> FsResult<()> {
        self.file_key(handle).map(|_| ())
    }

    fn mkdir(&self, path: &Path, mode: u32, cred: Credentials) -> FsResult<()> {
        self.make_node(path, libc::S_IFDIR | (mode & 0o7777), cred)
    }

    fn mknod(&self, path: &Path, mode: u32, rdev: u64, cred: Credentials) -> FsResult<()> {
        self.make_node(path, mode, cred)?;
        self.tree.lock().node_mut(path)?.attr.rdev = rdev;
        Ok(())
    }

    fn symlink(&self, target: &OsStr, path: &Path, cred: Credentials) -> FsResult<()> {
        self.make_node(path, libc::S_IFLNK | 0o777, cred)?;
        let mut tree = self.tree.lock();
        let node = tree.node_mut(path)?;
        node.target = target.to_os_string();
        node.attr.size = target.len() as u64;
        Ok(())
    }

    fn link(&self, existing: &Path, new_path: &Path) -> FsResult<()> {
        let mut tree = self.tree.lock();
        tree.check_parent(new_path)?;
        let key = tree.key(existing)?;
        tree.node_mut(existing)?.attr.nlink += 1;
        tree.names.insert(new_path.to_path_buf(), key);
        Ok(())
    }

    fn readlink(&self, path: &Path) -> FsResult<OsString> {
        let tree = self.tree.lock();
        let node = tree.node(path)?;
        if !node.attr.is_symlink() {
            return Err(FsError::InvalidArgument);
        }
        Ok(node.target.clone())
    }

    fn rename(&self, from: &Path, to: &Path) -> FsResult<()> {
        let mut tree = self.tree.lock();
        tree.key(from)?;
        let moved: Vec<(PathBuf, NodeKey)> = tree
            .names
            .iter()
            .filter(|(path, _)| path.starts_with(from))
            .map(|(path, key)| (path.clone(), *key))
            .collect();
        tree.names.remove(to);
        for (path, key) in moved {
            tree.names.remove(&path);
            let suffix = path.strip_prefix(from).unwrap_or(Path::new(""));
            tree.names.insert(to.join(suffix), key);
        }
        Ok(())
    }

    fn unlink(&self, path: &Path, remove_dir: bool) -> FsResult<()> {
        let mut tree = self.tree.lock();
        let is_dir = tree.node(path)?.attr.is_dir();
        match (is_dir, remove_dir) {
            (true, false) => return Err(FsError::from_errno(libc::EISDIR)),
            (false, true) => return Err(FsError::from_errno(libc::ENOTDIR)),
            (true, true) if !tree.children(path).is_empty() => {
                return Err(FsError::from_errno(libc::ENOTEMPTY))
            }
            _ => {}
        }
        let key = tree.key(path)?;
        tree.names.remove(path);
        if let Some(node) = tree.nodes.get_mut(&key) {
            node.attr.nlink = node.attr.nlink.saturating_sub(1);
        }
        Ok(())
    }

    fn remove(&self, path: &Path) -> FsResult<()> {
        let is_dir = self.lstat(path)?.is_dir();
        self.unlink(path, is_dir)
    }

    fn truncate(&self, path: &Path, size: u64) -> FsResult<()> {
        let mut tree = self.tree.lock();
        let node = tree.node_mut(path)?;
        node.data.resize(size as usize, 0);
        node.attr.size = size;
        Ok(())
    }

    fn chmod(&self, path: &Path, mode: u32) -> FsResult<()> {
        let mut tree = self.tree.lock();
        let node = tree.node_mut(path)?;
        node.attr.mode = (node.attr.mode & libc::S_IFMT) | (mode & 0o7777);
        Ok(())
    }

    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> FsResult<()> {
        let mut tree = self.tree.lock();
        let node = tree.node_mut(path)?;
        if let Some(uid) = uid {
            node.attr.uid = uid;
        }
        if let Some(gid) = gid {
            node.attr.gid = gid;
        }
        Ok(())
    }

    fn utimens(&self, path: &Path, atime: SetTime, mtime: SetTime) -> FsResult<()> {
        let mut tree = self.tree.lock();
        let node = tree.node_mut(path)?;
        let apply = |slot: &mut Timespec, t: SetTime| match t {
            SetTime::Omit => {}
            SetTime::Now => *slot = Timespec { sec: 1, nsec: 0 },
            SetTime::At(ts) => *slot = ts,
        };
        apply(&mut node.attr.atime, atime);
        apply(&mut node.attr.mtime, mtime);
        Ok(())
    }

    fn statfs(&self, path: &Path) -> FsResult<FsStats> {
        self.lstat(path)?;
        Ok(FsStats {
            fs_type: 0x0102_1994,
            bsize: 4096,
            blocks: 1 << 20,
            bfree: 1 << 19,
            bavail: 1 << 19,
            files: 1 << 16,
            ffree: 1 << 15,
            fsid: 7,
            namelen: 255,
        })
    }

    fn getxattr(&self, path: &Path, name: &str) -> FsResult<Vec<u8>> {
        let tree = self.tree.lock();
        tree.node(path)?
            .xattrs
            .get(name)
            .cloned()
            .ok_or_else(|| FsError::from_errno(libc::ENODATA))
    }

    fn listxattr(&self, path: &Path) -> FsResult<Vec<u8>> {
        let tree = self.tree.lock();
        let mut list = Vec::new();
        for name in tree.node(path)?.xattrs.keys() {
            list.extend_from_slice(name.as_bytes());
            list.push(0);
        }
        Ok(list)
    }

    fn setxattr(&self, path: &Path, name: &str, value: &[u8], _flags: i32) -> FsResult<()> {
        let mut tree = self.tree.lock();
        tree.node_mut(path)?
            .xattrs
            .insert(name.to_string(), value.to_vec());
        Ok(())
    }

    fn removexattr(&self, path: &Path, name: &str) -> FsResult<()> {
        let mut tree = self.tree.lock();
        tree.node_mut(path)?
            .xattrs
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| FsError::from_errno(libc::ENODATA))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rename_moves_the_subtree() {
        let backend = MemBackend::new()
            .with_dir("a")
            .with_file("a/c", b"x");
        backend.rename(Path::new("a"), Path::new("b")).unwrap();
        assert!(!backend.exists("a/c"));
        assert_eq!(backend.contents("b/c").unwrap(), b"x");
    }

    #[test]
    fn open_handles_follow_the_inode() {
        let backend = MemBackend::new().with_file("f", b"hello");
        let h = backend.open(Path::new("f"), libc::O_RDONLY).unwrap();
        backend.rename(Path::new("f"), Path::new("g")).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(backend.read(h, 0, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        backend.close(h).unwrap();
        assert_eq!((backend.opens(), backend.closes()), (1, 1));
    }

    #[test]
    fn same_inode_on_two_devices_stays_distinct() {
        let backend = MemBackend::new()
            .with_dir_on("mnt", 2)
            .with_file_on("a", ROOT_DEV, 42, b"root")
            .with_file_on("mnt/b", 2, 42, b"other");

        assert_eq!(backend.contents("a").unwrap(), b"root");
        assert_eq!(backend.contents("mnt/b").unwrap(), b"other");
        let a = backend.lstat(Path::new("a")).unwrap();
        let b = backend.lstat(Path::new("mnt/b")).unwrap();
        assert_eq!((a.dev, a.ino), (ROOT_DEV, 42));
        assert_eq!((b.dev, b.ino), (2, 42));

        let h = backend.open(Path::new("mnt/b"), libc::O_RDONLY).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(backend.read(h, 0, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"other");
        backend.close(h).unwrap();
    }

    #[test]
    fn unusual_names_are_listed_verbatim() {
        use std::os::unix::ffi::OsStrExt;

        let backend = MemBackend::new();
        let name = OsStr::from_bytes(b"bad\xffname");
        backend
            .mkdir(Path::new(name), 0o755, Credentials::default())
            .unwrap();
        let dir = backend.opendir(Path::new("")).unwrap();
        let mut names = Vec::new();
        while let Some(entry) = backend.readdir(dir).unwrap() {
            names.push(entry.name);
        }
        assert!(names.iter().any(|n| n.as_bytes() == b"bad\xffname"));
        backend.closedir(dir).unwrap();
    }
}
