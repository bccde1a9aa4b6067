// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Fid table: client-chosen ids mapped to server-side handle state

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::backend::HandleId;
use crate::error::{FsError, FsResult};

/// Extended-attribute transfer carried by an xattr fid
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct XattrTransfer {
    pub name: String,
    pub value: Vec<u8>,
    /// Declared total length.
    pub len: u64,
    /// Bytes written so far; `None` for a read-only (xattrwalk) transfer.
    pub copied: Option<u64>,
    pub flags: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum FidKind {
    #[default]
    Unopened,
    File,
    Dir,
    Xattr(XattrTransfer),
}

impl FidKind {
    pub fn is_open(&self) -> bool {
        !matches!(self, FidKind::Unopened)
    }
}

/// Mutable part of a fid
#[derive(Debug, Default)]
pub struct FidState {
    pub path: PathBuf,
    pub kind: FidKind,
    /// Backend handle for `File`/`Dir`; `None` when reclaimed.
    pub handle: Option<HandleId>,
    /// Host open flags, reused when reopening after reclaim.
    pub open_flags: i32,
    pub uid: u32,
    pub non_reclaimable: bool,
    refs: u32,
    clunked: bool,
    referenced: bool,
}

impl FidState {
    pub fn refs(&self) -> u32 {
        self.refs
    }

    pub fn is_clunked(&self) -> bool {
        self.clunked
    }

    /// Take whatever must be released when the fid dies.
    fn take_teardown(&mut self) -> Option<Teardown> {
        let kind = std::mem::take(&mut self.kind);
        let handle = self.handle.take();
        match (kind, handle) {
            (FidKind::File, Some(h)) => Some(Teardown::Close(h)),
            (FidKind::Dir, Some(h)) => Some(Teardown::CloseDir(h)),
            (FidKind::Xattr(transfer), _) if transfer.copied.is_some() => Some(Teardown::Xattr {
                path: self.path.clone(),
                transfer,
            }),
            _ => None,
        }
    }
}

/// Work left over when a fid is destroyed or reclaimed
#[derive(Debug, PartialEq, Eq)]
pub enum Teardown {
    Close(HandleId),
    CloseDir(HandleId),
    /// Commit (or reject) a pending xattr create.
    Xattr { path: PathBuf, transfer: XattrTransfer },
}

/// Backend state to recreate for a reclaimed fid
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reopen {
    pub path: PathBuf,
    pub flags: i32,
    pub dir: bool,
}

/// A live fid shared between the table and the requests using it
#[derive(Debug)]
pub struct Fid {
    id: u32,
    state: Mutex<FidState>,
    dir_lock: tokio::sync::Mutex<()>,
}

impl Fid {
    fn new(id: u32, path: PathBuf, uid: u32) -> Self {
        Self {
            id,
            state: Mutex::new(FidState {
                path,
                uid,
                refs: 1,
                referenced: true,
                ..FidState::default()
            }),
            dir_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> MutexGuard<'_, FidState> {
        self.state.lock()
    }

    pub fn path(&self) -> PathBuf {
        self.state.lock().path.clone()
    }

    /// Serializes directory position changes (readdir and .u directory reads).
    pub fn dir_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.dir_lock
    }

    /// Backend state that has to be recreated before the fid can be used.
    pub fn reopen_needed(&self) -> Option<Reopen> {
        let st = self.state.lock();
        match st.kind {
            FidKind::File | FidKind::Dir if st.handle.is_none() => Some(Reopen {
                path: st.path.clone(),
                flags: st.open_flags,
                dir: st.kind == FidKind::Dir,
            }),
            _ => None,
        }
    }

    /// Install a reopened handle. Returns `false` when another request
    /// already did, in which case the caller owns `handle` and must close it.
    pub fn install_reopened(&self, handle: HandleId) -> bool {
        let mut st = self.state.lock();
        if st.handle.is_some() || !matches!(st.kind, FidKind::File | FidKind::Dir) {
            return false;
        }
        st.handle = Some(handle);
        true
    }

    /// Mark the fid open with `handle`.
    pub fn set_open(&self, kind: FidKind, handle: Option<HandleId>, flags: i32) {
        let mut st = self.state.lock();
        st.kind = kind;
        st.handle = handle;
        st.open_flags = flags;
    }
}

/// Map from protocol fid numbers to live fids
#[derive(Debug, Default)]
pub struct FidTable {
    fids: Mutex<BTreeMap<u32, Arc<Fid>>>,
}

impl FidTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.fids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.fids.lock().is_empty()
    }

    /// Create fid `id` at `path`. The caller holds the initial reference.
    pub fn allocate(&self, id: u32, path: PathBuf, uid: u32) -> FsResult<Arc<Fid>> {
        let mut fids = self.fids.lock();
        if fids.contains_key(&id) {
            return Err(FsError::DuplicateFid(id));
        }
        let fid = Arc::new(Fid::new(id, path, uid));
        fids.insert(id, fid.clone());
        Ok(fid)
    }

    /// Take a reference to fid `id` and mark it recently used.
    pub fn acquire(&self, id: u32) -> FsResult<Arc<Fid>> {
        let fids = self.fids.lock();
        let fid = fids.get(&id).cloned().ok_or(FsError::UnknownFid(id))?;
        {
            let mut st = fid.state.lock();
            st.refs += 1;
            st.referenced = true;
        }
        Ok(fid)
    }

    /// Drop a reference. Returns the teardown work when this destroyed the fid.
    pub fn release(&self, fid: &Fid) -> Option<Teardown> {
        let mut st = fid.state.lock();
        debug_assert!(st.refs > 0, "fid {} released more often than acquired", fid.id);
        st.refs = st.refs.saturating_sub(1);
        if st.refs == 0 && st.clunked {
            st.take_teardown()
        } else {
            None
        }
    }

    /// Remove `id` from the table. The returned fid carries an extra
    /// reference; releasing it destroys the fid once no request holds it.
    pub fn clunk(&self, id: u32) -> FsResult<Arc<Fid>> {
        let fid = self.fids.lock().remove(&id).ok_or(FsError::UnknownFid(id))?;
        {
            let mut st = fid.state.lock();
            st.clunked = true;
            st.refs += 1;
        }
        Ok(fid)
    }

    /// Detach every fid. Teardown for idle fids is returned; busy fids are
    /// torn down by their last release.
    pub fn reset(&self) -> Vec<Teardown> {
        let drained = std::mem::take(&mut *self.fids.lock());
        drained
            .into_values()
            .filter_map(|fid| {
                let mut st = fid.state.lock();
                st.clunked = true;
                if st.refs == 0 {
                    st.take_teardown()
                } else {
                    None
                }
            })
            .collect()
    }

    /// One pass of the reclaim clock. Idle, reclaimable fids that were not
    /// referenced since the last pass give up their backend handle; referenced
    /// ones lose the mark and survive this pass.
    pub fn collect_reclaimable(&self, target: usize) -> Vec<Teardown> {
        let fids = self.fids.lock();
        let mut reclaimed = Vec::new();
        for fid in fids.values() {
            if reclaimed.len() >= target {
                break;
            }
            let mut st = fid.state.lock();
            if st.refs > 0 || st.non_reclaimable {
                continue;
            }
            if st.referenced {
                st.referenced = false;
                continue;
            }
            let teardown = match (&st.kind, st.handle) {
                (FidKind::File, Some(h)) => Teardown::Close(h),
                (FidKind::Dir, Some(h)) => Teardown::CloseDir(h),
                _ => continue,
            };
            st.handle = None;
            reclaimed.push(teardown);
        }
        reclaimed
    }

    /// Flag every fid at `path` as non-reclaimable. Fids that were already
    /// reclaimed are returned acquired so the caller can reopen and release
    /// them.
    pub fn mark_unreclaimable(&self, path: &Path) -> Vec<Arc<Fid>> {
        let fids = self.fids.lock();
        let mut to_reopen = Vec::new();
        for fid in fids.values() {
            let mut st = fid.state.lock();
            if st.path != path {
                continue;
            }
            st.non_reclaimable = true;
            if matches!(st.kind, FidKind::File | FidKind::Dir) && st.handle.is_none() {
                st.refs += 1;
                to_reopen.push(fid.clone());
            }
        }
        to_reopen
    }

    /// Rewrite the path of every fid at or below `old` to live under `new`.
    pub fn fix_paths(&self, old: &Path, new: &Path) {
        let fids = self.fids.lock();
        for fid in fids.values() {
            let mut st = fid.state.lock();
            if let Ok(rest) = st.path.strip_prefix(old) {
                st.path = if rest.as_os_str().is_empty() {
                    new.to_path_buf()
                } else {
                    new.join(rest)
                };
            }
        }
    }
}
