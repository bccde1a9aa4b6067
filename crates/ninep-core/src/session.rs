// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-connection session state

use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ninep_proto::flags::qid_type_for_mode;
use ninep_proto::messages::{Rerror, Rlerror};
use ninep_proto::{mtype, Dialect, Qid, Rmessage, IOHDRSZ};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::backend::{Backend, FileAttr};
use crate::config::SessionConfig;
use crate::error::{FsError, FsResult};
use crate::executor::WorkerPool;
use crate::fence::RenameFence;
use crate::fid::{Fid, FidTable, Reopen, Teardown};
use crate::reclaim::{FdBudget, FdLimits};
use crate::remap::InodeRemapper;
use crate::request::{ActiveRequests, RequestContext};

/// Protocol parameters fixed by `Tversion`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Negotiated {
    pub msize: u32,
    /// `None` until a dialect has been agreed.
    pub dialect: Option<Dialect>,
}

/// State for one client connection
pub struct Session {
    config: SessionConfig,
    backend: Arc<dyn Backend>,
    fids: FidTable,
    fence: RenameFence,
    remapper: Mutex<InodeRemapper>,
    fds: Arc<FdBudget>,
    pool: WorkerPool,
    active: ActiveRequests,
    negotiated: Mutex<Negotiated>,
}

impl Session {
    pub fn new(config: SessionConfig, backend: Arc<dyn Backend>) -> Arc<Self> {
        let limits = FdLimits::from_config(&config);
        Self::with_limits(config, backend, limits)
    }

    /// A session with a budget of its own.
    pub fn with_limits(
        config: SessionConfig,
        backend: Arc<dyn Backend>,
        limits: FdLimits,
    ) -> Arc<Self> {
        Self::with_budget(config, backend, Arc::new(FdBudget::new(limits)))
    }

    /// A session counting its descriptors against a budget shared with every
    /// other session on the same backend.
    pub fn with_budget(
        config: SessionConfig,
        backend: Arc<dyn Backend>,
        fds: Arc<FdBudget>,
    ) -> Arc<Self> {
        let limits = fds.limits();
        debug!(
            msize = config.msize,
            workers = config.workers,
            readonly = config.readonly,
            multidevs = ?config.multidevs,
            high_water = limits.high_water,
            reclaim_target = limits.reclaim_target,
            "session created"
        );
        let session = Arc::new(Self {
            fence: RenameFence::new(backend.is_path_based()),
            remapper: Mutex::new(InodeRemapper::new(config.multidevs)),
            fds,
            pool: WorkerPool::new(config.workers),
            active: ActiveRequests::default(),
            negotiated: Mutex::new(Negotiated {
                msize: config.msize,
                dialect: None,
            }),
            fids: FidTable::new(),
            backend,
            config,
        });
        session.fds.register(&session);
        session
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn fids(&self) -> &FidTable {
        &self.fids
    }

    pub fn fence(&self) -> &RenameFence {
        &self.fence
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn active(&self) -> &ActiveRequests {
        &self.active
    }

    pub fn fds(&self) -> &FdBudget {
        &self.fds
    }

    pub fn negotiated(&self) -> Negotiated {
        *self.negotiated.lock()
    }

    pub fn set_negotiated(&self, negotiated: Negotiated) {
        *self.negotiated.lock() = negotiated;
    }

    pub fn msize(&self) -> u32 {
        self.negotiated.lock().msize
    }

    pub fn dialect(&self) -> Option<Dialect> {
        self.negotiated.lock().dialect
    }

    /// Error reply in the negotiated dialect's format.
    pub fn error_reply(&self, err: &FsError) -> Rmessage {
        let ecode = err.errno();
        match self.dialect() {
            Some(Dialect::Linux) => Rlerror {
                ecode: ecode as u32,
            }
            .into(),
            _ => Rerror {
                ename: nix::errno::Errno::from_raw(ecode).desc().to_string(),
                errno: ecode as u32,
            }
            .into(),
        }
    }

    /// Largest read/write payload worth issuing for a filesystem block size.
    pub fn iounit(&self, bsize: u32) -> u32 {
        let avail = self.msize().saturating_sub(IOHDRSZ);
        if bsize == 0 {
            return avail;
        }
        match bsize * (avail / bsize) {
            0 => avail,
            unit => unit,
        }
    }

    pub fn set_root_device(&self, dev: u64) {
        self.remapper.lock().set_root_device(dev);
    }

    /// Qid for an attribute set, remapping the inode number as configured.
    pub fn qid_for(&self, attr: &FileAttr) -> FsResult<Qid> {
        let path = self.remapper.lock().map(attr.dev, attr.ino)?;
        Ok(Qid {
            ty: qid_type_for_mode(attr.mode),
            version: (attr.mtime.sec as u64 ^ (attr.size << 8)) as u32,
            path,
        })
    }

    /// Qid path for a directory entry found on `dev`.
    pub fn map_inode(&self, dev: u64, ino: u64) -> FsResult<u64> {
        self.remapper.lock().map(dev, ino)
    }

    /// Run a backend call on a worker.
    pub async fn blocking<T, F>(&self, req: &RequestContext, f: F) -> FsResult<T>
    where
        F: FnOnce(&dyn Backend) -> FsResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let backend = self.backend.clone();
        self.pool.run(req, move || f(backend.as_ref())).await
    }

    /// Run a backend call on `fid`'s path, holding the rename fence shared.
    pub async fn with_path<T, F>(&self, req: &RequestContext, fid: &Fid, f: F) -> FsResult<T>
    where
        F: FnOnce(&dyn Backend, &Path) -> FsResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let _fence = self.fence.read().await;
        let path = fid.path();
        self.blocking(req, move |backend| f(backend, &path)).await
    }

    /// Look up and acquire `id`, reopening its backend state if it was
    /// reclaimed.
    pub async fn get_fid(self: &Arc<Self>, req: &RequestContext, id: u32) -> FsResult<FidRef> {
        let fid = FidRef::adopt(self.clone(), self.fids.acquire(id)?);
        self.ensure_open(req, &fid).await?;
        Ok(fid)
    }

    /// Allocate `id` at `path`.
    pub fn new_fid(self: &Arc<Self>, id: u32, path: PathBuf, uid: u32) -> FsResult<FidRef> {
        Ok(FidRef::adopt(self.clone(), self.fids.allocate(id, path, uid)?))
    }

    /// Detach `id` from the table; the fid dies when the returned reference
    /// and every other holder are released.
    pub fn clunk_fid(self: &Arc<Self>, id: u32) -> FsResult<FidRef> {
        Ok(FidRef::adopt(self.clone(), self.fids.clunk(id)?))
    }

    async fn ensure_open(&self, req: &RequestContext, fid: &Fid) -> FsResult<()> {
        while let Some(reopen) = fid.reopen_needed() {
            match self.reopen(req, fid, reopen).await {
                Err(err) if err.is_interrupted() && !req.is_cancelled() => continue,
                other => return other,
            }
        }
        Ok(())
    }

    async fn reopen(&self, req: &RequestContext, fid: &Fid, reopen: Reopen) -> FsResult<()> {
        debug!(fid = fid.id(), path = %reopen.path.display(), "reopening reclaimed fid");
        let handle = {
            let _fence = self.fence.read().await;
            let path = fid.path();
            let flags = reopen.flags;
            if reopen.dir {
                self.blocking(req, move |b| b.opendir(&path)).await?
            } else {
                self.blocking(req, move |b| b.open(&path, flags)).await?
            }
        };
        if fid.install_reopened(handle) {
            self.note_opened().await;
        } else {
            let backend = self.backend.clone();
            let dir = reopen.dir;
            let closed = self
                .pool
                .run_detached(move || {
                    if dir {
                        backend.closedir(handle)
                    } else {
                        backend.close(handle)
                    }
                })
                .await;
            if let Err(err) = closed {
                debug!(error = %err, "closing duplicate reopen failed");
            }
        }
        Ok(())
    }

    /// Count a newly opened descriptor and reclaim idle ones if the
    /// high-water mark is exceeded.
    pub async fn note_opened(&self) {
        if self.fds.opened() {
            self.reclaim().await;
        }
    }

    /// One reclaim pass over the fid tables of every session sharing the
    /// budget.
    pub async fn reclaim(&self) {
        let Some(_running) = self.fds.begin_reclaim() else {
            return;
        };
        let mut remaining = usize::try_from(self.fds.limits().reclaim_target).unwrap_or(usize::MAX);
        for session in self.fds.sessions() {
            if remaining == 0 {
                break;
            }
            let reclaimed = session.fids.collect_reclaimable(remaining);
            if reclaimed.is_empty() {
                continue;
            }
            remaining = remaining.saturating_sub(reclaimed.len());
            debug!(
                count = reclaimed.len(),
                open = self.fds.open_count(),
                "reclaiming idle descriptors"
            );
            for teardown in reclaimed {
                if let Err(err) = session.run_teardown(teardown).await {
                    warn!(error = %err, "closing reclaimed descriptor failed");
                }
            }
        }
    }

    /// Reopen reclaimed fids at `path` and pin them open, so an unlink does
    /// not strand them.
    pub async fn mark_unreclaimable(
        self: &Arc<Self>,
        req: &RequestContext,
        path: &Path,
    ) -> FsResult<()> {
        for fid in self.fids.mark_unreclaimable(path) {
            let fid = FidRef::adopt(self.clone(), fid);
            self.ensure_open(req, &fid).await?;
        }
        Ok(())
    }

    /// Perform the work left behind by a destroyed or reclaimed fid.
    pub async fn run_teardown(&self, teardown: Teardown) -> FsResult<()> {
        let closes_fd = matches!(teardown, Teardown::Close(_) | Teardown::CloseDir(_));
        let _fence = match teardown {
            Teardown::Xattr { .. } => self.fence.read().await,
            _ => None,
        };
        let backend = self.backend.clone();
        let result = self
            .pool
            .run_detached(move || apply_teardown(backend.as_ref(), teardown))
            .await;
        if closes_fd {
            self.fds.closed();
        }
        result
    }

    /// Wait until every request in flight besides `current` has pushed or
    /// discarded its reply. Versions and flushes are skipped: a flush ends
    /// with its target, and two versions must not wait on each other.
    pub async fn drain(&self, current: &RequestContext) {
        let pending: Vec<_> = self
            .active
            .others(current)
            .into_iter()
            .filter(|req| !matches!(req.msg_type(), mtype::TVERSION | mtype::TFLUSH))
            .collect();
        if pending.is_empty() {
            return;
        }
        debug!(count = pending.len(), "draining in-flight requests");
        for req in pending {
            req.wait_complete().await;
        }
    }

    /// Clunk every fid (used by `Tversion` and at connection close).
    pub async fn reset(&self) {
        let teardowns = self.fids.reset();
        if !teardowns.is_empty() {
            debug!(count = teardowns.len(), "tearing down fids on reset");
        }
        for teardown in teardowns {
            if let Err(err) = self.run_teardown(teardown).await {
                debug!(error = %err, "fid teardown failed during reset");
            }
        }
    }

    /// Connection is gone: stop in-flight work and release every fid.
    pub async fn shutdown(&self) {
        self.active.cancel_all();
        self.reset().await;
    }
}

/// Synchronous teardown, run on a worker.
fn apply_teardown(backend: &dyn Backend, teardown: Teardown) -> FsResult<()> {
    match teardown {
        Teardown::Close(handle) => backend.close(handle),
        Teardown::CloseDir(handle) => backend.closedir(handle),
        Teardown::Xattr { path, transfer } => {
            if Some(transfer.len) != transfer.copied {
                return Err(FsError::InvalidArgument);
            }
            if transfer.len == 0 {
                backend.removexattr(&path, &transfer.name)
            } else {
                backend.setxattr(&path, &transfer.name, &transfer.value, transfer.flags)
            }
        }
    }
}

/// A counted reference to a fid, released on drop
pub struct FidRef {
    session: Arc<Session>,
    fid: Arc<Fid>,
    released: bool,
}

impl FidRef {
    /// Take ownership of a reference the table already counted.
    fn adopt(session: Arc<Session>, fid: Arc<Fid>) -> Self {
        Self {
            session,
            fid,
            released: false,
        }
    }

    pub fn fid(&self) -> &Arc<Fid> {
        &self.fid
    }

    /// Release now and wait for any resulting teardown.
    pub async fn put(mut self) -> FsResult<()> {
        self.released = true;
        match self.session.fids.release(&self.fid) {
            Some(teardown) => self.session.run_teardown(teardown).await,
            None => Ok(()),
        }
    }
}

impl Deref for FidRef {
    type Target = Fid;

    fn deref(&self) -> &Fid {
        &self.fid
    }
}

impl Drop for FidRef {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Some(teardown) = self.session.fids.release(&self.fid) else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let session = self.session.clone();
                runtime.spawn(async move {
                    if let Err(err) = session.run_teardown(teardown).await {
                        debug!(error = %err, "deferred fid teardown failed");
                    }
                });
            }
            Err(_) => {
                let closes_fd = matches!(teardown, Teardown::Close(_) | Teardown::CloseDir(_));
                if let Err(err) = apply_teardown(self.session.backend.as_ref(), teardown) {
                    debug!(error = %err, "fid teardown outside runtime failed");
                }
                if closes_fd {
                    self.session.fds.closed();
                }
            }
        }
    }
}

impl std::fmt::Debug for FidRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FidRef").field("fid", &self.fid.id()).finish()
    }
}

