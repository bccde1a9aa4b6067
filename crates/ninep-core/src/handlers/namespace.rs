// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ninep_proto::flags::AT_REMOVEDIR;
use ninep_proto::messages::{
    Rlink, Rmkdir, Rmknod, Rreadlink, Rremove, Rrename, Rrenameat, Rsymlink, Runlinkat, Rwalk,
    Tlink, Tmkdir, Tmknod, Treadlink, Tremove, Trename, Trenameat, Tsymlink, Tunlinkat, Twalk,
};
use ninep_proto::{Name, Rmessage, MAX_WALK_ELEMENTS, NOFID};
use tracing::debug;

use super::{check_name, check_new_name};
use crate::backend::Credentials;
use crate::error::{FsError, FsResult};
use crate::request::RequestContext;
use crate::session::Session;

pub(super) async fn walk(
    session: &Arc<Session>,
    req: &RequestContext,
    msg: Twalk,
) -> FsResult<Rmessage> {
    if msg.wnames.len() > MAX_WALK_ELEMENTS {
        return Err(FsError::InvalidArgument);
    }
    for name in &msg.wnames {
        check_name(name.as_bytes())?;
    }
    let fid = session.get_fid(req, msg.fid).await?;
    if fid.state().kind.is_open() {
        return Err(FsError::WrongFidType);
    }

    let names = msg.wnames;
    let (path, attrs, failure) = session
        .with_path(req, &fid, move |b, start| {
            let mut path = start.to_path_buf();
            let mut attrs = Vec::with_capacity(names.len());
            for name in &names {
                let step = b
                    .lookup(&path, name.as_os_str())
                    .and_then(|next| b.lstat(&next).map(|attr| (next, attr)));
                match step {
                    Ok((next, attr)) => {
                        path = next;
                        attrs.push(attr);
                    }
                    Err(err) => return Ok((path, attrs, Some(err))),
                }
            }
            Ok((path, attrs, None))
        })
        .await?;

    let wqids = attrs
        .iter()
        .map(|attr| session.qid_for(attr))
        .collect::<FsResult<Vec<_>>>()?;
    if let Some(err) = failure {
        if wqids.is_empty() {
            return Err(err);
        }
        debug!(walked = wqids.len(), error = %err, "partial walk");
        return Ok(Rwalk { wqids }.into());
    }

    if msg.newfid == msg.fid {
        fid.state().path = path;
    } else {
        let uid = fid.state().uid;
        session.new_fid(msg.newfid, path, uid)?;
    }
    Ok(Rwalk { wqids }.into())
}

fn credentials(session_uid: u32, gid: u32) -> Credentials {
    Credentials {
        uid: session_uid,
        gid,
    }
}

pub(super) async fn mkdir(
    session: &Arc<Session>,
    req: &RequestContext,
    msg: Tmkdir,
) -> FsResult<Rmessage> {
    check_new_name(msg.name.as_bytes())?;
    let dir = session.get_fid(req, msg.dfid).await?;
    let cred = credentials(dir.state().uid, msg.gid);
    let (name, mode) = (msg.name, msg.mode);
    let attr = session
        .with_path(req, &dir, move |b, dir| {
            let path = b.lookup(dir, name.as_os_str())?;
            b.mkdir(&path, mode, cred)?;
            b.lstat(&path)
        })
        .await?;
    Ok(Rmkdir {
        qid: session.qid_for(&attr)?,
    }
    .into())
}

pub(super) async fn mknod(
    session: &Arc<Session>,
    req: &RequestContext,
    msg: Tmknod,
) -> FsResult<Rmessage> {
    check_new_name(msg.name.as_bytes())?;
    let dir = session.get_fid(req, msg.dfid).await?;
    let cred = credentials(dir.state().uid, msg.gid);
    let rdev = nix::sys::stat::makedev(msg.major as u64, msg.minor as u64);
    let (name, mode) = (msg.name, msg.mode);
    let attr = session
        .with_path(req, &dir, move |b, dir| {
            let path = b.lookup(dir, name.as_os_str())?;
            b.mknod(&path, mode, rdev, cred)?;
            b.lstat(&path)
        })
        .await?;
    Ok(Rmknod {
        qid: session.qid_for(&attr)?,
    }
    .into())
}

pub(super) async fn symlink(
    session: &Arc<Session>,
    req: &RequestContext,
    msg: Tsymlink,
) -> FsResult<Rmessage> {
    check_new_name(msg.name.as_bytes())?;
    let dir = session.get_fid(req, msg.dfid).await?;
    let cred = credentials(dir.state().uid, msg.gid);
    let (name, target) = (msg.name, msg.target);
    let attr = session
        .with_path(req, &dir, move |b, dir| {
            let path = b.lookup(dir, name.as_os_str())?;
            b.symlink(target.as_os_str(), &path, cred)?;
            b.lstat(&path)
        })
        .await?;
    Ok(Rsymlink {
        qid: session.qid_for(&attr)?,
    }
    .into())
}

pub(super) async fn link(
    session: &Arc<Session>,
    req: &RequestContext,
    msg: Tlink,
) -> FsResult<Rmessage> {
    check_new_name(msg.name.as_bytes())?;
    let dir = session.get_fid(req, msg.dfid).await?;
    let existing = session.get_fid(req, msg.fid).await?;
    let _fence = session.fence().read().await;
    let (dir_path, existing_path, name) = (dir.path(), existing.path(), msg.name);
    session
        .blocking(req, move |b| {
            let path = b.lookup(&dir_path, name.as_os_str())?;
            b.link(&existing_path, &path)
        })
        .await?;
    Ok(Rlink {}.into())
}

/// What a rename moves
pub(super) enum RenameSource {
    /// The object a fid is at.
    Fid(PathBuf),
    /// `name` inside `dir`.
    Entry { dir: PathBuf, name: Name },
}

/// Rename the source to `name` inside `new_dir` and move every fid below it
/// along. Callers hold the rename fence exclusively.
pub(super) async fn rename_path(
    session: &Arc<Session>,
    req: &RequestContext,
    source: RenameSource,
    new_dir: PathBuf,
    name: Name,
) -> FsResult<()> {
    let (from, to) = session
        .blocking(req, move |b| {
            let from = match source {
                RenameSource::Fid(path) => path,
                RenameSource::Entry { dir, name } => b.lookup(&dir, name.as_os_str())?,
            };
            let to = b.lookup(&new_dir, name.as_os_str())?;
            b.rename(&from, &to)?;
            Ok((from, to))
        })
        .await?;
    debug!(from = %from.display(), to = %to.display(), "renamed");
    session.fids().fix_paths(&from, &to);
    Ok(())
}

fn check_rename_name(name: &[u8]) -> FsResult<()> {
    check_name(name)?;
    if name == b"." || name == b".." {
        return Err(FsError::from_errno(libc::EISDIR));
    }
    Ok(())
}

pub(super) async fn rename(
    session: &Arc<Session>,
    req: &RequestContext,
    msg: Trename,
) -> FsResult<Rmessage> {
    check_rename_name(msg.name.as_bytes())?;
    let fid = session.get_fid(req, msg.fid).await?;
    if fid.state().kind.is_open() {
        return Err(FsError::WrongFidType);
    }
    let new_dir = match msg.newdirfid {
        NOFID => None,
        id => Some(session.get_fid(req, id).await?),
    };

    let _fence = session.fence().write().await;
    let old = fid.path();
    let new_dir = match &new_dir {
        Some(dir) => dir.path(),
        None => old.parent().map(Path::to_path_buf).unwrap_or_default(),
    };
    rename_path(session, req, RenameSource::Fid(old), new_dir, msg.name).await?;
    Ok(Rrename {}.into())
}

pub(super) async fn renameat(
    session: &Arc<Session>,
    req: &RequestContext,
    msg: Trenameat,
) -> FsResult<Rmessage> {
    check_rename_name(msg.oldname.as_bytes())?;
    check_rename_name(msg.newname.as_bytes())?;
    let old_dir = session.get_fid(req, msg.olddirfid).await?;
    let new_dir = session.get_fid(req, msg.newdirfid).await?;

    let _fence = session.fence().write().await;
    let (old_dir, new_dir) = (old_dir.path(), new_dir.path());
    let source = RenameSource::Entry {
        dir: old_dir,
        name: msg.oldname,
    };
    rename_path(session, req, source, new_dir, msg.newname).await?;
    Ok(Rrenameat {}.into())
}

pub(super) async fn unlinkat(
    session: &Arc<Session>,
    req: &RequestContext,
    msg: Tunlinkat,
) -> FsResult<Rmessage> {
    check_name(msg.name.as_bytes())?;
    match msg.name.as_bytes() {
        b"." => return Err(FsError::InvalidArgument),
        b".." => return Err(FsError::from_errno(libc::ENOTEMPTY)),
        _ => {}
    }
    let dir = session.get_fid(req, msg.dirfid).await?;
    let name = msg.name.clone();
    let path = session
        .with_path(req, &dir, move |b, dir| b.lookup(dir, name.as_os_str()))
        .await?;
    session.mark_unreclaimable(req, &path).await?;

    let remove_dir = msg.flags & AT_REMOVEDIR != 0;
    let name = msg.name;
    session
        .with_path(req, &dir, move |b, dir| {
            let path = b.lookup(dir, name.as_os_str())?;
            b.unlink(&path, remove_dir)
        })
        .await?;
    Ok(Runlinkat {}.into())
}

pub(super) async fn remove(
    session: &Arc<Session>,
    req: &RequestContext,
    msg: Tremove,
) -> FsResult<Rmessage> {
    let fid = session.get_fid(req, msg.fid).await?;
    let removed = async {
        if !session.backend().is_path_based() {
            return Err(FsError::Unsupported);
        }
        session.mark_unreclaimable(req, &fid.path()).await?;
        session.with_path(req, &fid, |b, path| b.remove(path)).await
    }
    .await;
    drop(fid);

    // The fid goes away whether or not the remove worked.
    if let Ok(clunked) = session.clunk_fid(msg.fid) {
        if let Err(err) = clunked.put().await {
            debug!(fid = msg.fid, error = %err, "teardown after remove failed");
        }
    }
    removed?;
    Ok(Rremove {}.into())
}

pub(super) async fn readlink(
    session: &Arc<Session>,
    req: &RequestContext,
    msg: Treadlink,
) -> FsResult<Rmessage> {
    let fid = session.get_fid(req, msg.fid).await?;
    let target = session.with_path(req, &fid, |b, path| b.readlink(path)).await?;
    Ok(Rreadlink {
        target: target.into(),
    }
    .into())
}
