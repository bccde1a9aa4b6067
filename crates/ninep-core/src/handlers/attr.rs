// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::path::Path;
use std::sync::Arc;

use ninep_proto::flags::{getattr, lock, mode_to_v9mode, setattr, v9mode, v9mode_to_mode};
use ninep_proto::messages::{
    Rgetattr, Rgetlock, Rlock, Rsetattr, Rstat, Rstatfs, Rwstat, Tgetattr, Tgetlock, Tlock,
    Tsetattr, Tstat, Tstatfs, Twstat,
};
use ninep_proto::{Name, Rmessage, SizedStat, Stat, StatDotl, StatFs, IOHDRSZ};

use super::io::sync_fid;
use super::namespace::{rename_path, RenameSource};
use super::check_name;
use crate::backend::{Backend, FileAttr, SetTime, Timespec};
use crate::error::{FsError, FsResult};
use crate::fid::{Fid, FidKind};
use crate::request::RequestContext;
use crate::session::Session;

/// 9P2000.u stat record for `path`. The qid is left for the caller, which
/// owns the inode remapper.
pub(super) fn build_stat(b: &dyn Backend, path: &Path, attr: &FileAttr) -> FsResult<Stat> {
    let extension: Name = if attr.is_symlink() {
        b.readlink(path)?.into()
    } else if attr.is_device() {
        let kind = if attr.mode & libc::S_IFMT == libc::S_IFCHR {
            'c'
        } else {
            'b'
        };
        format!(
            "{kind} {} {}",
            nix::sys::stat::major(attr.rdev),
            nix::sys::stat::minor(attr.rdev)
        )
        .into()
    } else if attr.is_dir() || attr.mode & libc::S_IFMT == libc::S_IFREG {
        format!("HARDLINKCOUNT {}", attr.nlink).into()
    } else {
        Name::default()
    };
    let name = path.file_name().map_or_else(|| "/".into(), Name::from);

    Ok(Stat {
        mode: mode_to_v9mode(attr.mode),
        atime: attr.atime.sec as u32,
        mtime: attr.mtime.sec as u32,
        length: attr.size,
        name,
        extension,
        n_uid: attr.uid,
        n_gid: attr.gid,
        ..Stat::default()
    })
}

pub(super) async fn getattr(
    session: &Arc<Session>,
    req: &RequestContext,
    msg: Tgetattr,
) -> FsResult<Rmessage> {
    let fid = session.get_fid(req, msg.fid).await?;
    let attr = session.with_path(req, &fid, |b, path| b.lstat(path)).await?;
    Ok(Rgetattr {
        attr: StatDotl {
            valid: getattr::BASIC,
            qid: session.qid_for(&attr)?,
            mode: attr.mode,
            uid: attr.uid,
            gid: attr.gid,
            nlink: attr.nlink,
            rdev: attr.rdev,
            size: attr.size,
            blksize: attr.blksize,
            blocks: attr.blocks,
            atime_sec: attr.atime.sec as u64,
            atime_nsec: attr.atime.nsec as u64,
            mtime_sec: attr.mtime.sec as u64,
            mtime_nsec: attr.mtime.nsec as u64,
            ctime_sec: attr.ctime.sec as u64,
            ctime_nsec: attr.ctime.nsec as u64,
            ..StatDotl::default()
        },
    }
    .into())
}

fn set_time(valid: u32, present: u32, explicit: u32, sec: u64, nsec: u64) -> SetTime {
    if valid & present == 0 {
        SetTime::Omit
    } else if valid & explicit != 0 {
        SetTime::At(Timespec {
            sec: sec as i64,
            nsec: nsec as i64,
        })
    } else {
        SetTime::Now
    }
}

pub(super) async fn setattr(
    session: &Arc<Session>,
    req: &RequestContext,
    msg: Tsetattr,
) -> FsResult<Rmessage> {
    let fid = session.get_fid(req, msg.fid).await?;
    let attr = msg.attr;
    let valid = attr.valid;
    session
        .with_path(req, &fid, move |b, path| {
            if valid & setattr::MODE != 0 {
                b.chmod(path, attr.mode)?;
            }
            if valid & (setattr::ATIME | setattr::MTIME) != 0 {
                let atime = set_time(
                    valid,
                    setattr::ATIME,
                    setattr::ATIME_SET,
                    attr.atime_sec,
                    attr.atime_nsec,
                );
                let mtime = set_time(
                    valid,
                    setattr::MTIME,
                    setattr::MTIME_SET,
                    attr.mtime_sec,
                    attr.mtime_nsec,
                );
                b.utimens(path, atime, mtime)?;
            }
            if valid & (setattr::UID | setattr::GID) != 0 {
                let uid = (valid & setattr::UID != 0).then_some(attr.uid);
                let gid = (valid & setattr::GID != 0).then_some(attr.gid);
                b.chown(path, uid, gid)?;
            }
            if valid & setattr::SIZE != 0 {
                b.truncate(path, attr.size)?;
            }
            Ok(())
        })
        .await?;
    Ok(Rsetattr {}.into())
}

pub(super) async fn stat(
    session: &Arc<Session>,
    req: &RequestContext,
    msg: Tstat,
) -> FsResult<Rmessage> {
    let fid = session.get_fid(req, msg.fid).await?;
    let (mut stat, attr) = session
        .with_path(req, &fid, |b, path| {
            let attr = b.lstat(path)?;
            Ok((build_stat(b, path, &attr)?, attr))
        })
        .await?;
    stat.qid = session.qid_for(&attr)?;
    Ok(Rstat {
        stat: SizedStat(stat),
    }
    .into())
}

pub(super) async fn wstat(
    session: &Arc<Session>,
    req: &RequestContext,
    msg: Twstat,
) -> FsResult<Rmessage> {
    let fid = session.get_fid(req, msg.fid).await?;
    let stat = msg.stat.0;
    if stat.is_dont_touch() {
        sync_fid(session, req, &fid, false).await?;
        return Ok(Rwstat {}.into());
    }

    if stat.mode != u32::MAX {
        let current = session.with_path(req, &fid, |b, path| b.lstat(path)).await?;
        if stat.mode & v9mode::TYPE_BITS != mode_to_v9mode(current.mode) & v9mode::TYPE_BITS {
            return Err(FsError::from_errno(libc::EIO));
        }
        let mode = v9mode_to_mode(stat.mode, stat.extension.to_str().unwrap_or("")) & 0o7777;
        session
            .with_path(req, &fid, move |b, path| b.chmod(path, mode))
            .await?;
    }
    if stat.atime != u32::MAX || stat.mtime != u32::MAX {
        let at = |t: u32| match t {
            u32::MAX => SetTime::Omit,
            sec => SetTime::At(Timespec {
                sec: sec as i64,
                nsec: 0,
            }),
        };
        let (atime, mtime) = (at(stat.atime), at(stat.mtime));
        session
            .with_path(req, &fid, move |b, path| b.utimens(path, atime, mtime))
            .await?;
    }
    if stat.n_uid != u32::MAX || stat.n_gid != u32::MAX {
        let uid = (stat.n_uid != u32::MAX).then_some(stat.n_uid);
        let gid = (stat.n_gid != u32::MAX).then_some(stat.n_gid);
        session
            .with_path(req, &fid, move |b, path| b.chown(path, uid, gid))
            .await?;
    }
    if !stat.name.is_empty() {
        check_name(stat.name.as_bytes())?;
        let _fence = session.fence().write().await;
        let old = fid.path();
        let parent = old.parent().map(Path::to_path_buf).unwrap_or_default();
        rename_path(session, req, RenameSource::Fid(old), parent, stat.name.clone()).await?;
    }
    if stat.length != u64::MAX {
        let length = stat.length;
        session
            .with_path(req, &fid, move |b, path| b.truncate(path, length))
            .await?;
    }
    Ok(Rwstat {}.into())
}

pub(super) async fn statfs(
    session: &Arc<Session>,
    req: &RequestContext,
    msg: Tstatfs,
) -> FsResult<Rmessage> {
    let fid = session.get_fid(req, msg.fid).await?;
    let stats = session.with_path(req, &fid, |b, path| b.statfs(path)).await?;
    let avail = session.msize().saturating_sub(IOHDRSZ);
    let factor = (avail / stats.bsize.max(1)).max(1);
    Ok(Rstatfs {
        stat: StatFs {
            ty: stats.fs_type,
            bsize: stats.bsize.saturating_mul(factor),
            blocks: stats.blocks / factor as u64,
            bfree: stats.bfree / factor as u64,
            bavail: stats.bavail / factor as u64,
            files: stats.files,
            ffree: stats.ffree,
            fsid: stats.fsid,
            namelen: stats.namelen,
        },
    }
    .into())
}

/// Attributes of the fid's open file, or of its path when it has none.
async fn fid_attr(session: &Arc<Session>, req: &RequestContext, fid: &Fid) -> FsResult<FileAttr> {
    let handle = {
        let st = fid.state();
        match (&st.kind, st.handle) {
            (FidKind::File, Some(handle)) => Some(handle),
            _ => None,
        }
    };
    match handle {
        Some(handle) => session.blocking(req, move |b| b.fstat(handle)).await,
        None => session.with_path(req, fid, |b, path| b.lstat(path)).await,
    }
}

pub(super) async fn lock(
    session: &Arc<Session>,
    req: &RequestContext,
    msg: Tlock,
) -> FsResult<Rmessage> {
    if msg.flags & !lock::FLAGS_BLOCK != 0 {
        return Err(FsError::InvalidArgument);
    }
    let fid = session.get_fid(req, msg.fid).await?;
    fid_attr(session, req, &fid).await?;
    Ok(Rlock {
        status: lock::SUCCESS,
    }
    .into())
}

pub(super) async fn getlock(
    session: &Arc<Session>,
    req: &RequestContext,
    msg: Tgetlock,
) -> FsResult<Rmessage> {
    let fid = session.get_fid(req, msg.fid).await?;
    fid_attr(session, req, &fid).await?;
    Ok(Rgetlock {
        ty: lock::TYPE_UNLCK,
        start: msg.start,
        length: msg.length,
        proc_id: msg.proc_id,
        client_id: msg.client_id,
    }
    .into())
}
