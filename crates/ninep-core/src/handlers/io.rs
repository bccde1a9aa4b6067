// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::os::unix::ffi::OsStrExt;
use std::sync::Arc;

use bytes::Bytes;
use ninep_proto::flags::{
    dotl_to_open_flags, is_write_open, omode_to_open_flags, parse_device_extension,
    qid_type_for_dirent, v9mode,
};
use ninep_proto::messages::{
    Rcreate, Rfsync, Rlcreate, Rlopen, Ropen, Rread, Rreaddir, Rwrite, Tcreate, Tfsync, Tlcreate,
    Tlopen, Topen, Tread, Treaddir, Twrite,
};
use ninep_proto::{Data, Dirent, Qid, Rmessage, WireFormat, HEADER_SIZE};
use tracing::debug;

use super::attr::build_stat;
use super::check_new_name;
use crate::backend::{Credentials, HandleId};
use crate::config::MultiDevicePolicy;
use crate::error::{FsError, FsResult};
use crate::fid::{Fid, FidKind};
use crate::request::RequestContext;
use crate::session::{FidRef, Session};

/// `size[4] type[1] tag[2] count[4]` in front of read and readdir payloads.
const READ_OVERHEAD: u32 = HEADER_SIZE as u32 + 4;

/// Flags a reclaimed file is reopened with. Creation and truncation only
/// happen on the first open.
fn reopen_flags(flags: i32) -> i32 {
    flags & !(libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC)
}

/// Record a newly opened file on `fid` and count its descriptor.
async fn install_file(session: &Arc<Session>, fid: &Fid, handle: HandleId, flags: i32) {
    fid.set_open(FidKind::File, Some(handle), reopen_flags(flags));
    if flags & libc::O_EXCL != 0 {
        fid.state().non_reclaimable = true;
    }
    session.note_opened().await;
}

async fn install_dir(session: &Arc<Session>, fid: &Fid, handle: HandleId) {
    fid.set_open(FidKind::Dir, Some(handle), 0);
    session.note_opened().await;
}

async fn open_fid(
    session: &Arc<Session>,
    req: &RequestContext,
    id: u32,
    flags: i32,
) -> FsResult<(Qid, u32)> {
    let fid = session.get_fid(req, id).await?;
    if fid.state().kind.is_open() {
        return Err(FsError::WrongFidType);
    }
    let attr = session.with_path(req, &fid, |b, path| b.lstat(path)).await?;
    let qid = session.qid_for(&attr)?;

    if attr.is_dir() {
        let handle = session.with_path(req, &fid, |b, path| b.opendir(path)).await?;
        install_dir(session, &fid, handle).await;
        return Ok((qid, 0));
    }
    if session.config().readonly && is_write_open(flags) {
        return Err(FsError::ReadOnly);
    }
    let (handle, bsize) = session
        .with_path(req, &fid, move |b, path| {
            let handle = b.open(path, flags)?;
            let bsize = b.statfs(path).map(|s| s.bsize).unwrap_or(0);
            Ok((handle, bsize))
        })
        .await?;
    install_file(session, &fid, handle, flags).await;
    Ok((qid, session.iounit(bsize)))
}

pub(super) async fn lopen(
    session: &Arc<Session>,
    req: &RequestContext,
    msg: Tlopen,
) -> FsResult<Rmessage> {
    let (qid, iounit) = open_fid(session, req, msg.fid, dotl_to_open_flags(msg.flags)).await?;
    Ok(Rlopen { qid, iounit }.into())
}

pub(super) async fn open(
    session: &Arc<Session>,
    req: &RequestContext,
    msg: Topen,
) -> FsResult<Rmessage> {
    let (qid, iounit) = open_fid(session, req, msg.fid, omode_to_open_flags(msg.mode)).await?;
    Ok(Ropen { qid, iounit }.into())
}

pub(super) async fn lcreate(
    session: &Arc<Session>,
    req: &RequestContext,
    msg: Tlcreate,
) -> FsResult<Rmessage> {
    check_new_name(msg.name.as_bytes())?;
    let fid = session.get_fid(req, msg.fid).await?;
    if fid.state().kind.is_open() {
        return Err(FsError::WrongFidType);
    }
    let flags = dotl_to_open_flags(msg.flags);
    let cred = Credentials {
        uid: fid.state().uid,
        gid: msg.gid,
    };
    let (name, mode) = (msg.name, msg.mode);
    let (path, handle, attr, bsize) = session
        .with_path(req, &fid, move |b, dir| {
            let path = b.lookup(dir, name.as_os_str())?;
            let handle = b.create(&path, flags | libc::O_CREAT, mode, cred)?;
            let attr = match b.lstat(&path) {
                Ok(attr) => attr,
                Err(err) => {
                    let _ = b.close(handle);
                    return Err(err);
                }
            };
            let bsize = b.statfs(&path).map(|s| s.bsize).unwrap_or(0);
            Ok((path, handle, attr, bsize))
        })
        .await?;

    fid.state().path = path;
    install_file(session, &fid, handle, flags).await;
    Ok(Rlcreate {
        qid: session.qid_for(&attr)?,
        iounit: session.iounit(bsize),
    }
    .into())
}

/// What a 9P2000.u create produced
enum Created {
    Dir(HandleId),
    File(HandleId),
    Node,
}

pub(super) async fn create(
    session: &Arc<Session>,
    req: &RequestContext,
    msg: Tcreate,
) -> FsResult<Rmessage> {
    check_new_name(msg.name.as_bytes())?;
    let fid = session.get_fid(req, msg.fid).await?;
    if fid.state().kind.is_open() {
        return Err(FsError::WrongFidType);
    }
    let link_source: Option<FidRef> = if msg.perm & v9mode::LINK != 0 {
        let id = msg
            .extension
            .to_str()
            .ok_or(FsError::InvalidArgument)?
            .trim()
            .parse::<u32>()
            .map_err(|_| FsError::InvalidArgument)?;
        Some(session.get_fid(req, id).await?)
    } else {
        None
    };

    let flags = omode_to_open_flags(msg.mode);
    let uid = fid.state().uid;
    let Tcreate {
        name,
        perm,
        extension,
        ..
    } = msg;

    let (path, created, attr, bsize) = {
        let _fence = session.fence().read().await;
        let dir = fid.path();
        let link_path = link_source.as_ref().map(|f| f.path());
        session
            .blocking(req, move |b| {
                let path = b.lookup(&dir, name.as_os_str())?;
                let cred = Credentials {
                    uid,
                    gid: b.lstat(&dir)?.gid,
                };
                let bits = perm & 0o777;
                let created = if perm & v9mode::DIR != 0 {
                    b.mkdir(&path, bits, cred)?;
                    Created::Dir(b.opendir(&path)?)
                } else if perm & v9mode::SYMLINK != 0 {
                    b.symlink(extension.as_os_str(), &path, cred)?;
                    Created::Node
                } else if let Some(existing) = link_path {
                    b.link(&existing, &path)?;
                    Created::Node
                } else if perm & v9mode::DEVICE != 0 {
                    let (kind, major, minor) = extension
                        .to_str()
                        .and_then(parse_device_extension)
                        .ok_or(FsError::InvalidArgument)?;
                    let ty = if kind == 'c' { libc::S_IFCHR } else { libc::S_IFBLK };
                    let rdev = nix::sys::stat::makedev(major as u64, minor as u64);
                    b.mknod(&path, ty | bits, rdev, cred)?;
                    Created::Node
                } else if perm & v9mode::NAMED_PIPE != 0 {
                    b.mknod(&path, libc::S_IFIFO | bits, 0, cred)?;
                    Created::Node
                } else if perm & v9mode::SOCKET != 0 {
                    b.mknod(&path, libc::S_IFSOCK | bits, 0, cred)?;
                    Created::Node
                } else {
                    Created::File(b.create(&path, flags | libc::O_CREAT, perm & 0o7777, cred)?)
                };
                let attr = b.lstat(&path)?;
                let bsize = b.statfs(&path).map(|s| s.bsize).unwrap_or(0);
                Ok((path, created, attr, bsize))
            })
            .await?
    };

    fid.state().path = path;
    match created {
        Created::Dir(handle) => install_dir(session, &fid, handle).await,
        Created::File(handle) => install_file(session, &fid, handle, flags).await,
        Created::Node => {}
    }
    Ok(Rcreate {
        qid: session.qid_for(&attr)?,
        iounit: session.iounit(bsize),
    }
    .into())
}

/// What a read or write goes to
enum Target {
    File(HandleId),
    Dir(HandleId),
    Xattr,
}

fn io_target(fid: &Fid) -> FsResult<Target> {
    let st = fid.state();
    match (&st.kind, st.handle) {
        (FidKind::File, Some(handle)) => Ok(Target::File(handle)),
        (FidKind::Dir, Some(handle)) => Ok(Target::Dir(handle)),
        (FidKind::Xattr(_), _) => Ok(Target::Xattr),
        _ => Err(FsError::WrongFidType),
    }
}

pub(super) async fn read(
    session: &Arc<Session>,
    req: &RequestContext,
    msg: Tread,
) -> FsResult<Rmessage> {
    let count = msg.count.min(session.msize().saturating_sub(READ_OVERHEAD));
    let fid = session.get_fid(req, msg.fid).await?;
    let data = match io_target(&fid)? {
        Target::File(handle) => read_file(session, req, handle, msg.offset, count as usize).await?,
        Target::Dir(handle) => read_dir_stats(session, req, &fid, handle, msg.offset, count).await?,
        Target::Xattr => {
            let st = fid.state();
            let FidKind::Xattr(transfer) = &st.kind else {
                return Err(FsError::WrongFidType);
            };
            let start = usize::try_from(msg.offset)
                .unwrap_or(usize::MAX)
                .min(transfer.value.len());
            let end = start.saturating_add(count as usize).min(transfer.value.len());
            transfer.value[start..end].to_vec()
        }
    };
    Ok(Rread { data: Data(data) }.into())
}

/// Read until `count` bytes or end of file, retrying `EINTR` while the
/// request is live.
async fn read_file(
    session: &Arc<Session>,
    req: &RequestContext,
    handle: HandleId,
    mut offset: u64,
    count: usize,
) -> FsResult<Vec<u8>> {
    let mut data = Vec::with_capacity(count);
    while data.len() < count {
        let want = count - data.len();
        let chunk = session
            .blocking(req, move |b| {
                let mut buf = vec![0; want];
                let n = b.read(handle, offset, &mut buf)?;
                buf.truncate(n);
                Ok(buf)
            })
            .await;
        match chunk {
            Ok(chunk) if chunk.is_empty() => break,
            Ok(chunk) => {
                offset += chunk.len() as u64;
                data.extend_from_slice(&chunk);
            }
            Err(err) if err.is_interrupted() && !req.is_cancelled() => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(data)
}

/// 9P2000.u directory read: packed stat records.
async fn read_dir_stats(
    session: &Arc<Session>,
    req: &RequestContext,
    fid: &Fid,
    handle: HandleId,
    offset: u64,
    max: u32,
) -> FsResult<Vec<u8>> {
    let _position = fid.dir_lock().lock().await;
    let records = session
        .with_path(req, fid, move |b, dir| {
            if offset == 0 {
                b.rewinddir(handle)?;
            }
            let mut used = 0;
            let mut records = Vec::new();
            loop {
                let saved = b.telldir(handle)?;
                let Some(entry) = b.readdir(handle)? else {
                    break;
                };
                let path = b.lookup(dir, &entry.name)?;
                let attr = b.lstat(&path)?;
                let stat = build_stat(b, &path, &attr)?;
                let size = stat.byte_size();
                if used + size > max {
                    b.seekdir(handle, saved)?;
                    break;
                }
                used += size;
                records.push((stat, attr));
            }
            Ok(records)
        })
        .await?;

    let mut data = Vec::new();
    for (mut stat, attr) in records {
        stat.qid = session.qid_for(&attr)?;
        stat.encode(&mut data);
    }
    Ok(data)
}

pub(super) async fn readdir(
    session: &Arc<Session>,
    req: &RequestContext,
    msg: Treaddir,
) -> FsResult<Rmessage> {
    let fid = session.get_fid(req, msg.fid).await?;
    let Target::Dir(handle) = io_target(&fid)? else {
        return Err(FsError::WrongFidType);
    };
    let max = msg.count.min(session.msize().saturating_sub(READ_OVERHEAD));
    let offset = msg.offset;
    let remap = session.config().multidevs == MultiDevicePolicy::Remap;

    let _position = fid.dir_lock().lock().await;
    let entries = session
        .with_path(req, &fid, move |b, dir| {
            if offset == 0 {
                b.rewinddir(handle)?;
            } else {
                b.seekdir(handle, offset)?;
            }
            let dir_dev = if remap { b.lstat(dir)?.dev } else { 0 };
            let mut used = 0;
            let mut entries = Vec::new();
            loop {
                let saved = b.telldir(handle)?;
                let Some(entry) = b.readdir(handle)? else {
                    break;
                };
                let size = Dirent::size_for_name(entry.name.as_bytes());
                if used + size > max {
                    b.seekdir(handle, saved)?;
                    break;
                }
                used += size;
                let dev = if remap {
                    b.lookup(dir, &entry.name)
                        .and_then(|path| b.lstat(&path))
                        .map_or(dir_dev, |attr| attr.dev)
                } else {
                    dir_dev
                };
                entries.push((entry, dev));
            }
            Ok(entries)
        })
        .await?;

    let mut data = Vec::with_capacity(max as usize);
    for (entry, dev) in entries {
        let path = if remap {
            session.map_inode(dev, entry.ino)?
        } else {
            entry.ino
        };
        let dirent = Dirent {
            qid: Qid {
                ty: qid_type_for_dirent(entry.kind),
                version: 0,
                path,
            },
            offset: entry.offset,
            ty: entry.kind,
            name: entry.name.into(),
        };
        dirent.encode(&mut data);
    }
    Ok(Rreaddir { data: Data(data) }.into())
}

pub(super) async fn write(
    session: &Arc<Session>,
    req: &RequestContext,
    msg: Twrite,
) -> FsResult<Rmessage> {
    let fid = session.get_fid(req, msg.fid).await?;
    let data = Bytes::from(msg.data.0);
    let count = match io_target(&fid)? {
        Target::File(handle) => write_file(session, req, handle, msg.offset, data).await?,
        Target::Xattr => write_xattr(&fid, msg.offset, &data)?,
        Target::Dir(_) => return Err(FsError::WrongFidType),
    };
    Ok(Rwrite {
        count: count as u32,
    }
    .into())
}

async fn write_file(
    session: &Arc<Session>,
    req: &RequestContext,
    handle: HandleId,
    mut offset: u64,
    data: Bytes,
) -> FsResult<usize> {
    let mut written = 0;
    while written < data.len() {
        let chunk = data.slice(written..);
        let result = session
            .blocking(req, move |b| b.write(handle, offset, &chunk))
            .await;
        match result {
            Ok(0) => break,
            Ok(n) => {
                offset += n as u64;
                written += n;
            }
            Err(err) if err.is_interrupted() && !req.is_cancelled() => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(written)
}

/// Copy into a pending xattr value.
fn write_xattr(fid: &Fid, offset: u64, data: &[u8]) -> FsResult<usize> {
    let mut st = fid.state();
    let FidKind::Xattr(transfer) = &mut st.kind else {
        return Err(FsError::WrongFidType);
    };
    let Some(copied) = transfer.copied else {
        return Err(FsError::InvalidArgument);
    };
    let end = offset
        .checked_add(data.len() as u64)
        .filter(|end| *end <= transfer.len)
        .ok_or(FsError::NoSpace)?;
    transfer.value[offset as usize..end as usize].copy_from_slice(data);
    transfer.copied = Some(copied + data.len() as u64);
    debug!(fid = fid.id(), name = %transfer.name, copied = copied + data.len() as u64, "xattr write");
    Ok(data.len())
}

pub(super) async fn fsync(
    session: &Arc<Session>,
    req: &RequestContext,
    msg: Tfsync,
) -> FsResult<Rmessage> {
    let fid = session.get_fid(req, msg.fid).await?;
    sync_fid(session, req, &fid, msg.datasync != 0).await?;
    Ok(Rfsync {}.into())
}

/// Flush an open file to stable storage. Other fid kinds have nothing to
/// flush.
pub(super) async fn sync_fid(
    session: &Arc<Session>,
    req: &RequestContext,
    fid: &Fid,
    datasync: bool,
) -> FsResult<()> {
    let handle = {
        let st = fid.state();
        match (&st.kind, st.handle) {
            (FidKind::File, Some(handle)) => Some(handle),
            _ => None,
        }
    };
    if let Some(handle) = handle {
        session
            .blocking(req, move |b| b.fsync(handle, datasync))
            .await?;
    }
    Ok(())
}
