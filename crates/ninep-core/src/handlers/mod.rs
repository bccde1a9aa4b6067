// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-message request handlers

mod attr;
mod control;
mod io;
mod namespace;
mod xattr;

use std::sync::Arc;

use ninep_proto::{mtype, DecodeError, Rmessage, Tmessage};
use tracing::debug;

use crate::error::{FsError, FsResult};
use crate::request::RequestContext;
use crate::session::Session;

/// Request types a read-only export still serves.
fn is_readonly_op(ty: u8) -> bool {
    matches!(
        ty,
        mtype::TREADDIR
            | mtype::TSTATFS
            | mtype::TGETATTR
            | mtype::TXATTRWALK
            | mtype::TLOCK
            | mtype::TGETLOCK
            | mtype::TREADLINK
            | mtype::TVERSION
            | mtype::TLOPEN
            | mtype::TATTACH
            | mtype::TSTAT
            | mtype::TWALK
            | mtype::TCLUNK
            | mtype::TFSYNC
            | mtype::TOPEN
            | mtype::TREAD
            | mtype::TAUTH
            | mtype::TFLUSH
    )
}

/// Decode and run one request body, producing the success reply.
pub(crate) async fn handle(
    session: &Arc<Session>,
    req: &RequestContext,
    ty: u8,
    body: &[u8],
) -> FsResult<Rmessage> {
    let decoded = match Tmessage::decode(ty, body, session.dialect()) {
        Err(DecodeError::UnknownType(_)) => return Err(FsError::Unsupported),
        other => other,
    };
    if session.config().readonly && !is_readonly_op(ty) {
        return Err(FsError::ReadOnly);
    }
    let msg = decoded?;
    debug!(
        tag = req.tag(),
        ty = mtype::name(ty),
        fid = ?msg.fid(),
        "handling request"
    );

    match msg {
        Tmessage::Version(m) => control::version(session, req, m).await,
        Tmessage::Auth(_) => Err(FsError::Unsupported),
        Tmessage::Attach(m) => control::attach(session, req, m).await,
        Tmessage::Flush(m) => control::flush(session, req, m).await,
        Tmessage::Clunk(m) => control::clunk(session, m).await,

        Tmessage::Walk(m) => namespace::walk(session, req, m).await,
        Tmessage::Mkdir(m) => namespace::mkdir(session, req, m).await,
        Tmessage::Mknod(m) => namespace::mknod(session, req, m).await,
        Tmessage::Symlink(m) => namespace::symlink(session, req, m).await,
        Tmessage::Link(m) => namespace::link(session, req, m).await,
        Tmessage::Rename(m) => namespace::rename(session, req, m).await,
        Tmessage::Renameat(m) => namespace::renameat(session, req, m).await,
        Tmessage::Unlinkat(m) => namespace::unlinkat(session, req, m).await,
        Tmessage::Remove(m) => namespace::remove(session, req, m).await,
        Tmessage::Readlink(m) => namespace::readlink(session, req, m).await,

        Tmessage::Lopen(m) => io::lopen(session, req, m).await,
        Tmessage::Open(m) => io::open(session, req, m).await,
        Tmessage::Lcreate(m) => io::lcreate(session, req, m).await,
        Tmessage::Create(m) => io::create(session, req, m).await,
        Tmessage::Read(m) => io::read(session, req, m).await,
        Tmessage::Write(m) => io::write(session, req, m).await,
        Tmessage::Readdir(m) => io::readdir(session, req, m).await,
        Tmessage::Fsync(m) => io::fsync(session, req, m).await,

        Tmessage::Getattr(m) => attr::getattr(session, req, m).await,
        Tmessage::Setattr(m) => attr::setattr(session, req, m).await,
        Tmessage::Stat(m) => attr::stat(session, req, m).await,
        Tmessage::Wstat(m) => attr::wstat(session, req, m).await,
        Tmessage::Statfs(m) => attr::statfs(session, req, m).await,
        Tmessage::Lock(m) => attr::lock(session, req, m).await,
        Tmessage::Getlock(m) => attr::getlock(session, req, m).await,

        Tmessage::Xattrwalk(m) => xattr::xattrwalk(session, req, m).await,
        Tmessage::Xattrcreate(m) => xattr::xattrcreate(session, req, m).await,
    }
}

/// A single path component: non-empty, no separator.
fn check_name(name: &[u8]) -> FsResult<()> {
    if name.is_empty() || name.contains(&b'/') {
        return Err(FsError::NotFound);
    }
    Ok(())
}

/// A component that is about to be created.
fn check_new_name(name: &[u8]) -> FsResult<()> {
    check_name(name)?;
    if name == b"." || name == b".." {
        return Err(FsError::AlreadyExists);
    }
    Ok(())
}
