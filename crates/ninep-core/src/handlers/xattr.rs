// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::sync::Arc;

use ninep_proto::messages::{Rxattrcreate, Rxattrwalk, Txattrcreate, Txattrwalk};
use ninep_proto::Rmessage;
use tracing::debug;

use crate::error::{FsError, FsResult};
use crate::fid::{FidKind, XattrTransfer};
use crate::request::RequestContext;
use crate::session::Session;

/// Largest value accepted by `Txattrcreate` (Linux `XATTR_SIZE_MAX`).
const XATTR_SIZE_MAX: u64 = 64 * 1024;

pub(super) async fn xattrwalk(
    session: &Arc<Session>,
    req: &RequestContext,
    msg: Txattrwalk,
) -> FsResult<Rmessage> {
    let fid = session.get_fid(req, msg.fid).await?;
    let (path, uid) = {
        let st = fid.state();
        (st.path.clone(), st.uid)
    };
    let xattr_fid = session.new_fid(msg.newfid, path, uid)?;

    let name = msg.name;
    let lookup_name = name.clone();
    let value = session
        .with_path(req, &fid, move |b, path| {
            if lookup_name.is_empty() {
                b.listxattr(path)
            } else {
                b.getxattr(path, &lookup_name)
            }
        })
        .await;
    let value = match value {
        Ok(value) => value,
        Err(err) => {
            drop(xattr_fid);
            if let Ok(clunked) = session.clunk_fid(msg.newfid) {
                clunked.put().await?;
            }
            return Err(err);
        }
    };

    let size = value.len() as u64;
    xattr_fid.set_open(
        FidKind::Xattr(XattrTransfer {
            name,
            value,
            len: size,
            copied: None,
            flags: 0,
        }),
        None,
        0,
    );
    Ok(Rxattrwalk { size }.into())
}

pub(super) async fn xattrcreate(
    session: &Arc<Session>,
    req: &RequestContext,
    msg: Txattrcreate,
) -> FsResult<Rmessage> {
    if msg.attr_size > XATTR_SIZE_MAX {
        return Err(FsError::from_errno(libc::E2BIG));
    }
    let fid = session.get_fid(req, msg.fid).await?;
    if fid.state().kind.is_open() {
        return Err(FsError::WrongFidType);
    }
    debug!(fid = msg.fid, name = %msg.name, size = msg.attr_size, "xattr create");
    fid.set_open(
        FidKind::Xattr(XattrTransfer {
            name: msg.name,
            value: vec![0; msg.attr_size as usize],
            len: msg.attr_size,
            copied: Some(0),
            flags: msg.flags as i32,
        }),
        None,
        0,
    );
    Ok(Rxattrcreate {}.into())
}
