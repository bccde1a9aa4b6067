// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::path::PathBuf;
use std::sync::Arc;

use ninep_proto::messages::{Rattach, Rclunk, Rflush, Rversion, Tattach, Tclunk, Tflush, Tversion};
use ninep_proto::{Dialect, Rmessage, MIN_MSIZE};
use tracing::{debug, warn};

use crate::error::{FsError, FsResult};
use crate::request::RequestContext;
use crate::session::{Negotiated, Session};

pub(super) async fn version(
    session: &Arc<Session>,
    req: &RequestContext,
    msg: Tversion,
) -> FsResult<Rmessage> {
    session.drain(req).await;
    session.reset().await;

    let dialect = session.config().dialect.accept(&msg.version);
    let msize = msg.msize.min(session.config().msize);
    if msize < MIN_MSIZE {
        warn!(
            requested = msg.msize,
            minimum = MIN_MSIZE,
            "client requested msize below the protocol minimum"
        );
        session.set_negotiated(Negotiated {
            msize: session.config().msize,
            dialect: None,
        });
        return Err(FsError::MsizeTooSmall(msg.msize));
    }
    session.set_negotiated(Negotiated { msize, dialect });
    debug!(msize, version = %msg.version, accepted = ?dialect, "version negotiated");

    Ok(Rversion {
        msize,
        version: dialect.map_or("unknown", Dialect::as_str).to_string(),
    }
    .into())
}

pub(super) async fn attach(
    session: &Arc<Session>,
    req: &RequestContext,
    msg: Tattach,
) -> FsResult<Rmessage> {
    let fid = session.new_fid(msg.fid, PathBuf::new(), msg.n_uname)?;
    let root = match session.with_path(req, &fid, |b, p| b.lstat(p)).await {
        Ok(attr) => {
            session.set_root_device(attr.dev);
            session.qid_for(&attr)
        }
        Err(err) => Err(err),
    };
    drop(fid);
    match root {
        Ok(qid) => Ok(Rattach { qid }.into()),
        Err(err) => {
            if let Ok(fid) = session.clunk_fid(msg.fid) {
                fid.put().await?;
            }
            Err(err)
        }
    }
}

pub(super) async fn flush(
    session: &Arc<Session>,
    req: &RequestContext,
    msg: Tflush,
) -> FsResult<Rmessage> {
    if msg.oldtag != req.tag() {
        if let Some(target) = session.active().get(msg.oldtag) {
            debug!(oldtag = msg.oldtag, "cancelling flushed request");
            target.cancel();
            target.wait_complete().await;
        }
    }
    Ok(Rflush {}.into())
}

pub(super) async fn clunk(session: &Arc<Session>, msg: Tclunk) -> FsResult<Rmessage> {
    session.clunk_fid(msg.fid)?.put().await?;
    Ok(Rclunk {}.into())
}
