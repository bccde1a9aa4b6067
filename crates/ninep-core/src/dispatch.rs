// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Request dispatch
//!
//! Every complete frame becomes a spawned task. The task runs the handler,
//! encodes the reply (or error) and pushes it to the connection's reply sink.
//! Replies leave in completion order, not arrival order.

use std::sync::Arc;

use bytes::Bytes;
use ninep_proto::{encode_frame, mtype, Header, HEADER_SIZE};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::handlers;
use crate::request::RequestContext;
use crate::session::Session;

/// Where encoded reply frames go
pub trait ReplySink: Send + Sync {
    fn push_reply(&self, frame: Bytes);
}

impl ReplySink for mpsc::UnboundedSender<Bytes> {
    fn push_reply(&self, frame: Bytes) {
        // The writer is gone once the connection closes; late replies are dropped.
        let _ = self.send(frame);
    }
}

/// Runs the requests of one connection against its session
#[derive(Clone)]
pub struct Dispatcher {
    session: Arc<Session>,
    sink: Arc<dyn ReplySink>,
}

impl Dispatcher {
    pub fn new(session: Arc<Session>, sink: Arc<dyn ReplySink>) -> Self {
        Self { session, sink }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Start processing one complete frame.
    ///
    /// The request is registered as active before this returns, so a flush
    /// submitted afterwards always finds it. Frames whose header cannot be
    /// parsed are dropped without a reply.
    pub fn submit(&self, frame: Bytes) -> Option<JoinHandle<()>> {
        let header = match Header::decode(&frame) {
            Ok(header) => header,
            Err(err) => {
                warn!(error = %err, len = frame.len(), "dropping malformed frame");
                return None;
            }
        };
        let req = Arc::new(RequestContext::new(header.tag, header.ty));
        self.session.active().insert(req.clone());

        let session = self.session.clone();
        let sink = self.sink.clone();
        Some(tokio::spawn(async move {
            let body = &frame[HEADER_SIZE..];
            let result = handlers::handle(&session, &req, header.ty, body).await;
            match result {
                Ok(reply) => {
                    sink.push_reply(encode_frame(header.ty.wrapping_add(1), header.tag, &reply));
                }
                Err(err) if err.is_interrupted() && req.is_cancelled() => {
                    debug!(
                        tag = header.tag,
                        ty = mtype::name(header.ty),
                        "request flushed, reply discarded"
                    );
                }
                Err(err) => {
                    debug!(
                        tag = header.tag,
                        ty = mtype::name(header.ty),
                        error = %err,
                        "request failed"
                    );
                    sink.push_reply(session.error_reply(&err).to_frame(header.tag));
                }
            }
            session.active().remove(&req);
            req.complete();
        }))
    }
}
