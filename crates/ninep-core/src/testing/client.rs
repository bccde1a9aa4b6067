// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ninep_proto::messages::{Tattach, Tlopen, Tversion, Twalk};
use ninep_proto::{encode_frame, Name, Qid, Rmessage, Tmessage, NOFID, NOTAG};
use tokio::sync::mpsc;

use crate::backend::Backend;
use crate::config::SessionConfig;
use crate::dispatch::Dispatcher;
use crate::reclaim::{FdBudget, FdLimits};
use crate::session::Session;

/// Drives a [`Dispatcher`] the way a transport would and collects replies
/// by tag.
pub struct TestClient {
    dispatcher: Dispatcher,
    replies: mpsc::UnboundedReceiver<Bytes>,
    pending: HashMap<u16, Rmessage>,
    next_tag: u16,
}

impl TestClient {
    pub fn new(config: SessionConfig, backend: Arc<dyn Backend>) -> Self {
        Self::with_session(Session::new(config, backend))
    }

    pub fn with_limits(config: SessionConfig, backend: Arc<dyn Backend>, limits: FdLimits) -> Self {
        Self::with_session(Session::with_limits(config, backend, limits))
    }

    pub fn with_budget(
        config: SessionConfig,
        backend: Arc<dyn Backend>,
        budget: Arc<FdBudget>,
    ) -> Self {
        Self::with_session(Session::with_budget(config, backend, budget))
    }

    fn with_session(session: Arc<Session>) -> Self {
        let (tx, replies) = mpsc::unbounded_channel();
        Self {
            dispatcher: Dispatcher::new(session, Arc::new(tx)),
            replies,
            pending: HashMap::new(),
            next_tag: 1,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        self.dispatcher.session()
    }

    /// Submit a request under a fresh tag without waiting for its reply.
    pub fn send(&mut self, msg: impl Into<Tmessage>) -> u16 {
        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1);
        self.send_tagged(tag, msg.into());
        tag
    }

    fn send_tagged(&mut self, tag: u16, msg: Tmessage) {
        let frame = encode_frame(msg.msg_type(), tag, &msg);
        self.dispatcher.submit(frame);
    }

    /// Wait for the reply to `tag`.
    pub async fn reply(&mut self, tag: u16) -> Rmessage {
        loop {
            if let Some(reply) = self.pending.remove(&tag) {
                return reply;
            }
            let frame = tokio::time::timeout(Duration::from_secs(5), self.replies.recv())
                .await
                .expect("timed out waiting for a reply")
                .expect("reply channel closed");
            let (header, reply) = Rmessage::decode_frame(&frame).unwrap();
            self.pending.insert(header.tag, reply);
        }
    }

    /// Replies received so far for `tag`, without waiting.
    pub fn try_reply(&mut self, tag: u16) -> Option<Rmessage> {
        while let Ok(frame) = self.replies.try_recv() {
            let (header, reply) = Rmessage::decode_frame(&frame).unwrap();
            self.pending.insert(header.tag, reply);
        }
        self.pending.remove(&tag)
    }

    pub async fn call(&mut self, msg: impl Into<Tmessage>) -> Rmessage {
        let tag = self.send(msg);
        self.reply(tag).await
    }

    /// Negotiate 9P2000.L and attach `fid` to the export root.
    pub async fn attach(&mut self, fid: u32) -> Qid {
        self.send_tagged(
            NOTAG,
            Tversion {
                msize: 64 * 1024,
                version: "9P2000.L".into(),
            }
            .into(),
        );
        match self.reply(NOTAG).await {
            Rmessage::Version(_) => {}
            other => panic!("version failed: {other:?}"),
        }
        let reply = self
            .call(Tattach {
                fid,
                afid: NOFID,
                uname: "user".into(),
                aname: String::new(),
                n_uname: 1000,
            })
            .await;
        match reply {
            Rmessage::Attach(r) => r.qid,
            other => panic!("attach failed: {other:?}"),
        }
    }

    pub async fn walk(&mut self, fid: u32, newfid: u32, path: &str) -> Rmessage {
        let wnames = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(Name::from)
            .collect();
        self.call(Twalk {
            fid,
            newfid,
            wnames,
        })
        .await
    }

    pub async fn lopen(&mut self, fid: u32, flags: i32) -> Rmessage {
        self.call(Tlopen {
            fid,
            flags: flags as u32,
        })
        .await
    }
}
