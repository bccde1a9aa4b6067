// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-flight request tracking for flush/cancel

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

/// State shared between a running request and any flush aimed at it
#[derive(Debug)]
pub struct RequestContext {
    tag: u16,
    msg_type: u8,
    cancelled: AtomicBool,
    done: watch::Sender<bool>,
}

impl RequestContext {
    pub fn new(tag: u16, msg_type: u8) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            tag,
            msg_type,
            cancelled: AtomicBool::new(false),
            done,
        }
    }

    pub fn tag(&self) -> u16 {
        self.tag
    }

    pub fn msg_type(&self) -> u8 {
        self.msg_type
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Signal waiting flushes that the reply was pushed or discarded.
    pub fn complete(&self) {
        self.done.send_replace(true);
    }

    pub fn is_complete(&self) -> bool {
        *self.done.borrow()
    }

    pub async fn wait_complete(&self) {
        let mut rx = self.done.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|done| *done).await;
    }
}

/// Requests currently in flight, keyed by tag
#[derive(Debug, Default)]
pub struct ActiveRequests {
    by_tag: Mutex<HashMap<u16, Arc<RequestContext>>>,
}

impl ActiveRequests {
    pub fn insert(&self, req: Arc<RequestContext>) {
        self.by_tag.lock().insert(req.tag(), req);
    }

    pub fn get(&self, tag: u16) -> Option<Arc<RequestContext>> {
        self.by_tag.lock().get(&tag).cloned()
    }

    /// Remove `req` unless its tag has since been reused by a newer request.
    pub fn remove(&self, req: &Arc<RequestContext>) {
        let mut by_tag = self.by_tag.lock();
        if by_tag.get(&req.tag()).is_some_and(|cur| Arc::ptr_eq(cur, req)) {
            by_tag.remove(&req.tag());
        }
    }

    /// Every request in flight except `current`.
    pub fn others(&self, current: &RequestContext) -> Vec<Arc<RequestContext>> {
        self.by_tag
            .lock()
            .values()
            .filter(|req| !std::ptr::eq(req.as_ref(), current))
            .cloned()
            .collect()
    }

    /// Cancel everything in flight (connection teardown).
    pub fn cancel_all(&self) {
        for req in self.by_tag.lock().values() {
            req.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.by_tag.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tag.lock().is_empty()
    }
}
