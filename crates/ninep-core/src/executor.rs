// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Bounded worker pool for blocking backend calls
//!
//! A request task hands a closure to [`WorkerPool::run`] and is suspended
//! until a worker finishes it. Cancellation is observed before waiting for a
//! permit and again once a permit is held; a cancelled request never issues
//! the call and gets [`FsError::Interrupted`] instead.

use std::io;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::error;

use crate::error::{FsError, FsResult};
use crate::request::RequestContext;

#[derive(Clone, Debug)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers not currently running a call.
    pub fn idle(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `f` on a worker on behalf of `req`.
    pub async fn run<T, F>(&self, req: &RequestContext, f: F) -> FsResult<T>
    where
        F: FnOnce() -> FsResult<T> + Send + 'static,
        T: Send + 'static,
    {
        if req.is_cancelled() {
            return Err(FsError::Interrupted);
        }
        let permit = self.acquire().await?;
        if req.is_cancelled() {
            return Err(FsError::Interrupted);
        }
        Self::spawn(permit, f).await
    }

    /// Run `f` on a worker for internal housekeeping. Never cancelled.
    pub async fn run_detached<T, F>(&self, f: F) -> FsResult<T>
    where
        F: FnOnce() -> FsResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self.acquire().await?;
        Self::spawn(permit, f).await
    }

    async fn acquire(&self) -> FsResult<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FsError::Interrupted)
    }

    async fn spawn<T, F>(permit: OwnedSemaphorePermit, f: F) -> FsResult<T>
    where
        F: FnOnce() -> FsResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let joined = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        })
        .await;
        joined.unwrap_or_else(|err| {
            error!(error = %err, "worker call panicked");
            Err(FsError::Io(io::Error::other(err.to_string())))
        })
    }
}
