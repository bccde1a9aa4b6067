// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Reader/writer fence between path users and path rewrites

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Held shared by every backend call that uses a fid's path and exclusively
/// by renames while they rewrite fid paths. Only present for path-based
/// backends.
///
/// A task must not take the read side while it holds the write side.
#[derive(Debug)]
pub struct RenameFence {
    lock: Option<RwLock<()>>,
}

impl RenameFence {
    pub fn new(path_based: bool) -> Self {
        Self {
            lock: path_based.then(|| RwLock::new(())),
        }
    }

    pub fn is_active(&self) -> bool {
        self.lock.is_some()
    }

    pub async fn read(&self) -> Option<RwLockReadGuard<'_, ()>> {
        match &self.lock {
            Some(lock) => Some(lock.read().await),
            None => None,
        }
    }

    pub async fn write(&self) -> Option<RwLockWriteGuard<'_, ()>> {
        match &self.lock {
            Some(lock) => Some(lock.write().await),
            None => None,
        }
    }
}
