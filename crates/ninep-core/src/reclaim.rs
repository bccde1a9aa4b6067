// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Open-descriptor budget and reclaim limits

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use nix::sys::resource::{getrlimit, Resource};
use parking_lot::Mutex;
use tracing::warn;

use crate::config::SessionConfig;
use crate::session::Session;

/// Soft limit assumed when `RLIMIT_NOFILE` cannot be read or is unlimited.
const FALLBACK_NOFILE: u64 = 1024;
/// Cap applied to an unlimited `RLIMIT_NOFILE`.
const MAX_NOFILE: u64 = 1 << 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FdLimits {
    /// Open count above which a reclaim pass runs.
    pub high_water: u64,
    /// Number of descriptors one pass tries to close.
    pub reclaim_target: u64,
}

impl FdLimits {
    /// Limits derived from an `RLIMIT_NOFILE` soft limit.
    pub fn from_soft_limit(cur: u64) -> Self {
        Self {
            high_water: cur - (cur / 3).min(400),
            reclaim_target: cur / 2,
        }
    }

    pub fn from_rlimit() -> Self {
        let cur = match getrlimit(Resource::RLIMIT_NOFILE) {
            Ok((soft, _hard)) if soft == libc::RLIM_INFINITY => MAX_NOFILE,
            Ok((soft, _hard)) => soft as u64,
            Err(err) => {
                warn!(error = %err, fallback = FALLBACK_NOFILE, "cannot read RLIMIT_NOFILE");
                FALLBACK_NOFILE
            }
        };
        Self::from_soft_limit(cur)
    }

    /// Rlimit-derived limits with the config's overrides applied.
    pub fn from_config(config: &SessionConfig) -> Self {
        if let (Some(high_water), Some(reclaim_target)) =
            (config.fd_high_water, config.fd_reclaim_target)
        {
            return Self {
                high_water,
                reclaim_target,
            };
        }
        let base = Self::from_rlimit();
        Self {
            high_water: config.fd_high_water.unwrap_or(base.high_water),
            reclaim_target: config.fd_reclaim_target.unwrap_or(base.reclaim_target),
        }
    }
}

/// Process-wide count of open backend descriptors
///
/// Every session serving the same backend holds the same budget, so the
/// high-water mark applies to the sum of their descriptors and a reclaim
/// pass may close idle fids of any member session.
pub struct FdBudget {
    limits: FdLimits,
    open: AtomicU64,
    reclaiming: AtomicBool,
    sessions: Mutex<Vec<Weak<Session>>>,
}

impl FdBudget {
    pub fn new(limits: FdLimits) -> Self {
        Self {
            limits,
            open: AtomicU64::new(0),
            reclaiming: AtomicBool::new(false),
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// Add `session` to the set a reclaim pass walks.
    pub(crate) fn register(&self, session: &Arc<Session>) {
        let mut sessions = self.sessions.lock();
        sessions.retain(|s| s.strong_count() > 0);
        sessions.push(Arc::downgrade(session));
    }

    /// Live member sessions, oldest first.
    pub(crate) fn sessions(&self) -> Vec<Arc<Session>> {
        let mut sessions = self.sessions.lock();
        sessions.retain(|s| s.strong_count() > 0);
        sessions.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn limits(&self) -> FdLimits {
        self.limits
    }

    pub fn open_count(&self) -> u64 {
        self.open.load(Ordering::Relaxed)
    }

    /// Count a new descriptor. Returns `true` when the high-water mark is
    /// now exceeded.
    pub fn opened(&self) -> bool {
        self.open.fetch_add(1, Ordering::Relaxed) + 1 > self.limits.high_water
    }

    pub fn closed(&self) {
        let _ = self
            .open
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
    }

    /// Claim the right to run a reclaim pass; `None` if one is running.
    pub fn begin_reclaim(&self) -> Option<ReclaimGuard<'_>> {
        self.reclaiming
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ReclaimGuard { budget: self })
    }
}

/// Marks a reclaim pass in progress until dropped
pub struct ReclaimGuard<'a> {
    budget: &'a FdBudget,
}

impl std::fmt::Debug for FdBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdBudget")
            .field("limits", &self.limits)
            .field("open", &self.open_count())
            .field("sessions", &self.sessions.lock().len())
            .finish()
    }
}

impl Drop for ReclaimGuard<'_> {
    fn drop(&mut self) {
        self.budget.reclaiming.store(false, Ordering::Release);
    }
}
