// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! 9P2000.L session engine
//!
//! A [`Session`] holds the per-connection state (fid table, rename fence,
//! inode remapper and worker pool) and counts its open descriptors against
//! an [`FdBudget`] shared by every session on the same backend. A [`Dispatcher`]
//! feeds it complete frames and pushes encoded replies to a [`ReplySink`].
//! Storage is reached only through the [`Backend`] trait.

pub mod backend;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod fence;
pub mod fid;
mod handlers;
pub mod reclaim;
pub mod remap;
pub mod request;
pub mod session;

#[cfg(test)]
mod scenarios;
#[cfg(test)]
pub(crate) mod testing;

// Re-export key types
pub use backend::local::{LocalBackend, SecurityModel};
pub use backend::{Backend, Credentials, DirEntry, FileAttr, FsStats, HandleId, SetTime, Timespec};
pub use config::{DialectSelection, MultiDevicePolicy, SessionConfig};
pub use dispatch::{Dispatcher, ReplySink};
pub use error::{FsError, FsResult};
pub use reclaim::{FdBudget, FdLimits};
pub use session::{FidRef, Negotiated, Session};
