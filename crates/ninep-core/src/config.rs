// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-session settings

use std::str::FromStr;

use ninep_proto::Dialect;
use serde::{Deserialize, Serialize};

/// Policy for exports that span more than one host device
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MultiDevicePolicy {
    /// Remap inode numbers so ids stay unique across devices.
    Remap,
    /// Refuse access to anything outside the export root's device.
    Forbid,
    /// Pass inode numbers through and log once when a second device shows up.
    #[default]
    Warn,
}

impl FromStr for MultiDevicePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "remap" => Ok(MultiDevicePolicy::Remap),
            "forbid" => Ok(MultiDevicePolicy::Forbid),
            "warn" => Ok(MultiDevicePolicy::Warn),
            other => Err(format!(
                "invalid multidevs policy '{other}' (expected remap, forbid or warn)"
            )),
        }
    }
}

/// Which dialects `Tversion` may negotiate
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DialectSelection {
    #[default]
    #[serde(rename = "any")]
    Any,
    #[serde(rename = "9P2000.L")]
    Linux,
    #[serde(rename = "9P2000.u")]
    Unix,
}

impl DialectSelection {
    /// Dialect to use for a client version string, if acceptable.
    pub fn accept(self, requested: &str) -> Option<Dialect> {
        let dialect = Dialect::from_version(requested)?;
        match (self, dialect) {
            (DialectSelection::Any, d) => Some(d),
            (DialectSelection::Linux, Dialect::Linux) => Some(Dialect::Linux),
            (DialectSelection::Unix, Dialect::Unix) => Some(Dialect::Unix),
            _ => None,
        }
    }
}

impl FromStr for DialectSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "any" => Ok(DialectSelection::Any),
            "9P2000.L" | "L" | "l" => Ok(DialectSelection::Linux),
            "9P2000.u" | "u" | "U" => Ok(DialectSelection::Unix),
            other => Err(format!(
                "invalid dialect '{other}' (expected any, 9P2000.L or 9P2000.u)"
            )),
        }
    }
}

/// Settings consumed by a [`Session`](crate::Session)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SessionConfig {
    /// Largest message the server accepts or sends.
    pub msize: u32,
    pub dialect: DialectSelection,
    pub readonly: bool,
    pub multidevs: MultiDevicePolicy,
    /// Size of the blocking worker pool.
    pub workers: usize,
    /// Open-descriptor count that triggers reclaim. Derived from
    /// `RLIMIT_NOFILE` when unset.
    pub fd_high_water: Option<u64>,
    /// Number of descriptors a reclaim pass tries to close.
    pub fd_reclaim_target: Option<u64>,
}

pub const DEFAULT_MSIZE: u32 = 128 * 1024;
pub const DEFAULT_WORKERS: usize = 16;

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            msize: DEFAULT_MSIZE,
            dialect: DialectSelection::Any,
            readonly: false,
            multidevs: MultiDevicePolicy::Warn,
            workers: DEFAULT_WORKERS,
            fd_high_water: None,
            fd_reclaim_target: None,
        }
    }
}
