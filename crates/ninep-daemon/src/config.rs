// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Daemon configuration file
//!
//! ```toml
//! [export]
//! path = "/srv/share"
//! security-model = "mapped-xattr"
//! readonly = false
//!
//! [session]
//! msize = 131072
//! multidevs = "remap"
//!
//! [listen]
//! unix = "/run/ninep.sock"
//!
//! [logging]
//! log-level = "info"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use ninep_core::{MultiDevicePolicy, SecurityModel, SessionConfig};
use ninep_logging::LoggingConfig;
use ninep_proto::MIN_MSIZE;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors while loading or validating the daemon configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    ParseToml {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("no export path given")]
    MissingExport,
    #[error("export path {0} is not a directory")]
    ExportNotDirectory(PathBuf),
    #[error("exactly one of listen.unix and listen.tcp must be set")]
    ListenAddress,
    #[error("msize {0} is below the protocol minimum of {MIN_MSIZE}")]
    MsizeTooSmall(u32),
    #[error("the worker pool needs at least one worker")]
    NoWorkers,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ExportConfig {
    pub path: Option<PathBuf>,
    #[serde(alias = "security_model")]
    pub security_model: SecurityModel,
    pub readonly: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Unix socket path.
    pub unix: Option<PathBuf>,
    /// TCP `host:port`.
    pub tcp: Option<String>,
}

/// Where the daemon accepts connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Unix(PathBuf),
    Tcp(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub export: ExportConfig,
    pub session: SessionConfig,
    pub listen: ListenConfig,
    pub logging: LoggingConfig,
}

/// Command-line values that take precedence over the file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub export: Option<PathBuf>,
    pub listen_unix: Option<PathBuf>,
    pub listen_tcp: Option<String>,
    pub readonly: bool,
    pub multidevs: Option<MultiDevicePolicy>,
    pub security_model: Option<SecurityModel>,
    pub msize: Option<u32>,
    pub workers: Option<usize>,
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text, &path.display().to_string())
    }

    /// Parse TOML text; `origin` names the source in errors.
    pub fn parse(text: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::ParseToml {
            path: origin.to_string(),
            source,
        })
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if overrides.export.is_some() {
            self.export.path = overrides.export;
        }
        // A listen address on the command line replaces both file settings.
        if overrides.listen_unix.is_some() || overrides.listen_tcp.is_some() {
            self.listen = ListenConfig {
                unix: overrides.listen_unix,
                tcp: overrides.listen_tcp,
            };
        }
        self.export.readonly |= overrides.readonly;
        if let Some(multidevs) = overrides.multidevs {
            self.session.multidevs = multidevs;
        }
        if let Some(model) = overrides.security_model {
            self.export.security_model = model;
        }
        if let Some(msize) = overrides.msize {
            self.session.msize = msize;
        }
        if let Some(workers) = overrides.workers {
            self.session.workers = workers;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let export = self.export_path()?;
        if !export.is_dir() {
            return Err(ConfigError::ExportNotDirectory(export.to_path_buf()));
        }
        self.listen_addr()?;
        if self.session.msize < MIN_MSIZE {
            return Err(ConfigError::MsizeTooSmall(self.session.msize));
        }
        if self.session.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        Ok(())
    }

    pub fn export_path(&self) -> Result<&Path, ConfigError> {
        self.export.path.as_deref().ok_or(ConfigError::MissingExport)
    }

    pub fn listen_addr(&self) -> Result<ListenAddr, ConfigError> {
        match (&self.listen.unix, &self.listen.tcp) {
            (Some(path), None) => Ok(ListenAddr::Unix(path.clone())),
            (None, Some(addr)) => Ok(ListenAddr::Tcp(addr.clone())),
            _ => Err(ConfigError::ListenAddress),
        }
    }

    /// Settings for each connection's session.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            readonly: self.session.readonly || self.export.readonly,
            ..self.session.clone()
        }
    }
}
