// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! `[logging]` section of the server config file

use serde::{Deserialize, Serialize};

use crate::{CliLogLevel, LogFormat};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LoggingConfig {
    /// Logging verbosity level
    #[serde(rename = "log-level")]
    pub level: Option<CliLogLevel>,
    #[serde(rename = "log-format")]
    pub format: Option<LogFormat>,
    /// Log to this file instead of stderr.
    #[serde(rename = "log-file")]
    pub file: Option<String>,
}
