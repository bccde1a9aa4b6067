// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! 9P2000.L file server daemon: configuration loading and socket transport

pub mod config;
pub mod transport;

pub use config::{ConfigError, DaemonConfig, ListenAddr, Overrides};
pub use transport::{serve_connection, DeleteOnDrop, Listener, Server};
