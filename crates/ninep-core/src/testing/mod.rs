// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Test support: an in-memory backend and a small 9P client

mod client;
mod mem_backend;

pub use client::TestClient;
pub use mem_backend::{MemBackend, ROOT_DEV};
