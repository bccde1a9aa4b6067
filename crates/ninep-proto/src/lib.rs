// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! 9P2000.L / 9P2000.u wire protocol
//!
//! This crate defines the field codec, the message bodies and the flag
//! conversions shared by the session engine and the transport.

pub mod flags;
pub mod messages;
pub mod types;
pub mod wire;

// Re-export key types
pub use messages::{
    encode_frame, mtype, FrameBody, Header, Rmessage, SizedStat, Tmessage, HEADER_SIZE, IOHDRSZ,
    MAX_WALK_ELEMENTS, MIN_MSIZE, NOFID, NOTAG,
};
pub use types::{Dialect, Dirent, Qid, SetAttr, Stat, StatDotl, StatFs};
pub use wire::{Data, DecodeError, Name, WireFormat};
