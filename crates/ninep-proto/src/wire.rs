// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Little-endian field codec shared by every 9P message
//!
//! Field codes used throughout the protocol:
//!
//! | code | Rust type   | layout                      |
//! |------|-------------|-----------------------------|
//! | `b`  | `u8`        | 1 byte                      |
//! | `w`  | `u16`       | 2 bytes                     |
//! | `d`  | `u32`       | 4 bytes                     |
//! | `q`  | `u64`       | 8 bytes                     |
//! | `s`  | `String`    | `len[2]` + UTF-8 bytes      |
//! | `s`  | [`Name`]    | `len[2]` + raw bytes        |
//! | `Q`  | [`Qid`]     | `type[1] version[4] path[8]`|
//! | data | [`Data`]    | `count[4]` + bytes          |
//!
//! Counted sequences (walk names, walk qids) use a `u16` element count.
//! File names and link targets are [`Name`]s: hosts do not promise UTF-8
//! there, so they travel as bytes.
//!
//! [`Qid`]: crate::types::Qid

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::os::unix::ffi::{OsStrExt, OsStringExt};

use bytes::{Buf, BufMut};
use thiserror::Error;

/// Decoding failure for a single message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated message: {needed} more bytes required")]
    Truncated { needed: usize },
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("frame declares {declared} bytes but carries {actual}")]
    LengthMismatch { declared: u32, actual: usize },
}

/// A value with a fixed 9P encoding.
pub trait WireFormat: Sized {
    /// Number of bytes the value occupies on the wire.
    fn byte_size(&self) -> u32;

    fn encode<B: BufMut>(&self, buf: &mut B);

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, DecodeError>;
}

pub(crate) fn ensure<B: Buf>(buf: &B, needed: usize) -> Result<(), DecodeError> {
    if buf.remaining() < needed {
        return Err(DecodeError::Truncated {
            needed: needed - buf.remaining(),
        });
    }
    Ok(())
}

macro_rules! wire_int {
    ($ty:ty, $put:ident, $get:ident) => {
        impl WireFormat for $ty {
            fn byte_size(&self) -> u32 {
                std::mem::size_of::<$ty>() as u32
            }

            fn encode<B: BufMut>(&self, buf: &mut B) {
                buf.$put(*self);
            }

            fn decode<B: Buf>(buf: &mut B) -> Result<Self, DecodeError> {
                ensure(buf, std::mem::size_of::<$ty>())?;
                Ok(buf.$get())
            }
        }
    };
}

wire_int!(u8, put_u8, get_u8);
wire_int!(u16, put_u16_le, get_u16_le);
wire_int!(u32, put_u32_le, get_u32_le);
wire_int!(u64, put_u64_le, get_u64_le);

impl WireFormat for String {
    fn byte_size(&self) -> u32 {
        2 + self.len() as u32
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        // Strings longer than u16::MAX cannot be represented; callers bound
        // names and targets well below that.
        let len = self.len().min(u16::MAX as usize);
        buf.put_u16_le(len as u16);
        buf.put_slice(&self.as_bytes()[..len]);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, DecodeError> {
        let len = u16::decode(buf)? as usize;
        ensure(buf, len)?;
        let mut bytes = vec![0u8; len];
        buf.copy_to_slice(&mut bytes);
        String::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)
    }
}

/// A file name or link target, kept as the bytes the host uses.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Name(pub Vec<u8>);

impl Name {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn as_os_str(&self) -> &OsStr {
        OsStr::from_bytes(&self.0)
    }

    /// The name as text, if it is valid UTF-8.
    pub fn to_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Name {
    fn from(s: &str) -> Self {
        Name(s.as_bytes().to_vec())
    }
}

impl From<String> for Name {
    fn from(s: String) -> Self {
        Name(s.into_bytes())
    }
}

impl From<&[u8]> for Name {
    fn from(bytes: &[u8]) -> Self {
        Name(bytes.to_vec())
    }
}

impl From<Vec<u8>> for Name {
    fn from(bytes: Vec<u8>) -> Self {
        Name(bytes)
    }
}

impl From<&OsStr> for Name {
    fn from(s: &OsStr) -> Self {
        Name(s.as_bytes().to_vec())
    }
}

impl From<OsString> for Name {
    fn from(s: OsString) -> Self {
        Name(s.into_vec())
    }
}

impl PartialEq<str> for Name {
    fn eq(&self, other: &str) -> bool {
        self.0 == other.as_bytes()
    }
}

impl PartialEq<&str> for Name {
    fn eq(&self, other: &&str) -> bool {
        self.0 == other.as_bytes()
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.0))
    }
}

impl WireFormat for Name {
    fn byte_size(&self) -> u32 {
        2 + self.0.len() as u32
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        let len = self.0.len().min(u16::MAX as usize);
        buf.put_u16_le(len as u16);
        buf.put_slice(&self.0[..len]);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, DecodeError> {
        let len = u16::decode(buf)? as usize;
        ensure(buf, len)?;
        let mut bytes = vec![0u8; len];
        buf.copy_to_slice(&mut bytes);
        Ok(Name(bytes))
    }
}

/// Opaque payload with a 32-bit byte count (read/write/readdir bodies).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Data(pub Vec<u8>);

impl WireFormat for Data {
    fn byte_size(&self) -> u32 {
        4 + self.0.len() as u32
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.0.len() as u32);
        buf.put_slice(&self.0);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, DecodeError> {
        let len = u32::decode(buf)? as usize;
        ensure(buf, len)?;
        let mut bytes = vec![0u8; len];
        buf.copy_to_slice(&mut bytes);
        Ok(Data(bytes))
    }
}

impl<T: WireFormat> WireFormat for Vec<T> {
    fn byte_size(&self) -> u32 {
        2 + self.iter().map(WireFormat::byte_size).sum::<u32>()
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16_le(self.len() as u16);
        for item in self {
            item.encode(buf);
        }
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, DecodeError> {
        let count = u16::decode(buf)? as usize;
        let mut items = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            items.push(T::decode(buf)?);
        }
        Ok(items)
    }
}

/// Implements [`WireFormat`] for a struct whose fields are encoded in
/// declaration order.
macro_rules! wire_struct {
    ($name:ident { $($field:ident),* $(,)? }) => {
        impl $crate::wire::WireFormat for $name {
            fn byte_size(&self) -> u32 {
                0 $(+ $crate::wire::WireFormat::byte_size(&self.$field))*
            }

            #[allow(unused_variables)]
            fn encode<B: ::bytes::BufMut>(&self, buf: &mut B) {
                $($crate::wire::WireFormat::encode(&self.$field, buf);)*
            }

            #[allow(unused_variables)]
            fn decode<B: ::bytes::Buf>(buf: &mut B) -> Result<Self, $crate::wire::DecodeError> {
                Ok(Self {
                    $($field: $crate::wire::WireFormat::decode(buf)?,)*
                })
            }
        }
    };
}

pub(crate) use wire_struct;
