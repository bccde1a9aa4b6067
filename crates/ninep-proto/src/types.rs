// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Protocol structures shared by several messages

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::wire::{wire_struct, DecodeError, Name, WireFormat};

/// Negotiated protocol dialect
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dialect {
    #[serde(rename = "9P2000.L")]
    Linux,
    #[serde(rename = "9P2000.u")]
    Unix,
}

impl Dialect {
    pub const fn as_str(self) -> &'static str {
        match self {
            Dialect::Linux => "9P2000.L",
            Dialect::Unix => "9P2000.u",
        }
    }

    /// Parses the version string carried by `Tversion`.
    pub fn from_version(version: &str) -> Option<Self> {
        match version {
            "9P2000.L" => Some(Dialect::Linux),
            "9P2000.u" => Some(Dialect::Unix),
            _ => None,
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server-unique identity of a file as seen by the client
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Qid {
    pub ty: u8,
    pub version: u32,
    pub path: u64,
}

wire_struct!(Qid { ty, version, path });

/// `Rgetattr` body (the `A` structure)
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatDotl {
    pub valid: u64,
    pub qid: Qid,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u64,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime_sec: u64,
    pub atime_nsec: u64,
    pub mtime_sec: u64,
    pub mtime_nsec: u64,
    pub ctime_sec: u64,
    pub ctime_nsec: u64,
    pub btime_sec: u64,
    pub btime_nsec: u64,
    pub gen: u64,
    pub data_version: u64,
}

wire_struct!(StatDotl {
    valid,
    qid,
    mode,
    uid,
    gid,
    nlink,
    rdev,
    size,
    blksize,
    blocks,
    atime_sec,
    atime_nsec,
    mtime_sec,
    mtime_nsec,
    ctime_sec,
    ctime_nsec,
    btime_sec,
    btime_nsec,
    gen,
    data_version,
});

/// `Tsetattr` body (the `I` structure)
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SetAttr {
    pub valid: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime_sec: u64,
    pub atime_nsec: u64,
    pub mtime_sec: u64,
    pub mtime_nsec: u64,
}

wire_struct!(SetAttr {
    valid,
    mode,
    uid,
    gid,
    size,
    atime_sec,
    atime_nsec,
    mtime_sec,
    mtime_nsec,
});

/// 9P2000.u stat record (the `S` structure).
///
/// The leading `size[2]` is derived from the other fields on encode and
/// skipped on decode.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Stat {
    pub ty: u16,
    pub dev: u32,
    pub qid: Qid,
    pub mode: u32,
    pub atime: u32,
    pub mtime: u32,
    pub length: u64,
    pub name: Name,
    pub uid: String,
    pub gid: String,
    pub muid: String,
    pub extension: Name,
    pub n_uid: u32,
    pub n_gid: u32,
    pub n_muid: u32,
}

impl Stat {
    /// A stat whose every field means "leave unchanged" (used by wstat).
    pub fn dont_touch() -> Self {
        Stat {
            ty: u16::MAX,
            dev: u32::MAX,
            qid: Qid {
                ty: u8::MAX,
                version: u32::MAX,
                path: u64::MAX,
            },
            mode: u32::MAX,
            atime: u32::MAX,
            mtime: u32::MAX,
            length: u64::MAX,
            name: Name::default(),
            uid: String::new(),
            gid: String::new(),
            muid: String::new(),
            extension: Name::default(),
            n_uid: u32::MAX,
            n_gid: u32::MAX,
            n_muid: u32::MAX,
        }
    }

    pub fn is_dont_touch(&self) -> bool {
        let untouched = Stat {
            extension: self.extension.clone(),
            ..Stat::dont_touch()
        };
        *self == untouched
    }

    fn strings_size(&self) -> u32 {
        self.name.byte_size()
            + self.uid.byte_size()
            + self.gid.byte_size()
            + self.muid.byte_size()
            + self.extension.byte_size()
    }
}

impl WireFormat for Stat {
    fn byte_size(&self) -> u32 {
        // size[2] type[2] dev[4] qid[13] mode[4] atime[4] mtime[4]
        // length[8] n_uid[4] n_gid[4] n_muid[4]
        2 + 2 + 4 + 13 + 4 + 4 + 4 + 8 + 12 + self.strings_size()
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        ((self.byte_size() - 2) as u16).encode(buf);
        self.ty.encode(buf);
        self.dev.encode(buf);
        self.qid.encode(buf);
        self.mode.encode(buf);
        self.atime.encode(buf);
        self.mtime.encode(buf);
        self.length.encode(buf);
        self.name.encode(buf);
        self.uid.encode(buf);
        self.gid.encode(buf);
        self.muid.encode(buf);
        self.extension.encode(buf);
        self.n_uid.encode(buf);
        self.n_gid.encode(buf);
        self.n_muid.encode(buf);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, DecodeError> {
        let _size = u16::decode(buf)?;
        Ok(Stat {
            ty: WireFormat::decode(buf)?,
            dev: WireFormat::decode(buf)?,
            qid: WireFormat::decode(buf)?,
            mode: WireFormat::decode(buf)?,
            atime: WireFormat::decode(buf)?,
            mtime: WireFormat::decode(buf)?,
            length: WireFormat::decode(buf)?,
            name: WireFormat::decode(buf)?,
            uid: WireFormat::decode(buf)?,
            gid: WireFormat::decode(buf)?,
            muid: WireFormat::decode(buf)?,
            extension: WireFormat::decode(buf)?,
            n_uid: WireFormat::decode(buf)?,
            n_gid: WireFormat::decode(buf)?,
            n_muid: WireFormat::decode(buf)?,
        })
    }
}

/// One `Rreaddir` entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dirent {
    pub qid: Qid,
    pub offset: u64,
    pub ty: u8,
    pub name: Name,
}

wire_struct!(Dirent {
    qid,
    offset,
    ty,
    name
});

impl Dirent {
    /// Wire size of an entry named `name`: qid(13) + offset(8) + type(1) + name.
    pub fn size_for_name(name: &[u8]) -> u32 {
        13 + 8 + 1 + 2 + name.len() as u32
    }
}

/// `Rstatfs` body
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatFs {
    pub ty: u32,
    pub bsize: u32,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub fsid: u64,
    pub namelen: u32,
}

wire_struct!(StatFs {
    ty,
    bsize,
    blocks,
    bfree,
    bavail,
    files,
    ffree,
    fsid,
    namelen,
});
