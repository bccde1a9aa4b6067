// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Request and reply bodies plus frame-level encode/decode

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::types::{Dialect, Qid, SetAttr, Stat, StatDotl, StatFs};
use crate::wire::{wire_struct, Data, DecodeError, Name, WireFormat};

/// `size[4] type[1] tag[2]`
pub const HEADER_SIZE: usize = 7;
/// Tag used by `Tversion`
pub const NOTAG: u16 = u16::MAX;
/// "No fid" marker (e.g. `Trename` without a new directory)
pub const NOFID: u32 = u32::MAX;
/// Largest name count accepted by `Twalk`
pub const MAX_WALK_ELEMENTS: usize = 16;
/// Smallest msize a client may negotiate
pub const MIN_MSIZE: u32 = 4096;
/// Header bytes reserved ahead of read/write payloads
pub const IOHDRSZ: u32 = 24;

/// Message type codes
pub mod mtype {
    pub const TLERROR: u8 = 6;
    pub const RLERROR: u8 = 7;
    pub const TSTATFS: u8 = 8;
    pub const RSTATFS: u8 = 9;
    pub const TLOPEN: u8 = 12;
    pub const RLOPEN: u8 = 13;
    pub const TLCREATE: u8 = 14;
    pub const RLCREATE: u8 = 15;
    pub const TSYMLINK: u8 = 16;
    pub const RSYMLINK: u8 = 17;
    pub const TMKNOD: u8 = 18;
    pub const RMKNOD: u8 = 19;
    pub const TRENAME: u8 = 20;
    pub const RRENAME: u8 = 21;
    pub const TREADLINK: u8 = 22;
    pub const RREADLINK: u8 = 23;
    pub const TGETATTR: u8 = 24;
    pub const RGETATTR: u8 = 25;
    pub const TSETATTR: u8 = 26;
    pub const RSETATTR: u8 = 27;
    pub const TXATTRWALK: u8 = 30;
    pub const RXATTRWALK: u8 = 31;
    pub const TXATTRCREATE: u8 = 32;
    pub const RXATTRCREATE: u8 = 33;
    pub const TREADDIR: u8 = 40;
    pub const RREADDIR: u8 = 41;
    pub const TFSYNC: u8 = 50;
    pub const RFSYNC: u8 = 51;
    pub const TLOCK: u8 = 52;
    pub const RLOCK: u8 = 53;
    pub const TGETLOCK: u8 = 54;
    pub const RGETLOCK: u8 = 55;
    pub const TLINK: u8 = 70;
    pub const RLINK: u8 = 71;
    pub const TMKDIR: u8 = 72;
    pub const RMKDIR: u8 = 73;
    pub const TRENAMEAT: u8 = 74;
    pub const RRENAMEAT: u8 = 75;
    pub const TUNLINKAT: u8 = 76;
    pub const RUNLINKAT: u8 = 77;
    pub const TVERSION: u8 = 100;
    pub const RVERSION: u8 = 101;
    pub const TAUTH: u8 = 102;
    pub const RAUTH: u8 = 103;
    pub const TATTACH: u8 = 104;
    pub const RATTACH: u8 = 105;
    pub const RERROR: u8 = 107;
    pub const TFLUSH: u8 = 108;
    pub const RFLUSH: u8 = 109;
    pub const TWALK: u8 = 110;
    pub const RWALK: u8 = 111;
    pub const TOPEN: u8 = 112;
    pub const ROPEN: u8 = 113;
    pub const TCREATE: u8 = 114;
    pub const RCREATE: u8 = 115;
    pub const TREAD: u8 = 116;
    pub const RREAD: u8 = 117;
    pub const TWRITE: u8 = 118;
    pub const RWRITE: u8 = 119;
    pub const TCLUNK: u8 = 120;
    pub const RCLUNK: u8 = 121;
    pub const TREMOVE: u8 = 122;
    pub const RREMOVE: u8 = 123;
    pub const TSTAT: u8 = 124;
    pub const RSTAT: u8 = 125;
    pub const TWSTAT: u8 = 126;
    pub const RWSTAT: u8 = 127;

    /// Printable name for log lines.
    pub fn name(ty: u8) -> &'static str {
        match ty {
            TSTATFS => "statfs",
            TLOPEN => "lopen",
            TLCREATE => "lcreate",
            TSYMLINK => "symlink",
            TMKNOD => "mknod",
            TRENAME => "rename",
            TREADLINK => "readlink",
            TGETATTR => "getattr",
            TSETATTR => "setattr",
            TXATTRWALK => "xattrwalk",
            TXATTRCREATE => "xattrcreate",
            TREADDIR => "readdir",
            TFSYNC => "fsync",
            TLOCK => "lock",
            TGETLOCK => "getlock",
            TLINK => "link",
            TMKDIR => "mkdir",
            TRENAMEAT => "renameat",
            TUNLINKAT => "unlinkat",
            TVERSION => "version",
            TAUTH => "auth",
            TATTACH => "attach",
            TFLUSH => "flush",
            TWALK => "walk",
            TOPEN => "open",
            TCREATE => "create",
            TREAD => "read",
            TWRITE => "write",
            TCLUNK => "clunk",
            TREMOVE => "remove",
            TSTAT => "stat",
            TWSTAT => "wstat",
            _ => "unknown",
        }
    }
}

/// Frame header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub size: u32,
    pub ty: u8,
    pub tag: u16,
}

impl Header {
    /// Decodes the header of a complete frame and checks the declared size.
    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = frame;
        let size = u32::decode(&mut buf)?;
        let ty = u8::decode(&mut buf)?;
        let tag = u16::decode(&mut buf)?;
        if size as usize != frame.len() {
            return Err(DecodeError::LengthMismatch {
                declared: size,
                actual: frame.len(),
            });
        }
        Ok(Header { size, ty, tag })
    }
}

/// `n[2] S`: a stat record preceded by its own total size.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SizedStat(pub Stat);

impl WireFormat for SizedStat {
    fn byte_size(&self) -> u32 {
        2 + self.0.byte_size()
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        (self.0.byte_size() as u16).encode(buf);
        self.0.encode(buf);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, DecodeError> {
        let _n = u16::decode(buf)?;
        Ok(SizedStat(Stat::decode(buf)?))
    }
}

macro_rules! bodies {
    ($($name:ident { $($field:ident : $ty:ty),* $(,)? })*) => {
        $(
            #[derive(Clone, Debug, Default, PartialEq, Eq)]
            pub struct $name {
                $(pub $field: $ty,)*
            }

            wire_struct!($name { $($field),* });
        )*
    };
}

bodies! {
    Tversion { msize: u32, version: String }
    Tauth { afid: u32, uname: String, aname: String, n_uname: u32 }
    Tattach { fid: u32, afid: u32, uname: String, aname: String, n_uname: u32 }
    Tflush { oldtag: u16 }
    Twalk { fid: u32, newfid: u32, wnames: Vec<Name> }
    Tlopen { fid: u32, flags: u32 }
    Topen { fid: u32, mode: u8 }
    Tlcreate { fid: u32, name: Name, flags: u32, mode: u32, gid: u32 }
    Tcreate { fid: u32, name: Name, perm: u32, mode: u8, extension: Name }
    Tread { fid: u32, offset: u64, count: u32 }
    Twrite { fid: u32, offset: u64, data: Data }
    Tclunk { fid: u32 }
    Tremove { fid: u32 }
    Tstat { fid: u32 }
    Twstat { fid: u32, stat: SizedStat }
    Tgetattr { fid: u32, request_mask: u64 }
    Tsetattr { fid: u32, attr: SetAttr }
    Tstatfs { fid: u32 }
    Tmkdir { dfid: u32, name: Name, mode: u32, gid: u32 }
    Tmknod { dfid: u32, name: Name, mode: u32, major: u32, minor: u32, gid: u32 }
    Tsymlink { dfid: u32, name: Name, target: Name, gid: u32 }
    Tlink { dfid: u32, fid: u32, name: Name }
    Trename { fid: u32, newdirfid: u32, name: Name }
    Trenameat { olddirfid: u32, oldname: Name, newdirfid: u32, newname: Name }
    Tunlinkat { dirfid: u32, name: Name, flags: u32 }
    Treadlink { fid: u32 }
    Treaddir { fid: u32, offset: u64, count: u32 }
    Tfsync { fid: u32, datasync: u32 }
    Tlock { fid: u32, ty: u8, flags: u32, start: u64, length: u64, proc_id: u32, client_id: String }
    Tgetlock { fid: u32, ty: u8, start: u64, length: u64, proc_id: u32, client_id: String }
    Txattrwalk { fid: u32, newfid: u32, name: String }
    Txattrcreate { fid: u32, name: String, attr_size: u64, flags: u32 }

    Rlerror { ecode: u32 }
    Rerror { ename: String, errno: u32 }
    Rversion { msize: u32, version: String }
    Rauth { aqid: Qid }
    Rattach { qid: Qid }
    Rflush {}
    Rwalk { wqids: Vec<Qid> }
    Rlopen { qid: Qid, iounit: u32 }
    Ropen { qid: Qid, iounit: u32 }
    Rlcreate { qid: Qid, iounit: u32 }
    Rcreate { qid: Qid, iounit: u32 }
    Rread { data: Data }
    Rwrite { count: u32 }
    Rclunk {}
    Rremove {}
    Rstat { stat: SizedStat }
    Rwstat {}
    Rgetattr { attr: StatDotl }
    Rsetattr {}
    Rstatfs { stat: StatFs }
    Rmkdir { qid: Qid }
    Rmknod { qid: Qid }
    Rsymlink { qid: Qid }
    Rlink {}
    Rrename {}
    Rrenameat {}
    Runlinkat {}
    Rreadlink { target: Name }
    Rreaddir { data: Data }
    Rfsync {}
    Rlock { status: u8 }
    Rgetlock { ty: u8, start: u64, length: u64, proc_id: u32, client_id: String }
    Rxattrwalk { size: u64 }
    Rxattrcreate {}
}

macro_rules! message_enum {
    ($(#[$meta:meta])* $enum:ident { $($variant:ident($body:ident) = $code:ident),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub enum $enum {
            $($variant($body),)*
        }

        impl $enum {
            pub fn msg_type(&self) -> u8 {
                match self {
                    $($enum::$variant(_) => mtype::$code,)*
                }
            }

            pub fn body_size(&self) -> u32 {
                match self {
                    $($enum::$variant(body) => body.byte_size(),)*
                }
            }

            pub fn encode_body<B: BufMut>(&self, buf: &mut B) {
                match self {
                    $($enum::$variant(body) => body.encode(buf),)*
                }
            }

            pub fn decode_body<B: Buf>(ty: u8, buf: &mut B) -> Result<Self, DecodeError> {
                match ty {
                    $(mtype::$code => Ok($enum::$variant($body::decode(buf)?)),)*
                    other => Err(DecodeError::UnknownType(other)),
                }
            }

            /// Encodes a complete frame using this message's own type code.
            pub fn to_frame(&self, tag: u16) -> Bytes {
                encode_frame(self.msg_type(), tag, self)
            }
        }

        $(
            impl From<$body> for $enum {
                fn from(body: $body) -> Self {
                    $enum::$variant(body)
                }
            }
        )*

        impl FrameBody for $enum {
            fn body_size(&self) -> u32 {
                $enum::body_size(self)
            }

            fn encode_body(&self, buf: &mut BytesMut) {
                $enum::encode_body(self, buf)
            }
        }
    };
}

message_enum! {
    /// A decoded request
    Tmessage {
        Statfs(Tstatfs) = TSTATFS,
        Lopen(Tlopen) = TLOPEN,
        Lcreate(Tlcreate) = TLCREATE,
        Symlink(Tsymlink) = TSYMLINK,
        Mknod(Tmknod) = TMKNOD,
        Rename(Trename) = TRENAME,
        Readlink(Treadlink) = TREADLINK,
        Getattr(Tgetattr) = TGETATTR,
        Setattr(Tsetattr) = TSETATTR,
        Xattrwalk(Txattrwalk) = TXATTRWALK,
        Xattrcreate(Txattrcreate) = TXATTRCREATE,
        Readdir(Treaddir) = TREADDIR,
        Fsync(Tfsync) = TFSYNC,
        Lock(Tlock) = TLOCK,
        Getlock(Tgetlock) = TGETLOCK,
        Link(Tlink) = TLINK,
        Mkdir(Tmkdir) = TMKDIR,
        Renameat(Trenameat) = TRENAMEAT,
        Unlinkat(Tunlinkat) = TUNLINKAT,
        Version(Tversion) = TVERSION,
        Auth(Tauth) = TAUTH,
        Attach(Tattach) = TATTACH,
        Flush(Tflush) = TFLUSH,
        Walk(Twalk) = TWALK,
        Open(Topen) = TOPEN,
        Create(Tcreate) = TCREATE,
        Read(Tread) = TREAD,
        Write(Twrite) = TWRITE,
        Clunk(Tclunk) = TCLUNK,
        Remove(Tremove) = TREMOVE,
        Stat(Tstat) = TSTAT,
        Wstat(Twstat) = TWSTAT,
    }
}

message_enum! {
    /// A reply body
    Rmessage {
        Lerror(Rlerror) = RLERROR,
        Error(Rerror) = RERROR,
        Statfs(Rstatfs) = RSTATFS,
        Lopen(Rlopen) = RLOPEN,
        Lcreate(Rlcreate) = RLCREATE,
        Symlink(Rsymlink) = RSYMLINK,
        Mknod(Rmknod) = RMKNOD,
        Rename(Rrename) = RRENAME,
        Readlink(Rreadlink) = RREADLINK,
        Getattr(Rgetattr) = RGETATTR,
        Setattr(Rsetattr) = RSETATTR,
        Xattrwalk(Rxattrwalk) = RXATTRWALK,
        Xattrcreate(Rxattrcreate) = RXATTRCREATE,
        Readdir(Rreaddir) = RREADDIR,
        Fsync(Rfsync) = RFSYNC,
        Lock(Rlock) = RLOCK,
        Getlock(Rgetlock) = RGETLOCK,
        Link(Rlink) = RLINK,
        Mkdir(Rmkdir) = RMKDIR,
        Renameat(Rrenameat) = RRENAMEAT,
        Unlinkat(Runlinkat) = RUNLINKAT,
        Version(Rversion) = RVERSION,
        Auth(Rauth) = RAUTH,
        Attach(Rattach) = RATTACH,
        Flush(Rflush) = RFLUSH,
        Walk(Rwalk) = RWALK,
        Open(Ropen) = ROPEN,
        Create(Rcreate) = RCREATE,
        Read(Rread) = RREAD,
        Write(Rwrite) = RWRITE,
        Clunk(Rclunk) = RCLUNK,
        Remove(Rremove) = RREMOVE,
        Stat(Rstat) = RSTAT,
        Wstat(Rwstat) = RWSTAT,
    }
}

/// Anything that can be written after a frame header.
pub trait FrameBody {
    fn body_size(&self) -> u32;
    fn encode_body(&self, buf: &mut BytesMut);
}

/// Writes `size[4] type[1] tag[2]` followed by `body`.
pub fn encode_frame<M: FrameBody + ?Sized>(ty: u8, tag: u16, body: &M) -> Bytes {
    let size = HEADER_SIZE as u32 + body.body_size();
    let mut buf = BytesMut::with_capacity(size as usize);
    buf.put_u32_le(size);
    buf.put_u8(ty);
    buf.put_u16_le(tag);
    body.encode_body(&mut buf);
    buf.freeze()
}

impl Tmessage {
    /// Decodes a request body.
    ///
    /// Under 9P2000.L a `Topen` carries `fid[4] flags[4]` and is decoded as
    /// [`Tlopen`]; the reply keeps the `Ropen` type code.
    pub fn decode(ty: u8, body: &[u8], dialect: Option<Dialect>) -> Result<Self, DecodeError> {
        let mut buf = body;
        if ty == mtype::TOPEN && dialect == Some(Dialect::Linux) {
            return Ok(Tmessage::Lopen(Tlopen::decode(&mut buf)?));
        }
        Tmessage::decode_body(ty, &mut buf)
    }

    /// Fid the request primarily operates on, for log lines.
    pub fn fid(&self) -> Option<u32> {
        match self {
            Tmessage::Statfs(m) => Some(m.fid),
            Tmessage::Lopen(m) => Some(m.fid),
            Tmessage::Lcreate(m) => Some(m.fid),
            Tmessage::Symlink(m) => Some(m.dfid),
            Tmessage::Mknod(m) => Some(m.dfid),
            Tmessage::Rename(m) => Some(m.fid),
            Tmessage::Readlink(m) => Some(m.fid),
            Tmessage::Getattr(m) => Some(m.fid),
            Tmessage::Setattr(m) => Some(m.fid),
            Tmessage::Xattrwalk(m) => Some(m.fid),
            Tmessage::Xattrcreate(m) => Some(m.fid),
            Tmessage::Readdir(m) => Some(m.fid),
            Tmessage::Fsync(m) => Some(m.fid),
            Tmessage::Lock(m) => Some(m.fid),
            Tmessage::Getlock(m) => Some(m.fid),
            Tmessage::Link(m) => Some(m.dfid),
            Tmessage::Mkdir(m) => Some(m.dfid),
            Tmessage::Renameat(m) => Some(m.olddirfid),
            Tmessage::Unlinkat(m) => Some(m.dirfid),
            Tmessage::Attach(m) => Some(m.fid),
            Tmessage::Walk(m) => Some(m.fid),
            Tmessage::Open(m) => Some(m.fid),
            Tmessage::Create(m) => Some(m.fid),
            Tmessage::Read(m) => Some(m.fid),
            Tmessage::Write(m) => Some(m.fid),
            Tmessage::Clunk(m) => Some(m.fid),
            Tmessage::Remove(m) => Some(m.fid),
            Tmessage::Stat(m) => Some(m.fid),
            Tmessage::Wstat(m) => Some(m.fid),
            Tmessage::Version(_) | Tmessage::Auth(_) | Tmessage::Flush(_) => None,
        }
    }
}

impl Rmessage {
    /// Decodes a complete reply frame.
    pub fn decode_frame(frame: &[u8]) -> Result<(Header, Self), DecodeError> {
        let header = Header::decode(frame)?;
        let mut body = &frame[HEADER_SIZE..];
        let reply = Rmessage::decode_body(header.ty, &mut body)?;
        Ok((header, reply))
    }
}
