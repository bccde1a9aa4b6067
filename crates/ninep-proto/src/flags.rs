// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Protocol flag values and their host equivalents

/// Qid type bits
pub mod qid_type {
    pub const DIR: u8 = 0x80;
    pub const SYMLINK: u8 = 0x02;
    pub const FILE: u8 = 0x00;
}

/// `Tgetattr` request/valid mask
pub mod getattr {
    pub const BASIC: u64 = 0x0000_07ff;
}

/// `Tsetattr` valid bits
pub mod setattr {
    pub const MODE: u32 = 0x0000_0001;
    pub const UID: u32 = 0x0000_0002;
    pub const GID: u32 = 0x0000_0004;
    pub const SIZE: u32 = 0x0000_0008;
    pub const ATIME: u32 = 0x0000_0010;
    pub const MTIME: u32 = 0x0000_0020;
    pub const CTIME: u32 = 0x0000_0040;
    pub const ATIME_SET: u32 = 0x0000_0080;
    pub const MTIME_SET: u32 = 0x0000_0100;
}

/// `Tlock`/`Tgetlock` values
pub mod lock {
    pub const FLAGS_BLOCK: u32 = 1;
    pub const SUCCESS: u8 = 0;
    pub const TYPE_UNLCK: u8 = 2;
}

/// `Tunlinkat` flag selecting rmdir
pub const AT_REMOVEDIR: u32 = 0x200;

/// 9P2000.L open flags (values are the Linux generic ones, in octal)
pub mod dotl {
    pub const RDONLY: u32 = 0o0;
    pub const WRONLY: u32 = 0o1;
    pub const RDWR: u32 = 0o2;
    pub const ACCMODE: u32 = 0o3;
    pub const CREATE: u32 = 0o100;
    pub const EXCL: u32 = 0o200;
    pub const NOCTTY: u32 = 0o400;
    pub const TRUNC: u32 = 0o1000;
    pub const APPEND: u32 = 0o2000;
    pub const NONBLOCK: u32 = 0o4000;
    pub const DSYNC: u32 = 0o10000;
    pub const FASYNC: u32 = 0o20000;
    pub const DIRECT: u32 = 0o40000;
    pub const LARGEFILE: u32 = 0o100000;
    pub const DIRECTORY: u32 = 0o200000;
    pub const NOFOLLOW: u32 = 0o400000;
    pub const NOATIME: u32 = 0o1000000;
    pub const CLOEXEC: u32 = 0o2000000;
    pub const SYNC: u32 = 0o4000000;
}

/// 9P2000.u `Topen`/`Tcreate` mode byte
pub mod omode {
    pub const READ: u8 = 0;
    pub const WRITE: u8 = 1;
    pub const RDWR: u8 = 2;
    pub const EXEC: u8 = 3;
    pub const TRUNC: u8 = 0x10;
    pub const RCLOSE: u8 = 0x40;
    pub const APPEND: u8 = 0x80;
    pub const EXCL: u8 = 0x04;
}

/// 9P2000.u permission/type bits of the stat `mode` field
pub mod v9mode {
    pub const DIR: u32 = 0x8000_0000;
    pub const APPEND: u32 = 0x4000_0000;
    pub const EXCL: u32 = 0x2000_0000;
    pub const MOUNT: u32 = 0x1000_0000;
    pub const AUTH: u32 = 0x0800_0000;
    pub const TMP: u32 = 0x0400_0000;
    pub const SYMLINK: u32 = 0x0200_0000;
    pub const LINK: u32 = 0x0100_0000;
    pub const DEVICE: u32 = 0x0080_0000;
    pub const NAMED_PIPE: u32 = 0x0020_0000;
    pub const SOCKET: u32 = 0x0010_0000;
    pub const SETUID: u32 = 0x0008_0000;
    pub const SETGID: u32 = 0x0004_0000;
    pub const SETVTX: u32 = 0x0001_0000;

    pub const TYPE_BITS: u32 =
        DIR | APPEND | EXCL | MOUNT | AUTH | TMP | SYMLINK | LINK | DEVICE | NAMED_PIPE | SOCKET;
}

const DOTL_FLAG_MAP: &[(u32, libc::c_int)] = &[
    (dotl::CREATE, libc::O_CREAT),
    (dotl::EXCL, libc::O_EXCL),
    (dotl::NOCTTY, libc::O_NOCTTY),
    (dotl::TRUNC, libc::O_TRUNC),
    (dotl::APPEND, libc::O_APPEND),
    (dotl::NONBLOCK, libc::O_NONBLOCK),
    (dotl::DSYNC, libc::O_DSYNC),
    (dotl::FASYNC, libc::O_ASYNC),
    (dotl::DIRECT, libc::O_DIRECT),
    (dotl::LARGEFILE, libc::O_LARGEFILE),
    (dotl::DIRECTORY, libc::O_DIRECTORY),
    (dotl::NOFOLLOW, libc::O_NOFOLLOW),
    (dotl::NOATIME, libc::O_NOATIME),
    (dotl::SYNC, libc::O_SYNC),
];

/// Host open flags for a 9P2000.L flag word.
///
/// The access mode passes through unchanged. `O_NOCTTY`, `O_ASYNC`, `O_CREAT`
/// and `O_DIRECT` are never forwarded to the host.
pub fn dotl_to_open_flags(flags: u32) -> libc::c_int {
    let mut oflags = (flags & dotl::ACCMODE) as libc::c_int;
    for &(wire, host) in DOTL_FLAG_MAP {
        if flags & wire != 0 {
            oflags |= host;
        }
    }
    oflags & !(libc::O_NOCTTY | libc::O_ASYNC | libc::O_CREAT | libc::O_DIRECT)
}

/// Host open flags for a 9P2000.u mode byte.
pub fn omode_to_open_flags(mode: u8) -> libc::c_int {
    let mut oflags = match mode & 3 {
        omode::READ | omode::EXEC => libc::O_RDONLY,
        omode::WRITE => libc::O_WRONLY,
        _ => libc::O_RDWR,
    };
    if mode & omode::TRUNC != 0 {
        oflags |= libc::O_TRUNC;
    }
    if mode & omode::APPEND != 0 {
        oflags |= libc::O_APPEND;
    }
    if mode & omode::EXCL != 0 {
        oflags |= libc::O_EXCL;
    }
    oflags
}

/// True when host flags would modify the file.
pub fn is_write_open(oflags: libc::c_int) -> bool {
    let acc = oflags & libc::O_ACCMODE;
    acc == libc::O_WRONLY || acc == libc::O_RDWR || oflags & (libc::O_TRUNC | libc::O_APPEND) != 0
}

/// Qid type for a host `st_mode`.
pub fn qid_type_for_mode(mode: u32) -> u8 {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => qid_type::DIR,
        libc::S_IFLNK => qid_type::SYMLINK,
        _ => qid_type::FILE,
    }
}

/// 9P2000.u stat mode for a host `st_mode`.
pub fn mode_to_v9mode(mode: u32) -> u32 {
    let mut v9 = mode & 0o777;
    match mode & libc::S_IFMT {
        libc::S_IFDIR => v9 |= v9mode::DIR,
        libc::S_IFLNK => v9 |= v9mode::SYMLINK,
        libc::S_IFSOCK => v9 |= v9mode::SOCKET,
        libc::S_IFIFO => v9 |= v9mode::NAMED_PIPE,
        libc::S_IFBLK | libc::S_IFCHR => v9 |= v9mode::DEVICE,
        _ => {}
    }
    if mode & libc::S_ISUID != 0 {
        v9 |= v9mode::SETUID;
    }
    if mode & libc::S_ISGID != 0 {
        v9 |= v9mode::SETGID;
    }
    if mode & libc::S_ISVTX != 0 {
        v9 |= v9mode::SETVTX;
    }
    v9
}

/// Host `st_mode` for a 9P2000.u mode. `extension` distinguishes block
/// (`"b ..."`) from character devices.
pub fn v9mode_to_mode(v9: u32, extension: &str) -> u32 {
    let mut mode = v9 & 0o777;
    if v9 & v9mode::DIR != 0 {
        mode |= libc::S_IFDIR;
    } else if v9 & v9mode::SYMLINK != 0 {
        mode |= libc::S_IFLNK;
    } else if v9 & v9mode::SOCKET != 0 {
        mode |= libc::S_IFSOCK;
    } else if v9 & v9mode::NAMED_PIPE != 0 {
        mode |= libc::S_IFIFO;
    } else if v9 & v9mode::DEVICE != 0 {
        if extension.starts_with('c') {
            mode |= libc::S_IFCHR;
        } else {
            mode |= libc::S_IFBLK;
        }
    } else {
        mode |= libc::S_IFREG;
    }
    if v9 & v9mode::SETUID != 0 {
        mode |= libc::S_ISUID;
    }
    if v9 & v9mode::SETGID != 0 {
        mode |= libc::S_ISGID;
    }
    if v9 & v9mode::SETVTX != 0 {
        mode |= libc::S_ISVTX;
    }
    mode
}

/// Parses a 9P2000.u device extension: `"c major minor"` or `"b major minor"`.
pub fn parse_device_extension(extension: &str) -> Option<(char, u32, u32)> {
    let mut parts = extension.split_whitespace();
    let kind = parts.next()?.chars().next()?;
    if kind != 'c' && kind != 'b' {
        return None;
    }
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((kind, major, minor))
}

/// Dirent type byte (`DT_*`) for a host `st_mode`.
pub fn dirent_type_for_mode(mode: u32) -> u8 {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => libc::DT_DIR,
        libc::S_IFLNK => libc::DT_LNK,
        libc::S_IFREG => libc::DT_REG,
        libc::S_IFCHR => libc::DT_CHR,
        libc::S_IFBLK => libc::DT_BLK,
        libc::S_IFIFO => libc::DT_FIFO,
        libc::S_IFSOCK => libc::DT_SOCK,
        _ => libc::DT_UNKNOWN,
    }
}

/// Qid type for a `DT_*` dirent type.
pub fn qid_type_for_dirent(kind: u8) -> u8 {
    match kind {
        libc::DT_DIR => qid_type::DIR,
        libc::DT_LNK => qid_type::SYMLINK,
        _ => qid_type::FILE,
    }
}
