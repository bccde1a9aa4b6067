// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the session engine

use std::io;

use ninep_proto::DecodeError;

/// Core filesystem error type
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("unknown fid {0}")]
    UnknownFid(u32),
    #[error("fid {0} already in use")]
    DuplicateFid(u32),
    #[error("fid has the wrong type for this operation")]
    WrongFidType,
    #[error("read-only export")]
    ReadOnly,
    #[error("unsupported")]
    Unsupported,
    #[error("no space left")]
    NoSpace,
    #[error("interrupted")]
    Interrupted,
    #[error("inode remapping exhausted")]
    RemapExhausted,
    #[error("export spans multiple devices")]
    MultipleDevices,
    #[error("msize {0} is below the protocol minimum")]
    MsizeTooSmall(u32),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Errno(#[from] nix::errno::Errno),
}

impl FsError {
    /// POSIX errno carried in the protocol error reply.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound | FsError::UnknownFid(_) => libc::ENOENT,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::InvalidArgument
            | FsError::DuplicateFid(_)
            | FsError::WrongFidType
            | FsError::Decode(_) => libc::EINVAL,
            FsError::ReadOnly => libc::EROFS,
            FsError::Unsupported => libc::EOPNOTSUPP,
            FsError::NoSpace => libc::ENOSPC,
            FsError::Interrupted => libc::EINTR,
            FsError::RemapExhausted => libc::EIO,
            FsError::MultipleDevices => libc::ENODEV,
            FsError::MsizeTooSmall(_) => libc::EMSGSIZE,
            FsError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            FsError::Errno(errno) => *errno as i32,
        }
    }

    pub fn from_errno(errno: i32) -> Self {
        FsError::Errno(nix::errno::Errno::from_raw(errno))
    }

    /// The worker call was skipped or failed with `EINTR`.
    pub fn is_interrupted(&self) -> bool {
        self.errno() == libc::EINTR
    }
}

pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_errors_map_to_protocol_codes() {
        assert_eq!(FsError::UnknownFid(3).errno(), libc::ENOENT);
        assert_eq!(FsError::DuplicateFid(3).errno(), libc::EINVAL);
        assert_eq!(FsError::WrongFidType.errno(), libc::EINVAL);
        assert_eq!(FsError::RemapExhausted.errno(), libc::EIO);
    }

    #[test]
    fn io_errors_keep_their_os_code() {
        let err = FsError::from(io::Error::from_raw_os_error(libc::EMFILE));
        assert_eq!(err.errno(), libc::EMFILE);
        let err = FsError::from(io::Error::new(io::ErrorKind::Other, "opaque"));
        assert_eq!(err.errno(), libc::EIO);
    }

    #[test]
    fn interruption_is_recognised_in_every_form() {
        assert!(FsError::Interrupted.is_interrupted());
        assert!(FsError::from_errno(libc::EINTR).is_interrupted());
        assert!(FsError::from(io::Error::from_raw_os_error(libc::EINTR)).is_interrupted());
        assert!(!FsError::NotFound.is_interrupted());
    }
}
