//! Error taxonomy for filesystem callbacks.
//!
//! Every failure that reaches the kernel is an [`FsError`]; [`FsError::errno`]
//! turns it into the error number handed to `reply.error`.

use super::config::Mode;
use super::constants::MAX_PATH;
use libc::{c_int, EBADF, EINVAL, EIO, ENAMETOOLONG, EPERM, EROFS};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the filesystem core.
pub type FsResult<T> = std::result::Result<T, FsError>;

/// Failures of filesystem operations.
#[derive(Debug, Error)]
pub enum FsError {
    /// The backing path would not fit in `MAX_PATH` bytes.
    #[error("backing path for {0:?} exceeds {max} bytes", max = MAX_PATH)]
    PathTooLong(PathBuf),

    /// The codec pipe could not be created.
    #[error("could not create codec pipe: {0}")]
    ResourceExhausted(#[source] nix::Error),

    /// `fork` failed; no session was created.
    #[error("could not fork codec process: {0}")]
    ProcessSpawnFailed(#[source] nix::Error),

    /// The codec image could not be executed in the child. Only ever seen
    /// through the child's exit status.
    #[error("codec for {path:?} could not be launched (exit status {status})")]
    CodecLaunchFailed {
        /// Virtual path the session served
        path: PathBuf,
        /// Exit status reported by the child
        status: i32,
    },

    /// Error reported by the backing filesystem or the pipe.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Error reported by a `nix` syscall wrapper.
    #[error(transparent)]
    Nix(#[from] nix::Error),

    /// The operation is not permitted on this kind of mount.
    #[error("{operation} is not supported on a {mode} mount")]
    Unsupported {
        /// Name of the rejected operation
        operation: &'static str,
        /// Mode of the mount that rejected it
        mode: Mode,
    },

    /// A handle was registered twice.
    #[error("file handle {0} is already registered")]
    DuplicateHandle(u64),

    /// No open file is associated with the handle.
    #[error("unknown file handle {0}")]
    UnknownHandle(u64),

    /// A path or argument cannot be passed to the OS (embedded NUL).
    #[error("invalid path or argument {0:?}")]
    InvalidPath(String),
}

impl FsError {
    /// Shorthand for [`FsError::Unsupported`].
    pub fn unsupported(operation: &'static str, mode: Mode) -> Self {
        FsError::Unsupported { operation, mode }
    }

    /// Error number to reply with.
    pub fn errno(&self) -> c_int {
        match self {
            FsError::PathTooLong(_) => ENAMETOOLONG,
            FsError::ResourceExhausted(e) | FsError::ProcessSpawnFailed(e) => *e as c_int,
            FsError::CodecLaunchFailed { .. } => EIO,
            FsError::Io(e) => e.raw_os_error().unwrap_or(EIO),
            FsError::Nix(e) => *e as c_int,
            FsError::Unsupported { mode, .. } => match mode {
                Mode::Egress => EROFS,
                Mode::Ingest => EPERM,
            },
            FsError::DuplicateHandle(_) => EIO,
            FsError::UnknownHandle(_) => EBADF,
            FsError::InvalidPath(_) => EINVAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(FsError::PathTooLong(PathBuf::from("/x")).errno(), ENAMETOOLONG);
        assert_eq!(FsError::ResourceExhausted(Errno::EMFILE).errno(), libc::EMFILE);
        assert_eq!(FsError::ProcessSpawnFailed(Errno::EAGAIN).errno(), libc::EAGAIN);
        assert_eq!(FsError::UnknownHandle(7).errno(), EBADF);
        assert_eq!(
            FsError::Io(io::Error::from_raw_os_error(libc::ENOENT)).errno(),
            libc::ENOENT
        );
        assert_eq!(FsError::Io(io::Error::new(io::ErrorKind::Other, "boom")).errno(), EIO);
    }

    #[test]
    fn test_messages_name_the_limit() {
        let err = FsError::PathTooLong(PathBuf::from("/deep"));
        assert_eq!(
            err.to_string(),
            format!("backing path for \"/deep\" exceeds {} bytes", MAX_PATH)
        );

        let err = FsError::CodecLaunchFailed {
            path: PathBuf::from("/f"),
            status: 127,
        };
        assert_eq!(err.to_string(), "codec for \"/f\" could not be launched (exit status 127)");
        assert_eq!(err.errno(), EIO);
    }

    #[test]
    fn test_unsupported_depends_on_mode() {
        assert_eq!(FsError::unsupported("write", Mode::Egress).errno(), EROFS);
        assert_eq!(FsError::unsupported("mknod", Mode::Ingest).errno(), EPERM);
    }
}
