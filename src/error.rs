//! Error taxonomy shared by the filesystem engine and the API layer.
//!
//! Structural failures (NotFound, AlreadyExists, ...) map 1:1 onto errno
//! values for the FUSE layer. Transient wraps any network or backing-store
//! failure; the caller may retry the syscall. Conflict is internal to the
//! flush engine and is recovered by the merge path, never surfaced.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("directory not empty")]
    NotEmpty,
    #[error("permission denied")]
    PermissionDenied,
    #[error("invalid name: {0}")]
    InvalidName(String),
    /// Collection version mismatch on flush. Recovered via the conflict
    /// merge; callers outside the flush engine never see this.
    #[error("collection version conflict")]
    Conflict,
    /// Network or backing-store failure. The operation may be retried.
    #[error("backing store error: {0}")]
    Transient(String),
    #[error("corrupt manifest: {0}")]
    Corrupt(String),
    /// A node was evicted or mutated while the structural lock was released
    /// around a network call. The operation may be retried.
    #[error("stale node")]
    Stale,
}

impl FsError {
    /// errno for a FUSE reply.
    pub fn errno(&self) -> libc::c_int {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::PermissionDenied => libc::EPERM,
            FsError::InvalidName(_) => libc::EINVAL,
            FsError::Conflict => libc::EIO,
            FsError::Transient(_) => libc::EIO,
            FsError::Corrupt(_) => libc::EIO,
            FsError::Stale => libc::ESTALE,
        }
    }
}

impl From<reqwest::Error> for FsError {
    fn from(err: reqwest::Error) -> Self {
        FsError::Transient(err.to_string())
    }
}
