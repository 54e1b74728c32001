//! Recoverable errors of the file system.
//!
//! Only logical failures travel through [`FsError`]: a missing name, an
//! existing name, a non-empty directory and so on. Structural problems
//! found while the file system is live (out of inodes or blocks, a
//! transaction writing more blocks than it reserved, an unreferenced inode
//! being locked) halt the caller with a panic instead, since carrying on
//! would risk corrupting the image.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,
    #[error("file exists")]
    Exists,
    #[error("not a directory")]
    NotDirectory,
    #[error("is a directory")]
    IsDirectory,
    #[error("directory not empty")]
    NotEmpty,
    #[error("file name too long")]
    NameTooLong,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("file too large")]
    FileTooLarge,
    #[error("bad file descriptor")]
    BadDescriptor,
    #[error("too many open files")]
    TooManyOpenFiles,
    #[error("permission denied")]
    PermissionDenied,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid file system image: {0}")]
    Format(String),
}

impl FsError {
    /// The errno reported to FUSE. Exhaustive so that a new variant has to
    /// pick one.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::Exists => libc::EEXIST,
            FsError::NotDirectory => libc::ENOTDIR,
            FsError::IsDirectory => libc::EISDIR,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::NameTooLong => libc::ENAMETOOLONG,
            FsError::InvalidArgument(_) => libc::EINVAL,
            FsError::FileTooLarge => libc::EFBIG,
            FsError::BadDescriptor => libc::EBADF,
            FsError::TooManyOpenFiles => libc::ENFILE,
            FsError::PermissionDenied => libc::EACCES,
            FsError::Io(_) => libc::EIO,
            FsError::Format(_) => libc::EINVAL,
        }
    }
}

pub type Result<T> = std::result::Result<T, FsError>;
