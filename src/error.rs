use core::fmt;

use axerrno::LinuxError;

/// Error kinds raised by the virtual filesystem core.
///
/// These are kinds, not platform numbers. [`VfsError::code`] and the
/// conversion into [`LinuxError`] are the only places where a concrete errno
/// value appears.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VfsError {
    /// The file descriptor is out of range or not open.
    BadHandle,
    /// Access flags of a handle or permission bits of a node do not allow
    /// the requested access.
    AccessDenied,
    /// A path token could not be found in the current directory.
    NoEntry,
    /// A non-terminal token or `..` was applied to a non-directory.
    NotADirectory,
    /// The per-resolution symbolic link budget was exhausted.
    TooManySymbolicLinks,
    /// The handle table free list is empty.
    NoHandlesAvailable,
    /// Malformed path or argument combination.
    InvalidArgument,
    /// The entry already exists.
    Exists,
    /// Write access to a directory was requested.
    IsADirectory,
    /// Write access to a read-only filesystem instance.
    ReadOnly,
    /// The node or instance is in use.
    Busy,
    /// The operation was applied to the null location.
    NoDevice,
    /// The backend does not implement the operation.
    Unsupported,
    /// The operation spans two filesystem instances.
    CrossDevice,
    /// Only the owner of a node or the superuser may do this.
    NotPermitted,
}

impl VfsError {
    /// Returns the Linux errno value of this error.
    pub fn code(self) -> i32 {
        LinuxError::from(self) as i32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::BadHandle => "bad file descriptor",
            Self::AccessDenied => "permission denied",
            Self::NoEntry => "no such file or directory",
            Self::NotADirectory => "not a directory",
            Self::TooManySymbolicLinks => "too many levels of symbolic links",
            Self::NoHandlesAvailable => "too many open files",
            Self::InvalidArgument => "invalid argument",
            Self::Exists => "file exists",
            Self::IsADirectory => "is a directory",
            Self::ReadOnly => "read-only file system",
            Self::Busy => "device or resource busy",
            Self::NoDevice => "no such device or address",
            Self::Unsupported => "operation not supported",
            Self::CrossDevice => "cross-device link",
            Self::NotPermitted => "operation not permitted",
        }
    }
}

impl From<VfsError> for LinuxError {
    fn from(err: VfsError) -> Self {
        match err {
            VfsError::BadHandle => LinuxError::EBADF,
            VfsError::AccessDenied => LinuxError::EACCES,
            VfsError::NoEntry => LinuxError::ENOENT,
            VfsError::NotADirectory => LinuxError::ENOTDIR,
            VfsError::TooManySymbolicLinks => LinuxError::ELOOP,
            VfsError::NoHandlesAvailable => LinuxError::ENFILE,
            VfsError::InvalidArgument => LinuxError::EINVAL,
            VfsError::Exists => LinuxError::EEXIST,
            VfsError::IsADirectory => LinuxError::EISDIR,
            VfsError::ReadOnly => LinuxError::EROFS,
            VfsError::Busy => LinuxError::EBUSY,
            VfsError::NoDevice => LinuxError::ENXIO,
            VfsError::Unsupported => LinuxError::ENOSYS,
            VfsError::CrossDevice => LinuxError::EXDEV,
            VfsError::NotPermitted => LinuxError::EPERM,
        }
    }
}

impl fmt::Display for VfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::error::Error for VfsError {}

pub type VfsResult<T> = Result<T, VfsError>;
