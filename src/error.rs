//! Descriptor Subsystem Errors
//!
//! Every fallible operation reports one of these plain result codes.
//! Lookup races are retried internally and never surface here.

use core::fmt;

/// Error codes returned by descriptor operations.
///
/// Discriminants are the errno values handed back to user space.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdError {
    /// Handle unused, out of range, or closed by a concurrent thread.
    BadDescriptor = 9,
    /// The handle's capability rights do not permit the operation.
    NotCapable = 93,
    /// The per-process descriptor limit has been reached.
    TooManyOpen = 24,
    /// The system-wide open file limit has been reached.
    FileTableFull = 23,
    /// Malformed argument.
    InvalidArgument = 22,
    /// Refused by policy.
    PermissionDenied = 1,
    /// The object is not a directory.
    NotDirectory = 20,
    /// The file object does not implement the operation.
    NotSupported = 45,
}

impl FdError {
    /// Positive errno value.
    #[inline]
    pub const fn errno(self) -> i32 {
        self as i32
    }

    /// Negative value suitable for a system call return register.
    #[inline]
    pub const fn to_syscall_ret(self) -> i64 {
        -(self as i64)
    }

    /// Whether this error means a descriptor limit (process or system) was hit.
    #[inline]
    pub const fn is_resource_exhausted(self) -> bool {
        matches!(self, Self::TooManyOpen | Self::FileTableFull)
    }
}

impl fmt::Display for FdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadDescriptor => write!(f, "bad file descriptor"),
            Self::NotCapable => write!(f, "capabilities insufficient"),
            Self::TooManyOpen => write!(f, "too many open files"),
            Self::FileTableFull => write!(f, "too many open files in system"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::PermissionDenied => write!(f, "operation not permitted"),
            Self::NotDirectory => write!(f, "not a directory"),
            Self::NotSupported => write!(f, "operation not supported"),
        }
    }
}

/// Result type for descriptor operations.
pub type FdResult<T> = Result<T, FdError>;

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_errno_values() {
        assert_eq!(FdError::BadDescriptor.errno(), 9);
        assert_eq!(FdError::TooManyOpen.to_syscall_ret(), -24);
        assert_eq!(FdError::NotCapable.errno(), 93);
    }

    #[test]
    fn test_resource_class() {
        assert!(FdError::TooManyOpen.is_resource_exhausted());
        assert!(FdError::FileTableFull.is_resource_exhausted());
        assert!(!FdError::BadDescriptor.is_resource_exhausted());
    }

    #[test]
    fn test_display() {
        assert_eq!(FdError::BadDescriptor.to_string(), "bad file descriptor");
    }
}
