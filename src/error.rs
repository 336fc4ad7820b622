//! Error types for the compiled-code cache

use std::fmt;
use thiserror::Error;

/// What part of a cache file failed format validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatErrorKind {
    /// Magic number does not match
    BadMagic,
    /// File was written by a different build
    BuildIdentity,
    /// Declared sizes disagree with the actual file size
    SizeMismatch,
    /// File ends before a declared section
    Truncated,
    /// Header values are out of range
    BadHeader,
}

impl fmt::Display for FormatErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatErrorKind::BadMagic => write!(f, "BadMagic"),
            FormatErrorKind::BuildIdentity => write!(f, "BuildIdentity"),
            FormatErrorKind::SizeMismatch => write!(f, "SizeMismatch"),
            FormatErrorKind::Truncated => write!(f, "Truncated"),
            FormatErrorKind::BadHeader => write!(f, "BadHeader"),
        }
    }
}

/// Main error type for the cache
#[derive(Error, Debug)]
pub enum Error {
    /// The file is not a usable cache file for this process
    #[error("FormatError: {kind}: {message}")]
    Format {
        kind: FormatErrorKind,
        message: String,
    },

    /// No container in the file was captured under the current VM settings
    #[error("FingerprintMismatch: {0}")]
    FingerprintMismatch(String),

    /// A metadata entry could not be resolved or its identity changed
    #[error("UnresolvedError: {0}")]
    Unresolved(String),

    /// A recorded class-hierarchy assumption no longer holds
    #[error("DependencyViolated: {0}")]
    DependencyViolated(String),

    /// Current profile contradicts a recorded optimization
    #[error("OptRejected: {0}")]
    OptRejected(String),

    /// The cache contents are malformed
    #[error("CorruptionError: {0}")]
    Corruption(String),

    /// Invalid option string or option combination
    #[error("ConfigError: {0}")]
    Config(String),

    /// Output would exceed the configured maximum file size
    #[error("FileTooLarge: {size} bytes exceeds limit of {limit} bytes")]
    FileTooLarge { size: usize, limit: usize },

    /// Internal error
    #[error("InternalError: {0}")]
    InternalError(String),

    /// IO error
    #[error("IOError: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
}

impl Error {
    /// Create a format error
    pub fn format(kind: FormatErrorKind, message: impl Into<String>) -> Self {
        Error::Format {
            kind,
            message: message.into(),
        }
    }

    /// Create a truncation error for a read past `len`
    pub fn truncated(offset: usize, wanted: usize, len: usize) -> Self {
        Error::format(
            FormatErrorKind::Truncated,
            format!("read of {} bytes at offset {} past end {}", wanted, offset, len),
        )
    }

    /// Create a corruption error
    pub fn corruption(message: impl Into<String>) -> Self {
        Error::Corruption(message.into())
    }

    /// Create an unresolved-metadata error
    pub fn unresolved(message: impl Into<String>) -> Self {
        Error::Unresolved(message.into())
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Error::InternalError(message.into())
    }

    /// Whether this error indicates a malformed cache rather than stale data
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }

    /// Whether the condition is local to one version or container and
    /// should be absorbed by the caller
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::FingerprintMismatch(_)
                | Error::Unresolved(_)
                | Error::DependencyViolated(_)
                | Error::OptRejected(_)
        )
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::format(FormatErrorKind::BadMagic, "got 0x1234");
        assert_eq!(err.to_string(), "FormatError: BadMagic: got 0x1234");

        let err = Error::FileTooLarge { size: 10, limit: 5 };
        assert_eq!(err.to_string(), "FileTooLarge: 10 bytes exceeds limit of 5 bytes");
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::corruption("bad tag").is_corruption());
        assert!(!Error::corruption("bad tag").is_recoverable());
        assert!(Error::unresolved("java/lang/Foo").is_recoverable());
        assert!(Error::DependencyViolated("leaf_type".into()).is_recoverable());
        assert!(!Error::truncated(8, 4, 10).is_recoverable());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert!(matches!(err, Error::IoError { .. }));
    }
}
