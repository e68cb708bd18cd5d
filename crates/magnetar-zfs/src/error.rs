use miette::Diagnostic;
use thiserror::Error;

/// Classified provider error kind
///
/// The `zfs` CLI only reports failures as stderr text. `ZfsProvider` maps
/// that text to a kind exactly once, at the point of execution; everything
/// above this crate matches on the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZfsErrorKind {
    /// Dataset does not exist
    NotFound,
    /// Dataset name is malformed
    InvalidName,
    /// Dataset already exists
    AlreadyExists,
    /// Command ran but failed for another reason
    CommandFailed,
    /// I/O failure talking to the zfs binary or a stream
    Io,
}

/// Provider error with a classified kind
#[derive(Error, Debug, Diagnostic, Clone)]
#[error("zfs operation failed: {message}")]
#[diagnostic(
    code(magnetar::zfs::error),
    help("Verify the dataset exists with `zfs list` and that the pool is imported")
)]
pub struct ZfsError {
    pub kind: ZfsErrorKind,
    pub message: String,
}

/// Result type for provider operations
pub type Result<T> = std::result::Result<T, ZfsError>;

impl ZfsError {
    pub fn new(kind: ZfsErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(name: impl Into<String>) -> Self {
        Self::new(
            ZfsErrorKind::NotFound,
            format!("dataset does not exist: {}", name.into()),
        )
    }

    pub fn invalid_name(name: impl Into<String>) -> Self {
        Self::new(
            ZfsErrorKind::InvalidName,
            format!("invalid dataset name: {}", name.into()),
        )
    }

    pub fn already_exists(name: impl Into<String>) -> Self {
        Self::new(
            ZfsErrorKind::AlreadyExists,
            format!("dataset already exists: {}", name.into()),
        )
    }

    pub fn command_failed(message: impl Into<String>) -> Self {
        Self::new(ZfsErrorKind::CommandFailed, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ZfsErrorKind::Io, message)
    }

    /// Classify a zfs CLI failure by its stderr text
    pub fn from_stderr(stderr: &str) -> Self {
        let message = stderr.trim().to_string();
        let kind = if message.contains("does not exist") {
            ZfsErrorKind::NotFound
        } else if message.contains("invalid dataset name") || message.contains("invalid name") {
            ZfsErrorKind::InvalidName
        } else if message.contains("dataset already exists") || message.contains("already exists") {
            ZfsErrorKind::AlreadyExists
        } else {
            ZfsErrorKind::CommandFailed
        };
        Self::new(kind, message)
    }
}

impl From<std::io::Error> for ZfsError {
    fn from(err: std::io::Error) -> Self {
        ZfsError::io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stderr_classification() {
        let err = ZfsError::from_stderr("cannot open 'tank/nope': dataset does not exist\n");
        assert_eq!(err.kind, ZfsErrorKind::NotFound);

        let err = ZfsError::from_stderr("cannot create 'ta nk': invalid dataset name");
        assert_eq!(err.kind, ZfsErrorKind::InvalidName);

        let err = ZfsError::from_stderr("cannot create 'tank/vol': dataset already exists");
        assert_eq!(err.kind, ZfsErrorKind::AlreadyExists);

        let err = ZfsError::from_stderr("out of space");
        assert_eq!(err.kind, ZfsErrorKind::CommandFailed);
    }
}
