use magnetar_catalog::CatalogError;
use magnetar_zfs::{ZfsError, ZfsErrorKind};
use miette::Diagnostic;
use thiserror::Error;

/// Engine error type
///
/// All variants are `Clone`: a coalesced fetch broadcasts its single
/// outcome, success or failure, to every waiting caller verbatim.
#[derive(Error, Debug, Diagnostic, Clone)]
pub enum StoreError {
    /// A required request field is missing or malformed
    #[error("invalid argument: {message}")]
    #[diagnostic(
        code(magnetar::store::invalid_argument),
        help("Check the request fields against the RPC method documentation")
    )]
    InvalidArgument { message: String },

    /// Image record, dataset, or snapshot absent
    #[error("not found: {message}")]
    #[diagnostic(
        code(magnetar::store::not_found),
        help("Verify the id with ListImages, ListSnapshots, or ListVolumes")
    )]
    NotFound { message: String },

    /// Dataset name malformed per the provider
    #[error("not a valid dataset name: {name}")]
    #[diagnostic(
        code(magnetar::store::not_valid),
        help("Dataset names may contain alphanumerics, '_', '-', ':', '.', and '/'")
    )]
    NotValid { name: String },

    /// Operation required a snapshot
    #[error("not a snapshot: {name}")]
    #[diagnostic(code(magnetar::store::not_snapshot))]
    NotSnapshot { name: String },

    /// Operation required a volume
    #[error("not a volume: {name}")]
    #[diagnostic(code(magnetar::store::not_volume))]
    NotVolume { name: String },

    /// Aggregate disk request exceeds available space
    #[error("not enough space: requested {requested} MiB, available {available} KiB")]
    #[diagnostic(
        code(magnetar::store::no_space),
        help("Free space by deleting unused guest disks or images")
    )]
    NoSpace { requested: u64, available: u64 },

    /// Creation collides with an existing dataset
    #[error("already exists: {name}")]
    #[diagnostic(code(magnetar::store::already_exists))]
    AlreadyExists { name: String },

    /// Fetch source returned an unexpected HTTP status
    #[error("unexpected http response code: expected {expected}, received {code}, url: {url}")]
    #[diagnostic(
        code(magnetar::store::unexpected_http_code),
        help("Check that the image exists on the image service")
    )]
    UnexpectedHttpCode { expected: u16, code: u16, url: String },

    /// Fetch submitted after engine shutdown
    #[error("fetcher stopped")]
    #[diagnostic(code(magnetar::store::fetcher_stopped))]
    FetcherStopped,

    /// Provider or I/O failure not otherwise classified
    #[error("internal error: {message}")]
    #[diagnostic(code(magnetar::store::internal))]
    Internal { message: String },
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn not_valid(name: impl Into<String>) -> Self {
        Self::NotValid { name: name.into() }
    }

    pub fn not_snapshot(name: impl Into<String>) -> Self {
        Self::NotSnapshot { name: name.into() }
    }

    pub fn not_volume(name: impl Into<String>) -> Self {
        Self::NotVolume { name: name.into() }
    }

    pub fn already_exists(name: impl Into<String>) -> Self {
        Self::AlreadyExists { name: name.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<ZfsError> for StoreError {
    fn from(err: ZfsError) -> Self {
        match err.kind {
            ZfsErrorKind::NotFound => StoreError::not_found(err.message),
            ZfsErrorKind::InvalidName => StoreError::NotValid { name: err.message },
            ZfsErrorKind::AlreadyExists => StoreError::AlreadyExists { name: err.message },
            ZfsErrorKind::CommandFailed | ZfsErrorKind::Io => StoreError::internal(err.message),
        }
    }
}

impl From<CatalogError> for StoreError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::KeyNotFound { .. } => StoreError::not_found(err.to_string()),
            _ => StoreError::internal(err.to_string()),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::internal(format!("I/O error: {}", err))
    }
}
