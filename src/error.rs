use std::path::PathBuf;

/// The error taxonomy shared by the store, the ACME transport, and the
/// drive state machine. Local recovery logic (stale-account rediscovery,
/// authz re-registration, nonce refetch) matches on these variants rather
/// than on string messages.
#[derive(thiserror::Error, Debug)]
pub enum AcmeMdError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("rejected by policy: {0}")]
    BadArgument(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("retry later: {0}")]
    RetryLater(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("permission denied on store path {path}: {source}")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt store aspect at {path}: {detail}")]
    Corruption { path: PathBuf, detail: String },

    #[error("{0}")]
    General(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Ssl(#[from] openssl::error::ErrorStack),

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

impl AcmeMdError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, AcmeMdError::NotFound(_))
    }

    #[must_use]
    pub fn is_access_denied(&self) -> bool {
        matches!(self, AcmeMdError::AccessDenied(_))
    }

    /// The process exit code the CLI front-end should surface for this error.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            AcmeMdError::InvalidArgument(_) | AcmeMdError::BadArgument(_) => 2,
            AcmeMdError::AccessDenied(_) => 3,
            AcmeMdError::NotFound(_) => 4,
            AcmeMdError::AlreadyExists(_) => 5,
            AcmeMdError::RetryLater(_) => 6,
            AcmeMdError::Timeout(_) => 7,
            AcmeMdError::NotImplemented(_) => 8,
            AcmeMdError::PermissionDenied { .. } => 13,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, AcmeMdError>;
