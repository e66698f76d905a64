/// Errors produced by the OCI client.
#[derive(Debug, thiserror::Error)]
pub enum OciError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("network failure: {0}")]
    Network(#[from] reqwest::Error),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("invalid image reference {reference:?}: {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OciError {
    /// Short label for the failure class, used in failure reports.
    pub fn kind(&self) -> &'static str {
        match self {
            OciError::Auth(_) => "auth",
            OciError::NotFound(_) => "not-found",
            OciError::Network(_) => "network",
            OciError::DigestMismatch { .. } => "digest-mismatch",
            OciError::InvalidReference { .. } => "reference",
            OciError::Manifest(_) | OciError::UnsupportedMediaType(_) => "manifest",
            OciError::Registry(_) => "registry",
            OciError::Io(_) => "io",
            OciError::Json(_) => "json",
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OciError>;
