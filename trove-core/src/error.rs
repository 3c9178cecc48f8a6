use crate::params::ErrorCode;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum TroveError {
    #[error("{message}")]
    NotFound { message: String, code: ErrorCode },

    #[error("{message}")]
    Api { code: ErrorCode, message: String },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("{}", terms_message(.context, .terms))]
    TermsRequired {
        terms: Vec<String>,
        /// Operation that was refused, added by [`TroveError::with_context`].
        context: Option<String>,
    },

    #[error("size mismatch; network corruption? (expected {expected} bytes, got {actual})")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("hash mismatch; network corruption? (expected {expected}, got {actual})")]
    HashMismatch { expected: String, actual: String },

    #[error("upload not found: {upload_id}")]
    UploadSessionNotFound { upload_id: String },

    #[error("resource too big (allowed {:.3}GB)", gigabytes(.max_bytes))]
    PayloadTooLarge { max_bytes: u64 },

    #[error("part sizing error: {0}")]
    PartSizing(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: BoxError,
    },

    #[error("too many attempts ({attempts}); last error: {last}")]
    TooManyAttempts {
        attempts: usize,
        #[source]
        last: Box<TroveError>,
    },

    #[error("cache directory {path} unavailable: {source}")]
    CacheUnavailable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid id {id:?}: {reason}")]
    InvalidId { id: String, reason: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, TroveError>;

fn terms_message(context: &Option<String>, terms: &[String]) -> String {
    let reason = format!(
        "some terms have not been agreed to. Try \"trove agree {}\"",
        terms.join(" ")
    );
    match context {
        Some(context) => format!("{} because {}", context, reason),
        None => reason,
    }
}

fn gigabytes(bytes: &u64) -> f64 {
    *bytes as f64 / 1e9
}

impl TroveError {
    pub fn transport(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        TroveError::Transport {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        TroveError::Protocol(message.into())
    }

    pub fn invalid_id(id: impl Into<String>, reason: impl Into<String>) -> Self {
        TroveError::InvalidId {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Prefixes transport failures with an operation description and names
    /// the operation in a terms refusal. Every other kind is returned
    /// unchanged so callers can keep matching on it.
    pub fn with_context(self, context: &str) -> Self {
        match self {
            TroveError::Transport {
                context: inner,
                source,
            } => TroveError::Transport {
                context: format!("{}: {}", context, inner),
                source,
            },
            TroveError::TermsRequired {
                terms,
                context: None,
            } => TroveError::TermsRequired {
                terms,
                context: Some(context.to_string()),
            },
            other => other,
        }
    }

    /// The store error code carried by this error, if the store produced it.
    pub fn error_code(&self) -> Option<&ErrorCode> {
        match self {
            TroveError::NotFound { code, .. } | TroveError::Api { code, .. } => Some(code),
            TroveError::TooManyAttempts { last, .. } => last.error_code(),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TroveError::NotFound { .. })
    }

    pub fn is_authorization_error(&self) -> bool {
        match self {
            TroveError::Unauthorized(_) => true,
            TroveError::Api { code, .. } => *code == ErrorCode::Unauthorized,
            _ => false,
        }
    }

    /// Reports whether the store itself rejected the request. Such errors
    /// are definitive and are never retried.
    pub fn is_api_error(&self) -> bool {
        matches!(
            self,
            TroveError::NotFound { .. }
                | TroveError::Api { .. }
                | TroveError::Unauthorized(_)
                | TroveError::TermsRequired { .. }
        )
    }

    pub fn is_integrity_error(&self) -> bool {
        matches!(
            self,
            TroveError::SizeMismatch { .. } | TroveError::HashMismatch { .. }
        )
    }
}
