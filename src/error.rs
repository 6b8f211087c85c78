use std::sync::Arc;

use thiserror::Error;

use crate::types::FileId;

/// Failures raised by collaborators (metadata API, blob store, listing).
///
/// These are inserted into `anyhow` chains so that retry classification can
/// downcast them regardless of how much context was layered on top.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("CORS request blocked: {0}")]
    Cors(String),

    #[error("Authentication expired: {0}")]
    AuthExpired(String),
}

impl ServiceError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        ServiceError::Status {
            status,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::Status { status, .. } => matches!(status, 429 | 503),
            ServiceError::Network(_) | ServiceError::Cors(_) => true,
            ServiceError::AuthExpired(_) => false,
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return ServiceError::status(status.as_u16(), err.to_string());
        }
        ServiceError::Network(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No configuration found. Run 'photodrop auth --token <token>' to sign in.")]
    ConfigNotFound,

    #[error("No authentication token configured. Run 'photodrop auth --token <token>' first.")]
    TokenNotFound,
}

/// Errors surfaced by the upload pipeline to its caller.
#[derive(Debug, Clone, Error)]
pub enum UploadError {
    #[error("Upload destination requires an order id for {mode} uploads")]
    MissingSecondaryId { mode: &'static str },

    #[error("None of the selected files is an accepted type ({accepted})")]
    NoAcceptedFiles { accepted: String },

    #[error("Another submission is still running in this session")]
    SubmissionInProgress,

    #[error("{0} is already waiting for upload parameters")]
    DuplicateFile(FileId),

    #[error("Could not resolve upload parameters: {0:#}")]
    ParameterResolution(Arc<anyhow::Error>),

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Upload cancelled")]
    Cancelled,

    #[error("Upload arrived but processing did not finish in time")]
    ConvergenceTimeout,

    #[error("Session expired; sign in again to continue")]
    AuthExpired,
}

/// True when any link of the chain is an expired-credential failure.
pub fn is_auth_expired(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<ServiceError>(),
            Some(ServiceError::AuthExpired(_))
        )
    })
}

/// Shortens a message for per-file display, appending an ellipsis when cut.
pub fn cap_message(message: &str, limit: usize) -> String {
    let trimmed = message.trim();
    if trimmed.chars().count() <= limit {
        return trimmed.to_string();
    }
    let keep = limit.saturating_sub(1);
    let mut capped: String = trimmed.chars().take(keep).collect();
    capped.push('…');
    capped
}
