//! Error types for the auth session manager

use thiserror::Error;

/// Result type alias for auth operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while managing the authenticated session
#[derive(Error, Debug)]
pub enum Error {
    /// Transport failure reaching the identity backend; recoverable by retry.
    #[error("Network error: {0}")]
    Network(String),

    /// Wrong email/password or a rejected offline sentinel; not retryable.
    #[error("Invalid login credentials")]
    InvalidCredentials,

    /// The session's expiry has passed; triggers a silent sign-out.
    #[error("Session expired")]
    SessionExpired,

    /// OAuth redirect arrived with a flow state the backend does not recognize.
    #[error("Flow state mismatch: {0}")]
    FlowStateMismatch(String),

    /// OAuth redirect arrived without a usable code verifier in storage.
    #[error("Code verifier missing from storage")]
    CodeVerifierMissing,

    /// Unrecoverable state; always surfaced with an actionable message and
    /// always leaves the manager signed out.
    #[error("Authentication failed: {0}")]
    Fatal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether a retry of the same call can plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_))
    }

    /// Whether this error indicates a broken client-side OAuth flow context.
    ///
    /// These are the two kinds that drive the recovery coordinator's
    /// regenerate step rather than being surfaced to the user.
    pub fn is_flow_error(&self) -> bool {
        matches!(self, Error::FlowStateMismatch(_) | Error::CodeVerifierMissing)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Network(err.to_string())
    }
}
