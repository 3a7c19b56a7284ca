// Error handling module
// Defines the auth, API and storage error taxonomy

use thiserror::Error;

/// Maximum length for error response bodies kept in errors
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Authentication failures, classified so callers can tell
/// "log in again" apart from "try again later"
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Identity provider rejected the username/password
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Identity provider could not be reached or answered with a server error
    #[error("Identity provider unreachable: {0}")]
    ProviderUnreachable(String),

    /// Identity provider rejected the refresh token
    #[error("Refresh token expired: {0}")]
    RefreshExpired(String),

    /// No usable credential; the `login` tool must be called again
    #[error("Re-authentication required: {0}")]
    ReauthRequired(String),

    /// Refresh could not complete right now; the operation may be retried
    #[error("Temporary authentication failure: {0}")]
    Transient(String),
}

impl AuthError {
    /// Whether retrying the same operation later can succeed without a new login
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AuthError::ProviderUnreachable(_) | AuthError::Transient(_)
        )
    }
}

/// Errors surfaced by the platform client and the tool handlers
#[derive(Error, Debug)]
pub enum ApiError {
    /// Authentication failed
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Non-authorization HTTP error from the proxy/platform
    #[error("KTalk API error: {status} - {body}")]
    Http { status: u16, body: String },

    /// Requested recording or rendition does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Transport-level failure (DNS, connect, timeout, broken body)
    #[error("Network error ({kind}): {message}")]
    Network { kind: &'static str, message: String },

    /// Response body could not be decoded
    #[error("Invalid response: {0}")]
    Decode(String),

    /// Local filesystem failure while saving results
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Tool argument validation error
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl ApiError {
    /// Build an HTTP error, truncating large bodies
    pub fn http(status: u16, body: &str) -> Self {
        ApiError::Http {
            status,
            body: truncate_body(body),
        }
    }

    /// Classify a transport error from reqwest
    pub fn network(err: &reqwest::Error) -> Self {
        ApiError::Network {
            kind: error_kind(err),
            message: err.to_string(),
        }
    }

    /// HTTP status carried by this error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Failures of the on-disk credential cache.
/// Never surfaced to tool callers: reads degrade to "no credential".
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Token file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Token file is malformed: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Token file holds an invalid record: {0}")]
    Invalid(String),
}

/// Categorize a reqwest error for logs and messages
pub fn error_kind(err: &reqwest::Error) -> &'static str {
    if err.is_timeout() {
        "timeout"
    } else if err.is_connect() {
        "connection_failed"
    } else if err.is_request() {
        "request_error"
    } else if err.is_body() {
        "body_error"
    } else if err.is_decode() {
        "decode_error"
    } else {
        "unknown"
    }
}

/// Truncate a response body to avoid carrying excessive data
fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!(
        "{}... (truncated, {} total bytes)",
        &body[..end],
        body.len()
    )
}

/// Result type alias for API operations
pub type Result<T> = std::result::Result<T, ApiError>;
