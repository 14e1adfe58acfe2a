use graph_smtpd_core::ApiError;
use thiserror::Error;

/// Errors building a [`GraphClient`](crate::GraphClient). All of them are
/// fatal at startup.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Tenant id, client id or secret was empty.
    #[error("Missing Graph credential: {0}")]
    MissingCredential(&'static str),

    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The HTTP client could not be created.
    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Failures acquiring an access token
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Token request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The identity provider answered with a non-success status.
    #[error("Token endpoint returned {status}: {detail}")]
    Rejected { status: u16, detail: String },

    #[error("Malformed token response: {0}")]
    Malformed(String),
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Request(err) => Self::Unavailable(err.to_string()),
            TokenError::Rejected { status, detail } => match status {
                400 | 401 | 403 => Self::Unauthorized,
                429 => Self::Throttled { retry_after: None },
                500..=599 => Self::Unavailable(format!("token endpoint returned {status}")),
                _ => Self::Other(format!("token endpoint returned {status}: {detail}")),
            },
            TokenError::Malformed(reason) => Self::Other(reason),
        }
    }
}
