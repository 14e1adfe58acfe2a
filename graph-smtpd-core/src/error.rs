//! Error types for relay sessions.
//!
//! Every failure a session can hit maps onto exactly one SMTP [`Reply`] via
//! [`SessionError::reply`], and onto a log [`Severity`] via
//! [`SessionError::severity`]. Temporary remote conditions (throttling, an
//! unavailable API) map to 4xx so the submitting client retries later;
//! everything else is permanent.

use std::time::Duration;

use graph_smtpd_common::{
    reply::{EnhancedCode, Reply},
    status::Status,
};
use thiserror::Error;

use crate::session::Severity;

/// The submitted message could not be parsed or assembled.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The message itself is not valid RFC 5322.
    #[error("Malformed message: {0}")]
    Message(String),

    /// A `multipart/*` message declared no `boundary` parameter.
    #[error("Multipart message has no boundary parameter")]
    MissingBoundary,

    /// A `multipart/*` message whose parts could not be read.
    #[error("Unreadable multipart body: {0}")]
    Multipart(String),

    /// A part declared `Content-Transfer-Encoding: base64` but was not.
    #[error("Invalid base64 in part {part}: {reason}")]
    Base64 { part: usize, reason: String },

    /// A part declared `Content-Transfer-Encoding: quoted-printable` but was not.
    #[error("Invalid quoted-printable in part {part}: {reason}")]
    QuotedPrintable { part: usize, reason: String },

    /// Draining an attachment source failed.
    #[error("Failed to read attachment '{name}': {reason}")]
    AttachmentRead { name: String, reason: String },
}

impl From<mailparse::MailParseError> for ParseError {
    fn from(err: mailparse::MailParseError) -> Self {
        Self::Message(err.to_string())
    }
}

/// Failures reported by the directory mail-send API.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The API refused our credentials or lacks permission for this mailbox.
    #[error("Not authorised by the directory API")]
    Unauthorized,

    /// The API asked us to slow down.
    #[error("Throttled by the directory API")]
    Throttled { retry_after: Option<Duration> },

    /// The API could not be reached or reported a transient server failure.
    #[error("Directory API unavailable: {0}")]
    Unavailable(String),

    /// Any other rejection, with whatever detail the API gave.
    #[error("Directory API error: {0}")]
    Other(String),
}

impl ApiError {
    /// Whether the condition is expected to clear on its own
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Throttled { .. } | Self::Unavailable(_))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("No such user: {0}")]
    NotFound(String),

    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Sender or source is not on the relevant allow-list.
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// The sender has no identity in the directory.
    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error(transparent)]
    Parse(#[from] ParseError),

    /// `sendMail` failed.
    #[error("Send failed: {0}")]
    Send(#[source] ApiError),

    /// Resolving the sender failed for a reason other than "no such user".
    #[error("Directory lookup failed: {0}")]
    Directory(#[source] ApiError),

    /// A callback arrived out of order, e.g. `DATA` before `MAIL`.
    #[error("Bad sequence of commands: {0}")]
    BadSequence(&'static str),

    #[error("Authentication required")]
    AuthRequired,

    #[error("Authentication failed")]
    AuthFailed,

    #[error("Unsupported authentication mechanism: {0}")]
    UnsupportedMechanism(String),
}

impl From<ResolveError> for SessionError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::NotFound(user) => Self::UserNotFound(user),
            ResolveError::Api(api) => Self::Directory(api),
        }
    }
}

impl SessionError {
    /// The reply the SMTP engine should send for this error
    pub fn reply(&self) -> Reply {
        match self {
            Self::AccessDenied(_) => Reply::enhanced(
                Status::Error,
                EnhancedCode(5, 7, 1),
                self.to_string(),
            ),
            Self::UserNotFound(_) => Reply::enhanced(
                Status::Error,
                EnhancedCode(5, 1, 8),
                self.to_string(),
            ),
            Self::Parse(_) => Reply::enhanced(
                Status::TransactionFailed,
                EnhancedCode(5, 6, 0),
                self.to_string(),
            ),
            Self::Send(api) | Self::Directory(api) => api_reply(api, self.to_string()),
            Self::BadSequence(_) => Reply::enhanced(
                Status::InvalidCommandSequence,
                EnhancedCode(5, 5, 1),
                self.to_string(),
            ),
            Self::AuthRequired => Reply::enhanced(
                Status::AuthRequired,
                EnhancedCode(5, 7, 0),
                self.to_string(),
            ),
            Self::AuthFailed => Reply::enhanced(
                Status::AuthFailed,
                EnhancedCode(5, 7, 8),
                self.to_string(),
            ),
            Self::UnsupportedMechanism(_) => Reply::enhanced(
                Status::NotImplemented,
                EnhancedCode(5, 5, 4),
                self.to_string(),
            ),
        }
    }

    /// The reply sent when a connection is refused before the greeting
    pub fn connection_reply(&self) -> Reply {
        match self {
            Self::AccessDenied(_) => Reply::enhanced(
                Status::TransactionFailed,
                EnhancedCode(5, 7, 1),
                self.to_string(),
            ),
            _ => self.reply(),
        }
    }

    pub const fn severity(&self) -> Severity {
        match self {
            Self::Parse(_) | Self::Send(_) | Self::Directory(_) => Severity::Error,
            Self::AccessDenied(_)
            | Self::UserNotFound(_)
            | Self::BadSequence(_)
            | Self::AuthRequired
            | Self::AuthFailed
            | Self::UnsupportedMechanism(_) => Severity::Warn,
        }
    }

    /// Checks if the error was a policy decision rather than a failure
    pub const fn is_denial(&self) -> bool {
        matches!(self, Self::AccessDenied(_) | Self::UserNotFound(_))
    }

    /// Short label used as a metric attribute
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::AccessDenied(_) => "access_denied",
            Self::UserNotFound(_) => "user_not_found",
            Self::Parse(_) => "parse",
            Self::Send(_) => "send",
            Self::Directory(_) => "directory",
            Self::BadSequence(_) => "bad_sequence",
            Self::AuthRequired => "auth_required",
            Self::AuthFailed => "auth_failed",
            Self::UnsupportedMechanism(_) => "unsupported_mechanism",
        }
    }
}

fn api_reply(api: &ApiError, text: String) -> Reply {
    match api {
        ApiError::Throttled { .. } => {
            Reply::enhanced(Status::ActionUnavailable, EnhancedCode(4, 7, 0), text)
        }
        ApiError::Unavailable(_) => {
            Reply::enhanced(Status::ActionUnavailable, EnhancedCode(4, 4, 1), text)
        }
        ApiError::Unauthorized => {
            Reply::enhanced(Status::TransactionFailed, EnhancedCode(5, 7, 1), text)
        }
        ApiError::Other(_) => {
            Reply::enhanced(Status::TransactionFailed, EnhancedCode(5, 0, 0), text)
        }
    }
}
