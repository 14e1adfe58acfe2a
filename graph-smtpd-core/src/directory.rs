use std::fmt::{self, Display, Formatter};

use async_trait::async_trait;

use crate::{
    error::{ApiError, ResolveError},
    message::OutboundMessage,
};

/// Opaque reference to a mailbox in the directory, as returned by
/// [`Directory::resolve_user`]
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UserHandle(String);

impl UserHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UserHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The directory and mail-send API a relay delivers through.
///
/// Implementations own their own authentication; callers never see tokens.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Look up the mailbox for `address`.
    async fn resolve_user(&self, address: &str) -> Result<UserHandle, ResolveError>;

    /// Send `message` as the mailbox behind `user`.
    async fn send_mail(&self, user: &UserHandle, message: &OutboundMessage)
    -> Result<(), ApiError>;
}
