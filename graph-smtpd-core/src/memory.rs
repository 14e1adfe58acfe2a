use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use async_trait::async_trait;

use crate::{
    directory::{Directory, UserHandle},
    error::{ApiError, ResolveError},
    message::OutboundMessage,
};

/// In-memory directory
///
/// Holds a table of known mailboxes and records every message sent through
/// it instead of delivering it. Failures can be injected for either
/// operation, which makes it the test double for the real directory API.
///
/// Cloning shares the underlying state.
#[derive(Clone, Debug, Default)]
pub struct MemoryDirectory {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    users: HashMap<String, UserHandle>,
    sent: Vec<(UserHandle, OutboundMessage)>,
    resolve_failure: Option<ApiError>,
    send_failure: Option<ApiError>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a mailbox. The handle is derived from the address.
    #[must_use]
    pub fn with_user(self, address: &str) -> Self {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .users
            .insert(address.to_string(), UserHandle::new(format!("id:{address}")));
        self
    }

    /// Make every subsequent lookup fail with `error`
    pub fn fail_resolve(&self, error: Option<ApiError>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .resolve_failure = error;
    }

    /// Make every subsequent send fail with `error`
    pub fn fail_send(&self, error: Option<ApiError>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .send_failure = error;
    }

    /// Every message accepted so far, with the mailbox it was sent as
    pub fn sent(&self) -> Vec<(UserHandle, OutboundMessage)> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .sent
            .clone()
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn resolve_user(&self, address: &str) -> Result<UserHandle, ResolveError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);

        if let Some(failure) = &inner.resolve_failure {
            return Err(ResolveError::Api(failure.clone()));
        }

        inner
            .users
            .get(address)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound(address.to_string()))
    }

    async fn send_mail(
        &self,
        user: &UserHandle,
        message: &OutboundMessage,
    ) -> Result<(), ApiError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(failure) = &inner.send_failure {
            return Err(failure.clone());
        }

        inner.sent.push((user.clone(), message.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::message::MessageBuilder;

    #[tokio::test]
    async fn resolves_known_users() {
        let directory = MemoryDirectory::new().with_user("alice@co.com");

        assert_eq!(
            directory.resolve_user("alice@co.com").await,
            Ok(UserHandle::new("id:alice@co.com"))
        );
        assert_eq!(
            directory.resolve_user("mallory@co.com").await,
            Err(ResolveError::NotFound("mallory@co.com".into()))
        );
    }

    #[tokio::test]
    async fn records_and_fails_sends() {
        let directory = MemoryDirectory::new().with_user("alice@co.com");
        let user = UserHandle::new("id:alice@co.com");
        let message = MessageBuilder::new("alice@co.com", "bob@co.com", "Hi")
            .build()
            .expect("build");

        directory.send_mail(&user, &message).await.expect("send");

        directory.fail_send(Some(ApiError::Throttled { retry_after: None }));
        assert_eq!(
            directory.send_mail(&user, &message).await,
            Err(ApiError::Throttled { retry_after: None })
        );

        assert_eq!(directory.sent(), vec![(user, message)]);
    }
}
