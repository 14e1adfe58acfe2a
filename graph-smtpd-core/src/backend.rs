use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use graph_smtpd_common::internal;
use tracing::Span;

use crate::{
    access::{AccessControl, AllowList},
    directory::Directory,
    error::SessionError,
    metrics::Metrics,
    session::Session,
};

/// Fixed SASL PLAIN credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// What the SMTP engine knows about a freshly accepted connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// The peer address as the engine saw it, usually `ip:port`
    pub remote_addr: String,
}

impl ConnectionInfo {
    pub fn new(remote_addr: impl Into<String>) -> Self {
        Self {
            remote_addr: remote_addr.into(),
        }
    }
}

/// Process-wide session factory.
///
/// A `Backend` is built once at startup and shared behind an [`Arc`] by every
/// connection. Nothing in it changes after [`BackendBuilder::build`] apart
/// from the atomic counters, so sessions read it without locking.
pub struct Backend {
    pub(crate) directory: Arc<dyn Directory>,
    pub(crate) access: AccessControl,
    pub(crate) save_to_sent_items: bool,
    pub(crate) credentials: Option<Credentials>,
    pub(crate) metrics: Option<Arc<Metrics>>,
    pub(crate) span: Span,
    next_id: AtomicU64,
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("access", &self.access)
            .field("save_to_sent_items", &self.save_to_sent_items)
            .field("credentials", &self.credentials)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl Backend {
    pub fn builder(directory: Arc<dyn Directory>) -> BackendBuilder {
        BackendBuilder {
            directory,
            senders: AllowList::default(),
            sources: AllowList::default(),
            save_to_sent_items: false,
            credentials: None,
            metrics: None,
            span: None,
        }
    }

    /// Mint a session for a new connection.
    ///
    /// # Errors
    /// [`SessionError::AccessDenied`] if the peer is not on the source
    /// allow-list, or its address cannot be parsed while one is configured.
    pub fn new_session(self: &Arc<Self>, info: &ConnectionInfo) -> Result<Session, SessionError> {
        if let Some(metrics) = &self.metrics {
            metrics.record_connection();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        if !self.access.check_source(&info.remote_addr) {
            if let Some(metrics) = &self.metrics {
                metrics.record_denied("source");
            }

            let _enter = self.span.enter();
            internal!(
                level = WARN,
                "Rejected connection {} from {}: source not permitted",
                id,
                info.remote_addr
            );

            return Err(SessionError::AccessDenied(info.remote_addr.clone()));
        }

        Ok(Session::new(Arc::clone(self), id, info.remote_addr.clone()))
    }

    pub const fn access(&self) -> &AccessControl {
        &self.access
    }

    pub const fn requires_auth(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }
}

pub struct BackendBuilder {
    directory: Arc<dyn Directory>,
    senders: AllowList,
    sources: AllowList,
    save_to_sent_items: bool,
    credentials: Option<Credentials>,
    metrics: Option<Arc<Metrics>>,
    span: Option<Span>,
}

impl BackendBuilder {
    /// Restrict `MAIL FROM` to these addresses. Empty means anyone.
    #[must_use]
    pub fn with_allowed_senders<I, S>(mut self, senders: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.senders = AllowList::new(senders);
        self
    }

    /// Restrict connections to these peer IPs. Empty means anyone.
    #[must_use]
    pub fn with_allowed_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources = AllowList::addresses(sources);
        self
    }

    #[must_use]
    pub const fn with_save_to_sent_items(mut self, save: bool) -> Self {
        self.save_to_sent_items = save;
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Parent span for every session. Defaults to the span current when
    /// [`build`](Self::build) is called.
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn build(self) -> Backend {
        Backend {
            directory: self.directory,
            access: AccessControl::new(self.senders, self.sources),
            save_to_sent_items: self.save_to_sent_items,
            credentials: self.credentials,
            metrics: self.metrics,
            span: self.span.unwrap_or_else(Span::current),
            next_id: AtomicU64::new(1),
        }
    }
}
