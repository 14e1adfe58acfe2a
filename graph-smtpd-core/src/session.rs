//! One SMTP dialogue.
//!
//! ```text
//!   Fresh --MAIL--> SenderSet --RCPT--> RecipientsCollecting --DATA--> Completed
//!     |               |                      |    ^                        |
//!     +---------------+---- rejected --------+----+-------> Failed         |
//!                                                                          |
//!   any state --RSET--> Fresh <--------------------------------------------+
//! ```
//!
//! A rejected `MAIL` leaves the session in [`State::Failed`], from which the
//! client may issue `MAIL` again. A rejected `DATA` also lands in `Failed`.
//! Commands out of sequence are refused without touching the transaction.
//! Every reset or logout emits one summary event at the worst severity the
//! transaction reached.

use std::{fmt, sync::Arc};

use graph_smtpd_common::{incoming, internal};
use tracing::{Instrument, Span};

use crate::{
    backend::{Backend, Credentials},
    directory::UserHandle,
    error::{ParseError, SessionError},
    message::{MessageBuilder, OutboundMessage},
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum State {
    #[default]
    Fresh,
    SenderSet,
    RecipientsCollecting,
    Completed,
    Failed,
}

/// How bad the worst thing that happened in a session was
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    #[default]
    Info,
    Warn,
    Error,
}

/// Terminal outcome of a transaction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Sent,
    Denied,
    Error,
}

impl Outcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Denied => "denied",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct Session {
    backend: Arc<Backend>,
    id: u64,
    state: State,
    sender: Option<String>,
    recipient: Option<String>,
    envelope: Vec<String>,
    user: Option<UserHandle>,
    hostname: Option<String>,
    remote: String,
    errors: Vec<String>,
    outcome: Option<Outcome>,
    severity: Severity,
    authenticated: bool,
    active: bool,
    span: Span,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("sender", &self.sender)
            .field("recipient", &self.recipient)
            .field("remote", &self.remote)
            .field("outcome", &self.outcome)
            .field("severity", &self.severity)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(backend: Arc<Backend>, id: u64, remote: String) -> Self {
        let span = tracing::info_span!(parent: &backend.span, "session", id, peer = %remote);

        {
            let _enter = span.enter();
            internal!(level = DEBUG, "Session opened");
        }

        Self {
            backend,
            id,
            state: State::Fresh,
            sender: None,
            recipient: None,
            envelope: Vec::new(),
            user: None,
            hostname: None,
            remote,
            errors: Vec::new(),
            outcome: None,
            severity: Severity::Info,
            authenticated: false,
            active: false,
            span,
        }
    }

    pub const fn id(&self) -> u64 {
        self.id
    }

    pub const fn state(&self) -> State {
        self.state
    }

    pub const fn severity(&self) -> Severity {
        self.severity
    }

    pub const fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Record the client's HELO/EHLO name
    pub fn hello(&mut self, hostname: &str) {
        let _enter = self.span.enter();
        incoming!("HELO {}", hostname);
        self.hostname = Some(hostname.to_string());
    }

    /// SASL mechanisms this session accepts
    pub fn auth_mechanisms(&self) -> Vec<&'static str> {
        if self.backend.credentials.is_some() {
            vec!["PLAIN"]
        } else {
            Vec::new()
        }
    }

    pub const fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Start a SASL exchange.
    ///
    /// # Errors
    /// [`SessionError::UnsupportedMechanism`] unless credentials are configured
    /// and `mechanism` is `PLAIN`.
    pub fn auth(&mut self, mechanism: &str) -> Result<PlainServer<'_>, SessionError> {
        let Some(credentials) = self.backend.credentials.clone() else {
            return Err(self.fail(SessionError::UnsupportedMechanism(mechanism.to_string())));
        };

        if !mechanism.eq_ignore_ascii_case("PLAIN") {
            return Err(self.fail(SessionError::UnsupportedMechanism(mechanism.to_string())));
        }

        Ok(PlainServer {
            session: self,
            credentials,
        })
    }

    /// `MAIL FROM`: check the sender against the allow-list and resolve it in
    /// the directory.
    ///
    /// # Errors
    /// - [`SessionError::BadSequence`] if a transaction is already open
    /// - [`SessionError::AuthRequired`] if credentials are configured and the
    ///   client has not authenticated
    /// - [`SessionError::AccessDenied`] / [`SessionError::UserNotFound`] /
    ///   [`SessionError::Directory`] if the sender is refused
    pub async fn mail(&mut self, from: &str) -> Result<(), SessionError> {
        if matches!(self.state, State::SenderSet | State::RecipientsCollecting) {
            return Err(self.refuse(SessionError::BadSequence("nested MAIL command")));
        }

        self.active = true;
        self.sender = Some(from.to_string());
        self.recipient = None;
        self.envelope.clear();
        self.user = None;

        if self.backend.credentials.is_some() && !self.authenticated {
            return Err(self.fail(SessionError::AuthRequired));
        }

        if !self.backend.access.check_sender(from) {
            return Err(self.fail(SessionError::AccessDenied(from.to_string())));
        }

        // The null reverse-path names no mailbox to send as
        if from.trim().is_empty() {
            return Err(self.fail(SessionError::UserNotFound("<>".to_string())));
        }

        let directory = Arc::clone(&self.backend.directory);
        match directory
            .resolve_user(from)
            .instrument(self.span.clone())
            .await
        {
            Ok(user) => {
                let _enter = self.span.enter();
                internal!(level = DEBUG, "Resolved {} to {}", from, user);

                self.user = Some(user);
                self.state = State::SenderSet;
                Ok(())
            }
            Err(err) => Err(self.fail(err.into())),
        }
    }

    /// `RCPT TO`: recorded for the summary, never checked here.
    ///
    /// # Errors
    /// [`SessionError::BadSequence`] if no sender has been accepted
    pub fn rcpt(&mut self, to: &str) -> Result<(), SessionError> {
        if !matches!(self.state, State::SenderSet | State::RecipientsCollecting) {
            return Err(self.refuse(SessionError::BadSequence("need MAIL before RCPT")));
        }

        self.recipient = Some(to.to_string());
        self.envelope.push(to.to_string());
        self.state = State::RecipientsCollecting;

        Ok(())
    }

    /// Check that the transaction may move on to message data, before any of
    /// it is read.
    ///
    /// # Errors
    /// [`SessionError::BadSequence`] unless a sender and at least one
    /// recipient have been accepted
    pub fn begin_data(&mut self) -> Result<(), SessionError> {
        match self.state {
            State::RecipientsCollecting => Ok(()),
            State::SenderSet => Err(self.refuse(SessionError::BadSequence("need RCPT before DATA"))),
            _ => Err(self.refuse(SessionError::BadSequence("need MAIL before DATA"))),
        }
    }

    /// `DATA`: parse `raw`, build the outbound message and send it as the
    /// resolved sender.
    ///
    /// # Errors
    /// - [`SessionError::BadSequence`] before a successful `MAIL` and `RCPT`
    /// - [`SessionError::Parse`] if the message cannot be parsed
    /// - [`SessionError::Send`] if the directory API rejects it
    pub async fn data(&mut self, raw: &[u8]) -> Result<(), SessionError> {
        self.begin_data()?;

        let (Some(sender), Some(user)) = (self.sender.clone(), self.user.clone()) else {
            return Err(self.refuse(SessionError::BadSequence("need MAIL before DATA")));
        };

        let message = match self.build_message(&sender, raw) {
            Ok(message) => message,
            Err(err) => return Err(self.fail(err.into())),
        };

        self.cross_check(&message);

        let directory = Arc::clone(&self.backend.directory);
        match directory
            .send_mail(&user, &message)
            .instrument(self.span.clone())
            .await
        {
            Ok(()) => {
                if let Some(metrics) = &self.backend.metrics {
                    metrics.record_sent();
                }

                let _enter = self.span.enter();
                internal!(
                    level = INFO,
                    "Sent message from {} to {} recipient(s) with {} attachment(s)",
                    sender,
                    message.recipients().count(),
                    message.attachments.len()
                );

                self.outcome = Some(Outcome::Sent);
                self.state = State::Completed;
                Ok(())
            }
            Err(err) => Err(self.fail(SessionError::Send(err))),
        }
    }

    /// End the current transaction, logging its summary if anything happened.
    pub fn reset(&mut self) {
        if self.active {
            self.summarise();
        }

        self.state = State::Fresh;
        self.sender = None;
        self.recipient = None;
        self.envelope.clear();
        self.user = None;
        self.errors.clear();
        self.outcome = None;
        self.severity = Severity::Info;
        self.active = false;
    }

    /// Close the session for good. Always emits a summary, even when no
    /// transaction was attempted.
    ///
    /// # Errors
    /// Never fails today; the signature leaves room for engines that need to
    /// report a failed teardown.
    pub fn logout(mut self) -> Result<(), SessionError> {
        if !self.active {
            self.summarise();
        }
        self.reset();

        let _enter = self.span.enter();
        internal!(level = DEBUG, "Session closed");

        Ok(())
    }

    fn build_message(&self, sender: &str, raw: &[u8]) -> Result<OutboundMessage, ParseError> {
        let mail = mailparse::parse_mail(raw)?;

        MessageBuilder::from_mail(sender, &mail)?
            .save_to_sent_items(self.backend.save_to_sent_items)
            .build()
    }

    /// Warn about envelope recipients that none of the headers mention. The
    /// message still goes only to the header recipients.
    fn cross_check(&mut self, message: &OutboundMessage) {
        let unlisted: Vec<&String> = self
            .envelope
            .iter()
            .filter(|address| !message.recipients().any(|listed| mentions(listed, address)))
            .collect();

        if unlisted.is_empty() {
            return;
        }

        let warning = format!(
            "Envelope recipients missing from headers: {}",
            unlisted
                .iter()
                .map(|address| address.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        {
            let _enter = self.span.enter();
            internal!(level = WARN, "{}", warning);
        }

        self.errors.push(warning);
        self.severity = self.severity.max(Severity::Warn);
    }

    /// Record `err` against the session and fail the transaction, handing
    /// the error back for the caller to return.
    fn fail(&mut self, err: SessionError) -> SessionError {
        let err = self.refuse(err);

        self.outcome = Some(if err.is_denial() {
            Outcome::Denied
        } else {
            Outcome::Error
        });
        self.state = State::Failed;

        err
    }

    /// Record `err` against the session, leaving the transaction as it was.
    fn refuse(&mut self, err: SessionError) -> SessionError {
        let severity = err.severity();

        if let Some(metrics) = &self.backend.metrics {
            if err.is_denial() {
                metrics.record_denied("sender");
            } else {
                metrics.record_error(err.kind());
            }
        }

        {
            let _enter = self.span.enter();
            match severity {
                Severity::Error => internal!(level = ERROR, "{}", err),
                Severity::Warn => internal!(level = WARN, "{}", err),
                Severity::Info => internal!(level = INFO, "{}", err),
            }
        }

        self.errors.push(err.to_string());
        self.severity = self.severity.max(severity);
        self.active = true;

        err
    }

    fn summarise(&self) {
        let _enter = self.span.enter();

        let sender = self.sender.as_deref().unwrap_or_default();
        let recipient = self.recipient.as_deref().unwrap_or_default();
        let hostname = self.hostname.as_deref().unwrap_or_default();
        let status = self.outcome.map_or("incomplete", Outcome::as_str);
        let errors = &self.errors;

        match self.severity {
            Severity::Info => tracing::info!(
                sender,
                recipient,
                hostname,
                remote = %self.remote,
                status,
                ?errors,
                "Session summary"
            ),
            Severity::Warn => tracing::warn!(
                sender,
                recipient,
                hostname,
                remote = %self.remote,
                status,
                ?errors,
                "Session summary"
            ),
            Severity::Error => tracing::error!(
                sender,
                recipient,
                hostname,
                remote = %self.remote,
                status,
                ?errors,
                "Session summary"
            ),
        }
    }
}

/// Validates a SASL PLAIN response against the configured credentials
pub struct PlainServer<'a> {
    session: &'a mut Session,
    credentials: Credentials,
}

impl PlainServer<'_> {
    /// Check a decoded `authzid NUL authcid NUL passwd` response.
    ///
    /// # Errors
    /// [`SessionError::AuthFailed`] if the response is malformed or the
    /// credentials do not match.
    pub fn next(self, response: &[u8]) -> Result<(), SessionError> {
        let mut fields = response.split(|byte| *byte == 0);
        let (Some(_authzid), Some(authcid), Some(passwd), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(self.session.fail(SessionError::AuthFailed));
        };

        if authcid != self.credentials.username.as_bytes()
            || passwd != self.credentials.password.as_bytes()
        {
            return Err(self.session.fail(SessionError::AuthFailed));
        }

        self.session.authenticated = true;
        let _enter = self.session.span.enter();
        internal!(level = INFO, "Authenticated as {}", self.credentials.username);

        Ok(())
    }
}

fn mentions(listed: &str, address: &str) -> bool {
    let listed = listed.trim();

    listed.eq_ignore_ascii_case(address)
        || listed
            .rsplit_once('<')
            .and_then(|(_, rest)| rest.strip_suffix('>'))
            .is_some_and(|inner| inner.trim().eq_ignore_ascii_case(address))
}
