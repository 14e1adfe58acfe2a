use std::{sync::Arc, time::Duration};

use base64::{Engine, engine::general_purpose::STANDARD};
use graph_smtpd_common::{
    Signal, incoming, internal,
    reply::{EnhancedCode, Reply},
    status::Status,
};
use graph_smtpd_core::{Session, State};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::broadcast::{self, error::RecvError},
    time::timeout,
};
use tokio_rustls::TlsAcceptor;
use tracing::Instrument;

use crate::{
    command::{Command, MailParameters},
    config::SmtpConfig,
    connection::{COMMAND_LINE_LIMIT, Connection, DATA_LINE_LIMIT, Line},
    error::{ConnectionError, ConnectionResult},
};

/// What the dialogue does after a command has been answered
enum Flow {
    Continue,
    Close,
    StartTls(TlsAcceptor),
}

enum Event {
    Line(ConnectionResult<Option<Line>>),
    Signal(Result<Signal, RecvError>),
}

fn reply(status: Status, code: (u8, u16, u16), text: impl Into<String>) -> Reply {
    Reply::enhanced(status, EnhancedCode(code.0, code.1, code.2), text.into())
}

fn greet_first() -> Reply {
    reply(
        Status::InvalidCommandSequence,
        (5, 5, 1),
        "Send HELO/EHLO first",
    )
}

async fn read<S: AsyncRead + AsyncWrite + Unpin + Send>(
    connection: &mut Connection<S>,
    limit: usize,
    wait: Duration,
) -> ConnectionResult<Option<Line>> {
    timeout(wait, connection.read_line(limit))
        .await
        .map_err(|_| ConnectionError::Timeout)?
        .map_err(ConnectionError::from)
}

/// The SMTP dialogue for one accepted connection, driving a core [`Session`]
pub struct Conversation {
    session: Session,
    config: Arc<SmtpConfig>,
    greeted: bool,
    recipients: usize,
}

impl Conversation {
    pub const fn new(session: Session, config: Arc<SmtpConfig>) -> Self {
        Self {
            session,
            config,
            greeted: false,
            recipients: 0,
        }
    }

    /// Serve the connection until the client quits, goes quiet, or the
    /// server shuts down. The session summary is always logged on the way
    /// out.
    pub async fn run<S>(mut self, stream: S, shutdown: broadcast::Receiver<Signal>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let span = self.session.span().clone();
        let result = self
            .serve(Connection::plain(stream), shutdown)
            .instrument(span.clone())
            .await;

        let _enter = span.enter();
        match result {
            Ok(()) => {}
            Err(ConnectionError::Timeout) => {
                internal!(level = INFO, "Client timed out");
            }
            Err(err) => {
                internal!(level = WARN, "Connection ended: {}", err);
            }
        }

        if let Err(err) = self.session.logout() {
            internal!(level = ERROR, "Logout failed: {}", err);
        }
    }

    async fn serve<S>(
        &mut self,
        mut connection: Connection<S>,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> ConnectionResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let config = Arc::clone(&self.config);
        let mut listening = true;

        connection
            .send(&Reply::new(
                Status::ServiceReady,
                format!("{} ESMTP graph-smtpd ready", config.hostname),
            ))
            .await?;

        loop {
            let event = tokio::select! {
                line = read(&mut connection, COMMAND_LINE_LIMIT, config.timeouts.command()) => Event::Line(line),
                signal = shutdown.recv(), if listening => Event::Signal(signal),
            };

            let line = match event {
                Event::Signal(Ok(Signal::Shutdown)) => {
                    connection
                        .send(&reply(
                            Status::Unavailable,
                            (4, 3, 2),
                            "Service shutting down",
                        ))
                        .await?;
                    return Ok(());
                }
                Event::Signal(Err(RecvError::Closed)) => {
                    listening = false;
                    continue;
                }
                Event::Signal(_) => continue,
                Event::Line(Err(ConnectionError::Timeout)) => {
                    connection.send(&timed_out()).await?;
                    return Err(ConnectionError::Timeout);
                }
                Event::Line(line) => match line? {
                    Some(line) => line,
                    None => return Ok(()),
                },
            };

            if line.overflow {
                connection
                    .send(&reply(Status::SyntaxError, (5, 5, 2), "Line too long"))
                    .await?;
                continue;
            }

            let command = Command::try_from(line.content()).unwrap_or_else(|invalid| invalid);
            incoming!("{}", command);

            let flow = match self.dispatch(&mut connection, command).await {
                Err(ConnectionError::Timeout) => {
                    connection.send(&timed_out()).await?;
                    return Err(ConnectionError::Timeout);
                }
                flow => flow?,
            };

            match flow {
                Flow::Continue => {}
                Flow::Close => return Ok(()),
                Flow::StartTls(acceptor) => {
                    connection = connection.upgrade(&acceptor).await?;
                    internal!(level = DEBUG, "Connection upgraded to TLS");

                    // RFC 3207: the client starts over after the handshake
                    self.session.reset();
                    self.greeted = false;
                    self.recipients = 0;
                }
            }
        }
    }

    fn auth_offered(&self, tls: bool) -> bool {
        !self.session.auth_mechanisms().is_empty() && (tls || self.config.allow_insecure_auth)
    }

    async fn dispatch<S>(
        &mut self,
        connection: &mut Connection<S>,
        command: Command,
    ) -> ConnectionResult<Flow>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let answer = match command {
            Command::Helo(id) => {
                self.hello(&id);
                Reply::new(
                    Status::Ok,
                    format!("{} greets {id}", self.config.hostname),
                )
            }
            Command::Ehlo(id) => {
                self.hello(&id);
                self.capabilities(&id, connection.is_tls())
            }
            Command::MailFrom { address, params } => self.mail(&address, &params).await,
            Command::RcptTo(address) => self.rcpt(&address),
            Command::Data => return self.data(connection).await,
            Command::Rset => {
                self.session.reset();
                self.recipients = 0;
                reply(Status::Ok, (2, 0, 0), "OK")
            }
            Command::Noop => reply(Status::Ok, (2, 0, 0), "OK"),
            Command::Help => Reply::new(
                Status::HelpMessage,
                "Commands: HELO EHLO MAIL RCPT DATA RSET NOOP QUIT STARTTLS AUTH HELP VRFY",
            ),
            Command::Vrfy(_) => reply(
                Status::CannotVerify,
                (2, 5, 2),
                "Cannot VRFY user, but will accept message and attempt delivery",
            ),
            Command::Quit => {
                connection
                    .send(&reply(
                        Status::GoodBye,
                        (2, 0, 0),
                        format!("{} closing connection", self.config.hostname),
                    ))
                    .await?;
                return Ok(Flow::Close);
            }
            Command::StartTls => return self.start_tls(connection).await,
            Command::Auth { mechanism, initial } => {
                self.auth(connection, &mechanism, initial).await?
            }
            Command::Invalid(_) => reply(
                Status::SyntaxError,
                (5, 5, 2),
                "Syntax error, command unrecognised",
            ),
        };

        connection.send(&answer).await?;
        Ok(Flow::Continue)
    }

    fn hello(&mut self, id: &str) {
        self.session.reset();
        self.session.hello(id);
        self.greeted = true;
        self.recipients = 0;
    }

    fn capabilities(&self, id: &str, tls: bool) -> Reply {
        let mut lines = vec![
            format!("{} greets {id}", self.config.hostname),
            format!("SIZE {}", self.config.max_message_bytes),
            "8BITMIME".to_string(),
            "ENHANCEDSTATUSCODES".to_string(),
        ];

        if self.config.tls.is_some() && !tls {
            lines.push("STARTTLS".to_string());
        }

        if self.auth_offered(tls) {
            lines.push(format!("AUTH {}", self.session.auth_mechanisms().join(" ")));
        }

        lines.push("HELP".to_string());

        Reply::multiline(Status::Ok, lines)
    }

    async fn mail(&mut self, address: &str, params: &MailParameters) -> Reply {
        if !self.greeted {
            return greet_first();
        }

        if let Some(size) = params.size()
            && size > self.config.max_message_bytes
        {
            return reply(
                Status::ExceededStorage,
                (5, 3, 4),
                "Message size exceeds fixed maximum message size",
            );
        }

        // A failed or finished transaction may be retried with a new sender
        if matches!(self.session.state(), State::Failed | State::Completed) {
            self.session.reset();
        }

        match self.session.mail(address).await {
            Ok(()) => {
                self.recipients = 0;
                reply(Status::Ok, (2, 1, 0), "Sender OK")
            }
            Err(err) => err.reply(),
        }
    }

    fn rcpt(&mut self, address: &str) -> Reply {
        if self.recipients >= self.config.max_recipients {
            return reply(
                Status::InsufficientStorage,
                (4, 5, 3),
                "Too many recipients",
            );
        }

        match self.session.rcpt(address) {
            Ok(()) => {
                self.recipients += 1;
                reply(Status::Ok, (2, 1, 5), "Recipient OK")
            }
            Err(err) => err.reply(),
        }
    }

    async fn data<S>(&mut self, connection: &mut Connection<S>) -> ConnectionResult<Flow>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if let Err(err) = self.session.begin_data() {
            connection.send(&err.reply()).await?;
            return Ok(Flow::Continue);
        }

        connection
            .send(&Reply::new(
                Status::StartMailInput,
                "Start mail input; end with <CRLF>.<CRLF>",
            ))
            .await?;

        let limit = self.config.max_message_bytes;
        let wait = self.config.timeouts.data();
        let mut message = Vec::new();
        let mut oversize = false;

        loop {
            let Some(line) = read(connection, DATA_LINE_LIMIT, wait).await? else {
                return Ok(Flow::Close);
            };

            let content = line.content();
            if content == b"." && !line.overflow {
                break;
            }

            let content = content.strip_prefix(b".").unwrap_or(content);
            if line.overflow || message.len() + content.len() + 2 > limit {
                oversize = true;
            }

            if !oversize {
                message.extend_from_slice(content);
                message.extend_from_slice(b"\r\n");
            }
        }

        let answer = if oversize {
            internal!(
                level = WARN,
                "Rejected message over {} bytes or with an overlong line",
                limit
            );
            reply(
                Status::ExceededStorage,
                (5, 3, 4),
                "Message exceeds fixed maximum message size",
            )
        } else {
            match self.session.data(&message).await {
                Ok(()) => reply(Status::Ok, (2, 0, 0), "Message accepted for delivery"),
                Err(err) => err.reply(),
            }
        };

        self.session.reset();
        self.recipients = 0;

        connection.send(&answer).await?;
        Ok(Flow::Continue)
    }

    async fn start_tls<S>(&mut self, connection: &mut Connection<S>) -> ConnectionResult<Flow>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let answer = match self.config.tls.as_ref() {
            None => reply(Status::NotImplemented, (5, 5, 1), "STARTTLS not available"),
            Some(_) if connection.is_tls() => reply(
                Status::InvalidCommandSequence,
                (5, 5, 1),
                "TLS already active",
            ),
            Some(tls) => match tls.acceptor() {
                Ok(acceptor) => {
                    connection
                        .send(&reply(Status::ServiceReady, (2, 0, 0), "Ready to start TLS"))
                        .await?;
                    return Ok(Flow::StartTls(acceptor));
                }
                Err(err) => {
                    internal!(level = ERROR, "Unable to load TLS material: {}", err);
                    reply(
                        Status::from(454),
                        (4, 7, 0),
                        "TLS not available due to temporary reason",
                    )
                }
            },
        };

        connection.send(&answer).await?;
        Ok(Flow::Continue)
    }

    async fn auth<S>(
        &mut self,
        connection: &mut Connection<S>,
        mechanism: &str,
        initial: Option<String>,
    ) -> ConnectionResult<Reply>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if !self.greeted {
            return Ok(greet_first());
        }

        if self.session.is_authenticated() {
            return Ok(reply(
                Status::InvalidCommandSequence,
                (5, 5, 1),
                "Already authenticated",
            ));
        }

        if !self.auth_offered(connection.is_tls()) {
            return Ok(if self.session.auth_mechanisms().is_empty() {
                reply(Status::NotImplemented, (5, 5, 1), "AUTH not available")
            } else {
                reply(
                    Status::AuthRequired,
                    (5, 7, 0),
                    "Must issue a STARTTLS command first",
                )
            });
        }

        let wait = self.config.timeouts.command();
        let server = match self.session.auth(mechanism) {
            Ok(server) => server,
            Err(err) => return Ok(err.reply()),
        };

        let response = if let Some(initial) = initial {
            initial
        } else {
            connection
                .send(&Reply::new(Status::AuthContinue, ""))
                .await?;

            let Some(line) = read(connection, COMMAND_LINE_LIMIT, wait).await? else {
                return Err(ConnectionError::Io(std::io::ErrorKind::UnexpectedEof.into()));
            };
            String::from_utf8_lossy(line.content()).trim().to_string()
        };

        if response == "*" {
            return Ok(reply(
                Status::ParameterError,
                (5, 0, 0),
                "Authentication cancelled",
            ));
        }

        let decoded = if response == "=" {
            Vec::new()
        } else {
            match STANDARD.decode(&response) {
                Ok(decoded) => decoded,
                Err(_) => {
                    return Ok(reply(
                        Status::ParameterError,
                        (5, 5, 2),
                        "Invalid base64 in AUTH response",
                    ));
                }
            }
        };

        Ok(match server.next(&decoded) {
            Ok(()) => reply(Status::AuthSucceeded, (2, 7, 0), "Authentication successful"),
            Err(err) => err.reply(),
        })
    }
}

fn timed_out() -> Reply {
    reply(
        Status::Unavailable,
        (4, 4, 2),
        "Timeout waiting for client, closing connection",
    )
}
