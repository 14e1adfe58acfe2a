use std::{io, net::SocketAddr, sync::Arc};

use futures_util::future::join_all;
use graph_smtpd_common::{Signal, internal};
use graph_smtpd_core::{Backend, ConnectionInfo, SessionError};
use tokio::{
    net::{TcpListener, TcpStream, ToSocketAddrs},
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};

use crate::{config::SmtpConfig, connection::Connection, conversation::Conversation};

/// Accepts connections and hands each one to a [`Conversation`]
#[derive(Debug)]
pub struct Listener {
    backend: Arc<Backend>,
    config: Arc<SmtpConfig>,
}

impl Listener {
    pub const fn new(backend: Arc<Backend>, config: Arc<SmtpConfig>) -> Self {
        Self { backend, config }
    }

    /// Bind the listening socket.
    ///
    /// # Errors
    /// If the address is in use or cannot be bound.
    pub async fn bind(address: impl ToSocketAddrs) -> io::Result<TcpListener> {
        TcpListener::bind(address).await
    }

    /// Accept connections until a [`Signal::Shutdown`] arrives, then wait for
    /// every open conversation to finish.
    ///
    /// # Errors
    /// If STARTTLS is configured but the certificate or key is missing.
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> io::Result<()> {
        let local = listener.local_addr()?;
        internal!(level = INFO, "Serving SMTP on {}", local);

        if let Some(tls) = self.config.tls.as_ref() {
            if !tls.certificate.try_exists()? {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("Unable to find TLS Certificate {:?}", tls.certificate),
                ));
            }

            if !tls.key.try_exists()? {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("Unable to find TLS Key {:?}", tls.key),
                ));
            }
        }

        let mut sessions: Vec<JoinHandle<()>> = Vec::new();

        loop {
            tokio::select! {
                signal = shutdown.recv() => {
                    if matches!(signal, Ok(Signal::Shutdown) | Err(RecvError::Closed)) {
                        internal!(
                            level = INFO,
                            "SMTP listener {} received shutdown, finishing {} session(s) ...",
                            local,
                            sessions.len()
                        );
                        join_all(sessions).await;
                        break;
                    }
                }

                connection = listener.accept() => {
                    let (stream, peer) = match connection {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            internal!(level = WARN, "Failed to accept connection: {}", err);
                            continue;
                        }
                    };

                    tracing::debug!("Connection received on {} from {}", local, peer);
                    sessions.retain(|session| !session.is_finished());
                    sessions.push(self.accept(stream, peer, &shutdown));
                }
            }
        }

        Ok(())
    }

    fn accept(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: &broadcast::Receiver<Signal>,
    ) -> JoinHandle<()> {
        match self.backend.new_session(&ConnectionInfo::new(peer.to_string())) {
            Ok(session) => {
                let conversation = Conversation::new(session, Arc::clone(&self.config));
                tokio::spawn(conversation.run(stream, shutdown.resubscribe()))
            }
            Err(err) => tokio::spawn(refuse(stream, err)),
        }
    }
}

/// Answer a connection that is not allowed in, then hang up
async fn refuse(stream: TcpStream, err: SessionError) {
    let mut connection = Connection::plain(stream);

    if let Err(err) = connection.send(&err.connection_reply()).await {
        internal!(level = DEBUG, "Unable to send refusal: {}", err);
    }
}
