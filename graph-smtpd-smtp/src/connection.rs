use std::io;

use graph_smtpd_common::{outgoing, reply::Reply};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_rustls::{TlsAcceptor, server::TlsStream};

use crate::error::{ConnectionResult, TlsError, TlsResult};

/// Longest command line accepted, CRLF included
pub const COMMAND_LINE_LIMIT: usize = 512;
/// Longest line of message data accepted, CRLF included
pub const DATA_LINE_LIMIT: usize = 1000;

/// One line read from the client
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Line {
    bytes: Vec<u8>,
    /// The line was longer than the limit; `bytes` holds only its start
    pub overflow: bool,
}

impl Line {
    /// The line without its terminator
    pub fn content(&self) -> &[u8] {
        let bytes = self.bytes.strip_suffix(b"\n").unwrap_or(&self.bytes);
        bytes.strip_suffix(b"\r").unwrap_or(bytes)
    }
}

trait Stream: AsyncBufRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncBufRead + AsyncWrite + Unpin + Send> Stream for T {}

pub enum Connection<S: AsyncRead + AsyncWrite + Unpin + Send> {
    Plain(BufReader<S>),
    Tls(Box<BufReader<TlsStream<S>>>),
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Connection<S> {
    pub fn plain(stream: S) -> Self {
        Self::Plain(BufReader::new(stream))
    }

    pub const fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    fn stream(&mut self) -> &mut (dyn Stream + '_) {
        match self {
            Self::Plain(stream) => stream,
            Self::Tls(stream) => stream.as_mut(),
        }
    }

    /// Write `reply` followed by CRLF and flush it.
    ///
    /// # Errors
    /// If the peer has gone away.
    pub async fn send(&mut self, reply: &Reply) -> ConnectionResult<()> {
        outgoing!("{}", reply);

        let stream = self.stream();
        stream.write_all(format!("{reply}\r\n").as_bytes()).await?;
        stream.flush().await?;

        Ok(())
    }

    /// Read up to and including the next LF.
    ///
    /// Anything past `limit` bytes is discarded and the line is flagged as
    /// overflowing, so one oversized line never desynchronises the dialogue.
    /// Returns `None` once the peer has closed its side.
    ///
    /// # Errors
    /// On I/O failure.
    pub async fn read_line(&mut self, limit: usize) -> io::Result<Option<Line>> {
        let stream = self.stream();
        let mut line = Line::default();

        loop {
            let available = stream.fill_buf().await?;
            if available.is_empty() {
                return Ok((!line.bytes.is_empty() || line.overflow).then_some(line));
            }

            let (chunk, complete) = match available.iter().position(|byte| *byte == b'\n') {
                Some(end) => (&available[..=end], true),
                None => (available, false),
            };

            let room = limit.saturating_sub(line.bytes.len());
            if chunk.len() > room {
                line.overflow = true;
                line.bytes.extend_from_slice(&chunk[..room]);
            } else {
                line.bytes.extend_from_slice(chunk);
            }

            let used = chunk.len();
            stream.consume(used);

            if complete {
                return Ok(Some(line));
            }
        }
    }

    /// Run the server side of a TLS handshake over this connection.
    ///
    /// Bytes the client pipelined after `STARTTLS` are dropped with the
    /// plaintext buffer.
    ///
    /// # Errors
    /// [`TlsError::AlreadyActive`] on an encrypted connection, otherwise any
    /// handshake failure.
    pub async fn upgrade(self, acceptor: &TlsAcceptor) -> TlsResult<Self> {
        match self {
            Self::Plain(reader) => {
                let stream = acceptor.accept(reader.into_inner()).await?;
                Ok(Self::Tls(Box::new(BufReader::new(stream))))
            }
            Self::Tls(_) => Err(TlsError::AlreadyActive),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt, duplex};

    use super::*;

    #[tokio::test]
    async fn reads_lines() {
        let (client, server) = duplex(1024);
        let mut connection = Connection::plain(server);

        let mut client = client;
        client
            .write_all(b"EHLO a\r\nNOOP\nQUIT")
            .await
            .expect("write");
        drop(client);

        let first = connection.read_line(512).await.expect("read").expect("line");
        assert_eq!(first.content(), b"EHLO a");
        assert!(!first.overflow);

        let second = connection.read_line(512).await.expect("read").expect("line");
        assert_eq!(second.content(), b"NOOP");

        let last = connection.read_line(512).await.expect("read").expect("line");
        assert_eq!(last.content(), b"QUIT");

        assert_eq!(connection.read_line(512).await.expect("read"), None);
    }

    #[tokio::test]
    async fn long_lines_overflow_without_desync() {
        let (mut client, server) = duplex(4096);
        let mut connection = Connection::plain(server);

        let mut input = vec![b'x'; 600];
        input.extend_from_slice(b"\r\nNOOP\r\n");
        client.write_all(&input).await.expect("write");

        let long = connection.read_line(512).await.expect("read").expect("line");
        assert!(long.overflow);
        assert_eq!(long.content().len(), 512);

        let next = connection.read_line(512).await.expect("read").expect("line");
        assert_eq!(next.content(), b"NOOP");
        assert!(!next.overflow);
    }

    #[tokio::test]
    async fn sends_replies_with_crlf() {
        let (mut client, server) = duplex(1024);
        let mut connection = Connection::plain(server);

        connection
            .send(&Reply::new(graph_smtpd_common::status::Status::Ok, "OK"))
            .await
            .expect("send");
        drop(connection);

        let mut received = String::new();
        client
            .read_to_string(&mut received)
            .await
            .expect("read");
        assert_eq!(received, "250 OK\r\n");
    }
}
