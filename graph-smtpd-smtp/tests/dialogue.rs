//! Full SMTP dialogues against an in-memory directory.

use std::{sync::Arc, time::Duration};

use base64::{Engine, engine::general_purpose::STANDARD};
use graph_smtpd_common::Signal;
use graph_smtpd_core::{ApiError, Backend, ConnectionInfo, Credentials, MemoryDirectory};
use graph_smtpd_smtp::{Conversation, Listener, SmtpConfig, Timeouts, TlsContext};
use pretty_assertions::assert_eq;
use tokio::{
    io::{
        AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
        duplex, split,
    },
    net::TcpStream,
    sync::broadcast,
    task::JoinHandle,
};

struct Client<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
}

impl<S: AsyncRead + AsyncWrite> Client<S> {
    fn new(stream: S) -> Self {
        let (reader, writer) = split(stream);
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    /// Every line of the next reply, joined with `\n`
    async fn reply(&mut self) -> String {
        let mut lines = Vec::new();

        loop {
            let mut line = String::new();
            let read = self.reader.read_line(&mut line).await.expect("read reply");
            assert!(read > 0, "connection closed after {lines:?}");

            let line = line.trim_end_matches(['\r', '\n']).to_string();
            let last = line.as_bytes().get(3) != Some(&b'-');
            lines.push(line);

            if last {
                return lines.join("\n");
            }
        }
    }

    async fn write(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .expect("write");
    }

    async fn send(&mut self, line: &str) -> String {
        self.write(line).await;
        self.reply().await
    }

    async fn closed(&mut self) -> bool {
        let mut rest = String::new();
        matches!(self.reader.read_line(&mut rest).await, Ok(0))
    }
}

struct Harness {
    client: Client<tokio::io::DuplexStream>,
    shutdown: broadcast::Sender<Signal>,
    handle: JoinHandle<()>,
}

fn start(backend: Backend, config: SmtpConfig) -> Harness {
    let backend = Arc::new(backend);
    let session = backend
        .new_session(&ConnectionInfo::new("127.0.0.1:40000"))
        .expect("session");

    let (client, server) = duplex(64 * 1024);
    let (shutdown, receiver) = broadcast::channel(1);
    let handle = tokio::spawn(Conversation::new(session, Arc::new(config)).run(server, receiver));

    Harness {
        client: Client::new(client),
        shutdown,
        handle,
    }
}

fn directory() -> MemoryDirectory {
    MemoryDirectory::new().with_user("alice@co.com")
}

fn backend(directory: &MemoryDirectory) -> Backend {
    Backend::builder(Arc::new(directory.clone()))
        .with_allowed_senders(["alice@co.com", "ghost@co.com"])
        .build()
}

async fn ready(client: &mut Client<tokio::io::DuplexStream>) {
    assert!(client.reply().await.starts_with("220 localhost"));
    assert!(client.send("EHLO client.co.com").await.ends_with("250 HELP"));
}

async fn envelope(client: &mut Client<tokio::io::DuplexStream>) {
    assert_eq!(
        client.send("MAIL FROM:<alice@co.com>").await,
        "250 2.1.0 Sender OK"
    );
    assert_eq!(
        client.send("RCPT TO:<bob@co.com>").await,
        "250 2.1.5 Recipient OK"
    );
}

#[tokio::test]
async fn delivers_a_message() {
    let directory = directory();
    let Harness {
        mut client, handle, ..
    } = start(backend(&directory), SmtpConfig::default());

    assert_eq!(
        client.reply().await,
        "220 localhost ESMTP graph-smtpd ready"
    );
    assert_eq!(
        client.send("EHLO client.co.com").await,
        "250-localhost greets client.co.com\n\
         250-SIZE 1048576\n\
         250-8BITMIME\n\
         250-ENHANCEDSTATUSCODES\n\
         250 HELP"
    );

    envelope(&mut client).await;
    assert!(client.send("DATA").await.starts_with("354 "));

    for line in [
        "From: alice@co.com",
        "To: bob@co.com",
        "Subject: Hello",
        "",
        "..leading dot",
        "second line",
    ] {
        client.write(line).await;
    }
    assert_eq!(
        client.send(".").await,
        "250 2.0.0 Message accepted for delivery"
    );
    assert_eq!(
        client.send("QUIT").await,
        "221 2.0.0 localhost closing connection"
    );
    handle.await.expect("conversation");

    let sent = directory.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.as_str(), "id:alice@co.com");

    let message = &sent[0].1;
    assert_eq!(message.subject, "Hello");
    assert_eq!(message.to, vec!["bob@co.com"]);
    assert!(
        message.body.content.starts_with(".leading dot\r\nsecond line"),
        "{:?}",
        message.body.content
    );
}

#[tokio::test]
async fn commands_out_of_order() {
    let directory = directory();
    let Harness { mut client, .. } = start(backend(&directory), SmtpConfig::default());

    assert!(client.reply().await.starts_with("220 "));
    assert_eq!(
        client.send("MAIL FROM:<alice@co.com>").await,
        "503 5.5.1 Send HELO/EHLO first"
    );
    assert!(client.send("HELO client.co.com").await.starts_with("250 "));
    assert!(client.send("RCPT TO:<bob@co.com>").await.starts_with("503 5.5.1"));
    assert!(client.send("DATA").await.starts_with("503 5.5.1"));
    assert_eq!(
        client.send("BOGUS").await,
        "500 5.5.2 Syntax error, command unrecognised"
    );
    assert_eq!(client.send("NOOP").await, "250 2.0.0 OK");
    assert!(client.send("VRFY bob").await.starts_with("252 2.5.2"));
    assert!(client.send("HELP").await.starts_with("214 "));
}

#[tokio::test]
async fn sequence_errors_keep_the_transaction() {
    let directory = directory();
    let Harness { mut client, .. } = start(
        backend(&directory),
        SmtpConfig::default().with_max_recipients(1),
    );
    ready(&mut client).await;

    assert_eq!(
        client.send("MAIL FROM:<alice@co.com>").await,
        "250 2.1.0 Sender OK"
    );
    assert!(client.send("DATA").await.starts_with("503 5.5.1"));
    assert_eq!(
        client.send("RCPT TO:<bob@co.com>").await,
        "250 2.1.5 Recipient OK"
    );
    assert!(
        client
            .send("MAIL FROM:<alice@co.com>")
            .await
            .starts_with("503 5.5.1")
    );

    // The refused MAIL did not reset the recipient count
    assert!(
        client
            .send("RCPT TO:<carol@co.com>")
            .await
            .starts_with("452 4.5.3")
    );

    assert!(client.send("DATA").await.starts_with("354 "));
    for line in ["To: bob@co.com", "Subject: Hello", "", "body"] {
        client.write(line).await;
    }
    assert_eq!(
        client.send(".").await,
        "250 2.0.0 Message accepted for delivery"
    );
    assert_eq!(directory.sent().len(), 1);
}

#[tokio::test]
async fn refused_senders_can_retry() {
    let directory = directory();
    let Harness { mut client, .. } = start(backend(&directory), SmtpConfig::default());
    ready(&mut client).await;

    assert!(
        client
            .send("MAIL FROM:<mallory@co.com>")
            .await
            .starts_with("550 5.7.1")
    );
    assert!(
        client
            .send("MAIL FROM:<ghost@co.com>")
            .await
            .starts_with("550 5.1.8")
    );
    envelope(&mut client).await;
}

#[tokio::test]
async fn throttled_send_is_temporary() {
    let directory = directory();
    directory.fail_send(Some(ApiError::Throttled { retry_after: None }));
    let Harness { mut client, .. } = start(backend(&directory), SmtpConfig::default());
    ready(&mut client).await;
    envelope(&mut client).await;

    assert!(client.send("DATA").await.starts_with("354 "));
    client.write("Subject: x").await;
    client.write("").await;
    client.write("body").await;
    assert!(client.send(".").await.starts_with("451 4.7.0"));

    // The transaction is over; a new one may start straight away
    directory.fail_send(None);
    envelope(&mut client).await;
}

#[tokio::test]
async fn limits() {
    let directory = directory();
    let config = SmtpConfig::default()
        .with_max_recipients(2)
        .with_max_message_bytes(64);
    let Harness { mut client, .. } = start(backend(&directory), config);
    ready(&mut client).await;

    assert_eq!(
        client.send("MAIL FROM:<alice@co.com> SIZE=1000").await,
        "552 5.3.4 Message size exceeds fixed maximum message size"
    );

    envelope(&mut client).await;
    assert!(client.send("RCPT TO:<carol@co.com>").await.starts_with("250 "));
    assert_eq!(
        client.send("RCPT TO:<dave@co.com>").await,
        "452 4.5.3 Too many recipients"
    );

    assert!(client.send("DATA").await.starts_with("354 "));
    client.write("Subject: big").await;
    client.write("").await;
    client.write(&"y".repeat(80)).await;
    assert!(client.send(".").await.starts_with("552 5.3.4"));
    assert_eq!(client.send("RSET").await, "250 2.0.0 OK");

    assert!(directory.sent().is_empty());
}

#[tokio::test]
async fn overlong_command_line() {
    let directory = directory();
    let Harness { mut client, .. } = start(backend(&directory), SmtpConfig::default());
    ready(&mut client).await;

    assert_eq!(
        client.send(&"x".repeat(600)).await,
        "500 5.5.2 Line too long"
    );
    assert_eq!(client.send("NOOP").await, "250 2.0.0 OK");
}

#[tokio::test]
async fn plain_authentication() {
    let directory = directory();
    let backend = Backend::builder(Arc::new(directory.clone()))
        .with_credentials(Credentials::new("relay", "secret"))
        .build();
    let Harness { mut client, .. } =
        start(backend, SmtpConfig::default().with_insecure_auth(true));

    assert!(client.reply().await.starts_with("220 "));
    assert!(
        client
            .send("EHLO client.co.com")
            .await
            .contains("250-AUTH PLAIN")
    );
    assert!(
        client
            .send("MAIL FROM:<alice@co.com>")
            .await
            .starts_with("530 5.7.0")
    );

    assert_eq!(client.send("AUTH PLAIN").await, "334 ");
    let wrong = STANDARD.encode(b"\0relay\0wrong");
    assert!(client.send(&wrong).await.starts_with("535 5.7.8"));

    assert_eq!(client.send("AUTH PLAIN").await, "334 ");
    assert!(client.send("*").await.starts_with("501 "));

    let right = STANDARD.encode(b"\0relay\0secret");
    assert_eq!(
        client.send(&format!("AUTH PLAIN {right}")).await,
        "235 2.7.0 Authentication successful"
    );
    assert!(client.send("AUTH PLAIN").await.starts_with("503 "));

    envelope(&mut client).await;
}

#[tokio::test]
async fn auth_needs_tls_unless_allowed() {
    let directory = directory();
    let backend = Backend::builder(Arc::new(directory.clone()))
        .with_credentials(Credentials::new("relay", "secret"))
        .build();
    let Harness { mut client, .. } = start(backend, SmtpConfig::default());
    ready(&mut client).await;

    assert_eq!(
        client.send("AUTH PLAIN").await,
        "530 5.7.0 Must issue a STARTTLS command first"
    );
}

#[tokio::test]
async fn starttls_unavailable() {
    let directory = directory();
    let Harness { mut client, .. } = start(backend(&directory), SmtpConfig::default());
    ready(&mut client).await;

    assert_eq!(
        client.send("STARTTLS").await,
        "502 5.5.1 STARTTLS not available"
    );
    assert_eq!(client.send("AUTH PLAIN").await, "502 5.5.1 AUTH not available");
}

#[tokio::test]
async fn starttls_with_missing_certificate() {
    let directory = directory();
    let config = SmtpConfig::default().with_tls(Some(TlsContext::new(
        "/nonexistent/cert.pem",
        "/nonexistent/key.pem",
    )));
    let Harness { mut client, .. } = start(backend(&directory), config);

    assert!(client.reply().await.starts_with("220 "));
    assert!(
        client
            .send("EHLO client.co.com")
            .await
            .contains("250-STARTTLS")
    );
    assert!(client.send("STARTTLS").await.starts_with("454 4.7.0"));
    assert_eq!(client.send("NOOP").await, "250 2.0.0 OK");
}

#[tokio::test(start_paused = true)]
async fn idle_clients_are_dropped() {
    let directory = directory();
    let config = SmtpConfig::default().with_timeouts(Timeouts {
        command_secs: 5,
        data_secs: 5,
    });
    let Harness {
        mut client, handle, ..
    } = start(backend(&directory), config);
    ready(&mut client).await;

    assert!(client.reply().await.starts_with("421 4.4.2"));
    handle.await.expect("conversation");
    assert!(client.closed().await);
}

#[tokio::test]
async fn shutdown_interrupts_idle_conversation() {
    let directory = directory();
    let Harness {
        mut client,
        shutdown,
        handle,
    } = start(backend(&directory), SmtpConfig::default());
    ready(&mut client).await;

    shutdown.send(Signal::Shutdown).expect("signal");

    assert_eq!(client.reply().await, "421 4.3.2 Service shutting down");
    handle.await.expect("conversation");
}

#[tokio::test]
async fn listener_refuses_unknown_sources() {
    let directory = directory();
    let backend = Backend::builder(Arc::new(directory.clone()))
        .with_allowed_sources(["10.1.1.1"])
        .build();
    let listener = Listener::new(Arc::new(backend), Arc::new(SmtpConfig::default()));

    let socket = Listener::bind("127.0.0.1:0".parse::<std::net::SocketAddr>().expect("address"))
        .await
        .expect("bind");
    let address = socket.local_addr().expect("local address");
    let (shutdown, receiver) = broadcast::channel(1);
    let server = tokio::spawn(async move { listener.serve(socket, receiver).await });

    let mut client = Client::new(TcpStream::connect(address).await.expect("connect"));
    assert!(client.reply().await.starts_with("554 5.7.1"));
    assert!(client.closed().await);

    shutdown.send(Signal::Shutdown).expect("signal");
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("listener stops")
        .expect("join")
        .expect("serve");
}

#[tokio::test]
async fn listener_serves_allowed_sources() {
    let directory = directory();
    let backend = Backend::builder(Arc::new(directory.clone()))
        .with_allowed_sources(["127.0.0.1"])
        .build();
    let listener = Listener::new(Arc::new(backend), Arc::new(SmtpConfig::default()));

    let socket = Listener::bind("127.0.0.1:0".parse::<std::net::SocketAddr>().expect("address"))
        .await
        .expect("bind");
    let address = socket.local_addr().expect("local address");
    let (shutdown, receiver) = broadcast::channel(1);
    let server = tokio::spawn(async move { listener.serve(socket, receiver).await });

    let mut client = Client::new(TcpStream::connect(address).await.expect("connect"));
    assert!(client.reply().await.starts_with("220 localhost"));
    assert!(client.send("QUIT").await.starts_with("221 "));

    shutdown.send(Signal::Shutdown).expect("signal");
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("listener stops")
        .expect("join")
        .expect("serve");
}

#[tokio::test]
async fn listener_requires_tls_material() {
    let directory = directory();
    let config = SmtpConfig::default().with_tls(Some(TlsContext::new(
        "/nonexistent/cert.pem",
        "/nonexistent/key.pem",
    )));
    let listener = Listener::new(
        Arc::new(Backend::builder(Arc::new(directory)).build()),
        Arc::new(config),
    );

    let socket = Listener::bind("127.0.0.1:0".parse::<std::net::SocketAddr>().expect("address"))
        .await
        .expect("bind");
    let (_shutdown, receiver) = broadcast::channel(1);

    let err = listener
        .serve(socket, receiver)
        .await
        .expect_err("missing certificate");
    assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
}
