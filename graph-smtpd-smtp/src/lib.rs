//! SMTP front end for the relay: command parsing, the per-connection
//! dialogue, STARTTLS and the accept loop.

pub mod command;
pub mod config;
pub mod connection;
pub mod conversation;
pub mod error;
pub mod listener;

pub use command::{Command, MailParameters};
pub use config::{SmtpConfig, Timeouts, TlsContext};
pub use conversation::Conversation;
pub use error::{ConnectionError, TlsError};
pub use listener::Listener;
