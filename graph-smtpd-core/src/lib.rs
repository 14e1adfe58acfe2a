//! Session handling and message translation for the Graph SMTP relay.
//!
//! The SMTP engine hands each accepted connection to [`Backend::new_session`]
//! and then drives the returned [`Session`] through `MAIL`, `RCPT`, `DATA`,
//! `RSET` and `QUIT`. On `DATA` the raw RFC 5322 message is turned into an
//! [`OutboundMessage`] and handed to a [`Directory`] for delivery on behalf
//! of the authenticated sender.

pub mod access;
pub mod address;
pub mod backend;
pub mod directory;
pub mod error;
pub mod memory;
pub mod message;
pub mod metrics;
pub mod mime;
pub mod session;

pub use access::{AccessControl, AllowList};
pub use address::parse_address_list;
pub use backend::{Backend, BackendBuilder, ConnectionInfo, Credentials};
pub use directory::{Directory, UserHandle};
pub use error::{ApiError, ParseError, ResolveError, SessionError};
pub use message::{AttachmentSource, Body, ContentKind, MessageBuilder, OutboundMessage};
pub use memory::MemoryDirectory;
pub use metrics::{Metrics, Snapshot};
pub use mime::{Attachment, decompose_attachments, extract_body, file_attachments};
pub use session::{Outcome, PlainServer, Session, Severity, State};
