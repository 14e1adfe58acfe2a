//! Microsoft Graph as a relay [`Directory`](graph_smtpd_core::Directory).
//!
//! Tokens are obtained with the OAuth2 client-credentials grant against the
//! tenant's identity endpoint and cached until shortly before they expire.
//! Mail is sent with `POST /users/{id}/sendMail`.

pub mod client;
pub mod config;
pub mod error;
pub mod model;
pub mod token;

pub use client::{GraphClient, classify};
pub use config::{GraphConfig, Secret};
pub use error::{GraphError, TokenError};
