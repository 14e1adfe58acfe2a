use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use serde::Deserialize;
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        ServerConfig,
        pki_types::{CertificateDer, PrivateKeyDer},
    },
};

use crate::error::{TlsError, TlsResult};

pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;
pub const DEFAULT_MAX_RECIPIENTS: usize = 10;

/// Certificate and key used for STARTTLS.
///
/// Both files are read again on every upgrade, so replacing them on disk
/// takes effect for the next handshake without a restart.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct TlsContext {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

impl TlsContext {
    pub fn new(certificate: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        Self {
            certificate: certificate.into(),
            key: key.into(),
        }
    }

    fn load_certs(path: &Path) -> std::io::Result<Vec<CertificateDer<'static>>> {
        rustls_pemfile::certs(&mut BufReader::new(File::open(path)?)).collect()
    }

    fn load_key(path: &Path) -> TlsResult<PrivateKeyDer<'static>> {
        let key_error = |reason: String| TlsError::KeyLoad {
            path: path.display().to_string(),
            reason,
        };

        let mut reader =
            BufReader::new(File::open(path).map_err(|err| key_error(err.to_string()))?);

        match rustls_pemfile::read_one(&mut reader).map_err(|err| key_error(err.to_string()))? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => Ok(PrivateKeyDer::Pkcs1(key)),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => Ok(PrivateKeyDer::Pkcs8(key)),
            Some(rustls_pemfile::Item::Sec1Key(key)) => Ok(PrivateKeyDer::Sec1(key)),
            _ => Err(key_error(
                "Unable to determine key file format (expected PKCS1, PKCS8, or SEC1)".to_string(),
            )),
        }
    }

    /// Build an acceptor from the files as they are right now.
    ///
    /// # Errors
    /// If either file is missing or unreadable, or rustls rejects the pair.
    pub fn acceptor(&self) -> TlsResult<TlsAcceptor> {
        let certs =
            Self::load_certs(&self.certificate).map_err(|source| TlsError::CertificateLoad {
                path: self.certificate.display().to_string(),
                source,
            })?;
        let key = Self::load_key(&self.key)?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

/// Server-side timeouts, in seconds
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Timeouts {
    /// Waiting for the next command
    pub command_secs: u64,
    /// Waiting for the next line of message data
    pub data_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            command_secs: 300,
            data_secs: 180,
        }
    }
}

impl Timeouts {
    pub const fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    pub const fn data(&self) -> Duration {
        Duration::from_secs(self.data_secs)
    }
}

/// Engine settings shared by every connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SmtpConfig {
    /// Name used in the greeting and EHLO response
    pub hostname: String,
    pub max_message_bytes: usize,
    pub max_recipients: usize,
    pub tls: Option<TlsContext>,
    /// Offer AUTH on plaintext connections
    pub allow_insecure_auth: bool,
    pub timeouts: Timeouts,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            max_recipients: DEFAULT_MAX_RECIPIENTS,
            tls: None,
            allow_insecure_auth: false,
            timeouts: Timeouts::default(),
        }
    }
}

impl SmtpConfig {
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    #[must_use]
    pub const fn with_max_message_bytes(mut self, max: usize) -> Self {
        self.max_message_bytes = max;
        self
    }

    #[must_use]
    pub const fn with_max_recipients(mut self, max: usize) -> Self {
        self.max_recipients = max;
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: Option<TlsContext>) -> Self {
        self.tls = tls;
        self
    }

    #[must_use]
    pub const fn with_insecure_auth(mut self, allow: bool) -> Self {
        self.allow_insecure_auth = allow;
        self
    }

    #[must_use]
    pub const fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}
