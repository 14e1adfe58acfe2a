//! Daemon configuration: a RON file with every field defaulted, overridden
//! by command line flags and their `SMTPD_*` environment variables.

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use clap::Parser;
use graph_smtpd_common::logging::{LogConfig, LogFormat};
use graph_smtpd_core::{Backend, Credentials, Directory, Metrics, parse_address_list};
use graph_smtpd_graph::{GraphConfig, Secret, config};
use graph_smtpd_smtp::{SmtpConfig, Timeouts, TlsContext, config as smtp};
use serde::Deserialize;

use crate::telemetry::MetricsConfig;

pub const DEFAULT_CONFIG_PATHS: [&str; 2] = [
    "./graph-smtpd.config.ron",
    "/etc/graph-smtpd/graph-smtpd.config.ron",
];

/// Relay SMTP into Microsoft 365 through the Graph sendMail API
#[derive(Parser, Debug, Default)]
#[command(name = "graph-smtpd", version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (RON)
    #[arg(short, long, env = "SMTPD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, env = "SMTPD_ADDR")]
    pub addr: Option<String>,

    /// Hostname announced in the greeting
    #[arg(long, env = "SMTPD_DOMAIN")]
    pub domain: Option<String>,

    /// Maximum recipients per message
    #[arg(long, env = "SMTPD_RECIPIENTS")]
    pub recipients: Option<usize>,

    /// Maximum message size in bytes
    #[arg(long, env = "SMTPD_MAX")]
    pub max: Option<usize>,

    /// Keep a copy of relayed mail in the sender's Sent Items
    #[arg(long, env = "SMTPD_SENTITEMS", num_args = 0..=1, default_missing_value = "true")]
    pub sentitems: Option<bool>,

    /// Comma separated sender addresses allowed to relay
    #[arg(long, env = "SMTPD_SENDERS")]
    pub senders: Option<String>,

    /// Comma separated client IPs allowed to connect
    #[arg(long, env = "SMTPD_SOURCES")]
    pub sources: Option<String>,

    /// PEM certificate for STARTTLS
    #[arg(long, env = "SMTPD_CERT", requires = "key")]
    pub cert: Option<PathBuf>,

    /// PEM private key for STARTTLS
    #[arg(long, env = "SMTPD_KEY", requires = "cert")]
    pub key: Option<PathBuf>,

    /// Application (client) id registered in Entra ID
    #[arg(long, env = "SMTPD_CLIENTID")]
    pub clientid: Option<String>,

    /// Directory (tenant) id
    #[arg(long, env = "SMTPD_TENANTID")]
    pub tenantid: Option<String>,

    /// Client secret
    #[arg(long, env = "SMTPD_SECRET", hide_env_values = true)]
    pub secret: Option<String>,

    /// File holding the client secret, used when no secret is given
    #[arg(long, env = "SMTPD_SECRET_FILE")]
    pub secret_file: Option<PathBuf>,

    #[arg(long, env = "SMTPD_LOG_LEVEL")]
    pub log_level: Option<String>,

    #[arg(long, env = "SMTPD_LOG_FORMAT")]
    pub log_format: Option<LogFormat>,

    /// Push counters to this OTLP/HTTP endpoint
    #[arg(long, env = "SMTPD_METRICS_ENDPOINT")]
    pub metrics_endpoint: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SmtpSection {
    pub addr: String,
    pub domain: String,
    pub recipients: usize,
    pub max: usize,
    pub tls: Option<TlsContext>,
    pub allow_insecure_auth: bool,
    pub timeouts: Timeouts,
}

impl Default for SmtpSection {
    fn default() -> Self {
        Self {
            addr: "localhost:2525".to_string(),
            domain: "localhost".to_string(),
            recipients: smtp::DEFAULT_MAX_RECIPIENTS,
            max: smtp::DEFAULT_MAX_MESSAGE_BYTES,
            tls: None,
            allow_insecure_auth: false,
            timeouts: Timeouts::default(),
        }
    }
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct GraphSection {
    pub tenant_id: String,
    pub client_id: String,
    pub secret: Secret,
    pub secret_file: Option<PathBuf>,
    pub save_to_sent_items: bool,
    pub authority: String,
    pub endpoint: String,
    pub timeout_secs: u64,
}

impl Default for GraphSection {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            client_id: String::new(),
            secret: Secret::default(),
            secret_file: None,
            save_to_sent_items: false,
            authority: config::DEFAULT_AUTHORITY.to_string(),
            endpoint: config::DEFAULT_GRAPH_ENDPOINT.to_string(),
            timeout_secs: config::DEFAULT_TIMEOUT.as_secs(),
        }
    }
}

impl GraphSection {
    /// Fill an empty secret from `secret_file`, if one is configured.
    ///
    /// Returns the file that was read, if any.
    ///
    /// # Errors
    /// If the file cannot be read. The secret is left empty.
    pub fn load_secret_file(&mut self) -> io::Result<Option<&Path>> {
        if !self.secret.is_blank() {
            return Ok(None);
        }

        let Some(path) = self.secret_file.as_deref() else {
            return Ok(None);
        };

        let secret = std::fs::read_to_string(path)?;
        self.secret = Secret::new(secret.trim());

        Ok(Some(path))
    }
}

#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct AccessSection {
    pub senders: Vec<String>,
    pub sources: Vec<String>,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AuthSection {
    pub username: String,
    pub password: Secret,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub smtp: SmtpSection,
    pub graph: GraphSection,
    pub access: AccessSection,
    pub auth: Option<AuthSection>,
    pub log: LogConfig,
    pub metrics: MetricsConfig,
    /// Where this configuration was read from, if anywhere
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl Config {
    /// Parse a configuration file.
    ///
    /// # Errors
    /// If the file cannot be read or is not valid RON for [`Config`].
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let mut config: Self = ron::from_str(&content)
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        config.source = Some(path.to_path_buf());

        Ok(config)
    }

    /// Locate and read the configuration file, then apply `cli` on top.
    ///
    /// # Errors
    /// If an explicitly named file does not exist or any file found is
    /// invalid.
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        let defaults = DEFAULT_CONFIG_PATHS.map(PathBuf::from);

        let mut config = match find_config_file(cli.config.as_deref(), &defaults)? {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply(cli);

        Ok(config)
    }

    /// Override file values with whatever was given on the command line.
    pub fn apply(&mut self, cli: &Cli) {
        let smtp = &mut self.smtp;
        if let Some(addr) = &cli.addr {
            smtp.addr.clone_from(addr);
        }
        if let Some(domain) = &cli.domain {
            smtp.domain.clone_from(domain);
        }
        if let Some(recipients) = cli.recipients {
            smtp.recipients = recipients;
        }
        if let Some(max) = cli.max {
            smtp.max = max;
        }
        if let (Some(certificate), Some(key)) = (&cli.cert, &cli.key) {
            smtp.tls = Some(TlsContext::new(certificate, key));
        }

        let graph = &mut self.graph;
        if let Some(sentitems) = cli.sentitems {
            graph.save_to_sent_items = sentitems;
        }
        if let Some(client_id) = &cli.clientid {
            graph.client_id.clone_from(client_id);
        }
        if let Some(tenant_id) = &cli.tenantid {
            graph.tenant_id.clone_from(tenant_id);
        }
        if let Some(secret) = &cli.secret {
            graph.secret = Secret::new(secret.as_str());
        }
        if let Some(secret_file) = &cli.secret_file {
            graph.secret_file = Some(secret_file.clone());
        }

        if let Some(senders) = &cli.senders {
            self.access.senders = parse_address_list(senders);
        }
        if let Some(sources) = &cli.sources {
            self.access.sources = parse_address_list(sources);
        }

        if let Some(level) = &cli.log_level {
            self.log.level = Some(level.clone());
        }
        if let Some(format) = cli.log_format {
            self.log.format = format;
        }

        if let Some(endpoint) = &cli.metrics_endpoint {
            self.metrics.enabled = true;
            self.metrics.endpoint.clone_from(endpoint);
        }
    }

    pub fn smtp_config(&self) -> SmtpConfig {
        SmtpConfig::default()
            .with_hostname(self.smtp.domain.as_str())
            .with_max_recipients(self.smtp.recipients)
            .with_max_message_bytes(self.smtp.max)
            .with_tls(self.smtp.tls.clone())
            .with_insecure_auth(self.smtp.allow_insecure_auth)
            .with_timeouts(self.smtp.timeouts)
    }

    pub fn graph_config(&self) -> GraphConfig {
        GraphConfig::new(
            self.graph.tenant_id.as_str(),
            self.graph.client_id.as_str(),
            self.graph.secret.clone(),
        )
        .with_authority(self.graph.authority.as_str())
        .with_endpoint(self.graph.endpoint.as_str())
        .with_timeout(Duration::from_secs(self.graph.timeout_secs))
    }

    pub fn backend(&self, directory: Arc<dyn Directory>, metrics: Arc<Metrics>) -> Backend {
        let mut builder = Backend::builder(directory)
            .with_allowed_senders(&self.access.senders)
            .with_allowed_sources(&self.access.sources)
            .with_save_to_sent_items(self.graph.save_to_sent_items)
            .with_metrics(metrics);

        if let Some(auth) = &self.auth {
            builder = builder.with_credentials(Credentials::new(
                auth.username.as_str(),
                auth.password.expose(),
            ));
        }

        builder.build()
    }
}

/// Find the configuration file using the following precedence:
/// 1. `explicit` (`--config` or `SMTPD_CONFIG`), which must exist
/// 2. the first of `defaults` that exists
///
/// `Ok(None)` means no file was found and defaults apply.
///
/// # Errors
/// If `explicit` names a file that does not exist.
pub fn find_config_file(
    explicit: Option<&Path>,
    defaults: &[PathBuf],
) -> anyhow::Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(Some(path.to_path_buf()));
        }
        anyhow::bail!("Configuration file {} does not exist", path.display());
    }

    Ok(defaults.iter().find(|path| path.exists()).cloned())
}
