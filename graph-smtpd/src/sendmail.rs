//! `graph-sendmail`: send one message read from standard input.

use std::{fs::File, path::Path, path::PathBuf};

use anyhow::Context;
use clap::Parser;
use graph_smtpd_common::internal;
use graph_smtpd_core::{AttachmentSource, Directory, MessageBuilder, OutboundMessage};
use graph_smtpd_graph::{GraphClient, GraphConfig};
use mailparse::{MailAddr, MailHeader, MailHeaderMap, ParsedMail};

/// Send a message from stdin through the Microsoft Graph sendMail API
#[derive(Parser, Debug)]
#[command(name = "graph-sendmail", version, about, long_about = None)]
pub struct SendmailCli {
    /// Application (client) id registered in Entra ID
    #[arg(long, env = "SENDMAIL_CLIENTID")]
    pub clientid: String,

    /// Directory (tenant) id
    #[arg(long, env = "SENDMAIL_TENANTID")]
    pub tenantid: String,

    /// Client secret
    #[arg(long, env = "SENDMAIL_SECRET", hide_env_values = true)]
    pub secret: String,

    /// Keep a copy in the sender's Sent Items
    #[arg(
        long,
        env = "SENDMAIL_SENTITEMS",
        action = clap::ArgAction::Set,
        num_args = 0..=1,
        default_value = "false",
        default_missing_value = "true"
    )]
    pub sentitems: bool,

    /// Attach a file in addition to any attachments in the message
    #[arg(long = "attach", value_name = "FILE")]
    pub attach: Vec<PathBuf>,
}

fn first_address(header: &MailHeader<'_>) -> Option<String> {
    mailparse::addrparse_header(header)
        .ok()?
        .iter()
        .find_map(|address| match address {
            MailAddr::Single(single) => Some(single.addr.clone()),
            MailAddr::Group(group) => group.addrs.first().map(|single| single.addr.clone()),
        })
}

/// The mailbox the message is sent as: the `Sender` header, else the first
/// `From` address.
pub fn sender(mail: &ParsedMail<'_>) -> Option<String> {
    ["Sender", "From"]
        .into_iter()
        .filter_map(|name| mail.headers.get_first_header(name))
        .find_map(first_address)
}

fn file_attachment(path: &Path) -> anyhow::Result<AttachmentSource> {
    let file = File::open(path)
        .with_context(|| format!("Unable to open attachment {}", path.display()))?;

    let name = path.file_name().map_or_else(
        || path.display().to_string(),
        |name| name.to_string_lossy().into_owned(),
    );

    Ok(AttachmentSource::Reader {
        name,
        content_type: "application/octet-stream".to_string(),
        reader: Box::new(file),
    })
}

/// Turn a raw RFC 5322 message into the outbound message and the address it
/// is sent as.
///
/// # Errors
/// If the message cannot be parsed, names no sender, or an attachment
/// cannot be read.
pub fn compose(
    raw: &[u8],
    attach: &[PathBuf],
    save_to_sent_items: bool,
) -> anyhow::Result<(String, OutboundMessage)> {
    let mail = mailparse::parse_mail(raw).context("Unable to read message")?;
    let from = sender(&mail).context("Message has neither a Sender nor a From address")?;

    let files = attach
        .iter()
        .map(|path| file_attachment(path))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let message = MessageBuilder::from_mail(from.as_str(), &mail)?
        .attachments(files)
        .save_to_sent_items(save_to_sent_items)
        .build()?;

    Ok((from, message))
}

/// Compose `raw` and send it once through `directory`.
///
/// # Errors
/// If composing fails, the sender cannot be resolved or Graph refuses the
/// message.
pub async fn deliver(
    directory: &dyn Directory,
    raw: &[u8],
    attach: &[PathBuf],
    save_to_sent_items: bool,
) -> anyhow::Result<()> {
    let (from, message) = compose(raw, attach, save_to_sent_items)?;

    let user = directory
        .resolve_user(&from)
        .await
        .with_context(|| format!("Unable to resolve sender {from}"))?;

    directory
        .send_mail(&user, &message)
        .await
        .with_context(|| format!("Error sending email as {from}"))?;

    internal!(
        level = INFO,
        "Sent message from {} to {} recipient(s)",
        from,
        message.recipients().count()
    );

    Ok(())
}

impl SendmailCli {
    /// Build the Graph client described by the flags.
    ///
    /// # Errors
    /// If any credential is blank.
    pub fn client(&self) -> anyhow::Result<GraphClient> {
        GraphClient::new(GraphConfig::new(
            self.tenantid.as_str(),
            self.clientid.as_str(),
            self.secret.as_str(),
        ))
        .with_context(|| {
            format!(
                "Could not create Graph client for client id {} in tenant {}",
                self.clientid, self.tenantid
            )
        })
    }
}
