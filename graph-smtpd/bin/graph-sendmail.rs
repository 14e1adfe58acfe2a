#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

use std::io::Read;

use anyhow::Context;
use clap::Parser;
use graph_smtpd::sendmail::{SendmailCli, deliver};
use graph_smtpd_common::logging::{self, LogConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = SendmailCli::parse();
    logging::init(&LogConfig::default())?;

    let client = cli.client()?;

    let mut raw = Vec::new();
    std::io::stdin()
        .read_to_end(&mut raw)
        .context("Unable to read message from stdin")?;

    deliver(&client, &raw, &cli.attach, cli.sentitems).await
}
