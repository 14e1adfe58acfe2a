use std::{future::Future, sync::Arc};

use anyhow::Context;
use graph_smtpd_common::{Signal, internal, logging};
use graph_smtpd_core::{Directory, Metrics, Snapshot};
use graph_smtpd_graph::GraphClient;
use graph_smtpd_smtp::Listener;
use tokio::{net::TcpListener, sync::broadcast};

use crate::{config::Config, telemetry};

/// Owns the relay for the lifetime of the process
#[derive(Debug)]
pub struct Controller {
    config: Config,
}

async fn wait_for_signal() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            internal!(level = INFO, "CTRL+C received, shutting down");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate signal received, shutting down");
        }
    };

    Ok(())
}

impl Controller {
    pub const fn new(config: Config) -> Self {
        Self { config }
    }

    /// Install logging and metrics export, connect to Graph and serve until
    /// SIGINT or SIGTERM.
    ///
    /// # Errors
    /// If logging or the metrics exporter cannot be installed, Graph refuses
    /// the credentials, or the listening socket cannot be bound.
    pub async fn run(mut self) -> anyhow::Result<()> {
        logging::init(&self.config.log)?;

        match &self.config.source {
            Some(path) => internal!(level = INFO, "Loaded configuration from {}", path.display()),
            None => internal!(level = INFO, "No configuration file found, running on defaults"),
        }

        let provider = telemetry::init(&self.config.metrics)?;
        if provider.is_some() {
            internal!(level = INFO, "Exporting metrics to {}", self.config.metrics.endpoint);
        }

        let directory = self.directory().await?;
        let socket = Listener::bind(self.config.smtp.addr.as_str())
            .await
            .with_context(|| format!("Unable to listen on {}", self.config.smtp.addr))?;

        let result = self.serve(directory, socket, wait_for_signal()).await;

        if let Some(provider) = provider
            && let Err(err) = provider.shutdown()
        {
            internal!(level = WARN, "Unable to flush metrics: {}", err);
        }

        result.map(|_| ())
    }

    /// The Graph directory described by the configuration. A token is
    /// requested before returning, so credentials are known to work.
    ///
    /// # Errors
    /// If a credential is blank, an endpoint is not a valid URL, or no token
    /// can be obtained from the identity provider.
    pub async fn directory(&mut self) -> anyhow::Result<Arc<dyn Directory>> {
        match self.config.graph.load_secret_file() {
            Ok(Some(path)) => {
                internal!(level = DEBUG, "Read client secret from {}", path.display());
            }
            Ok(None) => {}
            Err(err) => {
                internal!(level = WARN, "Unable to read secret file: {}", err);
            }
        }

        let graph = &self.config.graph;
        let client = GraphClient::new(self.config.graph_config()).inspect_err(|err| {
            internal!(
                level = ERROR,
                "Could not create Graph client for client id {} in tenant {} (secret {}): {}",
                graph.client_id,
                graph.tenant_id,
                graph.secret,
                err
            );
        })?;

        client.verify().await.with_context(|| {
            format!(
                "Unable to obtain a Graph token from {} for client id {}",
                client.token_endpoint(),
                graph.client_id
            )
        })?;

        internal!(level = INFO, "Authenticated to Graph as client id {}", graph.client_id);

        Ok(Arc::new(client))
    }

    /// Serve SMTP on `socket` until `stop` resolves, then let open sessions
    /// finish and report the final counters.
    ///
    /// # Errors
    /// If `stop` fails or the listener gives up.
    pub async fn serve<F>(
        &self,
        directory: Arc<dyn Directory>,
        socket: TcpListener,
        stop: F,
    ) -> anyhow::Result<Snapshot>
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        let metrics = Arc::new(Metrics::new());
        let backend = Arc::new(self.config.backend(directory, Arc::clone(&metrics)));
        let listener = Listener::new(backend, Arc::new(self.config.smtp_config()));

        let (shutdown, receiver) = broadcast::channel(16);

        let serving = listener.serve(socket, receiver);
        tokio::pin!(serving);

        let result = tokio::select! {
            result = &mut serving => result.context("SMTP listener failed"),
            stopped = stop => {
                match stopped {
                    Ok(()) => {
                        // Nobody listening means the listener is already gone
                        let _ = shutdown.send(Signal::Shutdown);
                        serving.await.context("SMTP listener failed")
                    }
                    Err(err) => Err(err),
                }
            }
        };

        let snapshot = metrics.snapshot();
        internal!(
            level = INFO,
            "Shut down after {} connection(s): {} sent, {} denied, {} errored",
            snapshot.connections,
            snapshot.sent,
            snapshot.denied,
            snapshot.errored
        );

        result.map(|()| snapshot)
    }
}
