use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::k8s::Controller;
use crate::ledger::KubeNodeStore;
use crate::provisioner::{Provisioner, METRIC_DELETE_RESULTS, METRIC_PROVISION_RESULTS};
use crate::server::spawn_http_server;

/// The application object for when the provisioner is running as a server.
pub struct App {
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the HTTP server.
    server: JoinHandle<Result<()>>,
    /// The join handle of the K8s controller.
    controller: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: &Config) -> Result<Self> {
        register_metrics();

        // App shutdown channel.
        let (shutdown_tx, shutdown_rx) = broadcast::channel(10);

        // Initialize K8s client.
        let client = kube::Client::try_default().await.context("error initializing K8s client")?;

        // Prepare the provisioner's local state before accepting any work.
        let store = Arc::new(KubeNodeStore::new(client.clone()));
        let provisioner = Provisioner::new(config, store, shutdown_tx.clone());
        provisioner.init().await.context("error initializing provisioner directories")?;

        // Spawn various core tasks.
        let server = spawn_http_server(config, shutdown_tx.subscribe());
        let controller = Controller::new(client, provisioner, shutdown_tx.clone()).spawn();

        Ok(Self {
            shutdown_rx: BroadcastStream::new(shutdown_rx),
            shutdown_tx,
            server,
            controller,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("volume provisioner is shutting down");
        if let Err(err) = self.server.await.context("error joining http server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down http server");
        }
        if let Err(err) = self.controller.await.context("error joining k8s controller handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down k8s controller");
        }

        tracing::debug!("volume provisioner shutdown complete");
        Ok(())
    }
}

/// Register the provisioner's metrics with the global recorder.
fn register_metrics() {
    metrics::register_counter!(METRIC_PROVISION_RESULTS, metrics::Unit::Count, "provisioning operations by outcome");
    metrics::register_counter!(METRIC_DELETE_RESULTS, metrics::Unit::Count, "deletion operations by outcome");
    metrics::register_counter!(crate::ledger::METRIC_LEDGER_CONFLICTS, metrics::Unit::Count, "conflicting node label updates");
    metrics::register_histogram!(
        crate::placement::METRIC_PLACEMENT_WAIT_SECONDS,
        metrics::Unit::Seconds,
        "time spent waiting for placement decisions"
    );
}
