use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::reaper::{KubeCluster, Reaper};
use crate::server::spawn_http_server;

/// The application object for when the reaper is running as a daemon.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the reaper control loop.
    reaper: JoinHandle<Result<()>>,
    /// The join handle of the healthcheck & metrics server.
    http_server: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // App shutdown channel.
        let (shutdown_tx, shutdown_rx) = broadcast::channel(10);

        // Initialize K8s client.
        let client = kube::Client::try_default().await.context("error initializing K8s client")?;

        // Spawn various core tasks.
        let cluster = KubeCluster::new(client, config.clone()).await.context("error initializing cluster access")?;
        let reaper = Reaper::new(cluster, config.clone(), shutdown_tx.subscribe()).spawn();
        let http_server = spawn_http_server(&config, shutdown_tx.subscribe());

        Ok(Self {
            _config: config,
            shutdown_rx: BroadcastStream::new(shutdown_rx),
            shutdown_tx,
            reaper,
            http_server,
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

        // Begin shutdown routine. The reaper finishes its in-flight cycle before
        // exiting, so deletes are never left half-applied.
        tracing::debug!("Project Reaper is shutting down");
        if let Err(err) = self.reaper.await.context("error joining reaper handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down reaper");
        }
        if let Err(err) = self.http_server.await.context("error joining http server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down http server");
        }

        tracing::debug!("Project Reaper shutdown complete");
        Ok(())
    }
}
