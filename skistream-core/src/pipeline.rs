use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::buffer::{BufferStore, LogType};
use crate::config::Settings;
use crate::metrics::start_metrics_server;
use crate::sink::Ingest;
use crate::streamer::Streamer;
use crate::{Error, Result};

/// Streams all three logs into `ingest` until SIGINT or SIGTERM.
pub async fn run<C>(settings: Settings, ingest: C) -> Result<()>
where
    C: Ingest + Clone + Sync + 'static,
{
    let cln_token = CancellationToken::new();
    let shutdown_cln_token = cln_token.clone();

    // wait for SIG{INT,TERM} and invoke cancellation token.
    let shutdown_handle = tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_cln_token.cancel();
    });

    let result = start(settings, ingest, cln_token).await;
    if !shutdown_handle.is_finished() {
        shutdown_handle.abort();
    }
    result
}

/// Opens the buffer store and runs one streamer per log, plus the metrics server when an
/// address is configured, until `cancel` fires. The first task to fail cancels the others and
/// its error is returned once they have all stopped.
pub async fn start<C>(settings: Settings, ingest: C, cancel: CancellationToken) -> Result<()>
where
    C: Ingest + Clone + Sync + 'static,
{
    let store = BufferStore::initialize(&settings.store).await?;
    for log in LogType::ALL {
        let pending = store.pending(log).await?;
        info!(%log, pending, "Records waiting to be streamed");
    }

    let mut tasks = JoinSet::new();
    if let Some(addr) = settings.metrics_addr {
        tasks.spawn(start_metrics_server(addr, cancel.clone()));
    }

    for log in LogType::ALL {
        let store = store.clone();
        let ingest = ingest.clone();
        let config = settings.streamer.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let streamer = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                streamer = Streamer::init(log, store, ingest, config) => streamer?,
            };
            streamer.run(cancel).await
        });
    }

    let mut result = Ok(());
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.map_err(|e| Error::Task(e.to_string())).and_then(|r| r);
        if let Err(e) = outcome {
            error!(error = %e, "Pipeline task failed, shutting down");
            cancel.cancel();
            if result.is_ok() {
                result = Err(e);
            }
        }
    }

    store.close().await;
    info!("Pipeline stopped");
    result
}

/// Resolves on the first SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(?e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C signal");
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => {
                error!(?e, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
