use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::Config;
use crate::gateway::Dispatcher;
use crate::http::connection::Connection;

/// Binds the configured address and serves until `shutdown` resolves.
pub async fn run<F>(cfg: &Config, dispatcher: Arc<Dispatcher>, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    let listener = TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.listen_addr))?;
    info!("Listening on {}", cfg.listen_addr);

    serve(listener, dispatcher, shutdown, cfg.shutdown_grace).await
}

/// Accepts connections until `shutdown` resolves, then stops accepting,
/// lets in-flight requests finish for up to `grace` and abandons the rest.
pub async fn serve<F>(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    shutdown: F,
    grace: Duration,
) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut connections = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                };
                tracing::debug!("Accepted connection from {}", peer);

                let dispatcher = Arc::clone(&dispatcher);
                let shutdown = shutdown_rx.clone();
                connections.spawn(async move {
                    let mut conn = Connection::new(socket, dispatcher, shutdown);
                    if let Err(e) = conn.run().await {
                        warn!("Connection error from {}: {}", peer, e);
                    }
                });
            }

            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
        }

        // reap finished connections
        while connections.try_join_next().is_some() {}
    }

    drop(listener);
    let _ = shutdown_tx.send(true);

    if !connections.is_empty() {
        info!(connections = connections.len(), "Draining connections");
    }

    let drained = tokio::time::timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(
            connections = connections.len(),
            "Shutdown grace period elapsed, abandoning in-flight requests"
        );
        connections.abort_all();
        while connections.join_next().await.is_some() {}
    }

    info!("Server stopped");
    Ok(())
}
