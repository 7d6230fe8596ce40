//! Wires the sink, the transfer core and the WebSocket server together.

use std::sync::Arc;
use std::time::Duration;

use uplink_relay_server::RelayServer;
use uplink_transfer::{FsSink, Relay};

use crate::config::RelayConfig;

/// Runs the relay until Ctrl-C or a server failure.
pub async fn run(config: RelayConfig) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&config.sink.root).await?;
    let sink = Arc::new(FsSink::new(config.sink.root.clone()));

    let relay = Relay::with_system_memory(&config.transfer, sink)?;
    relay.start();

    let server = RelayServer::new(config.server_config(), relay.clone());
    let listener = server.bind().await?;
    if let Some(addr) = server.local_addr().await {
        tracing::info!(%addr, "WebSocket server listening");
    }

    let server_run = Arc::clone(&server);
    let mut serving = tokio::spawn(async move { server_run.serve(listener).await });

    tracing::info!("relay ready");

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
            Ok(())
        }
        joined = &mut serving => match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow::anyhow!("server error: {e}")),
            Err(e) => Err(anyhow::anyhow!("server task failed: {e}")),
        },
    };

    // Live transfers end as cancelled before the connections go away, so
    // every open channel still receives its terminal event.
    let cancelled = relay.shutdown();
    if cancelled > 0 {
        tracing::info!(cancelled, "cancelled live transfers");
        drain(&relay, config.transfer.session.cancel_timeout()).await;
    }
    server.shutdown();
    if !serving.is_finished() {
        let _ = serving.await;
    }

    let stats = relay.stats();
    tracing::info!(
        admitted = stats.admission.admitted_total,
        denied = stats.admission.denied_total,
        forced_teardowns = stats.forced_teardowns,
        reaped = stats.reaped,
        "final counters"
    );
    result
}

/// Waits for cancelled sessions to settle, bounded by `limit`.
async fn drain(relay: &Relay, limit: Duration) {
    let deadline = tokio::time::Instant::now() + limit;
    while relay.stats().active_sessions > 0 {
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!(
                remaining = relay.stats().active_sessions,
                "sessions still live after cancel timeout"
            );
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
