//! The supervised program: greet every connection with who answered it.

use std::io;
use std::sync::Arc;

use moult::{GracefulListener, RuntimeState};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub async fn serve(state: RuntimeState) {
    let greeting = Arc::new(greeting(&state));
    if !state.enabled {
        warn!("Running without supervision, upgrades are off");
    }
    info!(
        generation = state.generation,
        listeners = state.listeners.len(),
        started_at = %state.started_at,
        "Serving"
    );

    let mut loops = JoinSet::new();
    for listener in &state.listeners {
        loops.spawn(accept_loop(Arc::clone(listener), Arc::clone(&greeting)));
    }

    tokio::select! {
        _ = state.graceful_shutdown.requested() => info!("Handing over to the next generation"),
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
    }

    for listener in &state.listeners {
        listener.close().await;
    }
    while loops.join_next().await.is_some() {}
    info!(generation = state.generation, "Stopped");
}

fn greeting(state: &RuntimeState) -> String {
    let id = &state.id[..state.id.len().min(12)];
    format!(
        "hello from generation {} (pid {}, binary {})\n",
        state.generation,
        std::process::id(),
        if id.is_empty() { "unknown" } else { id }
    )
}

async fn accept_loop(listener: Arc<GracefulListener>, greeting: Arc<String>) {
    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) if err.kind() == io::ErrorKind::NotConnected => break,
            Err(err) => {
                warn!(address = %listener.local_addr(), error = %err, "Accept failed");
                continue;
            }
        };
        let greeting = Arc::clone(&greeting);
        tokio::spawn(async move {
            let written = async {
                stream.write_all(greeting.as_bytes()).await?;
                stream.shutdown().await
            };
            if let Err(err) = written.await {
                debug!(peer = %peer, error = %err, "Greeting not delivered");
            }
        });
    }
}
