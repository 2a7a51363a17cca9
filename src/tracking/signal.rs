use tokio::signal::ctrl_c;
use tracing::warn;

/// Resolve on SIGINT or SIGTERM and return the signal's name
#[cfg(unix)]
pub async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(err) => {
            warn!(error = %err, "Cannot listen for SIGTERM, only Ctrl+C triggers shutdown");
            return interrupt().await;
        }
    };

    tokio::select! {
        name = interrupt() => name,
        _ = terminate.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
pub async fn shutdown_signal() -> &'static str {
    interrupt().await
}

async fn interrupt() -> &'static str {
    if let Err(err) = ctrl_c().await {
        warn!(error = %err, "Cannot listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    "SIGINT"
}
