use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Cancels `token` when the process receives a termination signal. Spawned
/// once per binary; every long-running loop selects on the token.
pub async fn listen_shutdown(token: CancellationToken) {
    let signal = wait_for_signal().await;
    warn!("shutdown signal received: signal={signal}");
    token.cancel();
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
            }
        }
        (sigterm, sigint) => {
            if let Err(err) = &sigterm {
                warn!("failed to install SIGTERM handler: error={err}");
            }
            if let Err(err) = &sigint {
                warn!("failed to install SIGINT handler: error={err}");
            }
            let _ = tokio::signal::ctrl_c().await;
            "SIGINT"
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "SIGINT"
}
