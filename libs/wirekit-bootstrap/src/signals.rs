use anyhow::Result;
use std::future::Future;
use std::pin::Pin;
use tokio::signal;

/// Wait for termination signals (Ctrl+C, SIGTERM)
pub async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        sigterm.recv().await;
        Ok::<(), std::io::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<std::io::Result<()>>();

    tokio::select! {
        result = signal::ctrl_c() => {
            result.inspect_err(|e| tracing::error!(%e, "Failed to listen for Ctrl+C"))?;
            tracing::info!("Received Ctrl+C signal");
        }
        result = terminate => {
            result.inspect_err(|e| tracing::error!(%e, "Failed to install SIGTERM handler"))?;
            tracing::info!("Received SIGTERM signal");
        }
    }

    tracing::info!("Shutdown signal received, initiating graceful shutdown");
    Ok(())
}

/// Signal waiter packaged for `ShutdownOptions::Future`.
///
/// If the primary waiter fails, falls back to plain Ctrl+C.
pub fn shutdown_signal() -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async {
        if let Err(e) = wait_for_shutdown().await {
            tracing::warn!(
                error = %e,
                "shutdown: primary waiter failed; falling back to ctrl_c()"
            );
            let _ = signal::ctrl_c().await;
        }
    })
}
