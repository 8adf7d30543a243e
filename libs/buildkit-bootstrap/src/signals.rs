use anyhow::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Wait for termination signals (Ctrl+C, SIGTERM)
pub async fn wait_for_shutdown() -> Result<()> {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(%e, "Failed to install Ctrl+C handler");
            return Err(e);
        }
        Ok(())
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal_handler) => {
                signal_handler.recv().await;
                Ok(())
            }
            Err(e) => {
                tracing::error!(%e, "Failed to install SIGTERM handler");
                Err(e)
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<std::io::Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            match result {
                Ok(_) => tracing::info!(signal = "SIGINT", "received a stop signal"),
                Err(e) => return Err(e.into()),
            }
        },
        result = terminate => {
            match result {
                Ok(_) => tracing::info!(signal = "SIGTERM", "received a stop signal"),
                Err(e) => return Err(e.into()),
            }
        },
    }

    Ok(())
}

/// Returns a token that is cancelled once a termination signal arrives.
///
/// If the primary waiter cannot install its handlers it falls back to `ctrl_c()`.
pub fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let c = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown().await {
            tracing::warn!(
                error = %e,
                "shutdown: primary waiter failed; falling back to ctrl_c()"
            );
            let _ = signal::ctrl_c().await;
        }
        tracing::info!("stopping...");
        c.cancel();
    });
    cancel
}
