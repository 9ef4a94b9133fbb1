//! Graceful shutdown signal handling.
//!
//! Cross-platform termination-signal listener; the returned receiver fires
//! once when shutdown is requested.

use tokio::sync::oneshot;
use tracing::info;

/// Set up a shutdown signal handler.
///
/// Unix: SIGINT and SIGTERM. Windows: Ctrl+C.
pub async fn setup_shutdown_handler() -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigint =
                signal(SignalKind::interrupt()).expect("Failed to create SIGINT handler");
            let mut sigterm =
                signal(SignalKind::terminate()).expect("Failed to create SIGTERM handler");

            tokio::select! {
                _ = sigint.recv() => {
                    info!("SIGINT received - initiating graceful shutdown");
                }
                _ = sigterm.recv() => {
                    info!("SIGTERM received - initiating graceful shutdown");
                }
            }
        }

        #[cfg(windows)]
        {
            use tokio::signal::windows::ctrl_c;

            let mut ctrl_c = ctrl_c().expect("Failed to create Ctrl+C handler");
            ctrl_c.recv().await;
            info!("Ctrl+C received - initiating graceful shutdown");
        }

        let _ = tx.send(());
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_shutdown_handler_creation() {
        let shutdown_rx = setup_shutdown_handler().await;

        // No signal was sent, so the receiver must still be pending.
        let result = timeout(Duration::from_millis(10), shutdown_rx).await;
        assert!(result.is_err());
    }
}
