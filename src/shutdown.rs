use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// What ended the wait for shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    CtrlC,
    Terminate,
    /// [`ShutdownManager::shutdown`] was called.
    Requested,
}

/// Graceful shutdown trigger shared by the engine and its callers.
#[derive(Debug, Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests shutdown. Later calls are no-ops.
    pub fn shutdown(&self) {
        if self.token.is_cancelled() {
            debug!("shutdown already requested");
            return;
        }
        info!("shutdown requested");
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once shutdown has been requested.
    pub async fn wait(&self) {
        self.token.cancelled().await;
    }

    /// Waits for Ctrl-C, SIGTERM or an explicit request, whichever comes
    /// first.
    pub async fn wait_for_signal(&self) -> ShutdownReason {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("failed to install Ctrl+C handler: {e}");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    error!("failed to install SIGTERM handler: {e}");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        let reason = tokio::select! {
            _ = ctrl_c => ShutdownReason::CtrlC,
            _ = terminate => ShutdownReason::Terminate,
            _ = self.wait() => ShutdownReason::Requested,
        };
        info!(?reason, "shutting down");
        reason
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn test_shutdown_wakes_waiters() {
        let manager = ShutdownManager::new();
        assert!(!manager.is_shutdown());

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.wait_for_signal().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.shutdown();

        let reason = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(reason, ShutdownReason::Requested);
        assert!(manager.is_shutdown());
    }

    #[tokio::test]
    async fn test_double_shutdown() {
        let manager = ShutdownManager::new();
        manager.shutdown();
        manager.shutdown();
        timeout(Duration::from_millis(100), manager.wait())
            .await
            .unwrap();
    }
}
