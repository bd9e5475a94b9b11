//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! The automatic backup scheduler is built with the coordinator's token, so
//! the periodic loop and a backup it is creating both observe shutdown: a
//! create stops at its next source item and cleans up its partial archive.

use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// How long shutdown waits for background work to notice cancellation.
pub const GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Shutdown coordinator
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled when shutdown begins
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for SIGTERM or SIGINT, then cancel the token.
    pub async fn wait_for_signal(&self) -> std::io::Result<()> {
        #[cfg(unix)]
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;

        #[cfg(unix)]
        let terminate = terminate.recv();

        #[cfg(not(unix))]
        let terminate = std::future::pending::<Option<()>>();

        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = self.token.cancelled() => {
                info!("Shutdown requested");
            }
        }

        self.token.cancel();
        Ok(())
    }

    /// Give background tasks a moment to observe cancellation
    pub async fn shutdown(&self) {
        info!("Graceful shutdown initiated");
        self.token.cancel();
        tokio::time::sleep(GRACE_PERIOD).await;
        info!("Graceful shutdown complete");
    }
}
