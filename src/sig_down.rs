//! Graceful shutdown on SIGINT/SIGTERM.

use tokio_util::sync::CancellationToken;

/// Cancels a shared token when the process is asked to stop.
#[derive(Debug)]
pub struct SigDown {
    token: CancellationToken,
}

impl SigDown {
    #[cfg(unix)]
    pub fn try_new() -> Result<Self, std::io::Error> {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let token = CancellationToken::new();
        let inner = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("SIGTERM received, shutting down"),
                _ = sigint.recv() => tracing::info!("SIGINT received, shutting down"),
            }
            inner.cancel();
        });
        Ok(Self { token })
    }

    #[cfg(not(unix))]
    pub fn try_new() -> Result<Self, std::io::Error> {
        let token = CancellationToken::new();
        let inner = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Ctrl-C received, shutting down");
            }
            inner.cancel();
        });
        Ok(Self { token })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }
}
