//! Shutdown signals for the gate binary.

use std::fmt;
use tokio::signal;
use tracing::info;

/// Why the gate was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT, or Ctrl+C on Windows.
    Interrupt,
    /// SIGTERM.
    Terminate,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Interrupt => f.write_str("interrupt"),
            ShutdownReason::Terminate => f.write_str("terminate"),
        }
    }
}

/// Returns once the process is asked to stop.
pub async fn wait_for_shutdown() -> std::io::Result<ShutdownReason> {
    #[cfg(unix)]
    let reason = {
        use signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sigint.recv() => ShutdownReason::Interrupt,
            _ = sigterm.recv() => ShutdownReason::Terminate,
        }
    };

    #[cfg(not(unix))]
    let reason = {
        signal::ctrl_c().await?;
        ShutdownReason::Interrupt
    };

    info!(%reason, "📡 Gate received shutdown signal");
    Ok(reason)
}
