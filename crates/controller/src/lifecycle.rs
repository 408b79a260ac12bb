//! Process lifecycle: one cancellation token, cancelled on SIGINT/SIGTERM.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Owns the process-wide cancellation token every blocking wait observes.
#[derive(Debug, Clone, Default)]
pub struct Lifecycle {
    token: CancellationToken,
}

impl Lifecycle {
    pub fn new() -> Self { Self::default() }

    pub fn token(&self) -> CancellationToken { self.token.clone() }

    /// Cancel the token. Idempotent.
    pub fn shutdown(&self) { self.token.cancel(); }

    pub fn is_shutting_down(&self) -> bool { self.token.is_cancelled() }

    /// Cancel the token on the first interrupt/termination signal.
    pub fn install_signal_handlers(&self) -> JoinHandle<()> {
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                sig = shutdown_signal() => {
                    info!(signal = sig, "received signal, exiting");
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        })
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "unable to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c() => "SIGINT",
                _ = term.recv() => "SIGTERM",
            }
        }
        Err(e) => {
            warn!(error = %e, "unable to listen for SIGTERM; only ctrl-c will stop the controller");
            ctrl_c().await;
            "SIGINT"
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> &'static str {
    ctrl_c().await;
    "ctrl-c"
}
