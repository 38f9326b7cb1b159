//! OS termination signals.
//!
//! On Unix, SIGINT and SIGTERM start the shutdown sequence (with
//! [`tokio::signal::ctrl_c`] as a fallback). Elsewhere only Ctrl-C is
//! handled.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use super::shutdown::ShutdownController;

/// Registers termination-signal handlers and spawns a task that triggers
/// `controller` when one arrives.
///
/// Registration happens before this function returns, so a failure to
/// install a handler surfaces here instead of as a spurious shutdown.
///
/// # Errors
///
/// Returns the I/O error from the OS if a handler cannot be installed.
#[cfg(unix)]
pub fn trigger_on_signal(controller: Arc<ShutdownController>) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        let received = tokio::select! {
            _ = tokio::signal::ctrl_c() => "ctrl-c",
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        info!(signal = received, "termination signal received");
        controller.trigger();
    }))
}

/// Registers a Ctrl-C handler and spawns a task that triggers `controller`
/// when it fires.
///
/// # Errors
///
/// Never fails on this platform; the signature matches the Unix variant.
#[cfg(not(unix))]
pub fn trigger_on_signal(controller: Arc<ShutdownController>) -> std::io::Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(signal = "ctrl-c", "termination signal received");
            controller.trigger();
        }
    }))
}
