// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Process-signal wiring for the kernel's cancellation tree.
//!
//! Everything long-running in magpie hangs off one root
//! [`CancellationToken`] (agent loop, cron sleeper, heartbeat, channel
//! supervisor). The helpers here connect that root to SIGINT/SIGTERM so
//! `kill` and Ctrl+C both take the orderly path through
//! [`AgentLoop::stop`](crate::AgentLoop::stop) instead of tearing the
//! process down mid-write.

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Resolves once the process receives SIGINT or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())
            .expect("SIGTERM handler registration failed");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
            _ = sigterm.recv() => info!("SIGTERM received"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl+C received");
    }
}

/// Watch for a shutdown signal in the background and cancel `root` when
/// one arrives. The watcher also exits if something else cancels the
/// token first.
pub fn cancel_on_signal(root: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("shutdown signal received, cancelling root token");
                root.cancel();
            }
            _ = root.cancelled() => {}
        }
    });
}
