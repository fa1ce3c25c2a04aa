//! Graceful shutdown for the worker's background tasks.
//!
//! When a shutdown signal is received (Ctrl+C or SIGTERM):
//! 1. `true` is broadcast on the shutdown `watch` channel
//! 2. Each scheduler finishes its current run and exits its loop
//! 3. Each task is awaited with the configured timeout
//! 4. Clean exit

use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A named background task.
pub struct Task {
    /// Name used in shutdown logs
    pub name: &'static str,
    /// Handle of the spawned loop
    pub handle: JoinHandle<()>,
}

impl Task {
    /// Wrap a spawned loop.
    #[must_use]
    pub const fn new(name: &'static str, handle: JoinHandle<()>) -> Self {
        Self { name, handle }
    }
}

/// Wait for all background tasks to shut down gracefully.
///
/// Gives each task `timeout` to finish its current work; a task that
/// overruns is aborted.
pub async fn await_shutdown(tasks: Vec<Task>, timeout: Duration) {
    for Task { name, handle } in tasks {
        let abort = handle.abort_handle();
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => info!(task = name, "Task stopped gracefully"),
            Ok(Err(e)) => warn!(task = name, error = %e, "Task failed"),
            Err(_) => {
                warn!(task = name, "Task shutdown timed out, aborting");
                abort.abort();
            }
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// Returns when the process receives SIGINT (Ctrl+C) or SIGTERM. A handler
/// that cannot be installed is logged and never fires.
pub async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        () = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_finished_tasks_are_awaited() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(async move {
            let _ = tx.send(());
        });

        await_shutdown(vec![Task::new("quick", handle)], Duration::from_secs(1)).await;

        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_overrunning_task_is_aborted() {
        let handle = tokio::spawn(std::future::pending::<()>());
        let abort = handle.abort_handle();

        await_shutdown(vec![Task::new("stuck", handle)], Duration::from_millis(50)).await;
        for _ in 0..10 {
            if abort.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert!(abort.is_finished());
    }
}
