//! Graceful Shutdown Handling
//!
//! The relay runs until the operator presses Enter or the process receives
//! SIGTERM/SIGINT. Background tasks subscribe to the coordinator and are
//! cancelled when shutdown begins.

use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};

use crate::registry::SessionRegistry;
use crate::Result;

/// What ended the wait for shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    KeyPress,
    Signal(&'static str),
}

/// Shutdown coordinator that manages graceful shutdown process
pub struct ShutdownCoordinator {
    /// Broadcast sender for shutdown signal
    shutdown_tx: broadcast::Sender<()>,
    /// Upper bound for stopping every session
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            shutdown_tx,
            timeout,
        }
    }

    /// Get a shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Broadcast shutdown to every subscriber
    pub fn trigger(&self) {
        if let Err(e) = self.shutdown_tx.send(()) {
            debug!("No shutdown subscribers: {}", e);
        }
    }

    /// Block until Enter is pressed (when `watch_keyboard` is set) or a
    /// termination signal arrives, then broadcast shutdown.
    ///
    /// If stdin is closed, only signals end the wait.
    pub async fn wait_for_shutdown(&self, watch_keyboard: bool) -> Result<ShutdownReason> {
        let key_press = if watch_keyboard {
            Some(spawn_key_listener()?)
        } else {
            None
        };

        let reason = tokio::select! {
            reason = wait_for_signal() => reason?,
            _ = wait_for_key(key_press) => {
                info!("Key pressed, initiating graceful shutdown");
                ShutdownReason::KeyPress
            }
        };

        self.trigger();
        Ok(reason)
    }

    /// Stop every session of `registry`, giving up after the timeout
    pub async fn shutdown_registry(&self, registry: &SessionRegistry) -> Result<()> {
        info!("Initiating graceful shutdown of {} session(s)", registry.len());
        let start_time = Instant::now();

        match tokio::time::timeout(self.timeout, registry.stop_all()).await {
            Ok(()) => {
                info!("All sessions stopped in {:?}", start_time.elapsed());
                Ok(())
            }
            Err(_) => {
                warn!(
                    "Shutdown timeout reached after {:?} with {} session(s) still running",
                    start_time.elapsed(),
                    registry.running_count().await
                );
                Err(anyhow::anyhow!("Shutdown timed out after {:?}", self.timeout))
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<ShutdownReason> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

    let reason = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    info!("Received {}, initiating graceful shutdown", reason);
    Ok(ShutdownReason::Signal(reason))
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<ShutdownReason> {
    signal::ctrl_c().await?;
    info!("Received Ctrl+C, initiating graceful shutdown");
    Ok(ShutdownReason::Signal("Ctrl+C"))
}

async fn wait_for_key(key_press: Option<oneshot::Receiver<()>>) {
    match key_press {
        Some(rx) => {
            if rx.await.is_err() {
                debug!("stdin closed, waiting for a signal instead");
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

/// Read one line from stdin on a plain thread.
///
/// A tokio stdin read cannot be cancelled and would hold up runtime
/// shutdown, so the read lives on a detached thread instead.
fn spawn_key_listener() -> Result<oneshot::Receiver<()>> {
    let (tx, rx) = oneshot::channel();

    std::thread::Builder::new()
        .name("keypress".to_string())
        .spawn(move || {
            let mut line = String::new();
            match std::io::stdin().read_line(&mut line) {
                Ok(0) => {}
                Ok(_) => {
                    let _ = tx.send(());
                }
                Err(e) => error!("Failed to read stdin: {}", e),
            }
        })?;

    Ok(rx)
}

/// Shutdown-aware task handle that can be gracefully cancelled
pub struct ShutdownAwareTask {
    handle: tokio::task::JoinHandle<()>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl ShutdownAwareTask {
    /// Create a new shutdown-aware task
    pub fn spawn<F, Fut>(
        shutdown_coordinator: &ShutdownCoordinator,
        task_name: &str,
        task_fn: F,
    ) -> Self
    where
        F: FnOnce(broadcast::Receiver<()>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let shutdown_rx = shutdown_coordinator.subscribe();
        let task_name = task_name.to_string();

        let handle = tokio::spawn(async move {
            debug!("Starting shutdown-aware task: {}", task_name);
            task_fn(shutdown_rx).await;
            debug!("Shutdown-aware task completed: {}", task_name);
        });

        Self {
            handle,
            shutdown_rx: shutdown_coordinator.subscribe(),
        }
    }

    /// Wait for the task to complete or shutdown signal
    pub async fn wait_for_completion_or_shutdown(mut self) -> Result<()> {
        tokio::select! {
            result = &mut self.handle => {
                match result {
                    Ok(()) => {
                        debug!("Task completed successfully");
                        Ok(())
                    }
                    Err(e) if e.is_cancelled() => {
                        debug!("Task was cancelled");
                        Ok(())
                    }
                    Err(e) => {
                        error!("Task failed: {}", e);
                        Err(anyhow::anyhow!("Task failed: {}", e))
                    }
                }
            }
            _ = self.shutdown_rx.recv() => {
                debug!("Received shutdown signal, cancelling task");
                self.handle.abort();
                Ok(())
            }
        }
    }
}
