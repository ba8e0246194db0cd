//! Background task handles and cooperative shutdown.
//!
//! Every long-running loop (orchestrator, storage consumer, job worker) runs as a
//! tokio task that watches a [`ShutdownSignal`] at its wait points, so a stop
//! request is observed within one wait interval.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

/// Create a connected shutdown trigger and signal.
pub fn shutdown_channel() -> (watch::Sender<bool>, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (tx, ShutdownSignal(rx))
}

/// Receiving side of a shutdown request. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

impl ShutdownSignal {
    /// Whether shutdown was requested or the trigger was dropped.
    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow() || self.0.has_changed().is_err()
    }

    /// Resolve once shutdown is requested (or the trigger is dropped).
    pub async fn wait(&mut self) {
        while !*self.0.borrow_and_update() {
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Handle to control and join a background task.
#[derive(Debug)]
pub struct WorkerHandle<T = ()> {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<T>>,
}

impl<T: Send + 'static> WorkerHandle<T> {
    pub fn new(shutdown: watch::Sender<bool>, join: JoinHandle<T>) -> Self {
        Self {
            shutdown,
            join: Some(join),
        }
    }

    /// Ask the task to stop without waiting for it.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Request graceful shutdown and wait for the task to stop.
    ///
    /// Returns the task's output, or `None` if it panicked or was aborted.
    pub async fn shutdown(mut self) -> Option<T> {
        self.request_shutdown();
        let join = self.join.take()?;
        match join.await {
            Ok(output) => Some(output),
            Err(e) => {
                warn!(error = %e, "background task did not stop cleanly");
                None
            }
        }
    }
}
