//! Cooperative cancellation shared by every long-running task
//!
//! One [`ShutdownHandle`] owns the signal; any number of [`Shutdown`]
//! receivers observe it. Every sleep in the crate goes through
//! [`Shutdown::sleep`] so that a triggered signal aborts it promptly.

use std::time::Duration;

use tokio::sync::watch;

use crate::error::{ProxyScanError, Result};

/// Owner side of the shutdown signal
pub struct ShutdownHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn new() -> (Self, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, Shutdown { rx })
    }

    /// Create another receiver for this signal
    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.shutdown_tx.subscribe(),
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new().0
    }
}

/// Receiver side of the shutdown signal
#[derive(Clone, Debug)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// A receiver that is never triggered
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the signal fires. Pends forever if the handle was
    /// dropped without firing.
    pub async fn triggered(&mut self) {
        if self.rx.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Sleep for `duration` unless the signal fires first
    pub async fn sleep(&mut self, duration: Duration) -> Result<()> {
        if self.is_triggered() {
            return Err(ProxyScanError::Cancelled);
        }
        if duration.is_zero() {
            return Ok(());
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.triggered() => Err(ProxyScanError::Cancelled),
        }
    }
}
