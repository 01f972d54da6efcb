//! Cooperative cancellation shared by every worker.
//!
//! A single [`Shutdown`] handle is owned by the process bootstrap; each worker
//! receives a clone of the [`ShutdownSignal`]. Every suspension point
//! (connecting, declaring, waiting for a delivery, simulated work, retry
//! delays) races against the signal.
//!
//! # Example
//!
//! ```
//! use analysis_orchestrator_core::shutdown;
//!
//! # tokio_test::block_on(async {
//! let (shutdown, signal) = shutdown::channel();
//! assert!(!signal.is_triggered());
//!
//! shutdown.trigger();
//! signal.cancelled().await;
//! assert!(signal.is_triggered());
//! # });
//! ```

use crate::error::MessagingError;
use std::future::Future;
use tokio::sync::watch;

/// Create a linked shutdown trigger and signal.
#[must_use]
pub fn channel() -> (Shutdown, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (Shutdown { tx }, ShutdownSignal { rx })
}

/// The owning side: fires the signal for every subscriber at once.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    /// Fire the signal. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Get another receiver for this trigger.
    #[must_use]
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Whether the signal has been fired.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

/// The receiving side, cloned into every worker.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is requested.
    ///
    /// Also resolves if the [`Shutdown`] handle was dropped without firing:
    /// with no owner left nothing could ever stop the worker otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|triggered| *triggered).await;
    }

    /// Run `future` to completion unless shutdown is requested first.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Cancelled`] if the signal fires before
    /// `future` completes. The future is dropped at its current suspension
    /// point.
    pub async fn run_until<F: Future>(&self, future: F) -> Result<F::Output, MessagingError> {
        tokio::select! {
            biased;
            () = self.cancelled() => Err(MessagingError::Cancelled),
            output = future => Ok(output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn every_clone_observes_trigger() {
        let (shutdown, signal) = channel();
        let other = signal.clone();
        let late = shutdown.signal();

        shutdown.trigger();

        assert!(signal.is_triggered());
        assert!(other.is_triggered());
        assert!(late.is_triggered());
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn run_until_completes_when_not_triggered() {
        let (_shutdown, signal) = channel();
        let result = signal.run_until(async { 7 }).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn run_until_is_cancelled_by_trigger() {
        let (shutdown, signal) = channel();

        let task = tokio::spawn(async move {
            signal
                .run_until(tokio::time::sleep(Duration::from_secs(3600)))
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.trigger();

        assert_eq!(task.await.unwrap(), Err(MessagingError::Cancelled));
    }

    #[tokio::test]
    async fn dropped_owner_releases_waiters() {
        let (shutdown, signal) = channel();
        drop(shutdown);
        signal.cancelled().await;
    }
}
