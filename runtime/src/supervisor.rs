//! Restart loop for long-running workers.
//!
//! Each worker is one closure that subscribes and then consumes until its
//! stream fails. The supervisor logs the failure, waits the policy's delay
//! (cancellable by shutdown) and runs the closure again. A worker crash never
//! takes down its siblings: each runs under its own supervisor.

use crate::metrics::SupervisorMetrics;
use crate::retry::RetryPolicy;
use analysis_orchestrator_core::{MessagingError, ShutdownSignal};
use std::future::Future;
use tokio::time::Instant;

/// How a supervised worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Shutdown was requested
    Stopped,
    /// The retry policy ran out or the error cannot be retried
    GaveUp(MessagingError),
}

/// Run `attempt` until shutdown, restarting it after each failure.
///
/// The retry counter resets when an attempt ran for longer than the policy's
/// maximum delay, so a long-lived connection that eventually drops starts
/// over at the initial delay.
pub async fn supervise<F, Fut>(
    worker: &str,
    policy: &RetryPolicy,
    shutdown: &ShutdownSignal,
    mut attempt: F,
) -> WorkerExit
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), MessagingError>>,
{
    let mut retries = 0usize;

    loop {
        if shutdown.is_triggered() {
            tracing::info!(worker, "Worker stopped");
            return WorkerExit::Stopped;
        }

        tracing::info!(worker, "Worker starting");
        let started = Instant::now();

        let error = match attempt().await {
            Err(MessagingError::Cancelled) => {
                tracing::info!(worker, "Worker stopped");
                return WorkerExit::Stopped;
            }
            Ok(()) if shutdown.is_triggered() => {
                tracing::info!(worker, "Worker stopped");
                return WorkerExit::Stopped;
            }
            Ok(()) => MessagingError::Connection("worker returned without shutdown".to_string()),
            Err(error) => error,
        };

        if started.elapsed() > policy.max_delay {
            retries = 0;
        }

        if !error.is_retryable() || !policy.allows_retry(retries) {
            tracing::error!(worker, error = %error, retries, "Worker giving up");
            return WorkerExit::GaveUp(error);
        }

        let delay = policy.delay_for_attempt(retries);
        retries += 1;

        tracing::error!(
            worker,
            error = %error,
            kind = error.kind(),
            retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Worker failed, restarting after delay"
        );
        SupervisorMetrics::record_restart(worker);

        if shutdown.run_until(tokio::time::sleep(delay)).await.is_err() {
            tracing::info!(worker, "Worker stopped during retry delay");
            return WorkerExit::Stopped;
        }
    }
}
