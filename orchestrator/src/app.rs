//! Wires the workers together and runs them until shutdown.

use crate::choreographer::{AnalysisWork, Choreographer, SimulatedWork};
use crate::config::Config;
use crate::workers::Worker;
use analysis_orchestrator_core::{EventPublisher, MessageConsumer, ShutdownSignal};
use analysis_orchestrator_runtime::{RetryPolicy, WorkerExit, WorkerHealth};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// The three workflow workers sharing one consumer and one publisher.
pub struct Orchestrator {
    consumer: Arc<dyn MessageConsumer>,
    retry: RetryPolicy,
    health: Arc<WorkerHealth>,
    workers: Vec<Worker>,
}

impl Orchestrator {
    /// Orchestrator that simulates the analysis for the configured duration.
    #[must_use]
    pub fn new(
        config: &Config,
        consumer: Arc<dyn MessageConsumer>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        let work = Arc::new(SimulatedWork::new(config.workflow.simulated_work));
        Self::with_work(config, consumer, publisher, work)
    }

    /// Orchestrator running `work` between the started and completed events.
    #[must_use]
    pub fn with_work(
        config: &Config,
        consumer: Arc<dyn MessageConsumer>,
        publisher: Arc<dyn EventPublisher>,
        work: Arc<dyn AnalysisWork>,
    ) -> Self {
        let choreographer = Arc::new(Choreographer::new(publisher, work));
        let topology = &config.topology;
        Self {
            consumer,
            retry: config.retry.clone(),
            health: Arc::new(WorkerHealth::new()),
            workers: vec![
                Worker::request_analysis(topology, Arc::clone(&choreographer)),
                Worker::image_uploaded(topology, Arc::clone(&choreographer)),
                Worker::recognition_completed(topology, choreographer),
            ],
        }
    }

    /// Workers in start order.
    #[must_use]
    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    /// Subscription health of the workers, for the readiness endpoint.
    #[must_use]
    pub fn health(&self) -> Arc<WorkerHealth> {
        Arc::clone(&self.health)
    }

    /// Start every worker on its own task.
    #[must_use]
    pub fn spawn(self, shutdown: &ShutdownSignal) -> RunningWorkers {
        let mut tasks = JoinSet::new();

        for worker in self.workers {
            let consumer = Arc::clone(&self.consumer);
            let retry = self.retry.clone();
            let health = Arc::clone(&self.health);
            let shutdown = shutdown.clone();

            tasks.spawn(async move {
                let exit = worker
                    .run(consumer.as_ref(), &retry, &health, &shutdown)
                    .await;
                (worker.name(), exit)
            });
        }

        RunningWorkers { tasks }
    }
}

/// Handles to spawned workers.
pub struct RunningWorkers {
    tasks: JoinSet<(&'static str, WorkerExit)>,
}

impl RunningWorkers {
    /// Number of workers still running.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether every worker has finished.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait up to `timeout` for every worker, aborting the stragglers.
    ///
    /// Returns the exits of the workers that finished.
    pub async fn join(mut self, timeout: Duration) -> Vec<(&'static str, WorkerExit)> {
        let mut exits = Vec::with_capacity(self.tasks.len());

        let drained = tokio::time::timeout(timeout, async {
            while let Some(joined) = self.tasks.join_next().await {
                match joined {
                    Ok(exit) => exits.push(exit),
                    Err(e) => tracing::error!(error = %e, "Worker task failed"),
                }
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                remaining = self.tasks.len(),
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                "Workers did not stop in time, aborting"
            );
            self.tasks.abort_all();
        }
        exits
    }
}

/// Wait for Ctrl+C or SIGTERM.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
