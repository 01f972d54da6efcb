//! Executes rows of the workflow transition table.
//!
//! The [`Choreographer`] owns no workflow state: each inbound message carries
//! enough identifiers to drive its row to completion. Steps run strictly in
//! order and the first failure aborts the row.

use analysis_orchestrator_core::broker::publish_event;
use analysis_orchestrator_core::workflow::{
    self, Emission, Outbound, Step, Trigger, WorkflowInput, WorkflowState,
};
use analysis_orchestrator_core::{BrokerFuture, EventPublisher, MessagingError, ShutdownSignal};
use std::sync::Arc;
use std::time::Duration;

/// Performs the analysis between `AnalysisStarted` and `AnalysisCompleted`.
pub trait AnalysisWork: Send + Sync {
    /// Do the work for `input`.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Cancelled`] if shutdown interrupts the work.
    fn perform<'a>(
        &'a self,
        input: &'a WorkflowInput,
        shutdown: &'a ShutdownSignal,
    ) -> BrokerFuture<'a, ()>;
}

/// Stands in for the real analysis with a fixed delay.
#[derive(Debug, Clone, Copy)]
pub struct SimulatedWork {
    duration: Duration,
}

impl SimulatedWork {
    /// Simulate work taking `duration`.
    #[must_use]
    pub const fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

impl AnalysisWork for SimulatedWork {
    fn perform<'a>(
        &'a self,
        input: &'a WorkflowInput,
        shutdown: &'a ShutdownSignal,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            tracing::debug!(
                object_key = ?input.object_key,
                duration_ms = u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX),
                "Simulating analysis"
            );
            shutdown.run_until(tokio::time::sleep(self.duration)).await
        })
    }
}

/// Runs workflow rows against the event publisher and the work seam.
#[derive(Clone)]
pub struct Choreographer {
    publisher: Arc<dyn EventPublisher>,
    work: Arc<dyn AnalysisWork>,
}

impl Choreographer {
    /// Create a choreographer.
    #[must_use]
    pub fn new(publisher: Arc<dyn EventPublisher>, work: Arc<dyn AnalysisWork>) -> Self {
        Self { publisher, work }
    }

    /// Run every step of the row for `trigger`.
    ///
    /// # Errors
    ///
    /// Returns the first step failure: a [`MessagingError::Publish`] or
    /// [`MessagingError::Connection`] from an emission, or
    /// [`MessagingError::Cancelled`] if shutdown interrupted the work.
    pub async fn advance(
        &self,
        trigger: Trigger,
        input: &WorkflowInput,
        shutdown: &ShutdownSignal,
    ) -> Result<WorkflowState, MessagingError> {
        let row = workflow::transition(trigger);

        for step in row.steps {
            match step {
                Step::Emit(emission) => self.emit(*emission, input).await?,
                Step::PerformWork => self.work.perform(input, shutdown).await?,
            }
        }

        tracing::info!(
            trigger = trigger.name(),
            correlation_id = ?input.correlation_id,
            object_key = ?input.object_key,
            state = ?row.to,
            "Workflow advanced"
        );
        Ok(row.to)
    }

    async fn emit(&self, emission: Emission, input: &WorkflowInput) -> Result<(), MessagingError> {
        let exchange = emission.exchange();
        match emission.build(input)? {
            Outbound::Started(event) => publish_event(&*self.publisher, exchange, &event).await?,
            Outbound::Completed(event) => publish_event(&*self.publisher, exchange, &event).await?,
        }
        tracing::debug!(
            exchange,
            ?emission,
            correlation_id = ?input.correlation_id,
            object_key = ?input.object_key,
            "Event emitted"
        );
        Ok(())
    }
}
