//! The three workflow workers.
//!
//! Each worker binds one durable queue, decodes one contract and advances one
//! row of the transition table:
//!
//! | Worker | Queue source | Ack | Emits |
//! |---|---|---|---|
//! | `request-analysis` | `analysis.commands` (direct) | auto | started, completed |
//! | `image-uploaded` | ingestion fanout | manual | started |
//! | `recognition-completed` | recognition fanout | manual | completed |

mod handler;

pub use handler::WorkflowHandler;

use crate::choreographer::Choreographer;
use crate::config::TopologyConfig;
use analysis_orchestrator_core::workflow::{self, Trigger};
use analysis_orchestrator_core::{
    AckMode, ImageUploaded, MessageConsumer, MessageHandler, QueueBinding, RecognitionCompleted,
    RequestAnalysis, ShutdownSignal,
};
use analysis_orchestrator_runtime::consumer::consume;
use analysis_orchestrator_runtime::{RetryPolicy, WorkerExit, WorkerHealth, supervise};
use std::sync::Arc;

/// One queue subscription and the handler behind it.
#[derive(Clone)]
pub struct Worker {
    name: &'static str,
    trigger: Trigger,
    binding: QueueBinding,
    handler: Arc<dyn MessageHandler>,
}

impl Worker {
    /// Root command worker: `RequestAnalysis` → started, work, completed.
    #[must_use]
    pub fn request_analysis(topology: &TopologyConfig, choreographer: Arc<Choreographer>) -> Self {
        Self {
            name: "request-analysis",
            trigger: Trigger::RequestAnalysis,
            binding: topology.command_binding(),
            handler: Arc::new(WorkflowHandler::<RequestAnalysis>::new(
                Trigger::RequestAnalysis,
                choreographer,
            )),
        }
    }

    /// Upload-triggered worker: `ImageUploaded` → started.
    #[must_use]
    pub fn image_uploaded(topology: &TopologyConfig, choreographer: Arc<Choreographer>) -> Self {
        Self {
            name: "image-uploaded",
            trigger: Trigger::ImageUploaded,
            binding: topology.image_uploaded_binding(),
            handler: Arc::new(WorkflowHandler::<ImageUploaded>::new(
                Trigger::ImageUploaded,
                choreographer,
            )),
        }
    }

    /// Recognition-completion worker: `RecognitionCompleted` → completed.
    #[must_use]
    pub fn recognition_completed(
        topology: &TopologyConfig,
        choreographer: Arc<Choreographer>,
    ) -> Self {
        Self {
            name: "recognition-completed",
            trigger: Trigger::RecognitionCompleted,
            binding: topology.recognition_completed_binding(),
            handler: Arc::new(WorkflowHandler::<RecognitionCompleted>::new(
                Trigger::RecognitionCompleted,
                choreographer,
            )),
        }
    }

    /// Name used in logs and metrics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Queue subscription.
    #[must_use]
    pub const fn binding(&self) -> &QueueBinding {
        &self.binding
    }

    /// How deliveries are settled, as recorded in the transition table.
    #[must_use]
    pub fn ack_mode(&self) -> AckMode {
        workflow::transition(self.trigger).ack_mode
    }

    /// The handler fed by the consume loop.
    #[must_use]
    pub fn handler(&self) -> &dyn MessageHandler {
        self.handler.as_ref()
    }

    /// Subscribe and consume until shutdown, restarting after failures.
    ///
    /// Subscription failures and giving up are recorded in `health`.
    pub async fn run(
        &self,
        consumer: &dyn MessageConsumer,
        policy: &RetryPolicy,
        health: &WorkerHealth,
        shutdown: &ShutdownSignal,
    ) -> WorkerExit {
        let ack_mode = self.ack_mode();
        tracing::info!(
            worker = self.name,
            queue = %self.binding.queue,
            exchange = %self.binding.exchange,
            ?ack_mode,
            "Starting worker"
        );

        let exit = supervise(self.name, policy, shutdown, move || async move {
            let deliveries = consumer
                .subscribe(&self.binding, ack_mode, shutdown)
                .await
                .inspect_err(|e| health.record_subscribe_failed(self.name, e))?;
            health.record_subscribed(self.name);

            consume(
                &self.binding.queue,
                deliveries,
                self.handler(),
                ack_mode,
                shutdown,
            )
            .await
        })
        .await;

        if let WorkerExit::GaveUp(error) = &exit {
            health.record_gave_up(self.name, error);
        }
        exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::choreographer::SimulatedWork;
    use analysis_orchestrator_core::shutdown;
    use analysis_orchestrator_core::topology::exchanges;
    use analysis_orchestrator_core::{ExchangeKind, HandlerOutcome};
    use analysis_orchestrator_testing::InMemoryBroker;
    use std::time::Duration;

    fn workers(broker: &InMemoryBroker) -> [Worker; 3] {
        let choreographer = Arc::new(Choreographer::new(
            Arc::new(broker.clone()),
            Arc::new(SimulatedWork::new(Duration::ZERO)),
        ));
        let topology = TopologyConfig::default();
        [
            Worker::request_analysis(&topology, Arc::clone(&choreographer)),
            Worker::image_uploaded(&topology, Arc::clone(&choreographer)),
            Worker::recognition_completed(&topology, choreographer),
        ]
    }

    #[test]
    fn only_the_command_queue_auto_acks() {
        let [request, upload, recognition] = workers(&InMemoryBroker::new());

        assert_eq!(request.ack_mode(), AckMode::Auto);
        assert_eq!(request.binding().kind, ExchangeKind::Direct);
        assert_eq!(upload.ack_mode(), AckMode::Manual);
        assert_eq!(recognition.ack_mode(), AckMode::Manual);
    }

    #[tokio::test]
    async fn null_and_garbage_are_dropped_without_publishing() {
        let broker = InMemoryBroker::new();
        let (_shutdown, signal) = shutdown::channel();

        let bodies: [&[u8]; 3] = [b"null", b"not-json", br#"{"objectKey":""}"#];
        for worker in workers(&broker) {
            for body in bodies {
                let outcome = worker.handler().handle(body, &signal).await.unwrap();
                assert_eq!(outcome, HandlerOutcome::RejectDrop, "{}", worker.name());
            }
        }
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn upload_emits_started_without_correlation_id() {
        let broker = InMemoryBroker::new();
        let (_shutdown, signal) = shutdown::channel();
        let [_, upload, _] = workers(&broker);

        let outcome = upload
            .handler()
            .handle(br#"{"objectKey":"img2.jpg","size":1024}"#, &signal)
            .await
            .unwrap();

        assert_eq!(outcome, HandlerOutcome::Ack);
        let started = broker.published_to(exchanges::ANALYSIS_STARTED);
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].body, br#"{"objectKey":"img2.jpg"}"#);
    }

    #[tokio::test]
    async fn started_without_object_key_is_dropped() {
        let broker = InMemoryBroker::new();
        let (_shutdown, signal) = shutdown::channel();
        let choreographer = Arc::new(Choreographer::new(
            Arc::new(broker.clone()),
            Arc::new(SimulatedWork::new(Duration::ZERO)),
        ));
        let handler =
            WorkflowHandler::<RecognitionCompleted>::new(Trigger::ImageUploaded, choreographer);

        let outcome = handler
            .handle(br#"{"correlationId":"abc","labels":["cat"]}"#, &signal)
            .await
            .unwrap();

        assert_eq!(outcome, HandlerOutcome::RejectDrop);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn publish_failure_is_an_error_not_an_outcome() {
        let broker = InMemoryBroker::new();
        let (_shutdown, signal) = shutdown::channel();
        broker.fail_publishes_to(exchanges::ANALYSIS_COMPLETED);
        let [_, _, recognition] = workers(&broker);

        let result = recognition
            .handler()
            .handle(br#"{"correlationId":"abc","labels":["cat"]}"#, &signal)
            .await;

        assert!(result.is_err());
    }
}
