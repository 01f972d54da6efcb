//! The consume loop shared by every worker.
//!
//! Takes deliveries off a subscription one at a time, hands each body to the
//! worker's [`MessageHandler`] and settles the delivery according to the
//! returned [`HandlerOutcome`]. Deliveries are processed strictly in order;
//! the next one is not pulled until the previous one is settled.

use crate::metrics::ConsumerMetrics;
use analysis_orchestrator_core::{
    AckMode, DeliveryStream, HandlerOutcome, MessageHandler, MessagingError, ShutdownSignal,
};
use futures::StreamExt;

/// Consume `deliveries` until shutdown or failure.
///
/// With [`AckMode::Manual`] each delivery is acked or rejected after its
/// handler returns. With [`AckMode::Auto`] the broker already considers the
/// delivery handled and nothing is settled.
///
/// # Errors
///
/// - [`MessagingError::Connection`] when the stream ends or yields an error
/// - Any error returned by the handler other than
///   [`MessagingError::Cancelled`]; the in-flight delivery is left
///   unsettled so the broker redelivers it once the channel closes
pub async fn consume(
    queue: &str,
    mut deliveries: DeliveryStream,
    handler: &dyn MessageHandler,
    ack_mode: AckMode,
    shutdown: &ShutdownSignal,
) -> Result<(), MessagingError> {
    tracing::info!(queue, ?ack_mode, "Consuming");

    loop {
        let next = tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                tracing::info!(queue, "Consumer stopping on shutdown");
                return Ok(());
            }
            next = deliveries.next() => next,
        };

        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(error)) => return Err(error),
            None => {
                return Err(MessagingError::Connection(format!(
                    "Delivery stream for '{queue}' ended"
                )));
            }
        };

        ConsumerMetrics::record_received(queue);
        tracing::debug!(
            queue,
            delivery_tag = delivery.delivery_tag,
            redelivered = delivery.redelivered,
            "Delivery received"
        );

        let outcome = match handler.handle(&delivery.body, shutdown).await {
            Ok(outcome) => outcome,
            Err(MessagingError::Cancelled) => {
                tracing::info!(
                    queue,
                    delivery_tag = delivery.delivery_tag,
                    "Handler cancelled by shutdown, delivery left unsettled"
                );
                return Ok(());
            }
            Err(error) => {
                tracing::warn!(
                    queue,
                    delivery_tag = delivery.delivery_tag,
                    error = %error,
                    "Handler failed, delivery left unsettled"
                );
                return Err(error);
            }
        };

        if ack_mode == AckMode::Manual {
            delivery.settle(outcome).await?;
        }
        ConsumerMetrics::record_settled(queue, outcome);

        if outcome != HandlerOutcome::Ack {
            tracing::warn!(
                queue,
                delivery_tag = delivery.delivery_tag,
                ?outcome,
                "Delivery rejected"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use analysis_orchestrator_core::broker::handler_fn;
    use analysis_orchestrator_core::{Acknowledger, BrokerFuture, Delivery, shutdown};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Settled {
        Ack(u64),
        Reject(u64, bool),
    }

    struct Recording {
        tag: u64,
        log: Arc<Mutex<Vec<Settled>>>,
    }

    impl Acknowledger for Recording {
        fn ack(&self) -> BrokerFuture<'_, ()> {
            self.log.lock().unwrap().push(Settled::Ack(self.tag));
            Box::pin(async { Ok(()) })
        }

        fn reject(&self, requeue: bool) -> BrokerFuture<'_, ()> {
            self.log
                .lock()
                .unwrap()
                .push(Settled::Reject(self.tag, requeue));
            Box::pin(async { Ok(()) })
        }
    }

    fn stream_of(bodies: &[&[u8]], log: &Arc<Mutex<Vec<Settled>>>) -> DeliveryStream {
        let deliveries: Vec<_> = bodies
            .iter()
            .zip(1u64..)
            .map(|(body, tag)| {
                Ok::<_, MessagingError>(Delivery::new(
                    body.to_vec(),
                    tag,
                    false,
                    Box::new(Recording {
                        tag,
                        log: Arc::clone(log),
                    }),
                ))
            })
            .collect();
        Box::pin(futures::stream::iter(deliveries))
    }

    #[tokio::test]
    async fn manual_mode_settles_each_outcome() {
        let (_shutdown, signal) = shutdown::channel();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = handler_fn(|body: &[u8]| body == b"ok");

        let result = consume(
            "orchestrator.image-uploaded",
            stream_of(&[b"ok", b"bad", b"ok"], &log),
            &handler,
            AckMode::Manual,
            &signal,
        )
        .await;

        assert!(matches!(result, Err(MessagingError::Connection(_))));
        assert_eq!(
            *log.lock().unwrap(),
            vec![Settled::Ack(1), Settled::Reject(2, false), Settled::Ack(3)]
        );
    }

    #[tokio::test]
    async fn auto_mode_never_settles() {
        let (_shutdown, signal) = shutdown::channel();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = handler_fn(|_: &[u8]| false);

        let _ = consume(
            "orchestrator.analysis.commands",
            stream_of(&[b"x", b"y"], &log),
            &handler,
            AckMode::Auto,
            &signal,
        )
        .await;

        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn handler_error_leaves_delivery_unsettled() {
        struct Failing;

        impl MessageHandler for Failing {
            fn handle<'a>(
                &'a self,
                _body: &'a [u8],
                _shutdown: &'a ShutdownSignal,
            ) -> BrokerFuture<'a, HandlerOutcome> {
                Box::pin(async {
                    Err(MessagingError::Publish {
                        exchange: "analysis.started".into(),
                        reason: "channel closed".into(),
                    })
                })
            }
        }

        let (_shutdown, signal) = shutdown::channel();
        let log = Arc::new(Mutex::new(Vec::new()));

        let result = consume(
            "orchestrator.image-uploaded",
            stream_of(&[b"{}"], &log),
            &Failing,
            AckMode::Manual,
            &signal,
        )
        .await;

        assert!(matches!(result, Err(MessagingError::Publish { .. })));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn shutdown_stops_idle_consumer() {
        let (shutdown, signal) = shutdown::channel();
        let handler = handler_fn(|_: &[u8]| true);
        shutdown.trigger();

        let result = consume(
            "orchestrator.image-uploaded",
            Box::pin(futures::stream::pending::<Result<Delivery, MessagingError>>()),
            &handler,
            AckMode::Manual,
            &signal,
        )
        .await;

        assert_eq!(result, Ok(()));
    }
}
