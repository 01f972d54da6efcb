//! Durable queue subscriptions over AMQP.

use crate::connection::{ConnectionManager, declaration_error};
use crate::publisher::declare_exchange;
use analysis_orchestrator_core::{
    AckMode, Acknowledger, BrokerFuture, Delivery, DeliveryStream, HandlerOutcome,
    MessageConsumer, MessagingError, QueueBinding, ShutdownSignal,
};
use futures::StreamExt;
use lapin::Channel;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicQosOptions, BasicRejectOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use std::sync::Arc;

const DEFAULT_PREFETCH: u16 = 16;

/// Subscribes workers to their queues.
///
/// Each subscription gets a dedicated channel that lives exactly as long as
/// the returned stream. Dropping the stream closes the channel, which hands
/// any unsettled deliveries back to the broker for redelivery.
///
/// [`AckMode::Auto`] is not mapped to an AMQP `no_ack` consumer: those cannot
/// be throttled, so the broker would push the whole backlog into the local
/// buffer, already acknowledged. Instead the subscription runs with manual
/// acks and a prefetch of one, and each delivery is acked as it is taken off
/// the stream, before any handler sees it.
#[derive(Clone)]
pub struct RabbitMqConsumer {
    connections: Arc<ConnectionManager>,
    prefetch: u16,
}

impl RabbitMqConsumer {
    /// Create a consumer on `connections`.
    #[must_use]
    pub const fn new(connections: Arc<ConnectionManager>) -> Self {
        Self {
            connections,
            prefetch: DEFAULT_PREFETCH,
        }
    }

    /// Limit unsettled deliveries per manual-ack subscription.
    #[must_use]
    pub const fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    async fn open(
        &self,
        binding: &QueueBinding,
        ack_mode: AckMode,
    ) -> Result<DeliveryStream, MessagingError> {
        let channel = self.connections.create_channel().await?;
        declare_topology(&channel, binding).await?;

        let prefetch = match ack_mode {
            AckMode::Manual => self.prefetch,
            AckMode::Auto => 1,
        };
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| MessagingError::Connection(format!("Failed to set prefetch: {e}")))?;

        let consumer_tag = format!("analysis-orchestrator.{}", binding.queue);
        let consumer = channel
            .basic_consume(
                &binding.queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| declaration_error(&binding.queue, &e))?;

        tracing::info!(
            queue = %binding.queue,
            exchange = %binding.exchange,
            routing_key = %binding.routing_key,
            kind = %binding.kind,
            ?ack_mode,
            prefetch,
            "Subscribed to queue"
        );

        let queue = binding.queue.clone();
        let stream = async_stream::stream! {
            let _channel = channel;
            let mut consumer = consumer;
            while let Some(item) = consumer.next().await {
                match item {
                    Ok(delivery) => {
                        yield Ok(Delivery::new(
                            delivery.data,
                            delivery.delivery_tag,
                            delivery.redelivered,
                            Box::new(LapinAcker(delivery.acker)),
                        ));
                    }
                    Err(e) => {
                        yield Err(MessagingError::Connection(format!(
                            "Consumer on '{queue}' failed: {e}"
                        )));
                        break;
                    }
                }
            }
            tracing::debug!(queue = %queue, "Delivery stream closed");
        };

        let deliveries = Box::pin(stream) as DeliveryStream;
        Ok(match ack_mode {
            AckMode::Manual => deliveries,
            AckMode::Auto => ack_on_receipt(deliveries),
        })
    }
}

/// Acknowledge each delivery the moment it is pulled from `deliveries`.
///
/// Deliveries still waiting in the stream stay unacked, so dropping the
/// stream returns them to the queue.
fn ack_on_receipt(deliveries: DeliveryStream) -> DeliveryStream {
    Box::pin(deliveries.then(|item| async move {
        let delivery = item?;
        delivery.settle(HandlerOutcome::Ack).await?;
        Ok::<_, MessagingError>(delivery)
    }))
}

/// Declare the source exchange and the durable queue, then bind them.
async fn declare_topology(channel: &Channel, binding: &QueueBinding) -> Result<(), MessagingError> {
    declare_exchange(channel, &binding.exchange, binding.kind).await?;

    channel
        .queue_declare(
            &binding.queue,
            QueueDeclareOptions {
                durable: true,
                exclusive: false,
                auto_delete: false,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| declaration_error(&binding.queue, &e))?;

    channel
        .queue_bind(
            &binding.queue,
            &binding.exchange,
            &binding.routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| declaration_error(&binding.queue, &e))
}

impl MessageConsumer for RabbitMqConsumer {
    fn subscribe<'a>(
        &'a self,
        binding: &'a QueueBinding,
        ack_mode: AckMode,
        shutdown: &'a ShutdownSignal,
    ) -> BrokerFuture<'a, DeliveryStream> {
        Box::pin(async move { shutdown.run_until(self.open(binding, ack_mode)).await? })
    }
}

struct LapinAcker(Acker);

impl Acknowledger for LapinAcker {
    fn ack(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.0
                .ack(BasicAckOptions::default())
                .await
                .map(|_| ())
                .map_err(|e| MessagingError::Connection(format!("Failed to ack: {e}")))
        })
    }

    fn reject(&self, requeue: bool) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.0
                .reject(BasicRejectOptions { requeue })
                .await
                .map(|_| ())
                .map_err(|e| MessagingError::Connection(format!("Failed to reject: {e}")))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recording {
        tag: u64,
        acked: Arc<Mutex<Vec<u64>>>,
    }

    impl Acknowledger for Recording {
        fn ack(&self) -> BrokerFuture<'_, ()> {
            self.acked.lock().unwrap().push(self.tag);
            Box::pin(async { Ok(()) })
        }

        fn reject(&self, _requeue: bool) -> BrokerFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }
    }

    fn backlog(count: u64, acked: &Arc<Mutex<Vec<u64>>>) -> DeliveryStream {
        let deliveries: Vec<_> = (1..=count)
            .map(|tag| {
                Ok::<_, MessagingError>(Delivery::new(
                    br#"{"correlationId":"c","objectKey":"img.jpg"}"#.to_vec(),
                    tag,
                    false,
                    Box::new(Recording {
                        tag,
                        acked: Arc::clone(acked),
                    }) as Box<dyn Acknowledger>,
                ))
            })
            .collect();
        Box::pin(futures::stream::iter(deliveries))
    }

    #[tokio::test]
    async fn auto_ack_settles_only_what_was_taken() {
        let acked = Arc::new(Mutex::new(Vec::new()));
        let mut deliveries = ack_on_receipt(backlog(5, &acked));

        let first = deliveries.next().await.unwrap().unwrap();
        assert_eq!(first.delivery_tag, 1);
        assert_eq!(*acked.lock().unwrap(), vec![1]);

        // The worker fails on the first command and drops its subscription
        drop(deliveries);
        assert_eq!(*acked.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn auto_ack_passes_stream_errors_through() {
        let acked = Arc::new(Mutex::new(Vec::<u64>::new()));
        let failing: DeliveryStream = Box::pin(futures::stream::iter(vec![Err::<Delivery, _>(
            MessagingError::Connection("channel closed".into()),
        )]));

        let mut deliveries = ack_on_receipt(failing);

        assert!(matches!(
            deliveries.next().await,
            Some(Err(MessagingError::Connection(_)))
        ));
        assert!(acked.lock().unwrap().is_empty());
    }

    #[test]
    fn consumer_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RabbitMqConsumer>();
        assert_sync::<RabbitMqConsumer>();
    }
}
