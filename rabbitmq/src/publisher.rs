//! Command and event publishing over AMQP.

use crate::connection::{ConnectionManager, declaration_error};
use analysis_orchestrator_core::codec::{CONTENT_TYPE, PERSISTENT_DELIVERY_MODE};
use analysis_orchestrator_core::{
    BrokerFuture, CommandPublisher, EventPublisher, ExchangeKind, JsonPayload, MessagingError,
};
use analysis_orchestrator_runtime::metrics::PublisherMetrics;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel};
use std::sync::Arc;

/// Publishes commands and events through the shared connection.
///
/// Each call opens a short-lived channel, declares the target exchange
/// durably, publishes one persistent JSON message (non-mandatory, so it is
/// dropped when no queue is bound) and waits for the broker's confirm.
#[derive(Clone)]
pub struct RabbitMqPublisher {
    connections: Arc<ConnectionManager>,
}

impl RabbitMqPublisher {
    /// Create a publisher on `connections`.
    #[must_use]
    pub const fn new(connections: Arc<ConnectionManager>) -> Self {
        Self { connections }
    }

    async fn publish_once(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: JsonPayload,
        kind: ExchangeKind,
    ) -> Result<(), MessagingError> {
        let result = async {
            let channel = self.connections.create_channel().await?;
            let published = publish_on(&channel, exchange, routing_key, &payload, kind).await;
            close_channel(&channel).await;
            published
        }
        .await;

        match &result {
            Ok(()) => {
                PublisherMetrics::record_published(exchange);
                tracing::debug!(
                    exchange,
                    routing_key,
                    kind = %kind,
                    bytes = payload.as_bytes().len(),
                    "Message published"
                );
            }
            Err(error) => {
                PublisherMetrics::record_failure(exchange, error.kind());
                tracing::error!(exchange, routing_key, error = %error, "Failed to publish message");
            }
        }
        result
    }
}

/// Declare `exchange` durably with `kind`.
pub(crate) async fn declare_exchange(
    channel: &Channel,
    exchange: &str,
    kind: ExchangeKind,
) -> Result<(), MessagingError> {
    channel
        .exchange_declare(
            exchange,
            amqp_kind(kind),
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| declaration_error(exchange, &e))
}

pub(crate) fn amqp_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

pub(crate) fn message_properties() -> BasicProperties {
    BasicProperties::default()
        .with_content_type(CONTENT_TYPE.into())
        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
}

async fn publish_on(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    payload: &JsonPayload,
    kind: ExchangeKind,
) -> Result<(), MessagingError> {
    let publish_error = |reason: String| MessagingError::Publish {
        exchange: exchange.to_string(),
        reason,
    };

    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await
        .map_err(|e| MessagingError::Connection(format!("Failed to enable confirms: {e}")))?;

    declare_exchange(channel, exchange, kind).await?;

    let confirmation = channel
        .basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions {
                mandatory: false,
                ..BasicPublishOptions::default()
            },
            payload.as_bytes(),
            message_properties(),
        )
        .await
        .map_err(|e| publish_error(e.to_string()))?
        .await
        .map_err(|e| publish_error(e.to_string()))?;

    if confirmation.is_nack() {
        return Err(publish_error("broker negatively acknowledged the message".to_string()));
    }
    Ok(())
}

async fn close_channel(channel: &Channel) {
    if let Err(e) = channel.close(200, "OK").await {
        tracing::debug!(error = %e, "Publish channel already closed");
    }
}

impl CommandPublisher for RabbitMqPublisher {
    fn send<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        payload: JsonPayload,
        kind: ExchangeKind,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(self.publish_once(exchange, routing_key, payload, kind))
    }
}

impl EventPublisher for RabbitMqPublisher {
    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        payload: JsonPayload,
        kind: ExchangeKind,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(self.publish_once(exchange, routing_key, payload, kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publisher_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RabbitMqPublisher>();
        assert_sync::<RabbitMqPublisher>();
    }

    #[test]
    fn kinds_map_onto_amqp() {
        assert!(matches!(
            amqp_kind(ExchangeKind::Direct),
            lapin::ExchangeKind::Direct
        ));
        assert!(matches!(
            amqp_kind(ExchangeKind::Fanout),
            lapin::ExchangeKind::Fanout
        ));
        assert!(matches!(amqp_kind(ExchangeKind::Topic), lapin::ExchangeKind::Topic));
    }

    #[test]
    fn messages_are_persistent_json() {
        let properties = message_properties();
        assert_eq!(properties.delivery_mode(), &Some(2));
        assert_eq!(
            properties.content_type().as_ref().map(lapin::types::ShortString::as_str),
            Some("application/json")
        );
    }
}
