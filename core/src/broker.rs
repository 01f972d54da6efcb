//! Transport-agnostic broker abstractions.
//!
//! This module provides the seams between workflow logic and the broker:
//!
//! - [`CommandPublisher`] / [`EventPublisher`]: send a serialized payload to an
//!   exchange, declaring the exchange first
//! - [`MessageConsumer`]: declare and bind a queue, then stream its deliveries
//! - [`MessageHandler`]: turn one message body into a [`HandlerOutcome`]
//! - [`Acknowledger`]: settle a single delivery with the broker
//!
//! # Dyn Compatibility
//!
//! All traits return explicit `Pin<Box<dyn Future>>` values instead of using
//! `async fn`, so every seam can be held as `Arc<dyn Trait>` and swapped for
//! the in-memory broker in tests.
//!
//! # Delivery Semantics
//!
//! - Commands are point-to-point: one queue is bound to the direct exchange.
//! - Events are broadcast: every bound queue gets a copy, and consumers must
//!   tolerate duplicates.
//! - Publishing is non-mandatory. A message published while no queue is bound
//!   is silently dropped by the broker.

use crate::codec::JsonPayload;
use crate::contracts::MessageContract;
use crate::error::MessagingError;
use crate::shutdown::ShutdownSignal;
use crate::topology::{AckMode, ExchangeKind, QueueBinding};
use futures::Stream;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by every broker seam.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, MessagingError>> + Send + 'a>>;

/// Stream of deliveries for one subscription.
///
/// The stream ends when the underlying channel or connection is lost.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, MessagingError>> + Send>>;

/// Publisher for point-to-point commands.
///
/// Commands tell exactly one service to act; they go to a direct (or topic)
/// exchange and require a routing key.
pub trait CommandPublisher: Send + Sync {
    /// Send a command to `exchange` with `routing_key`.
    ///
    /// The exchange is declared durably with `kind` first; declaration is
    /// idempotent.
    ///
    /// # Errors
    ///
    /// - [`MessagingError::Connection`] if the broker is unreachable
    /// - [`MessagingError::Declaration`] if the exchange exists with another kind
    /// - [`MessagingError::Publish`] if the send itself fails
    fn send<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        payload: JsonPayload,
        kind: ExchangeKind,
    ) -> BrokerFuture<'a, ()>;
}

/// Publisher for broadcast events.
///
/// Events describe something that already happened; they go to fanout (or
/// topic) exchanges and the routing key is optional for fanout.
pub trait EventPublisher: Send + Sync {
    /// Publish an event to `exchange`.
    ///
    /// # Errors
    ///
    /// Same as [`CommandPublisher::send`].
    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        payload: JsonPayload,
        kind: ExchangeKind,
    ) -> BrokerFuture<'a, ()>;
}

/// Serialize `command` and send it on a direct exchange.
///
/// # Errors
///
/// Returns [`MessagingError::Publish`] if serialization fails, otherwise
/// whatever [`CommandPublisher::send`] returns.
pub async fn send_command<T>(
    publisher: &dyn CommandPublisher,
    exchange: &str,
    routing_key: &str,
    command: &T,
) -> Result<(), MessagingError>
where
    T: Serialize + MessageContract + Sync,
{
    let payload = JsonPayload::encode(command).map_err(|e| MessagingError::Publish {
        exchange: exchange.to_string(),
        reason: format!("Failed to serialize {}: {e}", T::NAME),
    })?;
    publisher
        .send(exchange, routing_key, payload, ExchangeKind::Direct)
        .await
}

/// Serialize `event` and publish it on a fanout exchange.
///
/// # Errors
///
/// Returns [`MessagingError::Publish`] if serialization fails, otherwise
/// whatever [`EventPublisher::publish`] returns.
pub async fn publish_event<T>(
    publisher: &dyn EventPublisher,
    exchange: &str,
    event: &T,
) -> Result<(), MessagingError>
where
    T: Serialize + MessageContract + Sync,
{
    let payload = JsonPayload::encode(event).map_err(|e| MessagingError::Publish {
        exchange: exchange.to_string(),
        reason: format!("Failed to serialize {}: {e}", T::NAME),
    })?;
    publisher
        .publish(exchange, "", payload, ExchangeKind::Fanout)
        .await
}

/// What the consumer loop should do with a delivery after its handler ran.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Processed: remove the message from the queue.
    Ack,
    /// Poison message: reject without requeue. With no dead-letter exchange
    /// configured the message is permanently lost.
    RejectDrop,
    /// Transient failure: reject and put the message back on the queue.
    RejectRequeue,
}

impl From<bool> for HandlerOutcome {
    fn from(handled: bool) -> Self {
        if handled { Self::Ack } else { Self::RejectDrop }
    }
}

/// Handles the raw body of one delivery.
///
/// Decode failures must be reported as [`HandlerOutcome::RejectDrop`], not as
/// errors. An `Err` means the handler could not finish (e.g. a downstream
/// publish failed) and aborts the consume loop; the delivery is left unsettled.
pub trait MessageHandler: Send + Sync {
    /// Handle one message body.
    ///
    /// # Errors
    ///
    /// Returns an error when processing could not complete; the consume loop
    /// propagates it to the worker supervisor.
    fn handle<'a>(
        &'a self,
        body: &'a [u8],
        shutdown: &'a ShutdownSignal,
    ) -> BrokerFuture<'a, HandlerOutcome>;
}

/// Adapter turning a plain function into a [`MessageHandler`].
pub struct FnHandler<F>(F);

/// Wrap a synchronous `(bytes) -> outcome` function as a handler.
#[must_use]
pub const fn handler_fn<F, O>(f: F) -> FnHandler<F>
where
    F: Fn(&[u8]) -> O + Send + Sync,
    O: Into<HandlerOutcome>,
{
    FnHandler(f)
}

impl<F, O> MessageHandler for FnHandler<F>
where
    F: Fn(&[u8]) -> O + Send + Sync,
    O: Into<HandlerOutcome>,
{
    fn handle<'a>(
        &'a self,
        body: &'a [u8],
        _shutdown: &'a ShutdownSignal,
    ) -> BrokerFuture<'a, HandlerOutcome> {
        let outcome = (self.0)(body).into();
        Box::pin(async move { Ok(outcome) })
    }
}

/// Settles one delivery with the broker.
pub trait Acknowledger: Send + Sync {
    /// Positively acknowledge the delivery.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Connection`] if the channel is gone.
    fn ack(&self) -> BrokerFuture<'_, ()>;

    /// Negatively acknowledge the delivery.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Connection`] if the channel is gone.
    fn reject(&self, requeue: bool) -> BrokerFuture<'_, ()>;
}

/// One message received from a queue.
pub struct Delivery {
    /// Raw message body
    pub body: Vec<u8>,
    /// Broker-assigned tag, unique per channel
    pub delivery_tag: u64,
    /// Whether the broker delivered this message before
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Create a delivery settled through `acker`.
    #[must_use]
    pub fn new(
        body: Vec<u8>,
        delivery_tag: u64,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            body,
            delivery_tag,
            redelivered,
            acker,
        }
    }

    /// Settle this delivery according to `outcome`.
    ///
    /// # Errors
    ///
    /// Returns whatever the acknowledger returns.
    pub async fn settle(&self, outcome: HandlerOutcome) -> Result<(), MessagingError> {
        match outcome {
            HandlerOutcome::Ack => self.acker.ack().await,
            HandlerOutcome::RejectDrop => self.acker.reject(false).await,
            HandlerOutcome::RejectRequeue => self.acker.reject(true).await,
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish_non_exhaustive()
    }
}

/// Declares a durable queue binding and streams its deliveries.
pub trait MessageConsumer: Send + Sync {
    /// Declare `binding.exchange` (with `binding.kind`), declare the durable
    /// queue, bind it, and start consuming.
    ///
    /// With [`AckMode::Auto`] the broker considers each message handled on
    /// delivery; the returned deliveries must not be settled.
    ///
    /// # Errors
    ///
    /// - [`MessagingError::Connection`] if the broker is unreachable
    /// - [`MessagingError::Declaration`] on a topology conflict
    /// - [`MessagingError::Cancelled`] if shutdown fired while subscribing
    fn subscribe<'a>(
        &'a self,
        binding: &'a QueueBinding,
        ack_mode: AckMode,
        shutdown: &'a ShutdownSignal,
    ) -> BrokerFuture<'a, DeliveryStream>;
}
