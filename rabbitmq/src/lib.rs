//! RabbitMQ transport for the analysis orchestrator.
//!
//! This crate implements the broker seams from `analysis-orchestrator-core`
//! on top of lapin (AMQP 0-9-1):
//!
//! - [`ConnectionManager`]: one lazily opened connection shared by the
//!   process, recreated on next use after it was lost
//! - [`RabbitMqPublisher`]: [`CommandPublisher`] and [`EventPublisher`]
//! - [`RabbitMqConsumer`]: [`MessageConsumer`] with durable queues
//!
//! # Architecture
//!
//! ```text
//!                  ┌───────────────────────┐
//!                  │   ConnectionManager   │  one AMQP connection
//!                  └──────────┬────────────┘
//!              ┌──────────────┴──────────────┐
//!              ▼                             ▼
//!   ┌────────────────────┐        ┌────────────────────┐
//!   │  RabbitMqPublisher │        │  RabbitMqConsumer  │
//!   │ channel per publish│        │channel per worker  │
//!   └────────────────────┘        └────────────────────┘
//! ```
//!
//! # Delivery Semantics
//!
//! - Exchanges and queues are declared durable; messages are persistent.
//! - Publishing is non-mandatory: with no bound queue the broker drops the
//!   message silently.
//! - Manual-ack subscriptions leave unsettled deliveries with the broker
//!   until acked; if the channel closes first they are redelivered.
//!
//! lapin does not recover connections on its own. After a connection loss
//! every delivery stream ends, the worker supervisor retries, and the next
//! channel request opens a fresh connection.
//!
//! # Example
//!
//! ```no_run
//! use analysis_orchestrator_core::{EventPublisher, ExchangeKind, JsonPayload};
//! use analysis_orchestrator_rabbitmq::{ConnectionManager, RabbitMqPublisher, RabbitMqSettings};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = RabbitMqSettings::new("localhost", "guest", "guest");
//! let connections = Arc::new(ConnectionManager::amqp(settings));
//! let publisher = RabbitMqPublisher::new(Arc::clone(&connections));
//!
//! let payload = JsonPayload::from_bytes(br#"{"objectKey":"img1.jpg"}"#.to_vec());
//! publisher
//!     .publish("analysis.started", "", payload, ExchangeKind::Fanout)
//!     .await?;
//!
//! connections.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! [`CommandPublisher`]: analysis_orchestrator_core::CommandPublisher
//! [`EventPublisher`]: analysis_orchestrator_core::EventPublisher
//! [`MessageConsumer`]: analysis_orchestrator_core::MessageConsumer

pub mod connection;
pub mod consumer;
pub mod publisher;

pub use connection::{AmqpConnector, ConnectionManager, Connector, RabbitMqSettings};
pub use consumer::RabbitMqConsumer;
pub use publisher::RabbitMqPublisher;
