//! # Analysis Orchestrator Core
//!
//! Core types and traits for the analysis orchestrator.
//!
//! The orchestrator coordinates an image-analysis workflow purely through a
//! message broker. It never performs the analysis itself: it consumes commands
//! and upstream events, and emits the `AnalysisStarted` / `AnalysisCompleted`
//! facts that downstream subscribers rely on.
//!
//! ## Modules
//!
//! - [`contracts`]: Immutable message records exchanged on the broker
//! - [`topology`]: Static exchange/queue/routing-key registry
//! - [`codec`]: UTF-8 JSON encoding and decoding of payloads
//! - [`broker`]: Transport-agnostic publisher, consumer and handler traits
//! - [`workflow`]: Explicit workflow transition table
//! - [`shutdown`]: Cooperative cancellation shared by every worker
//! - [`error`]: The messaging error taxonomy
//!
//! ## Workflow
//!
//! ```text
//! RequestAnalysis ──► AnalysisStarted ──► (work) ──► AnalysisCompleted
//!
//! ImageUploaded ────► AnalysisStarted
//!
//! RecognitionCompleted ──────────────────────────► AnalysisCompleted
//! ```

pub mod broker;
pub mod codec;
pub mod contracts;
pub mod error;
pub mod shutdown;
pub mod topology;
pub mod workflow;

pub use broker::{
    Acknowledger, BrokerFuture, CommandPublisher, Delivery, DeliveryStream, EventPublisher,
    HandlerOutcome, MessageConsumer, MessageHandler,
};
pub use codec::JsonPayload;
pub use contracts::{
    AnalysisCompleted, AnalysisStarted, CorrelationId, ImageUploaded, MessageContract, ObjectKey,
    RecognitionCompleted, RequestAnalysis,
};
pub use error::MessagingError;
pub use shutdown::{Shutdown, ShutdownSignal};
pub use topology::{AckMode, ExchangeKind, QueueBinding};
