//! # Analysis Orchestrator Runtime
//!
//! Runtime pieces that keep workers alive on top of the broker seams defined
//! in `analysis-orchestrator-core`.
//!
//! ## Core Components
//!
//! - **Consumer loop** ([`consumer::consume`]): feeds deliveries to a handler
//!   and settles each one according to the handler's outcome
//! - **Supervisor** ([`supervisor::supervise`]): restarts a failed
//!   subscribe-then-consume attempt after the retry delay
//! - **Retry policy** ([`retry::RetryPolicy`]): fixed 3 second interval by
//!   default, optionally bounded and growing
//! - **Health** ([`health`]): liveness/readiness status types, the readiness
//!   seam and per-worker subscription health
//! - **Metrics** ([`metrics`]): Prometheus counters for consumption,
//!   publishing and restarts
//!
//! ## Example
//!
//! ```ignore
//! use analysis_orchestrator_runtime::{consumer, supervisor, retry::RetryPolicy};
//!
//! let exit = supervisor::supervise("image-uploaded", &RetryPolicy::default(), &signal, || async {
//!     let deliveries = broker.subscribe(&binding, AckMode::Manual, &signal).await?;
//!     consumer::consume(&binding.queue, deliveries, &handler, AckMode::Manual, &signal).await
//! })
//! .await;
//! ```

/// Consumer loop translating handler outcomes into acknowledgements
pub mod consumer;

/// Liveness and readiness reporting
pub mod health;

/// Prometheus metrics for observability
pub mod metrics;

/// Retry policy for worker restarts
pub mod retry;

/// Restart loop keeping each worker alive
pub mod supervisor;

pub use health::{HealthCheck, HealthReport, HealthStatus, ReadinessProbe, WorkerHealth};
pub use retry::RetryPolicy;
pub use supervisor::{WorkerExit, supervise};
