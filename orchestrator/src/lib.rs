//! # Analysis Orchestrator
//!
//! Coordinates the image-analysis workflow over RabbitMQ. The orchestrator
//! never analyzes images itself: it reacts to one command and two upstream
//! events and broadcasts the `AnalysisStarted` / `AnalysisCompleted` facts
//! other services rely on.
//!
//! ## Modules
//!
//! - [`config`]: Environment-driven configuration
//! - [`choreographer`]: Executes rows of the workflow transition table
//! - [`workers`]: One supervised subscription per inbound queue
//! - [`app`]: Spawns the workers and waits for them on shutdown
//! - [`health`]: Liveness, readiness and metrics endpoints

pub mod app;
pub mod choreographer;
pub mod config;
pub mod health;
pub mod workers;

pub use app::{Orchestrator, RunningWorkers, wait_for_signal};
pub use choreographer::{AnalysisWork, Choreographer, SimulatedWork};
pub use config::{Config, ConfigError};
pub use health::{HealthState, router};
pub use workers::Worker;
