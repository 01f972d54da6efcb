//! Health check types for liveness and readiness probes.
//!
//! Liveness only says the process is up. Readiness asks every registered
//! [`ReadinessProbe`] (the broker connection and the workers' subscriptions,
//! in production) and reports the worst status found.

use analysis_orchestrator_core::MessagingError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{PoisonError, RwLock};

/// Health check status levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Component is fully operational
    Healthy,

    /// Component is not operational
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is healthy
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Get the worst status between two statuses
    #[must_use]
    pub const fn worst(self, other: Self) -> Self {
        match (self, other) {
            (Self::Healthy, Self::Healthy) => Self::Healthy,
            _ => Self::Unhealthy,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health check result for a component
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    /// Name of the component being checked
    pub component: String,

    /// Current health status
    pub status: HealthStatus,

    /// Optional message providing details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Optional metadata (e.g. connection counts)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<(String, String)>,
}

impl HealthCheck {
    /// Create a healthy check result
    #[must_use]
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Healthy,
            message: None,
            metadata: Vec::new(),
        }
    }

    /// Create an unhealthy check result
    #[must_use]
    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            metadata: Vec::new(),
        }
    }

    /// Add metadata to the health check
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }
}

/// Aggregated health report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// Overall status (worst of all checks)
    pub status: HealthStatus,

    /// Individual component checks
    pub checks: Vec<HealthCheck>,
}

impl HealthReport {
    /// Combine component checks. An empty report is healthy.
    #[must_use]
    pub fn from_checks(checks: Vec<HealthCheck>) -> Self {
        let status = checks
            .iter()
            .fold(HealthStatus::Healthy, |acc, check| acc.worst(check.status));
        Self { status, checks }
    }

    /// Query every probe in turn.
    pub async fn collect(probes: &[std::sync::Arc<dyn ReadinessProbe>]) -> Self {
        let mut checks = Vec::with_capacity(probes.len());
        for probe in probes {
            checks.push(probe.check().await);
        }
        Self::from_checks(checks)
    }
}

/// A component that can report whether the service is ready for traffic.
///
/// Checks should be cheap: they run on every readiness request and must not
/// open new broker connections.
pub trait ReadinessProbe: Send + Sync {
    /// Report current health.
    fn check(&self) -> Pin<Box<dyn Future<Output = HealthCheck> + Send + '_>>;
}

/// Subscription state of every worker, as a readiness probe.
///
/// A worker is marked failing when its subscribe step hits a topology
/// conflict or when its supervisor gives up, and cleared again once it
/// subscribes. Connection failures are left to the connection probe.
#[derive(Debug, Default)]
pub struct WorkerHealth {
    failing: RwLock<BTreeMap<String, String>>,
}

impl WorkerHealth {
    /// No worker failing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `worker` is bound and consuming.
    pub fn record_subscribed(&self, worker: &str) {
        self.failing
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(worker);
    }

    /// `worker` could not subscribe.
    pub fn record_subscribe_failed(&self, worker: &str, error: &MessagingError) {
        if matches!(error, MessagingError::Declaration { .. }) {
            self.mark(worker, error.to_string());
        }
    }

    /// The supervisor of `worker` stopped restarting it.
    pub fn record_gave_up(&self, worker: &str, error: &MessagingError) {
        self.mark(worker, format!("gave up: {error}"));
    }

    /// Names of the failing workers, sorted.
    #[must_use]
    pub fn failing(&self) -> Vec<String> {
        self.failing
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn mark(&self, worker: &str, reason: String) {
        self.failing
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(worker.to_string(), reason);
    }
}

impl ReadinessProbe for WorkerHealth {
    fn check(&self) -> Pin<Box<dyn Future<Output = HealthCheck> + Send + '_>> {
        let failing = self
            .failing
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Box::pin(async move {
            if failing.is_empty() {
                return HealthCheck::healthy("workers");
            }
            let names: Vec<&str> = failing.keys().map(String::as_str).collect();
            failing.iter().fold(
                HealthCheck::unhealthy("workers", format!("failing: {}", names.join(", "))),
                |check, (worker, reason)| check.with_metadata(worker.clone(), reason.clone()),
            )
        })
    }
}
