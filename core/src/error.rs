//! Error taxonomy for broker and workflow operations.
//!
//! The variants map onto how each failure is handled:
//!
//! | Variant | Recovery |
//! |---|---|
//! | [`MessagingError::Connection`] | Worker supervisor retries after the configured delay |
//! | [`MessagingError::Declaration`] | Fatal configuration error, surfaced by repeated restarts |
//! | [`MessagingError::Decode`] | Message rejected without requeue and dropped |
//! | [`MessagingError::Publish`] | Propagated to the caller; aborts the in-flight handler |
//! | [`MessagingError::Cancelled`] | Shutdown was requested; not a failure |

use thiserror::Error;

/// Errors that can occur while talking to the broker or handling a message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessagingError {
    /// Broker unreachable, connection lost, or the delivery stream ended.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Topology conflict, e.g. an exchange redeclared with a different kind.
    #[error("Declaration failed for '{entity}': {reason}")]
    Declaration {
        /// The exchange or queue that could not be declared
        entity: String,
        /// The reason for failure
        reason: String,
    },

    /// A message body could not be decoded into the expected contract.
    #[error("Decode failed: {0}")]
    Decode(String),

    /// A message could not be serialized or sent.
    #[error("Publish failed for exchange '{exchange}': {reason}")]
    Publish {
        /// The exchange that failed
        exchange: String,
        /// The reason for failure
        reason: String,
    },

    /// The shutdown signal fired while the operation was suspended.
    #[error("Operation cancelled by shutdown")]
    Cancelled,
}

impl MessagingError {
    /// Whether the supervisor should restart the worker after this error.
    ///
    /// Declaration errors are retried too: the condition stays visible through
    /// repeated log output and the readiness probe until the topology is fixed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Cancelled | Self::Decode(_))
    }

    /// Short, stable label for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Declaration { .. } => "declaration",
            Self::Decode(_) => "decode",
            Self::Publish { .. } => "publish",
            Self::Cancelled => "cancelled",
        }
    }
}
