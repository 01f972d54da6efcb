//! Message contracts exchanged with the broker.
//!
//! Contracts are plain, immutable records. They are built at the moment a
//! worker decides to emit one and die once serialized onto the wire. Field
//! names follow the camelCase wire convention.
//!
//! - Commands are directives delivered point-to-point ([`RequestAnalysis`]).
//! - Events are facts broadcast to any number of subscribers
//!   ([`AnalysisStarted`], [`AnalysisCompleted`], and the upstream
//!   [`ImageUploaded`] / [`RecognitionCompleted`]).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name under which a contract is logged and measured.
pub trait MessageContract {
    /// Stable contract name, e.g. `"RequestAnalysis"`.
    const NAME: &'static str;
}

/// Identifies one end-to-end workflow instance.
///
/// Opaque to the orchestrator: it is copied verbatim from the inbound message
/// onto every event the workflow emits. Empty identifiers are rejected at
/// decode time.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Create a correlation id from trusted input.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CorrelationId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            return Err("correlationId cannot be empty".to_string());
        }
        Ok(Self(value))
    }
}

impl From<CorrelationId> for String {
    fn from(id: CorrelationId) -> Self {
        id.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies the image being analyzed (the object-storage key).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectKey(String);

impl ObjectKey {
    /// Create an object key from trusted input.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ObjectKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            return Err("objectKey cannot be empty".to_string());
        }
        Ok(Self(value))
    }
}

impl From<ObjectKey> for String {
    fn from(key: ObjectKey) -> Self {
        key.0
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Command asking the orchestrator to start an analysis.
///
/// Produced by the graph gateway, consumed by the orchestrator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestAnalysis {
    /// Workflow instance
    pub correlation_id: CorrelationId,
    /// Image to analyze
    pub object_key: ObjectKey,
}

impl MessageContract for RequestAnalysis {
    const NAME: &'static str = "RequestAnalysis";
}

/// Event published when the analysis has started.
///
/// `correlation_id` is absent when the workflow was triggered by an upload,
/// since [`ImageUploaded`] carries none.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisStarted {
    /// Workflow instance, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    /// Image being analyzed
    pub object_key: ObjectKey,
}

impl MessageContract for AnalysisStarted {
    const NAME: &'static str = "AnalysisStarted";
}

/// Event published when the analysis has finished.
///
/// Consumed by the graph gateway, which fans it out to subscription clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisCompleted {
    /// Workflow instance, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    /// Image that was analyzed, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_key: Option<ObjectKey>,
    /// Whether the analysis completed successfully
    pub success: bool,
}

impl MessageContract for AnalysisCompleted {
    const NAME: &'static str = "AnalysisCompleted";
}

/// Upstream event from the ingestion service: an image landed in storage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageUploaded {
    /// Key of the uploaded image
    pub object_key: ObjectKey,
}

impl MessageContract for ImageUploaded {
    const NAME: &'static str = "ImageUploaded";
}

/// Upstream event from the recognition service.
///
/// Opaque beyond triggering completion: the identifiers are picked up when
/// present and every other field is kept in `details` untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionCompleted {
    /// Workflow instance, when the recognition service forwarded it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    /// Image that was recognized, when forwarded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_key: Option<ObjectKey>,
    /// Remaining recognition payload
    #[serde(flatten)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl MessageContract for RecognitionCompleted {
    const NAME: &'static str = "RecognitionCompleted";
}
