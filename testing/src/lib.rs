//! # Analysis Orchestrator Testing
//!
//! Testing utilities for the analysis orchestrator.
//!
//! This crate provides:
//! - [`InMemoryBroker`]: a deterministic broker implementing every broker seam
//! - Property-based strategies for message contracts and malformed payloads
//! - Log capture setup for tests
//!
//! ## Example
//!
//! ```ignore
//! use analysis_orchestrator_testing::InMemoryBroker;
//!
//! #[tokio::test]
//! async fn upload_emits_started() {
//!     let broker = InMemoryBroker::new();
//!     let (shutdown, signal) = shutdown::channel();
//!     let running = Orchestrator::new(&config, Arc::new(broker.clone()), Arc::new(broker.clone()))
//!         .spawn(&signal);
//!
//!     broker.publish_raw("image.uploaded", "", ExchangeKind::Fanout, r#"{"objectKey":"img2.jpg"}"#)?;
//!
//!     let started = broker.wait_for_published("analysis.started", 1, TIMEOUT).await?;
//!     assert_eq!(started.len(), 1);
//! }
//! ```

pub mod broker;

/// Test helpers and utilities.
pub mod helpers {
    use std::sync::Once;

    static TRACING: Once = Once::new();

    /// Route `tracing` output through the test harness.
    ///
    /// Honours `RUST_LOG`; safe to call from every test.
    pub fn init_tracing() {
        TRACING.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
                )
                .with_test_writer()
                .try_init();
        });
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;

    /// Non-empty identifier-like strings, e.g. `img-42.jpg`.
    pub fn identifier() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9][a-zA-Z0-9._/-]{0,40}"
    }

    /// A well-formed `RequestAnalysis` body.
    pub fn request_analysis_body() -> impl Strategy<Value = Vec<u8>> {
        (identifier(), identifier()).prop_map(|(correlation_id, object_key)| {
            serde_json::json!({ "correlationId": correlation_id, "objectKey": object_key })
                .to_string()
                .into_bytes()
        })
    }

    /// Bodies that must never decode into an upload event: random bytes,
    /// `null`, JSON of the wrong shape, and empty keys.
    pub fn malformed_upload_body() -> impl Strategy<Value = Vec<u8>> {
        prop_oneof![
            proptest::collection::vec(any::<u8>(), 0..64)
                .prop_filter("must not be valid JSON", |bytes| {
                    serde_json::from_slice::<serde_json::Value>(bytes).is_err()
                }),
            Just(b"null".to_vec()),
            Just(b"[]".to_vec()),
            Just(b"{}".to_vec()),
            Just(br#"{"objectKey":""}"#.to_vec()),
            Just(br#"{"objectKey":42}"#.to_vec()),
            "[a-z ]{1,20}".prop_map(String::into_bytes),
        ]
    }
}

pub use broker::{InMemoryBroker, PublishedMessage, Settlement};
