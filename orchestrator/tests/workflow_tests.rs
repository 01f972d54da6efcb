//! End-to-end workflow scenarios against the in-memory broker.
//!
//! Every test runs the real workers (subscribe, consume, supervise) and
//! observes only what reaches the broker: published events, settlements and
//! queue depths.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use analysis_orchestrator::{Config, Orchestrator, RunningWorkers};
use analysis_orchestrator_core::contracts::{AnalysisCompleted, AnalysisStarted};
use analysis_orchestrator_core::shutdown::{self, Shutdown};
use analysis_orchestrator_core::topology::{exchanges, queues, routes};
use analysis_orchestrator_core::workflow::{Trigger, transition};
use analysis_orchestrator_core::{CorrelationId, ExchangeKind, ObjectKey};
use analysis_orchestrator_runtime::WorkerExit;
use analysis_orchestrator_testing::helpers::init_tracing;
use analysis_orchestrator_testing::properties::malformed_upload_body;
use analysis_orchestrator_testing::{InMemoryBroker, Settlement};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

const BINDINGS: [(&str, &str); 3] = [
    (queues::ANALYSIS_COMMANDS, exchanges::ANALYSIS_COMMANDS),
    (queues::IMAGE_UPLOADED, exchanges::IMAGE_UPLOADED),
    (queues::RECOGNITION_COMPLETED, exchanges::RECOGNITION_COMPLETED),
];

fn config(overrides: &[(&str, &str)]) -> Config {
    Config::from_lookup(|key| {
        overrides
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| (*v).to_string())
            .or_else(|| match key {
                "RABBIT_HOST" => Some("localhost".to_string()),
                "RABBIT_USER" | "RABBIT_PASS" => Some("guest".to_string()),
                "ANALYSIS_SIMULATED_WORK_MS" => Some("20".to_string()),
                "RETRY_INTERVAL_MS" => Some("50".to_string()),
                _ => None,
            })
    })
    .expect("test configuration is valid")
}

fn spawn(broker: &InMemoryBroker, config: &Config) -> (Shutdown, RunningWorkers) {
    init_tracing();
    let (shutdown, signal) = shutdown::channel();
    let running =
        Orchestrator::new(config, Arc::new(broker.clone()), Arc::new(broker.clone())).spawn(&signal);
    (shutdown, running)
}

async fn start(broker: &InMemoryBroker, config: &Config) -> (Shutdown, RunningWorkers) {
    let started = spawn(broker, config);
    for (queue, exchange) in BINDINGS {
        assert!(
            broker.wait_for_binding(queue, exchange, TIMEOUT).await,
            "{queue} was never bound to {exchange}"
        );
    }
    started
}

async fn stop(shutdown: Shutdown, running: RunningWorkers) -> Vec<(&'static str, WorkerExit)> {
    shutdown.trigger();
    running.join(TIMEOUT).await
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

fn rejected_without_requeue(broker: &InMemoryBroker, queue: &str) -> usize {
    broker
        .settlements()
        .iter()
        .filter(|s| {
            matches!(s, Settlement::Reject { queue: q, requeue: false, .. } if q == queue)
        })
        .count()
}

fn acked(broker: &InMemoryBroker, queue: &str) -> usize {
    broker
        .settlements()
        .iter()
        .filter(|s| matches!(s, Settlement::Ack { queue: q, .. } if q == queue))
        .count()
}

#[tokio::test]
async fn request_analysis_emits_started_then_completed() {
    let broker = InMemoryBroker::new();
    let (shutdown, running) = start(&broker, &config(&[])).await;

    broker
        .publish_raw(
            exchanges::ANALYSIS_COMMANDS,
            routes::REQUEST_ANALYSIS,
            ExchangeKind::Direct,
            r#"{"correlationId":"abc","objectKey":"img1.jpg"}"#,
        )
        .unwrap();

    broker
        .wait_for_published(exchanges::ANALYSIS_COMPLETED, 1, TIMEOUT)
        .await
        .expect("AnalysisCompleted was not published");

    let events: Vec<_> = broker
        .published()
        .into_iter()
        .filter(|m| m.exchange != exchanges::ANALYSIS_COMMANDS)
        .collect();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].exchange, exchanges::ANALYSIS_STARTED);
    assert_eq!(events[0].kind, ExchangeKind::Fanout);
    assert_eq!(
        events[0].decode::<AnalysisStarted>().unwrap(),
        AnalysisStarted {
            correlation_id: Some(CorrelationId::new("abc")),
            object_key: ObjectKey::new("img1.jpg"),
        }
    );
    assert_eq!(events[1].exchange, exchanges::ANALYSIS_COMPLETED);
    assert_eq!(
        events[1].decode::<AnalysisCompleted>().unwrap(),
        AnalysisCompleted {
            correlation_id: Some(CorrelationId::new("abc")),
            object_key: Some(ObjectKey::new("img1.jpg")),
            success: true,
        }
    );

    // Auto-acknowledged on delivery: nothing left to settle.
    assert_eq!(broker.queue_depth(queues::ANALYSIS_COMMANDS), 0);
    assert_eq!(acked(&broker, queues::ANALYSIS_COMMANDS), 0);

    stop(shutdown, running).await;
}

#[tokio::test]
async fn commands_with_another_routing_key_are_not_consumed() {
    let broker = InMemoryBroker::new();
    let (shutdown, running) = start(&broker, &config(&[])).await;

    broker
        .publish_raw(
            exchanges::ANALYSIS_COMMANDS,
            "analysis.other",
            ExchangeKind::Direct,
            r#"{"correlationId":"abc","objectKey":"img1.jpg"}"#,
        )
        .unwrap();

    assert_eq!(broker.published_to(exchanges::ANALYSIS_COMMANDS)[0].routed_to, 0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(broker.published_to(exchanges::ANALYSIS_STARTED).is_empty());

    stop(shutdown, running).await;
}

#[tokio::test]
async fn image_upload_emits_started_without_correlation_id() {
    let broker = InMemoryBroker::new();
    let (shutdown, running) = start(&broker, &config(&[])).await;

    broker
        .publish_raw(
            exchanges::IMAGE_UPLOADED,
            "",
            ExchangeKind::Fanout,
            r#"{"objectKey":"img2.jpg"}"#,
        )
        .unwrap();

    let started = broker
        .wait_for_published(exchanges::ANALYSIS_STARTED, 1, TIMEOUT)
        .await
        .expect("AnalysisStarted was not published");
    assert_eq!(started[0].body, br#"{"objectKey":"img2.jpg"}"#);
    assert_eq!(
        started[0].decode::<AnalysisStarted>().unwrap(),
        AnalysisStarted {
            correlation_id: None,
            object_key: ObjectKey::new("img2.jpg"),
        }
    );

    eventually(|| acked(&broker, queues::IMAGE_UPLOADED) == 1).await;
    assert_eq!(broker.unacked_count(), 0);
    assert!(broker.published_to(exchanges::ANALYSIS_COMPLETED).is_empty());

    stop(shutdown, running).await;
}

#[tokio::test]
async fn malformed_upload_is_dropped_for_good() {
    let broker = InMemoryBroker::new();
    let (shutdown, running) = start(&broker, &config(&[])).await;

    broker
        .publish_raw(exchanges::IMAGE_UPLOADED, "", ExchangeKind::Fanout, "not-json")
        .unwrap();

    eventually(|| rejected_without_requeue(&broker, queues::IMAGE_UPLOADED) == 1).await;
    assert_eq!(broker.queue_depth(queues::IMAGE_UPLOADED), 0);
    assert_eq!(broker.unacked_count(), 0);
    assert!(broker.published_to(exchanges::ANALYSIS_STARTED).is_empty());

    // The worker keeps consuming after a poison message.
    broker
        .publish_raw(
            exchanges::IMAGE_UPLOADED,
            "",
            ExchangeKind::Fanout,
            r#"{"objectKey":"img3.jpg"}"#,
        )
        .unwrap();
    broker
        .wait_for_published(exchanges::ANALYSIS_STARTED, 1, TIMEOUT)
        .await
        .expect("worker stopped after a malformed message");

    stop(shutdown, running).await;
}

#[tokio::test]
async fn recognition_completed_emits_completed_with_supplied_ids() {
    let broker = InMemoryBroker::new();
    let (shutdown, running) = start(&broker, &config(&[])).await;

    broker
        .publish_raw(
            exchanges::RECOGNITION_COMPLETED,
            "",
            ExchangeKind::Fanout,
            r#"{"correlationId":"abc","labels":["cat","sofa"],"confidence":0.93}"#,
        )
        .unwrap();

    let completed = broker
        .wait_for_published(exchanges::ANALYSIS_COMPLETED, 1, TIMEOUT)
        .await
        .expect("AnalysisCompleted was not published");
    assert_eq!(
        completed[0].decode::<AnalysisCompleted>().unwrap(),
        AnalysisCompleted {
            correlation_id: Some(CorrelationId::new("abc")),
            object_key: None,
            success: true,
        }
    );
    eventually(|| acked(&broker, queues::RECOGNITION_COMPLETED) == 1).await;

    stop(shutdown, running).await;
}

#[tokio::test(start_paused = true)]
async fn unavailable_broker_is_retried_every_three_seconds() {
    let broker = InMemoryBroker::new();
    broker.set_available(false);
    let config = config(&[("RETRY_INTERVAL_MS", "3000")]);
    let (shutdown, running) = spawn(&broker, &config);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.connection_attempts(), 3, "one attempt per worker");

    tokio::time::sleep(Duration::from_millis(2800)).await;
    assert_eq!(broker.connection_attempts(), 3, "no retry before the interval");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(broker.connection_attempts(), 6);

    broker.set_available(true);
    tokio::time::sleep(Duration::from_secs(3)).await;
    for (queue, exchange) in BINDINGS {
        assert!(broker.is_bound(queue, exchange), "{queue} not bound after recovery");
    }
    assert_eq!(broker.connection_attempts(), 9);

    broker
        .publish_raw(
            exchanges::IMAGE_UPLOADED,
            "",
            ExchangeKind::Fanout,
            r#"{"objectKey":"img4.jpg"}"#,
        )
        .unwrap();
    broker
        .wait_for_published(exchanges::ANALYSIS_STARTED, 1, TIMEOUT)
        .await
        .expect("workers did not proceed after the broker came back");

    let exits = stop(shutdown, running).await;
    assert_eq!(exits.len(), 3);
}

#[tokio::test]
async fn failed_publish_leaves_upload_for_redelivery() {
    let broker = InMemoryBroker::new();
    let (shutdown, running) = start(&broker, &config(&[])).await;
    broker.fail_publishes_to(exchanges::ANALYSIS_STARTED);

    broker
        .publish_raw(
            exchanges::IMAGE_UPLOADED,
            "",
            ExchangeKind::Fanout,
            r#"{"objectKey":"img5.jpg"}"#,
        )
        .unwrap();

    // The worker restarts and the broker hands the message back.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(broker.published_to(exchanges::ANALYSIS_STARTED).is_empty());
    assert!(broker.settlements().is_empty());

    broker.clear_publish_failures();
    let started = broker
        .wait_for_published(exchanges::ANALYSIS_STARTED, 1, TIMEOUT)
        .await
        .expect("redelivered upload was not processed");
    assert_eq!(started.len(), 1);
    eventually(|| acked(&broker, queues::IMAGE_UPLOADED) == 1).await;
    assert_eq!(rejected_without_requeue(&broker, queues::IMAGE_UPLOADED), 0);

    stop(shutdown, running).await;
}

#[tokio::test]
async fn auto_acked_command_is_lost_when_started_fails() {
    // No compensation step exists for the command row.
    assert!(!transition(Trigger::RequestAnalysis).unprotected_emissions().is_empty());

    let broker = InMemoryBroker::new();
    let (shutdown, running) = start(&broker, &config(&[])).await;
    broker.fail_publishes_to(exchanges::ANALYSIS_STARTED);

    broker
        .publish_raw(
            exchanges::ANALYSIS_COMMANDS,
            routes::REQUEST_ANALYSIS,
            ExchangeKind::Direct,
            r#"{"correlationId":"lost","objectKey":"img6.jpg"}"#,
        )
        .unwrap();
    eventually(|| broker.queue_depth(queues::ANALYSIS_COMMANDS) == 0).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    broker.clear_publish_failures();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(broker.published_to(exchanges::ANALYSIS_STARTED).is_empty());
    assert!(broker.published_to(exchanges::ANALYSIS_COMPLETED).is_empty());
    assert_eq!(broker.unacked_count(), 0);

    stop(shutdown, running).await;
}

#[tokio::test]
async fn exchange_kind_conflict_keeps_only_that_worker_down() {
    let broker = InMemoryBroker::new();
    broker
        .declare_exchange(exchanges::IMAGE_UPLOADED, ExchangeKind::Direct)
        .unwrap();
    let (shutdown, running) = spawn(&broker, &config(&[]));

    assert!(
        broker
            .wait_for_binding(queues::ANALYSIS_COMMANDS, exchanges::ANALYSIS_COMMANDS, TIMEOUT)
            .await
    );
    assert!(
        broker
            .wait_for_binding(
                queues::RECOGNITION_COMPLETED,
                exchanges::RECOGNITION_COMPLETED,
                TIMEOUT
            )
            .await
    );

    let attempts_before = broker.connection_attempts();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!broker.is_bound(queues::IMAGE_UPLOADED, exchanges::IMAGE_UPLOADED));
    assert!(
        broker.connection_attempts() > attempts_before,
        "the failing worker keeps restarting"
    );

    let exits = stop(shutdown, running).await;
    assert_eq!(exits.len(), 3);
    assert!(exits.iter().all(|(_, exit)| *exit == WorkerExit::Stopped));
}

#[tokio::test]
async fn restarting_the_orchestrator_redeclares_idempotently() {
    let broker = InMemoryBroker::new();
    let config = config(&[]);

    let (shutdown, running) = start(&broker, &config).await;
    stop(shutdown, running).await;

    // Durable queue keeps the message while nobody consumes.
    broker
        .publish_raw(
            exchanges::IMAGE_UPLOADED,
            "",
            ExchangeKind::Fanout,
            r#"{"objectKey":"img7.jpg"}"#,
        )
        .unwrap();
    assert_eq!(broker.queue_depth(queues::IMAGE_UPLOADED), 1);

    let (shutdown, running) = start(&broker, &config).await;
    broker
        .wait_for_published(exchanges::ANALYSIS_STARTED, 1, TIMEOUT)
        .await
        .expect("queued upload was not processed after restart");

    broker
        .publish_raw(
            exchanges::IMAGE_UPLOADED,
            "",
            ExchangeKind::Fanout,
            r#"{"objectKey":"img8.jpg"}"#,
        )
        .unwrap();
    assert_eq!(broker.published_to(exchanges::IMAGE_UPLOADED)[1].routed_to, 1);
    broker
        .wait_for_published(exchanges::ANALYSIS_STARTED, 2, TIMEOUT)
        .await
        .expect("second upload was not processed");

    stop(shutdown, running).await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_simulated_work() {
    let broker = InMemoryBroker::new();
    let config = config(&[("ANALYSIS_SIMULATED_WORK_MS", "2000")]);
    let (shutdown, running) = start(&broker, &config).await;

    broker
        .publish_raw(
            exchanges::ANALYSIS_COMMANDS,
            routes::REQUEST_ANALYSIS,
            ExchangeKind::Direct,
            r#"{"correlationId":"abc","objectKey":"img9.jpg"}"#,
        )
        .unwrap();
    broker
        .wait_for_published(exchanges::ANALYSIS_STARTED, 1, TIMEOUT)
        .await
        .expect("AnalysisStarted was not published");

    let exits = stop(shutdown, running).await;

    assert_eq!(exits.len(), 3);
    assert!(exits.iter().all(|(_, exit)| *exit == WorkerExit::Stopped));
    assert!(broker.published_to(exchanges::ANALYSIS_COMPLETED).is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn malformed_uploads_are_rejected_and_publish_nothing(body in malformed_upload_body()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let broker = InMemoryBroker::new();
            let (shutdown, running) = start(&broker, &config(&[])).await;

            broker
                .publish_raw(exchanges::IMAGE_UPLOADED, "", ExchangeKind::Fanout, &body)
                .unwrap();
            eventually(|| rejected_without_requeue(&broker, queues::IMAGE_UPLOADED) == 1).await;

            assert_eq!(broker.queue_depth(queues::IMAGE_UPLOADED), 0);
            assert!(broker.published_to(exchanges::ANALYSIS_STARTED).is_empty());
            stop(shutdown, running).await;
        });
    }
}
