//! In-memory broker for deterministic tests.
//!
//! [`InMemoryBroker`] implements every broker seam ([`CommandPublisher`],
//! [`EventPublisher`], [`MessageConsumer`]) and the readiness probe, with the
//! routing rules of an AMQP broker:
//!
//! - exchanges are declared on first use; redeclaring with another kind fails
//! - direct, fanout and topic exchanges route by [`ExchangeKind::routes`]
//! - a message published while no queue is bound is dropped
//! - queues are durable: they keep messages while no consumer is attached
//! - unsettled deliveries return to their queue, flagged as redelivered, when
//!   their subscription stream is dropped or the broker "drops the connection"
//!
//! Test hooks make outages and publish failures reproducible.

use analysis_orchestrator_core::{
    AckMode, Acknowledger, BrokerFuture, CommandPublisher, Delivery, DeliveryStream,
    EventPublisher, ExchangeKind, JsonPayload, MessageConsumer, MessagingError, QueueBinding,
    ShutdownSignal,
};
use analysis_orchestrator_runtime::{HealthCheck, ReadinessProbe};
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

/// A message accepted by an exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Target exchange
    pub exchange: String,
    /// Routing key used
    pub routing_key: String,
    /// Kind the exchange was declared with
    pub kind: ExchangeKind,
    /// Raw body
    pub body: Vec<u8>,
    /// Number of queues the message was routed to
    pub routed_to: usize,
}

impl PublishedMessage {
    /// Decode the body into a contract.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Decode`] if the body does not match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, MessagingError> {
        analysis_orchestrator_core::codec::decode(&self.body)
    }
}

/// How a delivery was settled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Settlement {
    /// Positively acknowledged
    Ack {
        /// Source queue
        queue: String,
        /// Delivery tag
        delivery_tag: u64,
    },
    /// Negatively acknowledged
    Reject {
        /// Source queue
        queue: String,
        /// Delivery tag
        delivery_tag: u64,
        /// Whether the message went back on the queue
        requeue: bool,
    },
}

#[derive(Clone, Debug)]
struct Stored {
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct Binding {
    exchange: String,
    queue: String,
    binding_key: String,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    subscription: u64,
    message: Stored,
}

#[derive(Debug)]
struct State {
    available: bool,
    generation: u64,
    connection_attempts: usize,
    next_tag: u64,
    next_subscription: u64,
    exchanges: HashMap<String, ExchangeKind>,
    bindings: Vec<Binding>,
    queues: HashMap<String, VecDeque<Stored>>,
    unacked: HashMap<u64, Unacked>,
    published: Vec<PublishedMessage>,
    settlements: Vec<Settlement>,
    failing_exchanges: HashSet<String>,
}

impl State {
    fn declare_exchange(&mut self, name: &str, kind: ExchangeKind) -> Result<(), MessagingError> {
        match self.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(MessagingError::Declaration {
                entity: name.to_string(),
                reason: format!(
                    "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{name}': \
                     received '{kind}' but current is '{existing}'"
                ),
            }),
            Some(_) => Ok(()),
            None => {
                self.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    /// Put unsettled deliveries back at the front of their queues, keeping
    /// their original order. `None` returns every subscription's messages.
    fn requeue_unacked(&mut self, subscription: Option<u64>) {
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, unacked)| subscription.is_none_or(|id| unacked.subscription == id))
            .map(|(tag, _)| *tag)
            .collect();
        let mut returned: Vec<(u64, Unacked)> = tags
            .into_iter()
            .filter_map(|tag| self.unacked.remove(&tag).map(|unacked| (tag, unacked)))
            .collect();
        returned.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
        for (_, unacked) in returned {
            let mut message = unacked.message;
            message.redelivered = true;
            self.queues
                .entry(unacked.queue)
                .or_default()
                .push_front(message);
        }
    }

    fn connect(&mut self) -> Result<(), MessagingError> {
        self.connection_attempts += 1;
        if self.available {
            Ok(())
        } else {
            Err(MessagingError::Connection("broker unavailable".to_string()))
        }
    }

    fn route(&mut self, exchange: &str, routing_key: &str, kind: ExchangeKind, body: &[u8]) {
        let targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && kind.routes(&b.binding_key, routing_key))
            .map(|b| b.queue.clone())
            .collect();

        for queue in &targets {
            self.queues.entry(queue.clone()).or_default().push_back(Stored {
                body: body.to_vec(),
                redelivered: false,
            });
        }

        self.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            kind,
            body: body.to_vec(),
            routed_to: targets.len(),
        });
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    deliveries: Notify,
    published: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory broker shared by publishers and consumers under test.
///
/// Cloning is cheap; clones observe the same exchanges and queues.
///
/// # Example
///
/// ```
/// use analysis_orchestrator_core::{EventPublisher, ExchangeKind, JsonPayload};
/// use analysis_orchestrator_testing::InMemoryBroker;
///
/// # tokio_test::block_on(async {
/// let broker = InMemoryBroker::new();
/// broker
///     .publish("analysis.started", "", JsonPayload::from_bytes(b"{}".to_vec()), ExchangeKind::Fanout)
///     .await
///     .unwrap();
///
/// let published = broker.published_to("analysis.started");
/// assert_eq!(published.len(), 1);
/// assert_eq!(published[0].routed_to, 0);
/// # });
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Create an empty, reachable broker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    available: true,
                    generation: 0,
                    connection_attempts: 0,
                    next_tag: 1,
                    next_subscription: 0,
                    exchanges: HashMap::new(),
                    bindings: Vec::new(),
                    queues: HashMap::new(),
                    unacked: HashMap::new(),
                    published: Vec::new(),
                    settlements: Vec::new(),
                    failing_exchanges: HashSet::new(),
                }),
                deliveries: Notify::new(),
                published: Notify::new(),
            }),
        }
    }

    /// Declare an exchange up front, e.g. to provoke a kind conflict.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Declaration`] if it exists with another kind.
    pub fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), MessagingError> {
        self.shared.lock().declare_exchange(name, kind)
    }

    /// Kind an exchange was declared with.
    #[must_use]
    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.shared.lock().exchanges.get(name).copied()
    }

    /// Publish raw bytes, bypassing serialization. Declares the exchange.
    ///
    /// # Errors
    ///
    /// Same as [`EventPublisher::publish`].
    pub fn publish_raw(
        &self,
        exchange: &str,
        routing_key: &str,
        kind: ExchangeKind,
        body: impl AsRef<[u8]>,
    ) -> Result<(), MessagingError> {
        self.accept(exchange, routing_key, kind, body.as_ref())
    }

    /// Make the broker reachable or unreachable.
    ///
    /// Going unreachable also drops every open subscription.
    pub fn set_available(&self, available: bool) {
        if available {
            self.shared.lock().available = true;
        } else {
            self.disconnect();
            self.shared.lock().available = false;
        }
    }

    /// Drop every open subscription, as if the connection was lost.
    ///
    /// Unsettled deliveries go back to the front of their queue flagged as
    /// redelivered; their acknowledgers fail from now on.
    pub fn disconnect(&self) {
        {
            let mut state = self.shared.lock();
            state.generation += 1;
            state.requeue_unacked(None);
        }
        self.shared.deliveries.notify_waiters();
    }

    /// Fail every publish to `exchange` until cleared.
    pub fn fail_publishes_to(&self, exchange: &str) {
        self.shared
            .lock()
            .failing_exchanges
            .insert(exchange.to_string());
    }

    /// Stop failing publishes.
    pub fn clear_publish_failures(&self) {
        self.shared.lock().failing_exchanges.clear();
    }

    /// Number of connect attempts made by publishers and consumers.
    #[must_use]
    pub fn connection_attempts(&self) -> usize {
        self.shared.lock().connection_attempts
    }

    /// Every message accepted so far, in order.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.shared.lock().published.clone()
    }

    /// Messages accepted by `exchange`, in order.
    #[must_use]
    pub fn published_to(&self, exchange: &str) -> Vec<PublishedMessage> {
        self.shared
            .lock()
            .published
            .iter()
            .filter(|m| m.exchange == exchange)
            .cloned()
            .collect()
    }

    /// Every settlement so far, in order.
    #[must_use]
    pub fn settlements(&self) -> Vec<Settlement> {
        self.shared.lock().settlements.clone()
    }

    /// Ready messages waiting in `queue`.
    #[must_use]
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.shared.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Deliveries handed out but not yet settled.
    #[must_use]
    pub fn unacked_count(&self) -> usize {
        self.shared.lock().unacked.len()
    }

    /// Whether `queue` is bound to `exchange`.
    #[must_use]
    pub fn is_bound(&self, queue: &str, exchange: &str) -> bool {
        self.shared
            .lock()
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange)
    }

    /// Wait until `exchange` has accepted at least `count` messages.
    ///
    /// # Errors
    ///
    /// Returns the messages seen so far if `timeout` elapses first.
    pub async fn wait_for_published(
        &self,
        exchange: &str,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<PublishedMessage>, Vec<PublishedMessage>> {
        let wait = async {
            loop {
                let notified = self.shared.published.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let seen = self.published_to(exchange);
                if seen.len() >= count {
                    return seen;
                }
                notified.await;
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| self.published_to(exchange))
    }

    /// Wait until `queue` has been bound to `exchange`. Returns `false` if
    /// `timeout` elapses first.
    pub async fn wait_for_binding(&self, queue: &str, exchange: &str, timeout: Duration) -> bool {
        let wait = async {
            while !self.is_bound(queue, exchange) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    fn accept(
        &self,
        exchange: &str,
        routing_key: &str,
        kind: ExchangeKind,
        body: &[u8],
    ) -> Result<(), MessagingError> {
        {
            let mut state = self.shared.lock();
            state.connect()?;
            state.declare_exchange(exchange, kind)?;
            if state.failing_exchanges.contains(exchange) {
                return Err(MessagingError::Publish {
                    exchange: exchange.to_string(),
                    reason: "injected publish failure".to_string(),
                });
            }
            state.route(exchange, routing_key, kind, body);
        }
        self.shared.deliveries.notify_waiters();
        self.shared.published.notify_waiters();
        Ok(())
    }

    fn bind(&self, binding: &QueueBinding) -> Result<u64, MessagingError> {
        let mut state = self.shared.lock();
        state.connect()?;
        state.declare_exchange(&binding.exchange, binding.kind)?;
        state.queues.entry(binding.queue.clone()).or_default();

        let exists = state.bindings.iter().any(|b| {
            b.exchange == binding.exchange
                && b.queue == binding.queue
                && b.binding_key == binding.routing_key
        });
        if !exists {
            state.bindings.push(Binding {
                exchange: binding.exchange.clone(),
                queue: binding.queue.clone(),
                binding_key: binding.routing_key.clone(),
            });
        }
        Ok(state.generation)
    }

    /// Take the next ready message, or `Err` if the subscription was dropped.
    fn next_delivery(
        &self,
        queue: &str,
        ack_mode: AckMode,
        generation: u64,
        subscription: u64,
    ) -> Result<Option<Delivery>, MessagingError> {
        let mut state = self.shared.lock();
        if state.generation != generation || !state.available {
            return Err(MessagingError::Connection(format!(
                "subscription to '{queue}' dropped"
            )));
        }

        let Some(message) = state.queues.get_mut(queue).and_then(VecDeque::pop_front) else {
            return Ok(None);
        };

        let tag = state.next_tag;
        state.next_tag += 1;

        if ack_mode == AckMode::Manual {
            state.unacked.insert(
                tag,
                Unacked {
                    queue: queue.to_string(),
                    subscription,
                    message: message.clone(),
                },
            );
        }

        Ok(Some(Delivery::new(
            message.body,
            tag,
            message.redelivered,
            Box::new(InMemoryAcker {
                shared: Arc::clone(&self.shared),
                queue: queue.to_string(),
                delivery_tag: tag,
            }),
        )))
    }
}

impl CommandPublisher for InMemoryBroker {
    fn send<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        payload: JsonPayload,
        kind: ExchangeKind,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move { self.accept(exchange, routing_key, kind, payload.as_bytes()) })
    }
}

impl EventPublisher for InMemoryBroker {
    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        payload: JsonPayload,
        kind: ExchangeKind,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move { self.accept(exchange, routing_key, kind, payload.as_bytes()) })
    }
}

impl MessageConsumer for InMemoryBroker {
    fn subscribe<'a>(
        &'a self,
        binding: &'a QueueBinding,
        ack_mode: AckMode,
        shutdown: &'a ShutdownSignal,
    ) -> BrokerFuture<'a, DeliveryStream> {
        Box::pin(async move {
            if shutdown.is_triggered() {
                return Err(MessagingError::Cancelled);
            }

            let generation = self.bind(binding)?;
            let subscription = {
                let mut state = self.shared.lock();
                state.next_subscription += 1;
                state.next_subscription
            };
            let broker = self.clone();
            let queue = binding.queue.clone();

            let stream = async_stream::stream! {
                let _guard = SubscriptionGuard {
                    shared: Arc::clone(&broker.shared),
                    subscription,
                };
                loop {
                    let notified = broker.shared.deliveries.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();

                    match broker.next_delivery(&queue, ack_mode, generation, subscription) {
                        Ok(Some(delivery)) => yield Ok::<_, MessagingError>(delivery),
                        Ok(None) => notified.await,
                        Err(error) => {
                            tracing::debug!(queue = %queue, error = %error, "In-memory subscription closed");
                            break;
                        }
                    }
                }
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

/// Returns a subscription's unsettled deliveries when its stream is dropped,
/// the way a broker does when a consumer's channel closes.
struct SubscriptionGuard {
    shared: Arc<Shared>,
    subscription: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.shared.lock().requeue_unacked(Some(self.subscription));
        self.shared.deliveries.notify_waiters();
    }
}

impl ReadinessProbe for InMemoryBroker {
    fn check(&self) -> Pin<Box<dyn Future<Output = HealthCheck> + Send + '_>> {
        let available = self.shared.lock().available;
        Box::pin(async move {
            if available {
                HealthCheck::healthy("broker")
            } else {
                HealthCheck::unhealthy("broker", "broker unavailable")
            }
        })
    }
}

struct InMemoryAcker {
    shared: Arc<Shared>,
    queue: String,
    delivery_tag: u64,
}

impl InMemoryAcker {
    fn settle(&self, requeue: Option<bool>) -> Result<(), MessagingError> {
        {
            let mut state = self.shared.lock();
            let Some(unacked) = state.unacked.remove(&self.delivery_tag) else {
                return Err(MessagingError::Connection(format!(
                    "delivery {} on '{}' is no longer outstanding",
                    self.delivery_tag, self.queue
                )));
            };

            let settlement = match requeue {
                None => Settlement::Ack {
                    queue: self.queue.clone(),
                    delivery_tag: self.delivery_tag,
                },
                Some(requeue) => {
                    if requeue {
                        let mut message = unacked.message;
                        message.redelivered = true;
                        state
                            .queues
                            .entry(self.queue.clone())
                            .or_default()
                            .push_back(message);
                    }
                    Settlement::Reject {
                        queue: self.queue.clone(),
                        delivery_tag: self.delivery_tag,
                        requeue,
                    }
                }
            };
            state.settlements.push(settlement);
        }
        self.shared.deliveries.notify_waiters();
        Ok(())
    }
}

impl Acknowledger for InMemoryAcker {
    fn ack(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move { self.settle(None) })
    }

    fn reject(&self, requeue: bool) -> BrokerFuture<'_, ()> {
        Box::pin(async move { self.settle(Some(requeue)) })
    }
}
