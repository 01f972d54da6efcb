//! Lazily established, shared broker connection.
//!
//! Every publish and every subscription opens its own channel on one shared
//! connection. The connection is created on first use and recreated on the
//! next use after it was lost. Concurrent first callers are serialized by an
//! async init lock and re-check after acquiring it, so exactly one connection
//! is opened.

use analysis_orchestrator_core::{BrokerFuture, MessagingError};
use analysis_orchestrator_runtime::metrics::ConnectionMetrics;
use analysis_orchestrator_runtime::{HealthCheck, ReadinessProbe};
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use lapin::{Channel, Connection, ConnectionProperties};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Broker address and credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct RabbitMqSettings {
    /// Broker host name
    pub host: String,
    /// AMQP port
    pub port: u16,
    /// Virtual host
    pub vhost: String,
    /// User name
    pub username: String,
    /// Password (never logged)
    pub password: String,
}

impl RabbitMqSettings {
    /// Settings for `host` with the default port and vhost.
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: 5672,
            vhost: "/".to_string(),
            username: username.into(),
            password: password.into(),
        }
    }

    /// Set the AMQP port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the virtual host.
    #[must_use]
    pub fn vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = vhost.into();
        self
    }

    /// Structured `amqp://` URI; lapin handles any escaping.
    #[must_use]
    pub fn amqp_uri(&self) -> AMQPUri {
        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.username.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.vhost.clone(),
            ..AMQPUri::default()
        }
    }

    /// Address without credentials, for logs.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}{}", self.host, self.port, self.vhost_path())
    }

    fn vhost_path(&self) -> String {
        if self.vhost.starts_with('/') {
            self.vhost.clone()
        } else {
            format!("/{}", self.vhost)
        }
    }
}

impl fmt::Debug for RabbitMqSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RabbitMqSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("vhost", &self.vhost)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Opens connections to the broker.
///
/// Split out from [`ConnectionManager`] so the lazy, single-flight connect
/// logic can be exercised without a broker.
pub trait Connector: Send + Sync {
    /// Live connection handle.
    type Connection: Send + Sync;

    /// Open a new connection.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Connection`] if the broker is unreachable or
    /// refuses the credentials.
    fn connect(&self) -> BrokerFuture<'_, Self::Connection>;

    /// Whether `connection` is still usable.
    fn is_open(connection: &Self::Connection) -> bool;

    /// Address for logs.
    fn endpoint(&self) -> String;
}

/// Connector for a real AMQP broker.
#[derive(Clone, Debug)]
pub struct AmqpConnector {
    settings: RabbitMqSettings,
}

impl AmqpConnector {
    /// Create a connector for `settings`.
    #[must_use]
    pub const fn new(settings: RabbitMqSettings) -> Self {
        Self { settings }
    }
}

impl Connector for AmqpConnector {
    type Connection = Connection;

    fn connect(&self) -> BrokerFuture<'_, Connection> {
        Box::pin(async move {
            Connection::connect_uri(self.settings.amqp_uri(), ConnectionProperties::default())
                .await
                .map_err(|e| {
                    MessagingError::Connection(format!(
                        "Failed to connect to RabbitMQ at {}: {e}",
                        self.settings.endpoint()
                    ))
                })
        })
    }

    fn is_open(connection: &Connection) -> bool {
        connection.status().connected()
    }

    fn endpoint(&self) -> String {
        self.settings.endpoint()
    }
}

/// Shared connection, opened on first use.
pub struct ConnectionManager<C: Connector = AmqpConnector> {
    connector: C,
    current: RwLock<Option<Arc<C::Connection>>>,
    init: tokio::sync::Mutex<()>,
    opened: AtomicU64,
}

impl<C: Connector> ConnectionManager<C> {
    /// Create a manager; nothing is opened until the first call.
    #[must_use]
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            current: RwLock::new(None),
            init: tokio::sync::Mutex::new(()),
            opened: AtomicU64::new(0),
        }
    }

    /// Get the open connection, connecting if there is none.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Connection`] if connecting fails.
    pub async fn connection(&self) -> Result<Arc<C::Connection>, MessagingError> {
        if let Some(connection) = self.open_connection() {
            return Ok(connection);
        }

        let _init = self.init.lock().await;
        if let Some(connection) = self.open_connection() {
            return Ok(connection);
        }

        let endpoint = self.connector.endpoint();
        tracing::info!(endpoint = %endpoint, "Connecting to RabbitMQ");

        let connection = Arc::new(self.connector.connect().await.inspect_err(|e| {
            tracing::warn!(endpoint = %endpoint, error = %e, "RabbitMQ connection failed");
        })?);

        *self.current.write().unwrap_or_else(PoisonError::into_inner) =
            Some(Arc::clone(&connection));
        self.opened.fetch_add(1, Ordering::SeqCst);
        ConnectionMetrics::record_opened();
        tracing::info!(endpoint = %endpoint, "Connected to RabbitMQ");

        Ok(connection)
    }

    /// Whether a connection is currently open. Never connects.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.open_connection().is_some()
    }

    /// Number of connections opened so far.
    #[must_use]
    pub fn connections_opened(&self) -> u64 {
        self.opened.load(Ordering::SeqCst)
    }

    /// Forget the current connection, returning it if there was one.
    pub fn take(&self) -> Option<Arc<C::Connection>> {
        self.current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn open_connection(&self) -> Option<Arc<C::Connection>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|connection| C::is_open(connection))
            .cloned()
    }
}

impl ConnectionManager<AmqpConnector> {
    /// Manager for a real broker.
    #[must_use]
    pub fn amqp(settings: RabbitMqSettings) -> Self {
        Self::new(AmqpConnector::new(settings))
    }

    /// Open a fresh channel on the shared connection.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Connection`] if connecting or opening the
    /// channel fails.
    pub async fn create_channel(&self) -> Result<Channel, MessagingError> {
        let connection = self.connection().await?;
        connection
            .create_channel()
            .await
            .map_err(|e| MessagingError::Connection(format!("Failed to create channel: {e}")))
    }

    /// Close the connection if one is open.
    pub async fn close(&self) {
        let Some(connection) = self.take() else {
            return;
        };
        if !connection.status().connected() {
            return;
        }
        match connection.close(200, "shutdown").await {
            Ok(()) => tracing::info!("RabbitMQ connection closed"),
            Err(e) => tracing::warn!(error = %e, "Failed to close RabbitMQ connection cleanly"),
        }
    }
}

impl<C: Connector> ReadinessProbe for ConnectionManager<C> {
    fn check(&self) -> Pin<Box<dyn Future<Output = HealthCheck> + Send + '_>> {
        let connected = self.is_connected();
        let opened = self.connections_opened();
        Box::pin(async move {
            let check = if connected {
                HealthCheck::healthy("rabbitmq")
            } else {
                HealthCheck::unhealthy("rabbitmq", "no open connection")
            };
            check.with_metadata("connections_opened", opened.to_string())
        })
    }
}

/// Map a declare/bind failure: protocol errors are topology conflicts,
/// everything else means the connection is gone.
pub(crate) fn declaration_error(entity: &str, error: &lapin::Error) -> MessagingError {
    match error {
        lapin::Error::ProtocolError(_) => MessagingError::Declaration {
            entity: entity.to_string(),
            reason: error.to_string(),
        },
        _ => MessagingError::Connection(format!("Failed to declare '{entity}': {error}")),
    }
}
