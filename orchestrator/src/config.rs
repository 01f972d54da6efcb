//! Configuration management for the analysis orchestrator.
//!
//! Loads configuration from environment variables (optionally seeded from a
//! `.env` file) with sensible defaults. Broker credentials have no default:
//! the process refuses to start without them.

use analysis_orchestrator_core::QueueBinding;
use analysis_orchestrator_core::topology::{exchanges, queues, routes};
use analysis_orchestrator_rabbitmq::RabbitMqSettings;
use analysis_orchestrator_runtime::RetryPolicy;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is unset or empty
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),

    /// A variable is set but cannot be parsed
    #[error("Invalid value {value:?} for {key}: {reason}")]
    Invalid {
        /// Variable name
        key: &'static str,
        /// Raw value
        value: String,
        /// Parse failure
        reason: String,
    },
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Broker connection settings
    pub rabbitmq: RabbitMqSettings,
    /// Exchange, queue and routing key names
    pub topology: TopologyConfig,
    /// Worker restart policy
    pub retry: RetryPolicy,
    /// Workflow tuning
    pub workflow: WorkflowConfig,
    /// Health/metrics server
    pub server: ServerConfig,
}

/// Names of the inbound exchanges, queues and routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyConfig {
    /// Routing key binding the command queue to `analysis.commands`
    pub request_routing_key: String,
    /// Fanout exchange owned by the ingestion service
    pub image_uploaded_exchange: String,
    /// Fanout exchange owned by the recognition service
    pub recognition_completed_exchange: String,
    /// Queue receiving `RequestAnalysis`
    pub command_queue: String,
    /// Queue receiving `ImageUploaded`
    pub image_uploaded_queue: String,
    /// Queue receiving `RecognitionCompleted`
    pub recognition_completed_queue: String,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            request_routing_key: routes::REQUEST_ANALYSIS.to_string(),
            image_uploaded_exchange: exchanges::IMAGE_UPLOADED.to_string(),
            recognition_completed_exchange: exchanges::RECOGNITION_COMPLETED.to_string(),
            command_queue: queues::ANALYSIS_COMMANDS.to_string(),
            image_uploaded_queue: queues::IMAGE_UPLOADED.to_string(),
            recognition_completed_queue: queues::RECOGNITION_COMPLETED.to_string(),
        }
    }
}

impl TopologyConfig {
    /// Binding of the command queue to the direct command exchange.
    #[must_use]
    pub fn command_binding(&self) -> QueueBinding {
        QueueBinding::direct(
            &self.command_queue,
            exchanges::ANALYSIS_COMMANDS,
            &self.request_routing_key,
        )
    }

    /// Binding of the upload queue to the ingestion exchange.
    #[must_use]
    pub fn image_uploaded_binding(&self) -> QueueBinding {
        QueueBinding::fanout(&self.image_uploaded_queue, &self.image_uploaded_exchange)
    }

    /// Binding of the recognition queue to the recognition exchange.
    #[must_use]
    pub fn recognition_completed_binding(&self) -> QueueBinding {
        QueueBinding::fanout(
            &self.recognition_completed_queue,
            &self.recognition_completed_exchange,
        )
    }
}

/// Workflow tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkflowConfig {
    /// How long the root command worker simulates analysis
    pub simulated_work: Duration,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            simulated_work: Duration::from_secs(2),
        }
    }
}

/// Health/metrics server configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerConfig {
    /// Bind address for `/health/*` and `/metrics`
    pub health_addr: SocketAddr,
    /// How long to wait for workers after shutdown is requested
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            health_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a required variable is missing or any
    /// variable fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, e.g. a map in tests.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a required variable is missing or any
    /// variable fails to parse.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let topology_defaults = TopologyConfig::default();

        let mut rabbitmq = RabbitMqSettings::new(
            env.required("RABBIT_HOST")?,
            env.credential("RABBIT_USER")?,
            env.credential("RABBIT_PASS")?,
        );
        if let Some(port) = env.parse::<u16>("RABBIT_PORT")? {
            rabbitmq = rabbitmq.port(port);
        }
        if let Some(vhost) = env.optional("RABBIT_VHOST") {
            rabbitmq = rabbitmq.vhost(vhost);
        }

        let topology = TopologyConfig {
            request_routing_key: env
                .optional("ANALYSIS_REQUEST_ROUTING_KEY")
                .unwrap_or(topology_defaults.request_routing_key),
            image_uploaded_exchange: env
                .optional("IMAGE_UPLOADED_EXCHANGE")
                .unwrap_or(topology_defaults.image_uploaded_exchange),
            recognition_completed_exchange: env
                .optional("RECOGNITION_COMPLETED_EXCHANGE")
                .unwrap_or(topology_defaults.recognition_completed_exchange),
            command_queue: env
                .optional("ANALYSIS_COMMANDS_QUEUE")
                .unwrap_or(topology_defaults.command_queue),
            image_uploaded_queue: env
                .optional("IMAGE_UPLOADED_QUEUE")
                .unwrap_or(topology_defaults.image_uploaded_queue),
            recognition_completed_queue: env
                .optional("RECOGNITION_COMPLETED_QUEUE")
                .unwrap_or(topology_defaults.recognition_completed_queue),
        };

        let mut retry = RetryPolicy::builder();
        if let Some(interval) = env.parse::<u64>("RETRY_INTERVAL_MS")? {
            retry = retry.initial_delay(Duration::from_millis(interval));
        }
        if let Some(max_retries) = env.parse::<usize>("RETRY_MAX_ATTEMPTS")? {
            retry = retry.max_retries(max_retries);
        }
        if let Some(multiplier) = env.parse::<f64>("RETRY_MULTIPLIER")? {
            if !multiplier.is_finite() || multiplier < 1.0 {
                return Err(ConfigError::Invalid {
                    key: "RETRY_MULTIPLIER",
                    value: multiplier.to_string(),
                    reason: "must be a finite number >= 1.0".to_string(),
                });
            }
            retry = retry.multiplier(multiplier);
        }
        if let Some(max_delay) = env.parse::<u64>("RETRY_MAX_DELAY_MS")? {
            retry = retry.max_delay(Duration::from_millis(max_delay));
        }
        let retry = retry.build();
        if retry.initial_delay.is_zero() {
            return Err(ConfigError::Invalid {
                key: "RETRY_INTERVAL_MS",
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if retry.max_delay < retry.initial_delay {
            return Err(ConfigError::Invalid {
                key: "RETRY_MAX_DELAY_MS",
                value: retry.max_delay.as_millis().to_string(),
                reason: format!(
                    "must not be below the retry interval ({} ms)",
                    retry.initial_delay.as_millis()
                ),
            });
        }

        let workflow = WorkflowConfig {
            simulated_work: env
                .parse::<u64>("ANALYSIS_SIMULATED_WORK_MS")?
                .map_or(WorkflowConfig::default().simulated_work, Duration::from_millis),
        };

        let server_defaults = ServerConfig::default();
        let server = ServerConfig {
            health_addr: env
                .parse::<SocketAddr>("HEALTH_ADDR")?
                .unwrap_or(server_defaults.health_addr),
            shutdown_timeout: env
                .parse::<u64>("SHUTDOWN_TIMEOUT_SECS")?
                .map_or(server_defaults.shutdown_timeout, Duration::from_secs),
        };

        Ok(Self {
            rabbitmq,
            topology,
            retry,
            workflow,
            server,
        })
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    /// Set and non-blank.
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.optional(key).ok_or(ConfigError::Missing(key))
    }

    /// Set and non-blank, kept verbatim.
    fn credential(&self, key: &'static str) -> Result<String, ConfigError> {
        (self.0)(key)
            .filter(|value| !value.trim().is_empty())
            .ok_or(ConfigError::Missing(key))
    }

    fn parse<T>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.optional(key)
            .map(|value| {
                value.parse::<T>().map_err(|e| ConfigError::Invalid {
                    key,
                    reason: e.to_string(),
                    value,
                })
            })
            .transpose()
    }
}
