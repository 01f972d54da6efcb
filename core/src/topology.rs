//! Static broker topology: exchanges, their kinds, routing keys and queues.
//!
//! Every participant declares the exchanges it touches, so declaration must be
//! idempotent: redeclaring an exchange with the same kind is a no-op, and
//! redeclaring it with a different kind is a configuration error.
//!
//! | Exchange | Kind | Purpose |
//! |---|---|---|
//! | `analysis.commands` | direct | routes `RequestAnalysis` to the orchestrator |
//! | `analysis.started` | fanout | broadcasts `AnalysisStarted` |
//! | `analysis.completed` | fanout | broadcasts `AnalysisCompleted` |
//! | `image.uploaded` | fanout | upstream trigger (ingestion service) |
//! | `recognition.completed` | fanout | upstream trigger (recognition service) |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Exchange names.
pub mod exchanges {
    /// Direct exchange carrying commands for the orchestrator.
    pub const ANALYSIS_COMMANDS: &str = "analysis.commands";
    /// Fanout exchange broadcasting `AnalysisStarted`.
    pub const ANALYSIS_STARTED: &str = "analysis.started";
    /// Fanout exchange broadcasting `AnalysisCompleted`.
    pub const ANALYSIS_COMPLETED: &str = "analysis.completed";
    /// Default name of the upstream image-uploaded exchange.
    pub const IMAGE_UPLOADED: &str = "image.uploaded";
    /// Default name of the upstream recognition-completed exchange.
    pub const RECOGNITION_COMPLETED: &str = "recognition.completed";
}

/// Routing keys for commands on direct exchanges.
pub mod routes {
    /// Default routing key for `RequestAnalysis`.
    pub const REQUEST_ANALYSIS: &str = "analysis.request";
}

/// Queues owned by the orchestrator.
pub mod queues {
    /// Point-to-point command queue.
    pub const ANALYSIS_COMMANDS: &str = "orchestrator.analysis.commands";
    /// Subscription to the image-uploaded exchange.
    pub const IMAGE_UPLOADED: &str = "orchestrator.image-uploaded";
    /// Subscription to the recognition-completed exchange.
    pub const RECOGNITION_COMPLETED: &str = "orchestrator.recognition-completed";
}

/// Routing behavior of an exchange.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Exact routing-key match (commands)
    Direct,
    /// Every bound queue receives every message (events)
    Fanout,
    /// Dotted pattern match with `*` and `#` wildcards
    Topic,
    /// Header-based routing
    Headers,
}

impl ExchangeKind {
    /// AMQP type name of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
            Self::Headers => "headers",
        }
    }

    /// Whether a binding with `binding_key` receives a message published
    /// with `routing_key` on an exchange of this kind.
    ///
    /// Header exchanges route on message headers, which this system never
    /// sets, so nothing matches them.
    #[must_use]
    pub fn routes(self, binding_key: &str, routing_key: &str) -> bool {
        match self {
            Self::Fanout => true,
            Self::Direct => binding_key == routing_key,
            Self::Topic => topic_matches(binding_key, routing_key),
            Self::Headers => false,
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "fanout" => Ok(Self::Fanout),
            "topic" => Ok(Self::Topic),
            "headers" | "header" => Ok(Self::Headers),
            other => Err(format!("unknown exchange kind: {other}")),
        }
    }
}

fn topic_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    topic_words_match(&pattern, &key)
}

fn topic_words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| topic_words_match(rest, &key[skip..])),
        Some((word, rest)) => match key.split_first() {
            Some((first, key_rest)) => {
                (*word == "*" || word == first) && topic_words_match(rest, key_rest)
            }
            None => false,
        },
    }
}

/// How deliveries on a subscription are settled.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AckMode {
    /// The consumer loop acknowledges or rejects after the handler returns.
    Manual,
    /// The broker treats a message as handled the moment it is delivered.
    Auto,
}

/// Durable subscription of one queue to one exchange.
///
/// Queues are declared durable, non-exclusive and non-auto-delete, so they
/// survive worker restarts; binding again on restart is idempotent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueBinding {
    /// Queue name
    pub queue: String,
    /// Source exchange
    pub exchange: String,
    /// Kind the exchange is declared with (must match the producer's)
    pub kind: ExchangeKind,
    /// Binding key (empty for fanout)
    pub routing_key: String,
}

impl QueueBinding {
    /// Bind `queue` to a fanout `exchange`.
    #[must_use]
    pub fn fanout(queue: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            kind: ExchangeKind::Fanout,
            routing_key: String::new(),
        }
    }

    /// Bind `queue` to a direct `exchange` with `routing_key`.
    #[must_use]
    pub fn direct(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            kind: ExchangeKind::Direct,
            routing_key: routing_key.into(),
        }
    }
}
