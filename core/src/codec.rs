//! UTF-8 JSON payload codec.
//!
//! Every message on the wire is a UTF-8 JSON object published with
//! `content-type: application/json` and persistent delivery mode.

use crate::error::MessagingError;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Content type set on every published message.
pub const CONTENT_TYPE: &str = "application/json";

/// AMQP delivery mode for persistent messages.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// A payload that has already been serialized to UTF-8 JSON.
///
/// Publishers only accept this type, so serialization happens once, before
/// any broker I/O, and a serialization failure never leaves a half-declared
/// channel behind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JsonPayload(Vec<u8>);

impl JsonPayload {
    /// Serialize `value` to JSON.
    ///
    /// # Errors
    ///
    /// Returns [`serde_json::Error`] if `value` cannot be represented as JSON
    /// (e.g. a map with non-string keys).
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_vec(value).map(Self)
    }

    /// Wrap bytes that are already JSON.
    #[must_use]
    pub const fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// The encoded bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume the payload, returning the encoded bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

/// Decode a message body into `T`.
///
/// A body that is valid JSON `null` is treated like a malformed one: there is
/// nothing to act on.
///
/// # Errors
///
/// Returns [`MessagingError::Decode`] if the body is not valid JSON for `T`
/// or is `null`.
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, MessagingError> {
    match serde_json::from_slice::<Option<T>>(body) {
        Ok(Some(value)) => Ok(value),
        Ok(None) => Err(MessagingError::Decode("payload was null".to_string())),
        Err(e) => Err(MessagingError::Decode(e.to_string())),
    }
}
