//! Domain errors raised by bus and protocol operations.
//!
//! All errors use `thiserror`-derived types with structured context so callers
//! can inspect the failure programmatically. JSON errors are wrapped in `Arc`
//! so [`BusError`] stays `Clone` and can travel through stream callbacks.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors arising from command dispatch.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    /// The value handed to the bus is not a usable command.
    #[error("invalid command '{name}': {message}")]
    InvalidCommand {
        /// Name the command was dispatched under.
        name: String,
        /// Description of what made the command unusable.
        message: String,
    },

    /// No unary handler could be resolved for the command type.
    #[error("command handler for '{name}' not found")]
    HandlerNotFound {
        /// Command type name that was looked up.
        name: String,
    },

    /// No stream handler could be resolved for the command type.
    #[error("stream handler for '{name}' not found")]
    StreamHandlerNotFound {
        /// Command type name that was looked up.
        name: String,
    },

    /// A stream was requested for a type that only has a unary handler.
    #[error("handler registered for '{name}' is not a stream handler")]
    NotAStreamHandler {
        /// Command type name that was looked up.
        name: String,
    },

    /// The remote side did not answer within the configured deadline.
    #[error("Timeout waiting for {stage} of command '{name}' after {timeout_ms}ms")]
    RemoteTimeout {
        /// Command type name of the request.
        name: String,
        /// Which deadline elapsed.
        stage: TimeoutStage,
        /// Configured deadline in milliseconds.
        timeout_ms: u64,
    },

    /// The remote handler reported a failure.
    #[error("remote handler for '{name}' failed: {source}")]
    Remote {
        /// Command type name of the request.
        name: String,
        /// Failure forwarded by the callee.
        #[source]
        source: HandlerError,
    },

    /// A local handler reported a failure.
    #[error("handler for '{name}' failed: {source}")]
    Handler {
        /// Command type name of the request.
        name: String,
        /// Failure returned by the handler.
        #[source]
        source: HandlerError,
    },

    /// A command or result could not be serialised to JSON.
    #[error("failed to encode '{name}': {source}")]
    Encode {
        /// Command type name involved.
        name: String,
        /// Underlying JSON error.
        #[source]
        source: Arc<serde_json::Error>,
    },

    /// A wire payload could not be deserialised into the expected type.
    #[error("failed to decode '{name}': {source}")]
    Decode {
        /// Command type name involved.
        name: String,
        /// Underlying JSON error.
        #[source]
        source: Arc<serde_json::Error>,
    },

    /// The dispatch was abandoned, or its transport closed, before a terminal
    /// response arrived.
    #[error("dispatch of '{name}' was abandoned before a response arrived")]
    Disconnected {
        /// Command type name of the request.
        name: String,
    },
}

impl BusError {
    /// Creates an invalid command error.
    #[must_use]
    pub fn invalid_command(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidCommand {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Creates a handler-not-found error.
    #[must_use]
    pub fn handler_not_found(name: impl Into<String>) -> Self {
        Self::HandlerNotFound { name: name.into() }
    }

    /// Creates a stream-handler-not-found error.
    #[must_use]
    pub fn stream_handler_not_found(name: impl Into<String>) -> Self {
        Self::StreamHandlerNotFound { name: name.into() }
    }

    /// Creates a not-a-stream-handler error.
    #[must_use]
    pub fn not_a_stream_handler(name: impl Into<String>) -> Self {
        Self::NotAStreamHandler { name: name.into() }
    }

    /// Wraps a local handler failure.
    #[must_use]
    pub fn handler(name: impl Into<String>, source: HandlerError) -> Self {
        Self::Handler {
            name: name.into(),
            source,
        }
    }

    /// Wraps a failure forwarded by a remote callee.
    #[must_use]
    pub fn remote(name: impl Into<String>, source: HandlerError) -> Self {
        Self::Remote {
            name: name.into(),
            source,
        }
    }

    /// Creates a timeout error for a deadline of `after`.
    #[must_use]
    pub fn timeout(name: impl Into<String>, stage: TimeoutStage, after: Duration) -> Self {
        Self::RemoteTimeout {
            name: name.into(),
            stage,
            timeout_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Creates an error for a dispatch abandoned before it completed.
    #[must_use]
    pub fn disconnected(name: impl Into<String>) -> Self {
        Self::Disconnected { name: name.into() }
    }

    /// Wraps a serialisation failure.
    #[must_use]
    pub fn encode(name: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Encode {
            name: name.into(),
            source: Arc::new(source),
        }
    }

    /// Wraps a deserialisation failure.
    #[must_use]
    pub fn decode(name: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Decode {
            name: name.into(),
            source: Arc::new(source),
        }
    }

    /// Returns the command type name the error refers to.
    #[must_use]
    pub fn command_name(&self) -> &str {
        match self {
            Self::InvalidCommand { name, .. }
            | Self::HandlerNotFound { name }
            | Self::StreamHandlerNotFound { name }
            | Self::NotAStreamHandler { name }
            | Self::RemoteTimeout { name, .. }
            | Self::Remote { name, .. }
            | Self::Handler { name, .. }
            | Self::Encode { name, .. }
            | Self::Decode { name, .. }
            | Self::Disconnected { name } => name,
        }
    }

    /// Returns `true` for either remote deadline.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::RemoteTimeout { .. })
    }

    /// Converts the error into the failure carried by a response event.
    ///
    /// Handler failures keep their payload; every other kind is reduced to
    /// its message.
    #[must_use]
    pub fn into_wire_error(self) -> HandlerError {
        match self {
            Self::Handler { source, .. } | Self::Remote { source, .. } => source,
            other => HandlerError::new(other.to_string()),
        }
    }
}

/// The deadline that elapsed for a remote request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStage {
    /// No acknowledgement arrived after the request was published.
    Acknowledgement,
    /// The request was acknowledged but no terminal response followed.
    Response,
}

impl fmt::Display for TimeoutStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Acknowledgement => f.write_str("ack"),
            Self::Response => f.write_str("response"),
        }
    }
}

/// Failure reported by a handler.
///
/// This is the value carried in the `error` field of a response event, so it
/// must stay serialisable. Error identity is not preserved across the wire:
/// only the message and the optional JSON payload survive.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl HandlerError {
    /// Creates a failure with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: None,
        }
    }

    /// Creates a failure from any error, keeping only its display form.
    #[must_use]
    pub fn from_error<E: std::error::Error + ?Sized>(error: &E) -> Self {
        Self::new(error.to_string())
    }

    /// Attaches a JSON payload to the failure.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Returns the failure message.
    #[must_use]
    pub const fn message(&self) -> &str {
        self.message.as_str()
    }

    /// Returns the attached payload, if any.
    #[must_use]
    pub const fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    /// Encodes the failure for a response event.
    #[must_use]
    pub fn to_wire(&self) -> Value {
        let mut object = serde_json::Map::new();
        object.insert("message".to_owned(), Value::String(self.message.clone()));
        if let Some(data) = &self.data {
            object.insert("data".to_owned(), data.clone());
        }
        Value::Object(object)
    }

    /// Rebuilds a failure from whatever a peer placed in the `error` field.
    ///
    /// Strings become the message. Objects with a string `message` are read
    /// as a [`HandlerError`]. Anything else is kept verbatim as the payload.
    #[must_use]
    pub fn from_wire(value: Value) -> Self {
        match value {
            Value::String(message) => Self::new(message),
            other => {
                if other.get("message").is_some_and(Value::is_string) {
                    if let Ok(error) = serde_json::from_value::<Self>(other.clone()) {
                        return error;
                    }
                }
                Self::new(other.to_string()).with_data(other)
            }
        }
    }
}
