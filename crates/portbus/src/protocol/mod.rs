//! Wire protocol for remote command dispatch.
//!
//! Every command type owns four channels derived from its name: requests on
//! `<name>`, acknowledgements on `<name>_Ack`, responses on
//! `<name>_Response` and cancellations on `<name>_Unsubscribe`. Concurrent
//! exchanges share those channels and are told apart by the [`RequestId`]
//! carried in every event.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::command::Output;
use crate::error::{BusError, HandlerError};
use crate::stream::StreamEvent;

/// Identifier correlating every event of one exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generates a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the identifier text.
    #[must_use]
    pub const fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The four channel names of one command type.
///
/// # Example
///
/// ```
/// use portbus::protocol::ChannelNames;
///
/// let names = ChannelNames::for_command("Double");
/// assert_eq!(names.request(), "Double");
/// assert_eq!(names.ack(), "Double_Ack");
/// assert_eq!(names.response(), "Double_Response");
/// assert_eq!(names.unsubscribe(), "Double_Unsubscribe");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelNames {
    request: String,
    ack: String,
    response: String,
    unsubscribe: String,
}

impl ChannelNames {
    /// Derives the channel names for the command type `name`.
    #[must_use]
    pub fn for_command(name: &str) -> Self {
        Self {
            request: name.to_owned(),
            ack: format!("{name}_Ack"),
            response: format!("{name}_Response"),
            unsubscribe: format!("{name}_Unsubscribe"),
        }
    }

    /// Channel carrying requests.
    #[must_use]
    pub const fn request(&self) -> &str {
        self.request.as_str()
    }

    /// Channel carrying acknowledgements.
    #[must_use]
    pub const fn ack(&self) -> &str {
        self.ack.as_str()
    }

    /// Channel carrying responses.
    #[must_use]
    pub const fn response(&self) -> &str {
        self.response.as_str()
    }

    /// Channel carrying cancellations.
    #[must_use]
    pub const fn unsubscribe(&self) -> &str {
        self.unsubscribe.as_str()
    }
}

/// A request published by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandDataEvent {
    /// Exchange identifier.
    pub id: RequestId,
    /// Encoded command payload.
    #[serde(default)]
    pub data: Value,
}

/// Confirms a request reached a responder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandAckEvent {
    /// Exchange identifier.
    pub id: RequestId,
}

/// Cancels an exchange; sent by either side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandUnsubscribeEvent {
    /// Exchange identifier.
    pub id: RequestId,
}

/// A result, stream item or failure published by the responder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponseEvent {
    /// Exchange identifier.
    pub id: RequestId,
    /// Encoded value; null when the event carries none.
    #[serde(default)]
    pub data: Value,
    /// Marks the final event of the exchange.
    #[serde(default)]
    pub done: bool,
    /// Failure reported by the responder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl CommandResponseEvent {
    /// A non-final stream item.
    #[must_use]
    pub const fn next(id: RequestId, data: Value) -> Self {
        Self {
            id,
            data,
            done: false,
            error: None,
        }
    }

    /// The final event, carrying `data`.
    #[must_use]
    pub const fn complete(id: RequestId, data: Value) -> Self {
        Self {
            id,
            data,
            done: true,
            error: None,
        }
    }

    /// A terminal failure.
    #[must_use]
    pub fn failed(id: RequestId, error: &HandlerError) -> Self {
        Self {
            id,
            data: Value::Null,
            done: true,
            error: Some(error.to_wire()),
        }
    }

    /// Returns `true` when no further events follow.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.done || self.error.is_some()
    }

    /// Converts the response into a stream event for the command `name`.
    ///
    /// A final event whose data is null completes without a value.
    #[must_use]
    pub fn into_stream_event(self, name: &str) -> StreamEvent<Output> {
        if let Some(error) = self.error {
            return StreamEvent::Failed(BusError::remote(name, HandlerError::from_wire(error)));
        }
        match (self.done, self.data) {
            (true, Value::Null) => StreamEvent::Complete(None),
            (true, data) => StreamEvent::Complete(Some(Output::Encoded(data))),
            (false, data) => StreamEvent::Next(Output::Encoded(data)),
        }
    }

    /// Converts a terminal response into a unary result for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Remote`] when the responder reported a failure.
    pub fn into_result(self, name: &str) -> Result<Output, BusError> {
        match self.error {
            Some(error) => Err(BusError::remote(name, HandlerError::from_wire(error))),
            None => Ok(Output::Encoded(self.data)),
        }
    }
}
