//! Command values and the erased forms the bus dispatches.
//!
//! A [`Command`] is an immutable message carrying its payload and declaring
//! the type its handlers produce. Each command type declares an explicit
//! [`Command::NAME`] tag, used as the dispatch key and as the root of the
//! protocol channel names. The bus stores handlers behind
//! [`ErasedCommand`] and [`Output`] so one registry can hold every type.

mod context;
mod factory;

use std::any::Any;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BusError;

pub use self::context::Context;
pub use self::factory::CommandFactory;

/// A typed message dispatched through the command bus.
///
/// # Example
///
/// ```
/// use portbus::Command;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct Double(i64);
///
/// impl Command for Double {
///     const NAME: &'static str = "Double";
///     type Output = i64;
/// }
///
/// assert_eq!(Double::NAME, "Double");
/// ```
pub trait Command: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable tag identifying the command type on the bus and on the wire.
    const NAME: &'static str;

    /// Value produced by handlers of this command.
    type Output: Serialize + DeserializeOwned + Send + 'static;
}

/// Object-safe view of a command instance.
///
/// Implemented for every [`Command`]; plugins use it to read the dispatch
/// name and encode the payload without knowing the concrete type.
pub trait ErasedCommand: Send {
    /// Returns the dispatch name of the command.
    fn name(&self) -> &str;

    /// Encodes the command as a wire payload.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Encode`] when the command cannot be serialised.
    fn to_payload(&self) -> Result<Value, BusError>;

    /// Converts the command into an [`Any`] for downcasting.
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<C: Command> ErasedCommand for C {
    fn name(&self) -> &str {
        C::NAME
    }

    fn to_payload(&self) -> Result<Value, BusError> {
        serde_json::to_value(self).map_err(|err| BusError::encode(C::NAME, err))
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

impl fmt::Debug for dyn ErasedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErasedCommand")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

/// Rejects commands whose type tag cannot address a channel.
pub(crate) fn validate(command: &dyn ErasedCommand) -> Result<(), BusError> {
    let name = command.name();
    if name.trim().is_empty() {
        return Err(BusError::invalid_command(
            name,
            "command type name must not be empty",
        ));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(BusError::invalid_command(
            name,
            "command type name must not contain whitespace",
        ));
    }
    Ok(())
}

/// Recovers the concrete command from its erased form.
pub(crate) fn downcast<C: Command>(command: Box<dyn ErasedCommand>) -> Result<C, BusError> {
    let name = command.name().to_owned();
    command
        .into_any()
        .downcast::<C>()
        .map(|boxed| *boxed)
        .map_err(|_| {
            BusError::invalid_command(name, format!("expected an instance of {}", C::NAME))
        })
}

/// Result produced by an erased handler.
///
/// In-process handlers hand back the native value, so a local round trip
/// never touches JSON. Results that crossed the wire arrive encoded.
pub enum Output {
    /// A value produced in this process.
    Native(Box<dyn Any + Send>),
    /// A value received from a peer.
    Encoded(Value),
}

impl Output {
    /// Wraps a value produced in this process.
    #[must_use]
    pub fn native<T: Any + Send>(value: T) -> Self {
        Self::Native(Box::new(value))
    }

    /// Converts the output into the command's declared result type.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Decode`] when an encoded value does not match `T`,
    /// or [`BusError::InvalidCommand`] when a native value has another type.
    pub fn into_typed<T: DeserializeOwned + 'static>(self, name: &str) -> Result<T, BusError> {
        match self {
            Self::Native(value) => value.downcast::<T>().map(|boxed| *boxed).map_err(|_| {
                BusError::invalid_command(name, "handler produced a value of an unexpected type")
            }),
            Self::Encoded(value) => {
                serde_json::from_value(value).map_err(|err| BusError::decode(name, err))
            }
        }
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native(_) => f.write_str("Output::Native(..)"),
            Self::Encoded(value) => f.debug_tuple("Output::Encoded").field(value).finish(),
        }
    }
}

/// Untyped command addressed by name, as received from outside the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    name: String,
    #[serde(default)]
    payload: Value,
}

impl CommandEnvelope {
    /// Creates an envelope for the named command type.
    #[must_use]
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    /// Returns the command type name.
    #[must_use]
    pub const fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Returns the wire payload.
    #[must_use]
    pub const fn payload(&self) -> &Value {
        &self.payload
    }

    /// Splits the envelope into name and payload.
    #[must_use]
    pub fn into_parts(self) -> (String, Value) {
        (self.name, self.payload)
    }
}
