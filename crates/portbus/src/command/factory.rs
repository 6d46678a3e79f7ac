//! Per-type constructors used to rebuild commands from wire payloads.

use std::fmt;

use serde_json::Value;

use super::{Command, ErasedCommand, Output};
use crate::error::BusError;

type DecodeFn = fn(Value) -> Result<Box<dyn ErasedCommand>, BusError>;
type EncodeFn = fn(Output) -> Result<Value, BusError>;

/// Decodes payloads into a command type and encodes its results.
///
/// Registered alongside every handler so a node can serve a command that
/// arrived as JSON without knowing the concrete type at the call site.
#[derive(Clone, Copy)]
pub struct CommandFactory {
    name: &'static str,
    decode: DecodeFn,
    encode: EncodeFn,
}

impl CommandFactory {
    /// Returns the factory for `C`.
    #[must_use]
    pub fn of<C: Command>() -> Self {
        Self {
            name: C::NAME,
            decode: decode_command::<C>,
            encode: encode_output::<C>,
        }
    }

    /// Returns the command type name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Rebuilds a command from its wire payload.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidCommand`] when the payload does not decode.
    pub fn decode(&self, payload: Value) -> Result<Box<dyn ErasedCommand>, BusError> {
        (self.decode)(payload)
    }

    /// Encodes a handler result for the wire.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Encode`] when serialisation fails, or
    /// [`BusError::InvalidCommand`] when a native value has the wrong type.
    pub fn encode_output(&self, output: Output) -> Result<Value, BusError> {
        (self.encode)(output)
    }
}

impl fmt::Debug for CommandFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandFactory")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

fn decode_command<C: Command>(payload: Value) -> Result<Box<dyn ErasedCommand>, BusError> {
    serde_json::from_value::<C>(payload)
        .map(|command| Box::new(command) as Box<dyn ErasedCommand>)
        .map_err(|err| {
            BusError::invalid_command(C::NAME, format!("payload does not decode: {err}"))
        })
}

fn encode_output<C: Command>(output: Output) -> Result<Value, BusError> {
    match output {
        Output::Encoded(value) => Ok(value),
        native @ Output::Native(_) => {
            let value: C::Output = native.into_typed(C::NAME)?;
            serde_json::to_value(value).map_err(|err| BusError::encode(C::NAME, err))
        }
    }
}
