//! Typed command bus with remote dispatch over port channels.
//!
//! The `portbus` crate maps command type names to handlers and executes
//! commands either in-process or, through a dispatch plugin, in another
//! endpoint reachable over a message channel. A command is any serialisable
//! value implementing [`Command`]; its handler produces one result (unary)
//! or a sequence of results (stream).
//!
//! Three dispatch contracts are offered:
//!
//! - [`CommandBus::execute`] resolves a single result;
//! - [`CommandBus::stream`] pushes [`StreamEvent`]s into a callback and
//!   returns a cancellable [`Subscription`];
//! - [`CommandBus::stream_async`] yields a pull-style [`CommandStream`].
//!
//! # Architecture
//!
//! The bus owns a [`HandlerRegistry`] and at most one [`DispatchPlugin`].
//! Plugins intercept the entry points named by their [`Capabilities`] and
//! are told about every registration. [`PortChannelPlugin`] is the shipped
//! plugin: it serves local handlers to remote callers and forwards commands
//! without a local handler across a [`channel::PortChannel`], using the
//! request, acknowledgement, response and unsubscribe channels described in
//! [`protocol`]. Two transports are provided: [`channel::MemoryHub`] links
//! endpoints inside one process and [`channel::LinkPort`] carries frames as
//! JSON lines over a byte stream such as a child process's standard I/O.
//!
//! # Example
//!
//! ```rust
//! use portbus::{Command, CommandBus};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Greet {
//!     name: String,
//! }
//!
//! impl Command for Greet {
//!     const NAME: &'static str = "Greet";
//!     type Output = String;
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let bus = CommandBus::new();
//! bus.register(|command: Greet, _| Ok(format!("hello, {}", command.name)));
//!
//! let greeting = bus
//!     .execute(Greet { name: "port".into() })
//!     .await
//!     .expect("handler registered");
//! assert_eq!(greeting, "hello, port");
//! # }
//! ```

pub mod bus;
pub mod channel;
pub mod command;
pub mod error;
pub mod plugin;
pub mod port_channel;
pub mod protocol;
pub mod registry;
pub mod stream;

#[cfg(test)]
mod tests;

pub use self::bus::{CommandBus, CommandBusBuilder, StreamOptions};
pub use self::command::{Command, CommandEnvelope, CommandFactory, Context, ErasedCommand, Output};
pub use self::error::{BusError, HandlerError, TimeoutStage};
pub use self::plugin::{Capabilities, DispatchPlugin, DispatchRequest, PassThrough};
pub use self::port_channel::{PortChannelOptions, PortChannelPlugin};
pub use self::registry::{
    AsyncStreamHandler, HandlerKinds, HandlerRegistry, StreamHandler, UnaryHandler,
};
pub use self::stream::{
    CancellationSignal, CommandStream, Emitter, EventSink, StreamEvent, Subscription, Teardown,
};
