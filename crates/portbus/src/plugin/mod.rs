//! Dispatch plugin contract.
//!
//! A [`DispatchPlugin`] intercepts bus dispatch. The bus reads the plugin's
//! [`Capabilities`] once when it is built, hands it the shared registry and
//! default context through [`DispatchPlugin::install`], and from then on
//! routes intercepted calls through [`DispatchPlugin::handler`] and
//! [`DispatchPlugin::stream_handler`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::command::{Context, ErasedCommand, Output};
use crate::error::BusError;
use crate::registry::{HandlerRegistry, UnaryHandler};
use crate::stream::{CancellationSignal, EventSink, Teardown};

/// Which bus entry points a plugin intercepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// `execute` is routed through [`DispatchPlugin::handler`].
    pub intercepts_execute: bool,
    /// `stream` is routed through [`DispatchPlugin::stream_handler`].
    pub intercepts_stream: bool,
}

impl Capabilities {
    /// Intercepts `execute` only.
    pub const EXECUTE: Self = Self {
        intercepts_execute: true,
        intercepts_stream: false,
    };

    /// Intercepts both `execute` and `stream`.
    pub const ALL: Self = Self {
        intercepts_execute: true,
        intercepts_stream: true,
    };
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::EXECUTE
    }
}

/// A command routed to a plugin.
pub struct DispatchRequest {
    command: Box<dyn ErasedCommand>,
    context: Context,
}

impl DispatchRequest {
    /// Creates a request for `command` run with `context`.
    #[must_use]
    pub fn new(command: Box<dyn ErasedCommand>, context: Context) -> Self {
        Self { command, context }
    }

    /// Returns the command type name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.command.name()
    }

    /// Returns the command.
    #[must_use]
    pub fn command(&self) -> &dyn ErasedCommand {
        self.command.as_ref()
    }

    /// Returns the handler context.
    #[must_use]
    pub const fn context(&self) -> &Context {
        &self.context
    }

    /// Splits the request into command and context.
    #[must_use]
    pub fn into_parts(self) -> (Box<dyn ErasedCommand>, Context) {
        (self.command, self.context)
    }
}

impl fmt::Debug for DispatchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchRequest")
            .field("name", &self.name())
            .field("context", &self.context)
            .finish()
    }
}

/// Strategy intercepting command dispatch.
#[async_trait]
pub trait DispatchPlugin: Send + Sync {
    /// Reports which entry points this plugin intercepts.
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Called once when the bus is built.
    fn install(&self, _registry: Arc<HandlerRegistry>, _context: Context) {}

    /// Resolves an `execute` call.
    ///
    /// `local` is the handler registered in this process for the command
    /// type, if any; the plugin decides whether to run it.
    ///
    /// # Errors
    ///
    /// Returns any [`BusError`] raised while resolving the command.
    async fn handler(
        &self,
        request: DispatchRequest,
        local: Option<UnaryHandler>,
    ) -> Result<Output, BusError>;

    /// Resolves a `stream` call, delivering events to `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::StreamHandlerNotFound`] unless overridden.
    fn stream_handler(
        &self,
        request: DispatchRequest,
        _sink: EventSink,
        _signal: Option<CancellationSignal>,
    ) -> Result<Teardown, BusError> {
        Err(BusError::stream_handler_not_found(request.name()))
    }

    /// Called after a unary handler is registered.
    fn register(&self, _name: &str) {}

    /// Called after a push or pull stream handler is registered.
    fn register_stream(&self, _name: &str) {}
}

/// Plugin that behaves as if no plugin were installed.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

#[async_trait]
impl DispatchPlugin for PassThrough {
    async fn handler(
        &self,
        request: DispatchRequest,
        local: Option<UnaryHandler>,
    ) -> Result<Output, BusError> {
        let Some(handler) = local else {
            return Err(BusError::handler_not_found(request.name()));
        };
        let (command, context) = request.into_parts();
        handler(command, context).await
    }
}
