//! The command bus.
//!
//! [`CommandBus`] maps command type names to handlers and offers three
//! dispatch contracts: [`CommandBus::execute`] resolves one result,
//! [`CommandBus::stream`] pushes events into a callback and returns a
//! [`Subscription`], and [`CommandBus::stream_async`] yields a pull-style
//! [`CommandStream`]. When a [`DispatchPlugin`] is installed, the entry
//! points it intercepts are delegated to it.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::command::{self, Command, CommandEnvelope, CommandFactory, Context, ErasedCommand, Output};
use crate::error::{BusError, HandlerError};
use crate::plugin::{Capabilities, DispatchPlugin, DispatchRequest};
use crate::registry::{self, HandlerRegistry};
use crate::stream::{
    CancellationSignal, CommandStream, Emitter, EventSink, StreamEvent, Subscription, Teardown,
};

const BUS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::bus");

/// Per-call options for [`CommandBus::stream_with`].
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    context: Option<Context>,
    signal: Option<CancellationSignal>,
}

impl StreamOptions {
    /// Options using the bus default context and no signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the handler with `context` instead of the bus default.
    #[must_use]
    pub fn context(mut self, context: Context) -> Self {
        self.context = Some(context);
        self
    }

    /// Unsubscribes when `signal` fires.
    #[must_use]
    pub fn signal(mut self, signal: CancellationSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// Builder for [`CommandBus`].
#[derive(Default)]
pub struct CommandBusBuilder {
    context: Context,
    plugin: Option<Arc<dyn DispatchPlugin>>,
}

impl CommandBusBuilder {
    /// Sets the default context handed to handlers.
    #[must_use]
    pub fn context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    /// Installs a dispatch plugin.
    #[must_use]
    pub fn plugin(self, plugin: impl DispatchPlugin + 'static) -> Self {
        self.shared_plugin(Arc::new(plugin))
    }

    /// Installs a dispatch plugin the caller keeps a handle to.
    #[must_use]
    pub fn shared_plugin(mut self, plugin: Arc<dyn DispatchPlugin>) -> Self {
        self.plugin = Some(plugin);
        self
    }

    /// Builds the bus, installing the plugin if one was supplied.
    #[must_use]
    pub fn build(self) -> CommandBus {
        let registry = Arc::new(HandlerRegistry::new());
        let capabilities = self.plugin.as_ref().map_or(
            Capabilities {
                intercepts_execute: false,
                intercepts_stream: false,
            },
            |plugin| plugin.capabilities(),
        );
        if let Some(plugin) = &self.plugin {
            plugin.install(Arc::clone(&registry), self.context.clone());
        }
        CommandBus {
            registry,
            context: self.context,
            plugin: self.plugin,
            capabilities,
        }
    }
}

impl fmt::Debug for CommandBusBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBusBuilder")
            .field("context", &self.context)
            .field("plugin", &self.plugin.is_some())
            .finish()
    }
}

/// Registry of command handlers with pluggable dispatch.
///
/// # Example
///
/// ```
/// use portbus::{Command, CommandBus};
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
/// let bus = CommandBus::new();
/// bus.register(|command: Double, _| Ok(command.0 * 2));
///
/// let result = futures::executor::block_on(bus.execute(Double(21)));
/// assert_eq!(result.expect("handled"), 42);
/// ```
pub struct CommandBus {
    registry: Arc<HandlerRegistry>,
    context: Context,
    plugin: Option<Arc<dyn DispatchPlugin>>,
    capabilities: Capabilities,
}

impl Default for CommandBus {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandBus {
    /// Creates a bus with an empty context and no plugin.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts building a bus.
    #[must_use]
    pub fn builder() -> CommandBusBuilder {
        CommandBusBuilder::default()
    }

    /// Returns the default handler context.
    #[must_use]
    pub const fn context(&self) -> &Context {
        &self.context
    }

    /// Returns the shared handler registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Returns `true` when any handler kind is registered for `name`.
    #[must_use]
    pub fn has_handler(&self, name: &str) -> bool {
        self.registry.kinds(name).any()
    }

    /// Registers a synchronous handler for `C`, replacing any previous one.
    pub fn register<C, F>(&self, handler: F)
    where
        C: Command,
        F: Fn(C, &Context) -> Result<C::Output, HandlerError> + Send + Sync + 'static,
    {
        self.registry
            .insert_handler(CommandFactory::of::<C>(), registry::sync_handler(handler));
        self.announce(C::NAME, false);
    }

    /// Registers an asynchronous handler for `C`, replacing any previous one.
    pub fn register_async<C, F, Fut>(&self, handler: F)
    where
        C: Command,
        F: Fn(C, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<C::Output, HandlerError>> + Send + 'static,
    {
        self.registry
            .insert_handler(CommandFactory::of::<C>(), registry::async_handler(handler));
        self.announce(C::NAME, false);
    }

    /// Registers a push-style stream handler for `C`.
    ///
    /// The handler emits through the [`Emitter`] and returns the
    /// [`Teardown`] to run if the caller unsubscribes.
    pub fn register_stream<C, F>(&self, handler: F)
    where
        C: Command,
        F: Fn(C, &Context, Emitter<C::Output>) -> Teardown + Send + Sync + 'static,
    {
        self.registry
            .insert_stream_handler(CommandFactory::of::<C>(), registry::push_stream(handler));
        self.announce(C::NAME, true);
    }

    /// Registers a pull-style stream handler for `C`.
    ///
    /// The handler is called once per invocation and returns a fresh stream.
    pub fn register_stream_async<C, F, S>(&self, handler: F)
    where
        C: Command,
        F: Fn(C, Context) -> S + Send + Sync + 'static,
        S: futures::Stream<Item = Result<C::Output, HandlerError>> + Send + 'static,
    {
        self.registry.insert_async_stream_handler(
            CommandFactory::of::<C>(),
            registry::pull_stream(handler),
        );
        self.announce(C::NAME, true);
    }

    fn announce(&self, name: &str, stream: bool) {
        debug!(target: BUS_TARGET, command = name, stream, "handler registered");
        match &self.plugin {
            Some(plugin) if stream => plugin.register_stream(name),
            Some(plugin) => plugin.register(name),
            None => {}
        }
    }

    /// Executes `command` with the default context.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::HandlerNotFound`] when nothing can handle the
    /// command, or the failure reported by the handler or plugin.
    pub async fn execute<C: Command>(&self, command: C) -> Result<C::Output, BusError> {
        self.execute_in(command, self.context.clone()).await
    }

    /// Executes `command` with `context`.
    ///
    /// # Errors
    ///
    /// As [`CommandBus::execute`].
    pub async fn execute_in<C: Command>(
        &self,
        command: C,
        context: Context,
    ) -> Result<C::Output, BusError> {
        self.dispatch(Box::new(command), context)
            .await?
            .into_typed(C::NAME)
    }

    /// Executes a command addressed by name with the default context.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::HandlerNotFound`] when no handler of the named type
    /// was registered here, [`BusError::InvalidCommand`] when the payload does
    /// not decode, or any failure raised by the dispatch itself.
    pub async fn execute_raw(&self, envelope: CommandEnvelope) -> Result<Value, BusError> {
        self.execute_raw_in(envelope, self.context.clone()).await
    }

    /// Executes a command addressed by name with `context`.
    ///
    /// # Errors
    ///
    /// As [`CommandBus::execute_raw`].
    pub async fn execute_raw_in(
        &self,
        envelope: CommandEnvelope,
        context: Context,
    ) -> Result<Value, BusError> {
        let (name, payload) = envelope.into_parts();
        let factory = self
            .registry
            .factory(&name)
            .ok_or_else(|| BusError::handler_not_found(name.as_str()))?;
        let command = factory.decode(payload)?;
        let output = self.dispatch(command, context).await?;
        factory.encode_output(output)
    }

    async fn dispatch(
        &self,
        command: Box<dyn ErasedCommand>,
        context: Context,
    ) -> Result<Output, BusError> {
        command::validate(command.as_ref())?;
        let name = command.name().to_owned();
        let local = self.registry.handler(&name);
        debug!(
            target: BUS_TARGET,
            command = %name,
            local = local.is_some(),
            "executing command"
        );
        match &self.plugin {
            Some(plugin) if self.capabilities.intercepts_execute => {
                plugin
                    .handler(DispatchRequest::new(command, context), local)
                    .await
            }
            _ => match local {
                Some(handler) => handler(command, context).await,
                None => Err(BusError::handler_not_found(name)),
            },
        }
    }

    /// Streams `command` into `callback` with the default context.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::StreamHandlerNotFound`] when no stream handler
    /// exists, or [`BusError::NotAStreamHandler`] when only a unary handler
    /// is registered for the type.
    pub fn stream<C, F>(&self, command: C, callback: F) -> Result<Subscription, BusError>
    where
        C: Command,
        F: FnMut(StreamEvent<C::Output>) + Send + 'static,
    {
        self.stream_with(command, callback, StreamOptions::default())
    }

    /// Streams `command` into `callback` with explicit options.
    ///
    /// Once a terminal event has been delivered, or the subscription has been
    /// cancelled, the callback is not invoked again.
    ///
    /// # Errors
    ///
    /// As [`CommandBus::stream`].
    pub fn stream_with<C, F>(
        &self,
        command: C,
        callback: F,
        options: StreamOptions,
    ) -> Result<Subscription, BusError>
    where
        C: Command,
        F: FnMut(StreamEvent<C::Output>) + Send + 'static,
    {
        self.open_stream(
            Box::new(command),
            |subscription| typed_sink::<C, F>(callback, subscription.clone()),
            options,
        )
    }

    fn open_stream(
        &self,
        command: Box<dyn ErasedCommand>,
        sink: impl FnOnce(&Subscription) -> EventSink,
        options: StreamOptions,
    ) -> Result<Subscription, BusError> {
        command::validate(command.as_ref())?;
        let name = command.name().to_owned();
        let StreamOptions { context, signal } = options;
        let handler_context = context.unwrap_or_else(|| self.context.clone());
        let subscription = Subscription::new(name.as_str());
        if let Some(cancel) = &signal {
            subscription.bind(cancel);
        }
        let guarded = subscription.guard(sink(&subscription));
        debug!(target: BUS_TARGET, command = %name, "opening stream");

        let teardown = match &self.plugin {
            Some(plugin) if self.capabilities.intercepts_stream => plugin.stream_handler(
                DispatchRequest::new(command, handler_context),
                guarded,
                signal,
            )?,
            _ => self.local_stream(command, handler_context, guarded)?,
        };
        subscription.attach(teardown);
        Ok(subscription)
    }

    fn local_stream(
        &self,
        command: Box<dyn ErasedCommand>,
        context: Context,
        sink: EventSink,
    ) -> Result<Teardown, BusError> {
        let name = command.name().to_owned();
        if let Some(handler) = self.registry.stream_handler(&name) {
            return Ok(handler(command, context, sink));
        }
        if let Some(handler) = self.registry.async_stream_handler(&name) {
            return Ok(drive_pull(&name, handler(command, context), sink));
        }
        if self.registry.handler(&name).is_some() {
            return Err(BusError::not_a_stream_handler(name));
        }
        Err(BusError::stream_handler_not_found(name))
    }

    /// Streams `command` as a pull-style sequence with the default context.
    ///
    /// Dispatch failures are raised on the first pull.
    pub fn stream_async<C: Command>(&self, command: C) -> CommandStream<C::Output> {
        self.stream_async_in(command, self.context.clone())
    }

    /// Streams `command` as a pull-style sequence with `context`.
    ///
    /// A locally registered pull handler is iterated directly. Otherwise the
    /// push form is bridged through an unbounded queue.
    pub fn stream_async_in<C: Command>(
        &self,
        command: C,
        context: Context,
    ) -> CommandStream<C::Output> {
        if let Err(err) = command::validate(&command) {
            return CommandStream::failed(err);
        }
        if let Some(handler) = self.registry.async_stream_handler(C::NAME) {
            let items = handler(Box::new(command), context)
                .map(|item| item.and_then(|output| output.into_typed(C::NAME)))
                .boxed();
            return CommandStream::direct(items);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let options = StreamOptions::new().context(context);
        match self.stream_with(command, move |event| drop(tx.send(event)), options) {
            Ok(subscription) => CommandStream::bridged(rx, subscription),
            Err(err) => CommandStream::failed(err),
        }
    }
}

impl fmt::Debug for CommandBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBus")
            .field("registry", &self.registry)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

/// Adapts a typed callback to the erased sink.
///
/// An output that fails to convert terminates the stream with that error.
/// When that output was not the last one, `subscription` is cancelled so the
/// producer stops.
fn typed_sink<C, F>(callback: F, subscription: Subscription) -> EventSink
where
    C: Command,
    F: FnMut(StreamEvent<C::Output>) + Send + 'static,
{
    let slot = Mutex::new((callback, false));
    EventSink::new(move |event: StreamEvent<Output>| {
        let (typed, abandoned) = match event {
            StreamEvent::Next(output) => match output.into_typed(C::NAME) {
                Ok(value) => (StreamEvent::Next(value), false),
                Err(err) => (StreamEvent::Failed(err), true),
            },
            StreamEvent::Complete(Some(output)) => {
                let last = output
                    .into_typed(C::NAME)
                    .map_or_else(StreamEvent::Failed, |value| StreamEvent::Complete(Some(value)));
                (last, false)
            }
            StreamEvent::Complete(None) => (StreamEvent::Complete(None), false),
            StreamEvent::Failed(err) => (StreamEvent::Failed(err), false),
        };
        {
            let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
            let (deliver, closed) = &mut *guard;
            if *closed {
                return;
            }
            *closed = typed.is_terminal();
            deliver(typed);
        }
        if abandoned {
            debug!(
                target: BUS_TARGET,
                command = C::NAME,
                "stream output failed to convert; unsubscribing"
            );
            subscription.unsubscribe();
        }
    })
}

/// Drives a pull stream into a push sink on the ambient runtime.
pub(crate) fn drive_pull(
    name: &str,
    items: BoxStream<'static, Result<Output, BusError>>,
    sink: EventSink,
) -> Teardown {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        sink.send(StreamEvent::Failed(BusError::handler(
            name,
            HandlerError::new("no async runtime available to drive the stream"),
        )));
        return Teardown::none();
    };
    let task = handle.spawn(pump(items, sink));
    Teardown::immediate(move || task.abort())
}

async fn pump(mut items: BoxStream<'static, Result<Output, BusError>>, sink: EventSink) {
    while let Some(item) = items.next().await {
        match item {
            Ok(output) => sink.send(StreamEvent::Next(output)),
            Err(err) => {
                sink.send(StreamEvent::Failed(err));
                return;
            }
        }
    }
    sink.send(StreamEvent::Complete(None));
}
