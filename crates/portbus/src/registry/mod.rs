//! Handler registry shared by the bus and its dispatch plugin.
//!
//! The [`HandlerRegistry`] keeps one erased handler per command type and
//! kind (unary, push stream, pull stream) together with the
//! [`CommandFactory`] needed to rebuild that type from a wire payload.
//! Registering a second handler of the same kind replaces the first.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{self, BoxStream, Stream, StreamExt};

use crate::command::{self, Command, CommandFactory, Context, ErasedCommand, Output};
use crate::error::{BusError, HandlerError};
use crate::stream::{Emitter, EventSink, StreamEvent, Teardown};

/// Erased one-shot handler.
pub type UnaryHandler = Arc<
    dyn Fn(Box<dyn ErasedCommand>, Context) -> BoxFuture<'static, Result<Output, BusError>>
        + Send
        + Sync,
>;

/// Erased push-style stream handler.
pub type StreamHandler =
    Arc<dyn Fn(Box<dyn ErasedCommand>, Context, EventSink) -> Teardown + Send + Sync>;

/// Erased pull-style stream handler.
pub type AsyncStreamHandler = Arc<
    dyn Fn(Box<dyn ErasedCommand>, Context) -> BoxStream<'static, Result<Output, BusError>>
        + Send
        + Sync,
>;

/// Which handler kinds are registered for a command type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerKinds {
    /// A unary handler exists.
    pub unary: bool,
    /// A push stream handler exists.
    pub stream: bool,
    /// A pull stream handler exists.
    pub async_stream: bool,
}

impl HandlerKinds {
    /// Returns `true` when any handler exists.
    #[must_use]
    pub const fn any(self) -> bool {
        self.unary || self.stream || self.async_stream
    }

    /// Returns `true` when a push or pull stream handler exists.
    #[must_use]
    pub const fn streams(self) -> bool {
        self.stream || self.async_stream
    }
}

/// Registry of erased handlers keyed by command type name.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, UnaryHandler>>,
    stream_handlers: RwLock<HashMap<String, StreamHandler>>,
    async_stream_handlers: RwLock<HashMap<String, AsyncStreamHandler>>,
    factories: RwLock<HashMap<String, CommandFactory>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert_handler(&self, factory: CommandFactory, handler: UnaryHandler) {
        write(&self.handlers).insert(factory.name().to_owned(), handler);
        self.insert_factory(factory);
    }

    pub(crate) fn insert_stream_handler(&self, factory: CommandFactory, handler: StreamHandler) {
        write(&self.stream_handlers).insert(factory.name().to_owned(), handler);
        self.insert_factory(factory);
    }

    pub(crate) fn insert_async_stream_handler(
        &self,
        factory: CommandFactory,
        handler: AsyncStreamHandler,
    ) {
        write(&self.async_stream_handlers).insert(factory.name().to_owned(), handler);
        self.insert_factory(factory);
    }

    fn insert_factory(&self, factory: CommandFactory) {
        write(&self.factories).insert(factory.name().to_owned(), factory);
    }

    /// Returns the unary handler for `name`.
    #[must_use]
    pub fn handler(&self, name: &str) -> Option<UnaryHandler> {
        read(&self.handlers).get(name).cloned()
    }

    /// Returns the push stream handler for `name`.
    #[must_use]
    pub fn stream_handler(&self, name: &str) -> Option<StreamHandler> {
        read(&self.stream_handlers).get(name).cloned()
    }

    /// Returns the pull stream handler for `name`.
    #[must_use]
    pub fn async_stream_handler(&self, name: &str) -> Option<AsyncStreamHandler> {
        read(&self.async_stream_handlers).get(name).cloned()
    }

    /// Returns the factory for `name`.
    #[must_use]
    pub fn factory(&self, name: &str) -> Option<CommandFactory> {
        read(&self.factories).get(name).copied()
    }

    /// Reports which handler kinds exist for `name`.
    #[must_use]
    pub fn kinds(&self, name: &str) -> HandlerKinds {
        HandlerKinds {
            unary: read(&self.handlers).contains_key(name),
            stream: read(&self.stream_handlers).contains_key(name),
            async_stream: read(&self.async_stream_handlers).contains_key(name),
        }
    }

    /// Returns every command type with at least one handler, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        names.extend(read(&self.handlers).keys().cloned());
        names.extend(read(&self.stream_handlers).keys().cloned());
        names.extend(read(&self.async_stream_handlers).keys().cloned());
        names.into_iter().collect()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("names", &self.names())
            .finish()
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Erases a synchronous handler.
pub(crate) fn sync_handler<C, F>(handler: F) -> UnaryHandler
where
    C: Command,
    F: Fn(C, &Context) -> Result<C::Output, HandlerError> + Send + Sync + 'static,
{
    Arc::new(move |command, context| {
        let outcome = command::downcast::<C>(command).and_then(|typed| {
            handler(typed, &context)
                .map(Output::native)
                .map_err(|err| BusError::handler(C::NAME, err))
        });
        future::ready(outcome).boxed()
    })
}

/// Erases an asynchronous handler.
pub(crate) fn async_handler<C, F, Fut>(handler: F) -> UnaryHandler
where
    C: Command,
    F: Fn(C, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<C::Output, HandlerError>> + Send + 'static,
{
    Arc::new(move |command, context| match command::downcast::<C>(command) {
        Ok(typed) => handler(typed, context)
            .map(|outcome| {
                outcome
                    .map(Output::native)
                    .map_err(|err| BusError::handler(C::NAME, err))
            })
            .boxed(),
        Err(err) => future::ready(Err(err)).boxed(),
    })
}

/// Erases a push-style stream handler.
pub(crate) fn push_stream<C, F>(handler: F) -> StreamHandler
where
    C: Command,
    F: Fn(C, &Context, Emitter<C::Output>) -> Teardown + Send + Sync + 'static,
{
    Arc::new(
        move |command, context, sink: EventSink| match command::downcast::<C>(command) {
            Ok(typed) => handler(typed, &context, Emitter::new(C::NAME, sink)),
            Err(err) => {
                sink.send(StreamEvent::Failed(err));
                Teardown::none()
            }
        },
    )
}

/// Erases a pull-style stream handler.
pub(crate) fn pull_stream<C, F, S>(handler: F) -> AsyncStreamHandler
where
    C: Command,
    F: Fn(C, Context) -> S + Send + Sync + 'static,
    S: Stream<Item = Result<C::Output, HandlerError>> + Send + 'static,
{
    Arc::new(move |command, context| match command::downcast::<C>(command) {
        Ok(typed) => handler(typed, context)
            .map(|item| {
                item.map(Output::native)
                    .map_err(|err| BusError::handler(C::NAME, err))
            })
            .boxed(),
        Err(err) => stream::once(future::ready(Err(err))).boxed(),
    })
}
