//! Stream events and the producer-side handles that emit them.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::command::Output;
use crate::error::{BusError, HandlerError};

/// One emission of a stream.
///
/// Mirrors the `(value, done, error)` triple of the wire protocol: `Next` is
/// a value with `done = false`, `Complete` is the terminal `done = true`
/// emission (optionally carrying a final value), and `Failed` is the terminal
/// error.
#[derive(Debug, Clone)]
pub enum StreamEvent<T> {
    /// A value; more may follow.
    Next(T),
    /// The stream finished, optionally with a last value.
    Complete(Option<T>),
    /// The stream failed; nothing follows.
    Failed(BusError),
}

impl<T> StreamEvent<T> {
    /// Builds an event from the wire-style triple.
    ///
    /// An error always wins. A non-terminal emission without a value is read
    /// as completion.
    #[must_use]
    pub fn from_parts(value: Option<T>, done: bool, error: Option<BusError>) -> Self {
        match (error, done, value) {
            (Some(error), _, _) => Self::Failed(error),
            (None, false, Some(value)) => Self::Next(value),
            (None, _, value) => Self::Complete(value),
        }
    }

    /// Returns `true` for `Complete` and `Failed`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Next(_))
    }

    /// Returns the carried value, if any.
    #[must_use]
    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Next(value) => Some(value),
            Self::Complete(value) => value,
            Self::Failed(_) => None,
        }
    }

    /// Maps the carried value.
    #[must_use]
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StreamEvent<U> {
        match self {
            Self::Next(value) => StreamEvent::Next(f(value)),
            Self::Complete(value) => StreamEvent::Complete(value.map(f)),
            Self::Failed(error) => StreamEvent::Failed(error),
        }
    }
}

/// Erased receiving end of a stream.
///
/// Plugins and the bus pass sinks around; the bus wraps each one so it
/// observes completion idempotently and honours cancellation.
#[derive(Clone)]
pub struct EventSink {
    inner: Arc<dyn Fn(StreamEvent<Output>) + Send + Sync>,
}

impl EventSink {
    /// Creates a sink from a closure.
    #[must_use]
    pub fn new(f: impl Fn(StreamEvent<Output>) + Send + Sync + 'static) -> Self {
        Self { inner: Arc::new(f) }
    }

    /// Delivers an event.
    pub fn send(&self, event: StreamEvent<Output>) {
        (self.inner)(event);
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventSink")
    }
}

/// Typed producer handle given to push-style stream handlers.
///
/// Once a terminal event has been observed, or the caller has unsubscribed,
/// further emissions are silently dropped.
pub struct Emitter<T> {
    name: &'static str,
    sink: EventSink,
    _marker: PhantomData<fn(T)>,
}

impl<T: Send + 'static> Emitter<T> {
    pub(crate) const fn new(name: &'static str, sink: EventSink) -> Self {
        Self {
            name,
            sink,
            _marker: PhantomData,
        }
    }

    /// Emits a value with `done = false`.
    pub fn next(&self, value: T) {
        self.sink.send(StreamEvent::Next(Output::native(value)));
    }

    /// Emits the terminal event, optionally with a last value.
    pub fn complete(&self, value: Option<T>) {
        self.sink
            .send(StreamEvent::Complete(value.map(Output::native)));
    }

    /// Emits a value, marking it terminal when `done` is set.
    pub fn emit(&self, value: T, done: bool) {
        if done {
            self.complete(Some(value));
        } else {
            self.next(value);
        }
    }

    /// Terminates the stream with a handler failure.
    pub fn fail(&self, error: HandlerError) {
        self.sink
            .send(StreamEvent::Failed(BusError::handler(self.name, error)));
    }
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            sink: self.sink.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter").field("name", &self.name).finish()
    }
}
