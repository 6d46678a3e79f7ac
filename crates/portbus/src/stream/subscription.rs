//! Caller-side subscription handles and producer teardown.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use tracing::debug;

use super::event::{EventSink, StreamEvent};
use super::signal::CancellationSignal;
use crate::command::Output;

const STREAM_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::stream");

/// Cleanup returned by a push-style stream handler.
///
/// Runs at most once, and only when the caller unsubscribes. Normal
/// completion does not trigger it. A deferred teardown resolves to another
/// teardown which is then run.
#[derive(Default)]
pub struct Teardown(TeardownKind);

#[derive(Default)]
enum TeardownKind {
    #[default]
    Noop,
    Immediate(Box<dyn FnOnce() + Send>),
    Deferred(BoxFuture<'static, Teardown>),
}

impl Teardown {
    /// A teardown that does nothing.
    #[must_use]
    pub const fn none() -> Self {
        Self(TeardownKind::Noop)
    }

    /// A teardown that runs `f`.
    #[must_use]
    pub fn immediate(f: impl FnOnce() + Send + 'static) -> Self {
        Self(TeardownKind::Immediate(Box::new(f)))
    }

    /// A teardown that becomes available once `future` resolves.
    #[must_use]
    pub fn deferred(future: impl Future<Output = Self> + Send + 'static) -> Self {
        Self(TeardownKind::Deferred(Box::pin(future)))
    }

    /// Runs the teardown.
    ///
    /// Deferred teardowns are driven on the ambient tokio runtime, or
    /// blocked on when none is available.
    pub fn run(self) {
        match self.0 {
            TeardownKind::Noop => {}
            TeardownKind::Immediate(f) => f(),
            TeardownKind::Deferred(future) => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    drop(handle.spawn(async move { future.await.run() }));
                }
                Err(_) => futures::executor::block_on(future).run(),
            },
        }
    }
}

impl fmt::Debug for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.0 {
            TeardownKind::Noop => "none",
            TeardownKind::Immediate(_) => "immediate",
            TeardownKind::Deferred(_) => "deferred",
        };
        f.debug_tuple("Teardown").field(&kind).finish()
    }
}

/// Handle to a running push-style stream.
///
/// Clones share state. Unsubscribing is idempotent: the stored teardown runs
/// once and later emissions are dropped before they reach the callback.
#[derive(Clone)]
pub struct Subscription {
    state: Arc<State>,
}

struct State {
    name: String,
    active: AtomicBool,
    finished: AtomicBool,
    teardown: Mutex<Option<Teardown>>,
}

impl Subscription {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            state: Arc::new(State {
                name: name.into(),
                active: AtomicBool::new(true),
                finished: AtomicBool::new(false),
                teardown: Mutex::new(None),
            }),
        }
    }

    /// Returns the command type this subscription streams.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Returns `true` until the caller unsubscribes or the stream terminates.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.active.load(Ordering::Acquire) && !self.is_finished()
    }

    /// Returns `true` once a terminal event has been delivered.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.finished.load(Ordering::Acquire)
    }

    /// Stops delivery and runs the producer's teardown.
    pub fn unsubscribe(&self) {
        if !self.state.active.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!(
            target: STREAM_TARGET,
            command = %self.state.name,
            "stream unsubscribed"
        );
        let teardown = lock_teardown(&self.state).take();
        if let Some(teardown) = teardown {
            teardown.run();
        }
    }

    /// Stores the producer's teardown, running it at once if the caller has
    /// already unsubscribed and discarding it if the stream already finished.
    pub(crate) fn attach(&self, teardown: Teardown) {
        let mut slot = lock_teardown(&self.state);
        if self.state.finished.load(Ordering::Acquire) {
            return;
        }
        if self.state.active.load(Ordering::Acquire) {
            *slot = Some(teardown);
            return;
        }
        drop(slot);
        teardown.run();
    }

    /// Unsubscribes when `signal` fires.
    pub(crate) fn bind(&self, signal: &CancellationSignal) {
        let subscription = self.clone();
        signal.on_cancel(move || subscription.unsubscribe());
    }

    /// Wraps `sink` so delivery stops after unsubscription or the first
    /// terminal event.
    pub(crate) fn guard(&self, sink: EventSink) -> EventSink {
        let state = Arc::clone(&self.state);
        EventSink::new(move |event: StreamEvent<Output>| {
            if !state.active.load(Ordering::Acquire) {
                return;
            }
            let terminal = event.is_terminal();
            if terminal {
                if state.finished.swap(true, Ordering::AcqRel) {
                    return;
                }
            } else if state.finished.load(Ordering::Acquire) {
                return;
            }
            sink.send(event);
            if terminal {
                // Completion never runs the teardown; release it unrun.
                drop(lock_teardown(&state).take());
            }
        })
    }
}

fn lock_teardown(state: &State) -> MutexGuard<'_, Option<Teardown>> {
    state
        .teardown
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.state.name)
            .field("active", &self.is_active())
            .field("finished", &self.is_finished())
            .finish()
    }
}
