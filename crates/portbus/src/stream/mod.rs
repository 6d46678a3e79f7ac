//! Push and pull streaming primitives shared by the bus and its plugins.
//!
//! A producer writes [`StreamEvent`]s through an [`Emitter`]; the caller
//! holds a [`Subscription`] it can cancel, optionally through a
//! [`CancellationSignal`]. [`CommandStream`] adapts the push form into a
//! `futures::Stream` for pull-style consumers.

mod bridge;
mod event;
mod signal;
mod subscription;

pub use self::bridge::CommandStream;
pub use self::event::{Emitter, EventSink, StreamEvent};
pub use self::signal::CancellationSignal;
pub use self::subscription::{Subscription, Teardown};

#[cfg(test)]
mod tests;
