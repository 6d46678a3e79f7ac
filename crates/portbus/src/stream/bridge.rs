//! Pull-style adapter over push and native async streams.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use futures::stream::BoxStream;
use tokio::sync::mpsc::UnboundedReceiver;

use super::event::StreamEvent;
use super::subscription::Subscription;
use crate::error::BusError;

/// Asynchronous sequence of command results.
///
/// Yields `Ok` per value and at most one trailing `Err`. When backed by a
/// push producer, values are queued without bound until pulled, and dropping
/// the stream before it terminates unsubscribes from the producer.
pub struct CommandStream<T> {
    inner: Inner<T>,
}

enum Inner<T> {
    Direct(BoxStream<'static, Result<T, BusError>>),
    Bridged {
        receiver: UnboundedReceiver<StreamEvent<T>>,
        subscription: Subscription,
    },
    Failed(BusError),
    Done,
}

// No field is structurally pinned.
impl<T> Unpin for CommandStream<T> {}

impl<T> CommandStream<T> {
    /// Wraps a native async stream.
    pub(crate) const fn direct(stream: BoxStream<'static, Result<T, BusError>>) -> Self {
        Self {
            inner: Inner::Direct(stream),
        }
    }

    /// Drains events queued by a push subscription.
    pub(crate) const fn bridged(
        receiver: UnboundedReceiver<StreamEvent<T>>,
        subscription: Subscription,
    ) -> Self {
        Self {
            inner: Inner::Bridged {
                receiver,
                subscription,
            },
        }
    }

    /// A stream whose first pull yields `error`.
    pub(crate) const fn failed(error: BusError) -> Self {
        Self {
            inner: Inner::Failed(error),
        }
    }

    /// Returns `true` once the stream has yielded its last item.
    #[must_use]
    pub const fn is_terminated(&self) -> bool {
        matches!(self.inner, Inner::Done)
    }

    fn finish(&mut self) {
        self.inner = Inner::Done;
    }
}

impl<T> Stream for CommandStream<T> {
    type Item = Result<T, BusError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match &mut this.inner {
            Inner::Done => Poll::Ready(None),
            Inner::Failed(_) => {
                let Inner::Failed(error) = std::mem::replace(&mut this.inner, Inner::Done) else {
                    return Poll::Ready(None);
                };
                Poll::Ready(Some(Err(error)))
            }
            Inner::Direct(stream) => match stream.as_mut().poll_next(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(Some(Ok(value))) => Poll::Ready(Some(Ok(value))),
                Poll::Ready(Some(Err(error))) => {
                    this.finish();
                    Poll::Ready(Some(Err(error)))
                }
                Poll::Ready(None) => {
                    this.finish();
                    Poll::Ready(None)
                }
            },
            Inner::Bridged {
                receiver,
                subscription,
            } => match receiver.poll_recv(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(Some(StreamEvent::Next(value))) => Poll::Ready(Some(Ok(value))),
                Poll::Ready(Some(StreamEvent::Complete(last))) => {
                    this.finish();
                    Poll::Ready(last.map(Ok))
                }
                Poll::Ready(Some(StreamEvent::Failed(error))) => {
                    subscription.unsubscribe();
                    this.finish();
                    Poll::Ready(Some(Err(error)))
                }
                Poll::Ready(None) => {
                    this.finish();
                    Poll::Ready(None)
                }
            },
        }
    }
}

impl<T> Drop for CommandStream<T> {
    fn drop(&mut self) {
        if let Inner::Bridged { subscription, .. } = &self.inner {
            subscription.unsubscribe();
        }
    }
}

impl<T> fmt::Debug for CommandStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner {
            Inner::Direct(_) => "direct",
            Inner::Bridged { .. } => "bridged",
            Inner::Failed(_) => "failed",
            Inner::Done => "done",
        };
        f.debug_struct("CommandStream").field("state", &state).finish()
    }
}
