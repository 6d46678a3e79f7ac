//! Multi-endpoint publish/subscribe transports.
//!
//! A [`PortChannel`] moves JSON payloads between endpoints over named
//! channels. Each delivery carries an [`Envelope`] naming the sending
//! endpoint so a listener can address its reply with
//! [`PublishOptions::to`]. Two transports ship with the crate:
//! [`MemoryHub`] connects any number of in-process endpoints, and
//! [`LinkPort`] joins two endpoints over a byte stream.

mod link;
mod listeners;
mod memory;

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

pub use self::link::LinkPort;
pub use self::memory::{MemoryHub, MemoryPort, PublishedMessage};

/// Tracing target for transport operations.
const CHANNEL_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::channel");

/// Identity of an endpoint on a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(u64);

impl EndpointId {
    /// Wraps a raw endpoint number.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw endpoint number.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "endpoint-{}", self.0)
    }
}

/// Delivery metadata handed to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Endpoint that published the message.
    pub source: EndpointId,
    /// Channel the message was published on.
    pub channel: String,
}

/// Addressing for a published message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    single_consumer: bool,
    target: Option<EndpointId>,
}

impl PublishOptions {
    /// Deliver to every other interested endpoint.
    #[must_use]
    pub const fn broadcast() -> Self {
        Self {
            single_consumer: false,
            target: None,
        }
    }

    /// Deliver to any one interested endpoint.
    #[must_use]
    pub const fn single_consumer() -> Self {
        Self {
            single_consumer: true,
            target: None,
        }
    }

    /// Deliver to `endpoint` only.
    #[must_use]
    pub const fn to(endpoint: EndpointId) -> Self {
        Self {
            single_consumer: true,
            target: Some(endpoint),
        }
    }

    /// Returns `true` when at most one endpoint receives the message.
    #[must_use]
    pub const fn is_single_consumer(&self) -> bool {
        self.single_consumer
    }

    /// Returns the addressed endpoint, if any.
    #[must_use]
    pub const fn target(&self) -> Option<EndpointId> {
        self.target
    }
}

/// Callback receiving payloads published on a channel.
pub type Listener = Arc<dyn Fn(Value, &Envelope) + Send + Sync>;

/// Wraps a closure as a [`Listener`].
#[must_use]
pub fn listener(f: impl Fn(Value, &Envelope) + Send + Sync + 'static) -> Listener {
    Arc::new(f)
}

/// Handle identifying a subscribed listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Wraps a raw listener number.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw listener number.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// A publish/subscribe transport between endpoints.
///
/// Publishing is best-effort. Listeners run on the transport's delivery task
/// and must not block.
pub trait PortChannel: Send + Sync {
    /// Returns this endpoint's identity.
    fn endpoint(&self) -> EndpointId;

    /// Publishes `payload` on `channel`.
    fn publish(&self, channel: &str, payload: Value, options: PublishOptions);

    /// Registers `listener` for payloads published on `channel`.
    fn subscribe(&self, channel: &str, listener: Listener) -> ListenerId;

    /// Removes a listener previously registered on `channel`.
    fn unsubscribe(&self, channel: &str, listener: ListenerId);

    /// Resolves once no peer can be reached any more.
    ///
    /// The default never resolves, for transports that stay open for the
    /// life of the endpoint.
    fn closed(&self) -> BoxFuture<'static, ()> {
        Box::pin(futures::future::pending())
    }
}
