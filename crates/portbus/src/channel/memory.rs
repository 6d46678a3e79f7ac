//! In-process hub connecting any number of endpoints.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::listeners::ListenerTable;
use super::{CHANNEL_TARGET, EndpointId, Envelope, Listener, ListenerId, PortChannel, PublishOptions};

/// A message as it was published to the hub.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    /// Publishing endpoint.
    pub source: EndpointId,
    /// Channel name.
    pub channel: String,
    /// Payload as published.
    pub payload: Value,
    /// Addressing requested by the publisher.
    pub options: PublishOptions,
}

struct Frame {
    source: EndpointId,
    channel: String,
    payload: Value,
}

struct Slot {
    sender: mpsc::UnboundedSender<Frame>,
    interest: HashMap<String, usize>,
}

#[derive(Default)]
struct Routing {
    endpoints: BTreeMap<EndpointId, Slot>,
    cursors: HashMap<String, usize>,
}

#[derive(Default)]
struct Hub {
    routing: Mutex<Routing>,
    published: Mutex<Vec<PublishedMessage>>,
    next_endpoint: AtomicU64,
}

/// In-process transport shared by several endpoints.
///
/// Targeted messages reach the addressed endpoint only. Other messages go to
/// the endpoints (never the publisher) that listen on the channel: all of
/// them for a broadcast, one of them in rotation for a single-consumer
/// publish. Each endpoint receives messages in order on its own delivery
/// task. Every publish is recorded for inspection.
///
/// # Example
///
/// ```
/// use portbus::channel::{MemoryHub, PortChannel, PublishOptions, listener};
/// use serde_json::json;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let hub = MemoryHub::new();
/// let sender = hub.connect();
/// let receiver = hub.connect();
/// let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
/// receiver.subscribe("greeting", listener(move |payload, _| {
///     drop(tx.send(payload));
/// }));
///
/// sender.publish("greeting", json!("hello"), PublishOptions::broadcast());
///
/// assert_eq!(rx.recv().await, Some(json!("hello")));
/// assert_eq!(hub.published_on("greeting").len(), 1);
/// # }
/// ```
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Hub>,
}

impl MemoryHub {
    /// Creates a hub with no endpoints.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects a new endpoint.
    ///
    /// Must be called within a Tokio runtime; the endpoint's delivery task is
    /// spawned on it.
    #[must_use]
    pub fn connect(&self) -> MemoryPort {
        let id = EndpointId::new(self.inner.next_endpoint.fetch_add(1, Ordering::Relaxed) + 1);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.routing().endpoints.insert(
            id,
            Slot {
                sender,
                interest: HashMap::new(),
            },
        );
        let listeners = Arc::new(ListenerTable::default());
        let pump = tokio::spawn(deliver(receiver, Arc::clone(&listeners)));
        debug!(target: CHANNEL_TARGET, endpoint = %id, "endpoint connected");
        MemoryPort {
            id,
            hub: self.clone(),
            listeners,
            pump,
        }
    }

    /// Returns every message published so far.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.log().clone()
    }

    /// Returns the messages published on `channel`.
    #[must_use]
    pub fn published_on(&self, channel: &str) -> Vec<PublishedMessage> {
        self.log()
            .iter()
            .filter(|message| message.channel == channel)
            .cloned()
            .collect()
    }

    /// Forgets the recorded messages.
    pub fn clear_published(&self) {
        self.log().clear();
    }

    fn routing(&self) -> MutexGuard<'_, Routing> {
        self.inner
            .routing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn log(&self) -> MutexGuard<'_, Vec<PublishedMessage>> {
        self.inner
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_interest(&self, endpoint: EndpointId, channel: &str, listening: bool) {
        let mut routing = self.routing();
        let Some(slot) = routing.endpoints.get_mut(&endpoint) else {
            return;
        };
        if listening {
            *slot.interest.entry(channel.to_owned()).or_default() += 1;
            return;
        }
        if let Some(count) = slot.interest.get_mut(channel) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                slot.interest.remove(channel);
            }
        }
    }

    fn disconnect(&self, endpoint: EndpointId) {
        self.routing().endpoints.remove(&endpoint);
        debug!(target: CHANNEL_TARGET, endpoint = %endpoint, "endpoint disconnected");
    }

    fn route(&self, source: EndpointId, channel: &str, payload: Value, options: PublishOptions) {
        {
            let mut routing = self.routing();
            let recipients = select_recipients(&mut routing, source, channel, options);
            if recipients.is_empty() {
                debug!(target: CHANNEL_TARGET, channel, source = %source, "no recipient for message");
            }
            for recipient in recipients {
                let Some(slot) = routing.endpoints.get(&recipient) else {
                    continue;
                };
                trace!(
                    target: CHANNEL_TARGET,
                    channel,
                    source = %source,
                    endpoint = %recipient,
                    "delivering"
                );
                drop(slot.sender.send(Frame {
                    source,
                    channel: channel.to_owned(),
                    payload: payload.clone(),
                }));
            }
        }
        self.log().push(PublishedMessage {
            source,
            channel: channel.to_owned(),
            payload,
            options,
        });
    }
}

impl fmt::Debug for MemoryHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryHub")
            .field("endpoints", &self.routing().endpoints.len())
            .finish_non_exhaustive()
    }
}

fn select_recipients(
    routing: &mut Routing,
    source: EndpointId,
    channel: &str,
    options: PublishOptions,
) -> Vec<EndpointId> {
    if let Some(target) = options.target() {
        let reachable = target != source && routing.endpoints.contains_key(&target);
        return if reachable { vec![target] } else { Vec::new() };
    }
    let candidates: Vec<EndpointId> = routing
        .endpoints
        .iter()
        .filter(|(id, slot)| **id != source && slot.interest.contains_key(channel))
        .map(|(id, _)| *id)
        .collect();
    if !options.is_single_consumer() {
        return candidates;
    }
    let cursor = routing.cursors.entry(channel.to_owned()).or_default();
    let index = if *cursor >= candidates.len() { 0 } else { *cursor };
    *cursor = index + 1;
    candidates.get(index).copied().into_iter().collect()
}

async fn deliver(mut frames: mpsc::UnboundedReceiver<Frame>, listeners: Arc<ListenerTable>) {
    while let Some(frame) = frames.recv().await {
        let envelope = Envelope {
            source: frame.source,
            channel: frame.channel,
        };
        listeners.dispatch(&frame.payload, &envelope);
    }
}

/// One endpoint of a [`MemoryHub`].
///
/// Dropping the port disconnects it from the hub.
pub struct MemoryPort {
    id: EndpointId,
    hub: MemoryHub,
    listeners: Arc<ListenerTable>,
    pump: JoinHandle<()>,
}

impl MemoryPort {
    /// Returns the hub this port belongs to.
    #[must_use]
    pub const fn hub(&self) -> &MemoryHub {
        &self.hub
    }
}

impl PortChannel for MemoryPort {
    fn endpoint(&self) -> EndpointId {
        self.id
    }

    fn publish(&self, channel: &str, payload: Value, options: PublishOptions) {
        self.hub.route(self.id, channel, payload, options);
    }

    fn subscribe(&self, channel: &str, listener: Listener) -> ListenerId {
        let (id, first) = self.listeners.add(channel, listener);
        if first {
            self.hub.set_interest(self.id, channel, true);
        }
        id
    }

    fn unsubscribe(&self, channel: &str, listener: ListenerId) {
        if self.listeners.remove(channel, listener) {
            self.hub.set_interest(self.id, channel, false);
        }
    }
}

impl Drop for MemoryPort {
    fn drop(&mut self) {
        self.hub.disconnect(self.id);
        self.pump.abort();
    }
}

impl fmt::Debug for MemoryPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPort")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
