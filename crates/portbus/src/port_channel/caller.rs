//! Caller side of the remote dispatch protocol.
//!
//! Every outstanding request is tracked by id until a terminal response, a
//! deadline, a remote unsubscribe, local cancellation or the loss of the
//! transport removes it. Response,
//! acknowledgement and unsubscribe listeners are shared by all outstanding
//! requests of one command type and only exist while such requests do.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{PORT_TARGET, PortChannelOptions, decoding_listener, publish_event};
use crate::channel::{EndpointId, Envelope, ListenerId, PortChannel, PublishOptions};
use crate::command::Output;
use crate::error::{BusError, TimeoutStage};
use crate::protocol::{
    ChannelNames, CommandAckEvent, CommandDataEvent, CommandResponseEvent,
    CommandUnsubscribeEvent, RequestId,
};
use crate::stream::{EventSink, StreamEvent, Teardown};

enum Reply {
    Unary(oneshot::Sender<Result<Output, BusError>>),
    Stream(EventSink),
}

impl Reply {
    fn deliver(self, outcome: Result<Option<Output>, BusError>) {
        match self {
            Self::Unary(sender) => {
                let result = outcome.map(|output| output.unwrap_or(Output::Encoded(Value::Null)));
                drop(sender.send(result));
            }
            Self::Stream(sink) => sink.send(match outcome {
                Ok(last) => StreamEvent::Complete(last),
                Err(err) => StreamEvent::Failed(err),
            }),
        }
    }
}

#[derive(Clone, Copy)]
enum Phase {
    AwaitingAck,
    Acknowledged { responder: EndpointId },
}

struct Pending {
    name: String,
    reply: Reply,
    phase: Phase,
    timer: Option<JoinHandle<()>>,
}

impl Pending {
    const fn responder(&self) -> Option<EndpointId> {
        match self.phase {
            Phase::AwaitingAck => None,
            Phase::Acknowledged { responder } => Some(responder),
        }
    }

    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct Route {
    names: ChannelNames,
    response: ListenerId,
    ack: ListenerId,
    unsubscribe: ListenerId,
    outstanding: usize,
}

#[derive(Default)]
struct State {
    pending: HashMap<RequestId, Pending>,
    routes: HashMap<String, Route>,
}

/// Outstanding requests made by this endpoint.
pub(super) struct Caller {
    port: Arc<dyn PortChannel>,
    options: PortChannelOptions,
    state: Mutex<State>,
    disconnected: AtomicBool,
}

impl Caller {
    pub(super) fn new(port: Arc<dyn PortChannel>, options: PortChannelOptions) -> Self {
        Self {
            port,
            options,
            state: Mutex::new(State::default()),
            disconnected: AtomicBool::new(false),
        }
    }

    pub(super) fn endpoint(&self) -> EndpointId {
        self.port.endpoint()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sends a unary request and waits for its terminal response.
    ///
    /// Dropping the returned future abandons the request and tells the
    /// responder to stop.
    pub(super) async fn execute(
        self: &Arc<Self>,
        name: &str,
        data: Value,
    ) -> Result<Output, BusError> {
        if self.is_disconnected() {
            return Err(BusError::disconnected(name));
        }
        let (sender, receiver) = oneshot::channel();
        let id = self.open(name, data, Reply::Unary(sender));
        let abandon = Abandon {
            caller: Arc::clone(self),
            id,
        };
        let outcome = receiver.await;
        drop(abandon);
        outcome.unwrap_or_else(|_| Err(BusError::disconnected(name)))
    }

    /// Sends a stream request; events are delivered to `sink`.
    pub(super) fn stream(
        self: &Arc<Self>,
        name: &str,
        data: Value,
        sink: EventSink,
    ) -> Teardown {
        if self.is_disconnected() {
            sink.send(StreamEvent::Failed(BusError::disconnected(name)));
            return Teardown::none();
        }
        let id = self.open(name, data, Reply::Stream(sink));
        let caller = Arc::downgrade(self);
        Teardown::immediate(move || {
            if let Some(owner) = caller.upgrade() {
                owner.cancel(&id);
            }
        })
    }

    fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Fails every outstanding request once the transport has closed.
    /// Requests made afterwards fail straight away.
    pub(super) fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        let ids: Vec<RequestId> = self.lock().pending.keys().cloned().collect();
        warn!(
            target: PORT_TARGET,
            outstanding = ids.len(),
            "transport closed; failing outstanding requests"
        );
        for id in ids {
            if let Some((pending, _)) = self.take(&id) {
                let error = BusError::disconnected(pending.name.as_str());
                pending.reply.deliver(Err(error));
            }
        }
    }

    pub(super) fn active_streams(&self) -> Vec<RequestId> {
        let mut ids: Vec<RequestId> = self
            .lock()
            .pending
            .iter()
            .filter(|(_, pending)| matches!(pending.reply, Reply::Stream(_)))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn open(self: &Arc<Self>, name: &str, data: Value, reply: Reply) -> RequestId {
        let id = RequestId::generate();
        let request_channel = {
            let mut state = self.lock();
            let route = self.route(&mut state, name);
            route.outstanding += 1;
            let channel = route.names.request().to_owned();
            state.pending.insert(
                id.clone(),
                Pending {
                    name: name.to_owned(),
                    reply,
                    phase: Phase::AwaitingAck,
                    timer: None,
                },
            );
            channel
        };
        let timer = self.arm(&id, name, TimeoutStage::Acknowledgement, self.options.timeout());
        self.store_timer(&id, timer);
        debug!(target: PORT_TARGET, command = name, request_id = %id, "publishing request");
        publish_event(
            self.port.as_ref(),
            &request_channel,
            &CommandDataEvent {
                id: id.clone(),
                data,
            },
            PublishOptions::single_consumer(),
        );
        id
    }

    fn store_timer(&self, id: &RequestId, timer: Option<JoinHandle<()>>) {
        let Some(handle) = timer else {
            return;
        };
        match self.lock().pending.get_mut(id) {
            Some(pending) => pending.timer = Some(handle),
            None => handle.abort(),
        }
    }

    fn route<'a>(self: &Arc<Self>, state: &'a mut State, name: &str) -> &'a mut Route {
        state.routes.entry(name.to_owned()).or_insert_with(|| {
            let names = ChannelNames::for_command(name);
            let weak = Arc::downgrade(self);
            let response = self.port.subscribe(
                names.response(),
                decoding_listener(weak.clone(), name, |caller: &Arc<Self>, event: CommandResponseEvent, _| {
                    caller.on_response(event);
                }),
            );
            let ack = self.port.subscribe(
                names.ack(),
                decoding_listener(weak.clone(), name, |caller: &Arc<Self>, event: CommandAckEvent, envelope| {
                    caller.on_ack(&event, envelope);
                }),
            );
            let unsubscribe = self.port.subscribe(
                names.unsubscribe(),
                decoding_listener(weak, name, |caller: &Arc<Self>, event: CommandUnsubscribeEvent, _| {
                    caller.on_unsubscribe(&event);
                }),
            );
            debug!(target: PORT_TARGET, command = name, "listening for responses");
            Route {
                names,
                response,
                ack,
                unsubscribe,
                outstanding: 0,
            }
        })
    }

    /// Removes a pending entry, dropping the shared listeners once the last
    /// request of its type is gone.
    fn take(&self, id: &RequestId) -> Option<(Pending, Option<ChannelNames>)> {
        let mut state = self.lock();
        let mut pending = state.pending.remove(id)?;
        pending.stop_timer();
        let names = state.routes.get_mut(&pending.name).and_then(|route| {
            route.outstanding = route.outstanding.saturating_sub(1);
            (route.outstanding == 0).then(|| route.names.clone())
        });
        let Some(channels) = names else {
            return Some((pending, None));
        };
        if let Some(route) = state.routes.remove(&pending.name) {
            self.port.unsubscribe(channels.response(), route.response);
            self.port.unsubscribe(channels.ack(), route.ack);
            self.port.unsubscribe(channels.unsubscribe(), route.unsubscribe);
            debug!(target: PORT_TARGET, command = %pending.name, "stopped listening for responses");
        }
        Some((pending, Some(channels)))
    }

    fn on_response(&self, event: CommandResponseEvent) {
        let stream = {
            let state = self.lock();
            let Some(pending) = state.pending.get(&event.id) else {
                debug!(target: PORT_TARGET, request_id = %event.id, "dropping response for unknown request");
                return;
            };
            match &pending.reply {
                Reply::Stream(sink) => Some((sink.clone(), pending.name.clone())),
                Reply::Unary(_) => None,
            }
        };
        if !event.is_terminal() {
            match stream {
                Some((sink, name)) => sink.send(event.into_stream_event(&name)),
                None => debug!(
                    target: PORT_TARGET,
                    request_id = %event.id,
                    "ignoring partial response to unary request"
                ),
            }
            return;
        }
        let Some((pending, _)) = self.take(&event.id) else {
            return;
        };
        let name = pending.name;
        match pending.reply {
            Reply::Unary(sender) => drop(sender.send(event.into_result(&name))),
            Reply::Stream(sink) => sink.send(event.into_stream_event(&name)),
        }
    }

    fn on_ack(self: &Arc<Self>, event: &CommandAckEvent, envelope: &Envelope) {
        let mut state = self.lock();
        let Some(pending) = state.pending.get_mut(&event.id) else {
            debug!(target: PORT_TARGET, request_id = %event.id, "dropping acknowledgement for unknown request");
            return;
        };
        if let Phase::Acknowledged { responder } = pending.phase {
            debug!(
                target: PORT_TARGET,
                request_id = %event.id,
                responder = %responder,
                duplicate = %envelope.source,
                "request already acknowledged"
            );
            return;
        }
        pending.stop_timer();
        pending.phase = Phase::Acknowledged {
            responder: envelope.source,
        };
        debug!(
            target: PORT_TARGET,
            command = %pending.name,
            request_id = %event.id,
            responder = %envelope.source,
            "request acknowledged"
        );
        let deadline = match pending.reply {
            Reply::Unary(_) => self.options.response_timeout(),
            Reply::Stream(_) => None,
        };
        if let Some(after) = deadline {
            let name = pending.name.clone();
            drop(state);
            let timer = self.arm(&event.id, &name, TimeoutStage::Response, after);
            self.store_timer(&event.id, timer);
        }
    }

    fn on_unsubscribe(&self, event: &CommandUnsubscribeEvent) {
        let Some((pending, _)) = self.take(&event.id) else {
            return;
        };
        debug!(
            target: PORT_TARGET,
            command = %pending.name,
            request_id = %event.id,
            "responder ended the exchange"
        );
        let outcome = match pending.reply {
            Reply::Stream(_) => Ok(None),
            Reply::Unary(_) => Err(BusError::disconnected(pending.name.as_str())),
        };
        pending.reply.deliver(outcome);
    }

    fn arm(
        self: &Arc<Self>,
        id: &RequestId,
        name: &str,
        stage: TimeoutStage,
        after: Duration,
    ) -> Option<JoinHandle<()>> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(target: PORT_TARGET, command = name, "no runtime available; request has no deadline");
            return None;
        };
        let caller = Arc::downgrade(self);
        let request = id.clone();
        Some(runtime.spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(owner) = caller.upgrade() {
                owner.expire(&request, stage, after);
            }
        }))
    }

    fn expire(&self, id: &RequestId, stage: TimeoutStage, after: Duration) {
        let expected = {
            let state = self.lock();
            state.pending.get(id).is_some_and(|pending| {
                matches!(
                    (stage, pending.phase),
                    (TimeoutStage::Acknowledgement, Phase::AwaitingAck)
                        | (TimeoutStage::Response, Phase::Acknowledged { .. })
                )
            })
        };
        if !expected {
            return;
        }
        let Some((pending, channels)) = self.take(id) else {
            return;
        };
        warn!(
            target: PORT_TARGET,
            command = %pending.name,
            request_id = %id,
            %stage,
            timeout_ms = u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
            "remote request timed out"
        );
        self.notify_unsubscribe(&pending, channels, id);
        let error = BusError::timeout(pending.name.as_str(), stage, after);
        pending.reply.deliver(Err(error));
    }

    /// Abandons a request on behalf of the local caller.
    fn cancel(&self, id: &RequestId) {
        let Some((pending, channels)) = self.take(id) else {
            return;
        };
        debug!(
            target: PORT_TARGET,
            command = %pending.name,
            request_id = %id,
            "cancelling remote request"
        );
        self.notify_unsubscribe(&pending, channels, id);
    }

    fn notify_unsubscribe(&self, pending: &Pending, channels: Option<ChannelNames>, id: &RequestId) {
        let names = channels.unwrap_or_else(|| ChannelNames::for_command(&pending.name));
        let options = pending
            .responder()
            .map_or_else(PublishOptions::broadcast, PublishOptions::to);
        publish_event(
            self.port.as_ref(),
            names.unsubscribe(),
            &CommandUnsubscribeEvent { id: id.clone() },
            options,
        );
    }
}

/// Cancels an in-flight unary request when its future is dropped early.
struct Abandon {
    caller: Arc<Caller>,
    id: RequestId,
}

impl Drop for Abandon {
    fn drop(&mut self) {
        self.caller.cancel(&self.id);
    }
}
