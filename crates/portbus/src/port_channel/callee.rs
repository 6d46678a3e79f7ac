//! Callee side of the remote dispatch protocol.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use serde_json::Value;
use tracing::debug;

use super::{PORT_TARGET, decoding_listener, publish_event};
use crate::bus;
use crate::channel::{EndpointId, Envelope, PortChannel, PublishOptions};
use crate::command::{CommandFactory, Context, ErasedCommand, Output};
use crate::error::{BusError, HandlerError};
use crate::protocol::{
    ChannelNames, CommandAckEvent, CommandDataEvent, CommandResponseEvent,
    CommandUnsubscribeEvent, RequestId,
};
use crate::registry::HandlerRegistry;
use crate::stream::{EventSink, StreamEvent, Subscription, Teardown};

struct Installed {
    registry: Arc<HandlerRegistry>,
    context: Context,
}

#[derive(Default)]
struct State {
    served: HashSet<String>,
    jobs: HashMap<RequestId, Subscription>,
}

/// Serves this endpoint's handlers to remote callers.
pub(super) struct Callee {
    port: Arc<dyn PortChannel>,
    installed: OnceLock<Installed>,
    state: Mutex<State>,
}

impl Callee {
    pub(super) fn new(port: Arc<dyn PortChannel>) -> Self {
        Self {
            port,
            installed: OnceLock::new(),
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn install(&self, registry: Arc<HandlerRegistry>, context: Context) {
        if self.installed.set(Installed { registry, context }).is_err() {
            debug!(target: PORT_TARGET, "plugin already installed; keeping the first bus");
        }
    }

    pub(super) fn registry(&self) -> Option<&Arc<HandlerRegistry>> {
        self.installed.get().map(|installed| &installed.registry)
    }

    pub(super) fn jobs(&self) -> Vec<RequestId> {
        let mut ids: Vec<RequestId> = self.lock().jobs.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Starts answering remote requests for `name`. Repeated calls do nothing.
    pub(super) fn serve(self: &Arc<Self>, name: &str) {
        if !self.lock().served.insert(name.to_owned()) {
            return;
        }
        let names = ChannelNames::for_command(name);
        let weak = Arc::downgrade(self);
        self.port.subscribe(
            names.request(),
            decoding_listener(
                weak.clone(),
                name,
                |callee: &Arc<Self>, event: CommandDataEvent, envelope| {
                    callee.on_request(event, envelope);
                },
            ),
        );
        self.port.subscribe(
            names.unsubscribe(),
            decoding_listener(
                weak,
                name,
                |callee: &Arc<Self>, event: CommandUnsubscribeEvent, _| {
                    callee.on_unsubscribe(&event);
                },
            ),
        );
        debug!(target: PORT_TARGET, command = name, "serving remote requests");
    }

    fn on_request(self: &Arc<Self>, event: CommandDataEvent, envelope: &Envelope) {
        let names = ChannelNames::for_command(&envelope.channel);
        let caller = envelope.source;
        let CommandDataEvent { id, data } = event;
        publish_event(
            self.port.as_ref(),
            names.ack(),
            &CommandAckEvent { id: id.clone() },
            PublishOptions::to(caller),
        );
        debug!(
            target: PORT_TARGET,
            command = %envelope.channel,
            request_id = %id,
            caller = %caller,
            "serving remote request"
        );

        let name = names.request();
        let Some(installed) = self.installed.get() else {
            self.reject(&names, &id, caller, &BusError::handler_not_found(name));
            return;
        };
        let Some(factory) = installed.registry.factory(name) else {
            self.reject(&names, &id, caller, &BusError::handler_not_found(name));
            return;
        };
        let command = match factory.decode(data) {
            Ok(command) => command,
            Err(err) => {
                self.reject(&names, &id, caller, &err);
                return;
            }
        };

        let subscription = Subscription::new(name);
        self.lock().jobs.insert(id.clone(), subscription.clone());
        let sink = subscription.guard(self.responder(&names, id, caller, factory));
        let teardown = run(&installed.registry, command, installed.context.clone(), sink);
        subscription.attach(teardown);
    }

    /// Stops every job once the transport has closed.
    pub(super) fn abandon_all(&self) {
        let jobs: Vec<(RequestId, Subscription)> = self.lock().jobs.drain().collect();
        for (id, subscription) in jobs {
            debug!(
                target: PORT_TARGET,
                command = subscription.name(),
                request_id = %id,
                "transport closed; stopping remote request"
            );
            subscription.unsubscribe();
        }
    }

    fn on_unsubscribe(&self, event: &CommandUnsubscribeEvent) {
        let job = self.lock().jobs.remove(&event.id);
        if let Some(subscription) = job {
            debug!(
                target: PORT_TARGET,
                command = subscription.name(),
                request_id = %event.id,
                "caller cancelled remote request"
            );
            subscription.unsubscribe();
        }
    }

    fn reject(&self, names: &ChannelNames, id: &RequestId, caller: EndpointId, error: &BusError) {
        debug!(target: PORT_TARGET, request_id = %id, %error, "rejecting remote request");
        publish_event(
            self.port.as_ref(),
            names.response(),
            &CommandResponseEvent::failed(id.clone(), &error.clone().into_wire_error()),
            PublishOptions::to(caller),
        );
    }

    /// Builds the sink publishing a request's events back to its caller.
    fn responder(
        self: &Arc<Self>,
        names: &ChannelNames,
        id: RequestId,
        caller: EndpointId,
        factory: CommandFactory,
    ) -> EventSink {
        let callee = Arc::downgrade(self);
        let channel = names.response().to_owned();
        EventSink::new(move |event: StreamEvent<Output>| {
            let Some(owner) = callee.upgrade() else {
                return;
            };
            let ended_early = !event.is_terminal();
            let response = to_response(&id, &factory, event);
            if response.is_terminal() {
                owner.finish(&id, ended_early);
            }
            publish_event(
                owner.port.as_ref(),
                &channel,
                &response,
                PublishOptions::to(caller),
            );
        })
    }

    fn finish(&self, id: &RequestId, stop: bool) {
        let job = self.lock().jobs.remove(id);
        if let Some(subscription) = job.filter(|_| stop) {
            subscription.unsubscribe();
        }
    }
}

/// Runs the best handler registered for the command: unary, then pull
/// stream, then push stream.
fn run(
    registry: &HandlerRegistry,
    command: Box<dyn ErasedCommand>,
    context: Context,
    sink: EventSink,
) -> Teardown {
    let name = command.name().to_owned();
    if let Some(handler) = registry.handler(&name) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            sink.send(StreamEvent::Failed(BusError::handler(
                name,
                HandlerError::new("no async runtime available to run the handler"),
            )));
            return Teardown::none();
        };
        let task = runtime.spawn(async move {
            let outcome = handler(command, context).await;
            sink.send(match outcome {
                Ok(output) => StreamEvent::Complete(Some(output)),
                Err(err) => StreamEvent::Failed(err),
            });
        });
        return Teardown::immediate(move || task.abort());
    }
    if let Some(handler) = registry.async_stream_handler(&name) {
        return bus::drive_pull(&name, handler(command, context), sink);
    }
    if let Some(handler) = registry.stream_handler(&name) {
        return handler(command, context, sink);
    }
    sink.send(StreamEvent::Failed(BusError::handler_not_found(name)));
    Teardown::none()
}

fn to_response(
    id: &RequestId,
    factory: &CommandFactory,
    event: StreamEvent<Output>,
) -> CommandResponseEvent {
    let encoded = match event {
        StreamEvent::Next(output) => factory
            .encode_output(output)
            .map(|data| CommandResponseEvent::next(id.clone(), data)),
        StreamEvent::Complete(Some(output)) => factory
            .encode_output(output)
            .map(|data| CommandResponseEvent::complete(id.clone(), data)),
        StreamEvent::Complete(None) => Ok(CommandResponseEvent::complete(id.clone(), Value::Null)),
        StreamEvent::Failed(err) => Err(err),
    };
    encoded.unwrap_or_else(|err| CommandResponseEvent::failed(id.clone(), &err.into_wire_error()))
}
