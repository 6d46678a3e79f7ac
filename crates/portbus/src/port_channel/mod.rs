//! Remote command dispatch over a [`PortChannel`].
//!
//! [`PortChannelPlugin`] lets a bus call handlers registered in another
//! endpoint and serve its own handlers to remote callers. Each exchange uses
//! the four channels named by [`ChannelNames`](crate::protocol::ChannelNames):
//!
//! 1. The caller publishes a [`CommandDataEvent`](crate::protocol::CommandDataEvent)
//!    to any one listener of the request channel and starts a deadline.
//! 2. The callee acknowledges straight back to the caller, stopping the
//!    deadline, then runs its handler.
//! 3. The callee answers with one response (unary) or one response per item
//!    (streams), the last marked `done`.
//! 4. Either side may publish an unsubscribe to abandon the exchange.
//!
//! Calls for which this process has a handler of its own never touch the
//! channel.

mod callee;
mod caller;

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use self::callee::Callee;
use self::caller::Caller;
use crate::bus;
use crate::channel::{Envelope, Listener, PortChannel, PublishOptions, listener};
use crate::command::{Context, Output};
use crate::error::BusError;
use crate::plugin::{Capabilities, DispatchPlugin, DispatchRequest};
use crate::protocol::RequestId;
use crate::registry::{HandlerRegistry, UnaryHandler};
use crate::stream::{CancellationSignal, EventSink, Teardown};

/// Tracing target for remote dispatch.
const PORT_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::port_channel");

/// Deadlines applied to remote requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortChannelOptions {
    timeout: Duration,
    response_timeout: Option<Duration>,
}

impl PortChannelOptions {
    /// Acknowledgement deadline used when none is configured.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

    /// Options with the default acknowledgement deadline and no response
    /// deadline.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            timeout: Self::DEFAULT_TIMEOUT,
            response_timeout: None,
        }
    }

    /// Sets how long a request may wait for its acknowledgement.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets how long an acknowledged unary request may wait for its result.
    #[must_use]
    pub const fn with_response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Returns the acknowledgement deadline.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns the post-acknowledgement deadline, if any.
    #[must_use]
    pub const fn response_timeout(&self) -> Option<Duration> {
        self.response_timeout
    }
}

impl Default for PortChannelOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatch plugin executing commands across a [`PortChannel`].
///
/// Cloning yields another handle to the same plugin, so a caller can keep
/// one after handing the plugin to a bus builder.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
///
/// use portbus::channel::{MemoryHub, MemoryPort};
/// use portbus::{Command, CommandBus, PortChannelOptions, PortChannelPlugin};
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
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let hub = MemoryHub::new();
/// let node = |port: MemoryPort| {
///     let plugin = PortChannelPlugin::new(Arc::new(port), PortChannelOptions::new());
///     CommandBus::builder().plugin(plugin).build()
/// };
/// let server = node(hub.connect());
/// let client = node(hub.connect());
/// server.register(|command: Double, _| Ok(command.0 * 2));
///
/// assert_eq!(client.execute(Double(21)).await.expect("remote result"), 42);
/// # }
/// ```
#[derive(Clone)]
pub struct PortChannelPlugin {
    caller: Arc<Caller>,
    callee: Arc<Callee>,
    _watch: Arc<TransportWatch>,
}

impl PortChannelPlugin {
    /// Creates a plugin dispatching over `port`.
    ///
    /// Within a Tokio runtime the plugin also watches
    /// [`PortChannel::closed`]: once it resolves, outstanding remote
    /// requests fail with [`BusError::Disconnected`] and remote jobs served
    /// here are stopped.
    #[must_use]
    pub fn new(port: Arc<dyn PortChannel>, options: PortChannelOptions) -> Self {
        let caller = Arc::new(Caller::new(Arc::clone(&port), options));
        let callee = Arc::new(Callee::new(Arc::clone(&port)));
        let watch = TransportWatch::spawn(port.as_ref(), &caller, &callee);
        Self {
            caller,
            callee,
            _watch: Arc::new(watch),
        }
    }

    /// Returns the ids of the remote streams this endpoint is consuming.
    #[must_use]
    pub fn active_remote_streams(&self) -> Vec<RequestId> {
        self.caller.active_streams()
    }

    /// Returns the ids of the remote requests this endpoint is serving.
    #[must_use]
    pub fn serving(&self) -> Vec<RequestId> {
        self.callee.jobs()
    }
}

impl fmt::Debug for PortChannelPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortChannelPlugin")
            .field("endpoint", &self.caller.endpoint())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DispatchPlugin for PortChannelPlugin {
    fn capabilities(&self) -> Capabilities {
        Capabilities::ALL
    }

    fn install(&self, registry: Arc<HandlerRegistry>, context: Context) {
        self.callee.install(registry, context);
    }

    async fn handler(
        &self,
        request: DispatchRequest,
        local: Option<UnaryHandler>,
    ) -> Result<Output, BusError> {
        let (command, context) = request.into_parts();
        if let Some(handler) = local {
            debug!(target: PORT_TARGET, command = command.name(), "serving locally");
            return handler(command, context).await;
        }
        let name = command.name().to_owned();
        let payload = command.to_payload()?;
        self.caller.execute(&name, payload).await
    }

    fn stream_handler(
        &self,
        request: DispatchRequest,
        sink: EventSink,
        _signal: Option<CancellationSignal>,
    ) -> Result<Teardown, BusError> {
        let (command, context) = request.into_parts();
        let name = command.name().to_owned();
        if let Some(registry) = self.callee.registry() {
            if let Some(handler) = registry.stream_handler(&name) {
                debug!(target: PORT_TARGET, command = %name, "streaming locally");
                return Ok(handler(command, context, sink));
            }
            if let Some(handler) = registry.async_stream_handler(&name) {
                debug!(target: PORT_TARGET, command = %name, "streaming locally");
                return Ok(bus::drive_pull(&name, handler(command, context), sink));
            }
            if registry.handler(&name).is_some() {
                return Err(BusError::not_a_stream_handler(name));
            }
        }
        let payload = command.to_payload()?;
        Ok(self.caller.stream(&name, payload, sink))
    }

    fn register(&self, name: &str) {
        self.callee.serve(name);
    }

    fn register_stream(&self, name: &str) {
        self.callee.serve(name);
    }
}

/// Background task reacting to the transport closing.
struct TransportWatch(Option<JoinHandle<()>>);

impl TransportWatch {
    fn spawn(port: &dyn PortChannel, caller: &Arc<Caller>, callee: &Arc<Callee>) -> Self {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(target: PORT_TARGET, "no runtime available; transport closure is not watched");
            return Self(None);
        };
        let closed = port.closed();
        let caller = Arc::downgrade(caller);
        let callee = Arc::downgrade(callee);
        Self(Some(runtime.spawn(async move {
            closed.await;
            if let Some(callee) = callee.upgrade() {
                callee.abandon_all();
            }
            if let Some(caller) = caller.upgrade() {
                caller.disconnect();
            }
        })))
    }
}

impl Drop for TransportWatch {
    fn drop(&mut self) {
        if let Some(task) = self.0.take() {
            task.abort();
        }
    }
}

/// Builds a listener that decodes each payload as `E` before handing it to
/// `react`, provided `owner` is still alive.
fn decoding_listener<T, E, F>(owner: Weak<T>, command: &str, react: F) -> Listener
where
    T: Send + Sync + 'static,
    E: DeserializeOwned,
    F: Fn(&Arc<T>, E, &Envelope) + Send + Sync + 'static,
{
    let command_name = command.to_owned();
    listener(move |payload, envelope| {
        let Some(target) = owner.upgrade() else {
            return;
        };
        match serde_json::from_value::<E>(payload) {
            Ok(event) => react(&target, event, envelope),
            Err(error) => warn!(
                target: PORT_TARGET,
                command = %command_name,
                channel = %envelope.channel,
                %error,
                "ignoring malformed event"
            ),
        }
    })
}

/// Serialises `event` and publishes it on `channel`.
fn publish_event<E: Serialize>(
    port: &dyn PortChannel,
    channel: &str,
    event: &E,
    options: PublishOptions,
) {
    match serde_json::to_value(event) {
        Ok(payload) => port.publish(channel, payload, options),
        Err(error) => warn!(target: PORT_TARGET, channel, %error, "failed to encode event"),
    }
}

#[cfg(test)]
mod tests;
