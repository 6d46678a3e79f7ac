//! Serving the demonstration commands to a peer process.

use std::sync::Arc;

use portbus::channel::{LinkPort, PortChannel};
use portbus::{CommandBus, PortChannelOptions, PortChannelPlugin};
use tracing::info;

use crate::CLI_TARGET;
use crate::commands::register_handlers;

/// Serves the demonstration commands over `port` until the peer hangs up.
pub async fn serve(port: Arc<LinkPort>, options: PortChannelOptions) {
    let shared: Arc<dyn PortChannel> = port.clone();
    let plugin = PortChannelPlugin::new(shared, options);
    let bus = CommandBus::builder().plugin(plugin).build();
    register_handlers(&bus);
    port.start();
    info!(target: CLI_TARGET, commands = ?bus.registry().names(), "worker ready");
    port.closed().await;
    info!(target: CLI_TARGET, "peer closed the link; worker stopping");
}

/// Serves the demonstration commands over this process's standard I/O.
pub async fn serve_stdio(options: PortChannelOptions) {
    serve(Arc::new(LinkPort::stdio()), options).await;
}
