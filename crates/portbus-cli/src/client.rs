//! Spawning a worker process and dispatching commands to it.

use std::ffi::OsString;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use portbus::channel::{LinkPort, PortChannel};
use portbus::{CommandBus, PortChannelOptions, PortChannelPlugin};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::{CLI_TARGET, CliError};

/// How long a worker may take to exit once its stdin is closed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A bus whose commands are served by a child `portbus worker` process.
pub struct WorkerClient {
    bus: CommandBus,
    child: Child,
}

impl WorkerClient {
    /// Spawns the running executable as a worker, forwarding `config_flags`.
    ///
    /// # Errors
    ///
    /// Returns [`CliError::CurrentExe`] or [`CliError::SpawnWorker`] when the
    /// worker cannot be started.
    pub fn spawn(config_flags: &[OsString], options: PortChannelOptions) -> Result<Self, CliError> {
        let program = std::env::current_exe().map_err(CliError::CurrentExe)?;
        let mut child = Command::new(program)
            .args(config_flags)
            .arg("worker")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(CliError::SpawnWorker)?;
        let stdin = child.stdin.take().ok_or(CliError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(CliError::MissingPipe("stdout"))?;
        debug!(target: CLI_TARGET, pid = child.id(), "worker spawned");

        let port = Arc::new(LinkPort::new(stdout, stdin));
        let shared: Arc<dyn PortChannel> = port.clone();
        let plugin = PortChannelPlugin::new(shared, options);
        let bus = CommandBus::builder().plugin(plugin).build();
        port.start();
        Ok(Self { bus, child })
    }

    /// Bus dispatching to the worker.
    #[must_use]
    pub const fn bus(&self) -> &CommandBus {
        &self.bus
    }

    /// Closes the link and waits for the worker to exit, killing it after
    /// a grace period.
    ///
    /// # Errors
    ///
    /// Returns [`CliError::WaitWorker`] when the exit status cannot be read.
    pub async fn shutdown(self) -> Result<ExitStatus, CliError> {
        let Self { bus, mut child } = self;
        drop(bus);
        if let Ok(status) = tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            return status.map_err(CliError::WaitWorker);
        }
        warn!(target: CLI_TARGET, "worker did not exit in time; killing it");
        child.kill().await.map_err(CliError::WaitWorker)?;
        child.wait().await.map_err(CliError::WaitWorker)
    }
}
