//! Error types surfaced by the binary.

use std::io;
use std::sync::Arc;

use portbus::BusError;
use portbus_config::ConfigError;
use thiserror::Error;

use crate::telemetry::TelemetryError;

/// Failures that end a `portbus` invocation.
#[derive(Debug, Error)]
pub enum CliError {
    /// Configuration layers could not be merged.
    #[error("failed to load configuration: {0}")]
    LoadConfiguration(Arc<ortho_config::OrthoError>),
    /// The merged configuration holds unusable values.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(#[from] ConfigError),
    /// Arguments did not match the command-line grammar.
    #[error("{0}")]
    CliUsage(clap::Error),
    /// Telemetry could not be installed.
    #[error("failed to initialise telemetry: {0}")]
    Telemetry(#[from] TelemetryError),
    /// The async runtime could not be built.
    #[error("failed to start the async runtime: {0}")]
    Runtime(io::Error),
    /// The path of the running executable could not be resolved.
    #[error("failed to locate the portbus executable: {0}")]
    CurrentExe(io::Error),
    /// The worker process could not be spawned.
    #[error("failed to spawn worker: {0}")]
    SpawnWorker(io::Error),
    /// The worker was spawned without one of its piped streams.
    #[error("worker {0} was not piped")]
    MissingPipe(&'static str),
    /// Waiting for the worker to exit failed.
    #[error("failed to wait for worker: {0}")]
    WaitWorker(io::Error),
    /// The dispatched command failed.
    #[error("command failed: {0}")]
    Dispatch(#[from] BusError),
    /// A result could not be serialised.
    #[error("failed to serialise output: {0}")]
    SerialiseOutput(serde_json::Error),
    /// A result could not be written.
    #[error("failed to write output: {0}")]
    WriteOutput(io::Error),
}
