//! Command-line runtime for the `portbus` demonstration node.
//!
//! `portbus worker` serves the [`commands`] over standard I/O using a
//! [`portbus::channel::LinkPort`]. The client subcommands (`factorial`,
//! `clock`) spawn such a worker, dispatch one command to it through a
//! [`portbus::PortChannelPlugin`] and print each result as a JSON line.
//! Configuration flags given before the subcommand are forwarded to the
//! worker so both sides agree on deadlines and logging.

use std::ffi::OsString;
use std::io::Write;
use std::process::ExitCode;

use clap::Parser;
use futures::StreamExt;
use portbus::PortChannelOptions;
use portbus_config::Config;
use serde::Serialize;
use tracing::debug;

mod cli;
pub mod client;
pub mod commands;
mod config;
mod errors;
pub mod telemetry;
pub mod worker;

use self::cli::{Cli, CliCommand};
use self::client::WorkerClient;
use self::commands::{Clock, Factorial};
use self::config::{ConfigArgumentSplit, ConfigLoader, OrthoConfigLoader, split_config_arguments};
pub use self::errors::CliError;

/// Tracing target for the binary.
const CLI_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::cli");

/// Runs the CLI using the provided arguments and output streams.
#[must_use]
pub fn run<I, W, E>(args: I, stdout: &mut W, stderr: &mut E) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
{
    run_with_loader(args, stdout, stderr, &OrthoConfigLoader)
}

fn run_with_loader<I, W, E, L>(args: I, stdout: &mut W, stderr: &mut E, loader: &L) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
    L: ConfigLoader,
{
    let args: Vec<OsString> = args.into_iter().collect();
    let split = split_config_arguments(&args);

    let result = Cli::try_parse_from(&split.command_arguments)
        .map_err(CliError::CliUsage)
        .and_then(|cli| loader.load(&split.config_arguments).map(|config| (cli, config)))
        .and_then(|(cli, config)| {
            config.validate()?;
            telemetry::initialise(&config)?;
            execute(cli.command, &config, &split, stdout)
        });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(CliError::CliUsage(error)) if !error.use_stderr() => {
            drop(write!(stdout, "{error}"));
            ExitCode::SUCCESS
        }
        Err(error) => {
            drop(writeln!(stderr, "{error}"));
            ExitCode::FAILURE
        }
    }
}

fn execute<W: Write>(
    command: CliCommand,
    config: &Config,
    split: &ConfigArgumentSplit,
    stdout: &mut W,
) -> Result<(), CliError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?;
    let options = config::port_channel_options(config);
    debug!(target: CLI_TARGET, ?command, "dispatching subcommand");

    match command {
        CliCommand::Worker => {
            runtime.block_on(worker::serve_stdio(options));
            Ok(())
        }
        CliCommand::Factorial { n } => {
            runtime.block_on(remote_factorial(Factorial { n }, split, options, stdout))
        }
        CliCommand::Clock { ticks, interval_ms } => runtime.block_on(remote_clock(
            Clock { ticks, interval_ms },
            split,
            options,
            stdout,
        )),
    }
}

async fn remote_factorial<W: Write>(
    command: Factorial,
    split: &ConfigArgumentSplit,
    options: PortChannelOptions,
    stdout: &mut W,
) -> Result<(), CliError> {
    let client = WorkerClient::spawn(split.forwarded(), options)?;
    let outcome = client.bus().execute(command).await;
    client.shutdown().await?;
    write_json_line(stdout, &outcome?)
}

async fn remote_clock<W: Write>(
    command: Clock,
    split: &ConfigArgumentSplit,
    options: PortChannelOptions,
    stdout: &mut W,
) -> Result<(), CliError> {
    let client = WorkerClient::spawn(split.forwarded(), options)?;
    let outcome = print_ticks(&client, command, stdout).await;
    client.shutdown().await?;
    outcome
}

async fn print_ticks<W: Write>(
    client: &WorkerClient,
    command: Clock,
    stdout: &mut W,
) -> Result<(), CliError> {
    let mut ticks = client.bus().stream_async(command);
    while let Some(tick) = ticks.next().await {
        write_json_line(stdout, &tick?)?;
    }
    Ok(())
}

fn write_json_line<W: Write, T: Serialize>(stdout: &mut W, value: &T) -> Result<(), CliError> {
    serde_json::to_writer(&mut *stdout, value).map_err(CliError::SerialiseOutput)?;
    stdout.write_all(b"\n").map_err(CliError::WriteOutput)?;
    stdout.flush().map_err(CliError::WriteOutput)
}
