//! Entry point for the `portbus` demonstration node.
//!
//! The binary delegates to [`portbus_cli::run`], which loads configuration,
//! installs telemetry and then either serves commands over standard I/O or
//! spawns such a worker and dispatches a command to it.

use std::io;
use std::process::ExitCode;

fn main() -> ExitCode {
    // Stdout stays unlocked: the worker streams protocol frames through it.
    let mut stdout = io::stdout();
    let mut stderr = io::stderr();
    portbus_cli::run(std::env::args_os(), &mut stdout, &mut stderr)
}
