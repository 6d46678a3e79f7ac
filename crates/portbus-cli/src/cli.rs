//! Command-line interface definitions for the `portbus` binary.

use clap::{Parser, Subcommand};

/// Command-line interface for the portbus demonstration node.
#[derive(Parser, Debug)]
#[command(name = "portbus", disable_help_subcommand = true)]
pub(crate) struct Cli {
    /// Action to perform.
    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

/// Structured subcommands for the `portbus` binary.
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CliCommand {
    /// Serves the demonstration commands over standard input and output.
    Worker,
    /// Computes `n!` in a freshly spawned worker.
    Factorial {
        /// Operand of the factorial.
        n: u32,
    },
    /// Streams clock ticks produced by a freshly spawned worker.
    Clock {
        /// Number of ticks to emit.
        #[arg(long, default_value_t = 5)]
        ticks: u32,
        /// Pause between ticks, in milliseconds.
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
}
