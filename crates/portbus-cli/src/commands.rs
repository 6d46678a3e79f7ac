//! Demonstration commands served by `portbus worker`.

use std::time::Duration;

use futures::Stream;
use portbus::{Command, CommandBus, Context, HandlerError};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::CLI_TARGET;

/// Computes `n!`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Factorial {
    /// Operand.
    pub n: u32,
}

impl Command for Factorial {
    const NAME: &'static str = "Factorial";
    type Output = u64;
}

/// Emits `ticks` numbered ticks, `interval_ms` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clock {
    /// Number of ticks to emit.
    pub ticks: u32,
    /// Pause before each tick, in milliseconds.
    pub interval_ms: u64,
}

/// One tick produced by [`Clock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    /// One-based tick number.
    pub n: u32,
    /// Ticks still to come.
    pub remaining: u32,
}

impl Command for Clock {
    const NAME: &'static str = "Clock";
    type Output = Tick;
}

/// Registers the demonstration handlers on `bus`.
pub fn register_handlers(bus: &CommandBus) {
    bus.register(|command: Factorial, _: &Context| factorial(command.n));
    bus.register_stream_async(|command: Clock, _: Context| clock(command));
}

/// Computes `n!`, failing when the result does not fit in a `u64`.
///
/// # Errors
///
/// Returns a [`HandlerError`] carrying `n` when the product overflows.
pub fn factorial(n: u32) -> Result<u64, HandlerError> {
    (1..=u64::from(n))
        .try_fold(1_u64, u64::checked_mul)
        .ok_or_else(|| {
            HandlerError::new(format!("{n}! does not fit in 64 bits"))
                .with_data(serde_json::json!({ "n": n }))
        })
}

fn clock(command: Clock) -> impl Stream<Item = Result<Tick, HandlerError>> + Send + 'static {
    let interval = Duration::from_millis(command.interval_ms);
    debug!(target: CLI_TARGET, ticks = command.ticks, ?interval, "clock started");
    futures::stream::unfold(0_u32, move |emitted| async move {
        if emitted >= command.ticks {
            return None;
        }
        tokio::time::sleep(interval).await;
        let n = emitted + 1;
        let tick = Tick {
            n,
            remaining: command.ticks - n,
        };
        Some((Ok(tick), n))
    })
}
