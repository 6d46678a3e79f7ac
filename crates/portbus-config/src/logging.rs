//! Log record formats for the `portbus` binary.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// How `portbus` renders log records on standard error.
///
/// Workers keep standard output for protocol frames, so both formats share
/// standard error with the client that spawned them.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogFormat {
    /// One JSON object per record, with span fields flattened.
    #[default]
    Json,
    /// Compact text line per record for interactive use.
    Compact,
}

/// Error returned when `--log-format` or `PORTBUS_LOG_FORMAT` names an
/// unknown format.
pub type LogFormatParseError = strum::ParseError;
