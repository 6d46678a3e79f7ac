//! Configuration loading helpers for the binary.
//!
//! Configuration flags must precede the subcommand. The leading run of
//! recognised flags is handed to `ortho_config` and forwarded to spawned
//! workers; everything from the first other token on is parsed by clap.

use std::ffi::{OsStr, OsString};

use ortho_config::OrthoConfig;
use portbus::PortChannelOptions;
use portbus_config::{CONFIG_CLI_FLAGS, Config};

use crate::CliError;

pub(crate) trait ConfigLoader {
    /// Loads configuration from the filtered configuration arguments.
    fn load(&self, args: &[OsString]) -> Result<Config, CliError>;
}

pub(crate) struct OrthoConfigLoader;

impl ConfigLoader for OrthoConfigLoader {
    fn load(&self, args: &[OsString]) -> Result<Config, CliError> {
        Config::load_from_iter(args.iter().cloned()).map_err(CliError::LoadConfiguration)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlagAction {
    Include { needs_value: bool },
    Skip,
}

fn process_config_flag(argument: &OsStr) -> FlagAction {
    let text = argument.to_string_lossy();
    if !text.starts_with("--") {
        return FlagAction::Skip;
    }
    let (flag, inline_value) = match text.split_once('=') {
        Some((flag, _)) => (flag, true),
        None => (&*text, false),
    };
    if CONFIG_CLI_FLAGS.contains(&flag) {
        return FlagAction::Include {
            needs_value: !inline_value,
        };
    }
    FlagAction::Skip
}

/// Arguments split between the configuration loader and clap.
///
/// Both lists start with the program name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ConfigArgumentSplit {
    pub(crate) config_arguments: Vec<OsString>,
    pub(crate) command_arguments: Vec<OsString>,
}

impl ConfigArgumentSplit {
    /// Configuration flags without the program name, for forwarding.
    pub(crate) fn forwarded(&self) -> &[OsString] {
        self.config_arguments.get(1..).unwrap_or_default()
    }
}

pub(crate) fn split_config_arguments(args: &[OsString]) -> ConfigArgumentSplit {
    let mut remaining = args.iter();
    let Some(program) = remaining.next() else {
        return ConfigArgumentSplit {
            config_arguments: Vec::new(),
            command_arguments: Vec::new(),
        };
    };
    let mut config_arguments = vec![program.clone()];
    let mut command_arguments = vec![program.clone()];
    let mut pending_value = false;

    for argument in remaining.by_ref() {
        if pending_value {
            config_arguments.push(argument.clone());
            pending_value = false;
            continue;
        }
        match process_config_flag(argument) {
            FlagAction::Include { needs_value } => {
                config_arguments.push(argument.clone());
                pending_value = needs_value;
            }
            FlagAction::Skip => {
                command_arguments.push(argument.clone());
                break;
            }
        }
    }
    command_arguments.extend(remaining.cloned());

    ConfigArgumentSplit {
        config_arguments,
        command_arguments,
    }
}

/// Maps the loaded configuration onto remote dispatch deadlines.
pub(crate) fn port_channel_options(config: &Config) -> PortChannelOptions {
    PortChannelOptions::new()
        .with_timeout(config.command_timeout())
        .with_response_timeout(config.response_timeout())
}
