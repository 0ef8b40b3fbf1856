// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! CLI command modules.

pub mod destroy;
pub mod dump;
pub mod listen;
pub mod monitor;
pub mod send;
pub mod validate;

use std::path::Path;

use shmbus_core::{BusConfig, BusError, BusKey, ConfigLoader, HardValidationError, TerminalAddress};

/// Settings for commands that touch a bus.
///
/// The configuration file is optional when `--key` is given; the key flag
/// always wins over the file.
pub fn resolve_config(config_path: &str, key: Option<BusKey>) -> Result<BusConfig, BusError> {
    let path = Path::new(config_path);

    let mut config = match (path.exists(), key) {
        (true, _) => ConfigLoader::load_file(path)?,
        (false, Some(key)) => BusConfig::new(key),
        (false, None) => {
            return Err(BusError::ConfigNotFound {
                path: path.to_path_buf(),
            })
        }
    };

    if let Some(key) = key {
        config.key = key;
    }

    tracing::debug!(bus = %config.key, pipe_capacity = config.pipe_capacity, "Resolved bus settings");
    Ok(config)
}

/// Terminal from the command line, or the configured one.
pub fn resolve_terminal(
    config: &BusConfig,
    flag: Option<TerminalAddress>,
    flag_name: &'static str,
) -> Result<TerminalAddress, BusError> {
    flag.or(config.terminal).ok_or_else(|| {
        HardValidationError::MissingRequiredField {
            field: flag_name,
            context: "command line or terminal section of the configuration".to_string(),
        }
        .into()
    })
}
