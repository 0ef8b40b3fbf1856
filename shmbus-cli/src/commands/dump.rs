// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `shmbus dump` command - Print a snapshot of the bus.

use shmbus_core::{BusInspector, BusKey};

use super::resolve_config;

pub async fn execute(
    config_path: &str,
    key: Option<BusKey>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = resolve_config(config_path, key)?;
    let snapshot = BusInspector::open(config.key)?.snapshot()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print!("{}", snapshot);
    }
    Ok(())
}
