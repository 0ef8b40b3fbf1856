// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `shmbus destroy` command - Remove the bus from the system.

use std::time::Duration;

use shmbus_core::{BusKey, PURGE_LOCK_TIMEOUT};

use super::resolve_config;

pub async fn execute(
    config_path: &str,
    key: Option<BusKey>,
    force: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = resolve_config(config_path, key)?;
    let wait = if force { Duration::ZERO } else { PURGE_LOCK_TIMEOUT };
    shmbus_core::purge_with_timeout(config.key, wait)?;
    println!("✓ Bus {} destroyed", config.key);
    Ok(())
}
