// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `shmbus send` command - Join the bus and send one message.

use shmbus_core::{Bus, BusKey, BusOptions, TerminalAddress};

use super::{resolve_config, resolve_terminal};

pub async fn execute(
    config_path: &str,
    key: Option<BusKey>,
    from: Option<TerminalAddress>,
    to: TerminalAddress,
    message: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = resolve_config(config_path, key)?;
    let from = resolve_terminal(&config, from, "from")?;

    let mut bus = Bus::with_options(config.key, from, BusOptions::from(&config))?;
    bus.poll()?;
    bus.send(to, message.as_bytes())?;

    println!(
        "✓ Sent {} bytes from {} to {} ({} bytes pending)",
        message.len(),
        from,
        to,
        bus.send_pending_bytes(to)
    );

    bus.release();
    Ok(())
}
