// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `shmbus listen` command - Print incoming messages until Ctrl-C.

use std::time::Duration;

use shmbus_core::{Bus, BusKey, BusOptions, BusResult, TerminalAddress};

use super::{resolve_config, resolve_terminal};

pub async fn execute(
    config_path: &str,
    key: Option<BusKey>,
    addr: Option<TerminalAddress>,
    tick_ms: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = resolve_config(config_path, key)?;
    let addr = resolve_terminal(&config, addr, "addr")?;

    let mut bus = Bus::with_options(config.key, addr, BusOptions::from(&config))?;
    tracing::info!(bus = %config.key, terminal = %addr, "Listening");
    println!("Listening on bus {} as {} (Ctrl-C to stop)", config.key, addr);

    let mut interval = tokio::time::interval(Duration::from_millis(tick_ms.max(1)));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                drain(&mut bus)?;
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("Shutting down...");
                break;
            }
        }
    }

    bus.release();
    Ok(())
}

/// Refresh the view and print everything currently queued.
fn drain(bus: &mut Bus) -> BusResult<usize> {
    if bus.poll()? {
        tracing::debug!(terminals = bus.terminals().len(), "Bus view changed");
    }

    let mut count = 0;
    while let Some((peer, payload)) = bus.recv_all()? {
        println!("{}: {}", peer, String::from_utf8_lossy(&payload));
        count += 1;
    }
    Ok(count)
}
