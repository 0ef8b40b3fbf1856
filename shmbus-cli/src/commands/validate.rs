// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `shmbus validate` command - Validate configuration file.

use shmbus_core::ConfigLoader;

pub async fn execute(file: &str) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(file = %file, "Validating configuration");

    match ConfigLoader::load_file(file) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!();
            println!("Bus Settings:");
            println!("  Key:           {}", config.key);
            println!("  Header Key:    {}", config.key.header_key());
            println!("  Pipe Capacity: {} bytes", config.pipe_capacity);
            match config.terminal {
                Some(addr) => println!("  Terminal:      {} (raw {})", addr, addr.raw()),
                None => println!("  Terminal:      (none, pass --from/--addr)"),
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}
