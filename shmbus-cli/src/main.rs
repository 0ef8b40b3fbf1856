// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! shmbus CLI
//!
//! Command-line interface for inspecting and exercising a shmbus bus.

use clap::{Parser, Subcommand};
use shmbus_core::{BusKey, TerminalAddress};

mod commands;
mod tui;

/// shmbus - same-host message bus over POSIX shared memory
#[derive(Parser)]
#[command(name = "shmbus")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "shmbus.yaml")]
    pub config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Bus key (decimal or 0x-prefixed), overrides the configuration file
    #[arg(short, long)]
    pub key: Option<BusKey>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the roster and pipe counters of a bus
    Dump {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Join the bus and send one message
    Send {
        /// Sending terminal (kind:instance), defaults to the configured terminal
        #[arg(long)]
        from: Option<TerminalAddress>,

        /// Receiving terminal (kind:instance)
        #[arg(long)]
        to: TerminalAddress,

        /// Message text
        message: String,
    },

    /// Join the bus and print every message received until Ctrl-C
    Listen {
        /// Listening terminal (kind:instance), defaults to the configured terminal
        #[arg(long)]
        addr: Option<TerminalAddress>,

        /// Poll interval in milliseconds
        #[arg(long, default_value_t = 10)]
        tick_ms: u64,
    },

    /// Live dashboard of terminals and pipes
    Monitor {
        /// Refresh interval in milliseconds
        #[arg(long, default_value_t = 250)]
        tick_ms: u64,
    },

    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        file: String,
    },

    /// Remove the bus and all of its pipes from the system
    Destroy {
        /// Do not wait for the bus lock (its holder exited without releasing it)
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    match cli.command {
        Commands::Dump { json } => commands::dump::execute(&cli.config, cli.key, json).await,
        Commands::Send { from, to, message } => {
            commands::send::execute(&cli.config, cli.key, from, to, &message).await
        }
        Commands::Listen { addr, tick_ms } => {
            commands::listen::execute(&cli.config, cli.key, addr, tick_ms).await
        }
        Commands::Monitor { tick_ms } => {
            commands::monitor::execute(&cli.config, cli.key, tick_ms).await
        }
        Commands::Validate { file } => commands::validate::execute(&file).await,
        Commands::Destroy { force } => {
            commands::destroy::execute(&cli.config, cli.key, force).await
        }
    }
}
