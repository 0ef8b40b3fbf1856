// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `shmbus monitor` command - Live dashboard.

use std::time::Duration;

use shmbus_core::BusKey;

use super::resolve_config;
use crate::tui;

pub async fn execute(
    config_path: &str,
    key: Option<BusKey>,
    tick_ms: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = resolve_config(config_path, key)?;
    tui::run_dashboard(config.key, Duration::from_millis(tick_ms.max(10))).await
}
