// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Shared fixtures for the shmbus benchmarks.

use shmbus_core::{purge, Bus, BusKey, BusOptions, BusResult, TerminalAddress};

/// Payload sizes to benchmark (in bytes).
pub const PAYLOAD_SIZES: &[usize] = &[16, 64, 256, 1024, 4096, 16384];

/// Bus key unlikely to collide with another benchmark run.
pub fn bench_key(tag: u16) -> BusKey {
    BusKey::new(0x4000 | ((std::process::id() as u16 & 0xFF) << 4) | (tag & 0xF))
}

/// Two handles on a fresh bus with pipes already created both ways.
pub struct BusPair {
    key: BusKey,
    pub left: Bus,
    pub right: Bus,
}

impl BusPair {
    pub fn new(key: BusKey, pipe_capacity: usize) -> BusResult<Self> {
        purge(key)?;
        let options = BusOptions { pipe_capacity };
        let left_addr = TerminalAddress::new(0, 1)?;
        let right_addr = TerminalAddress::new(0, 2)?;

        let mut left = Bus::with_options(key, left_addr, options.clone())?;
        let mut right = Bus::with_options(key, right_addr, options)?;

        left.send(right_addr, b"")?;
        right.poll()?;
        right.send(left_addr, b"")?;
        left.poll()?;
        right.recv(left_addr)?;
        left.recv(right_addr)?;

        Ok(Self { key, left, right })
    }

    /// Remove the bus. Handles are dropped first.
    pub fn destroy(self) -> BusResult<()> {
        let key = self.key;
        drop(self);
        purge(key)
    }
}
