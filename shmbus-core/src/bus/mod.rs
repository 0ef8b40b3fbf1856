// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Bus orchestration.
//!
//! A bus is one shared header segment (roster of terminals, table of pipes,
//! two version counters) plus one segment per directed pipe. Pipes are
//! created lazily by their first sender and discovered by their receiver on
//! the next [`Bus::poll`].

mod handle;
mod inspect;
mod layout;
mod pipe;
mod snapshot;

pub use handle::Bus;
pub use inspect::{purge, purge_with_timeout, BusInspector, PURGE_LOCK_TIMEOUT};
pub use layout::{
    layout_fingerprint, PipeHeader, BUS_HEADER_SIZE, MAX_PIPES, MAX_TERMINALS, PIPE_HEADER_SIZE,
};
pub use snapshot::{BusSnapshot, PipeStats};

use crate::config::{BusConfig, DEFAULT_PIPE_CAPACITY};

/// Per-handle tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusOptions {
    /// Ring capacity of pipes this handle creates, rounded up to a power of
    /// two.
    pub pipe_capacity: usize,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
        }
    }
}

impl From<&BusConfig> for BusOptions {
    fn from(config: &BusConfig) -> Self {
        Self {
            pipe_capacity: config.pipe_capacity,
        }
    }
}
