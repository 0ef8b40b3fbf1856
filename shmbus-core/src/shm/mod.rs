// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Shared memory primitives.
//!
//! Named POSIX segments, a semaphore-backed process mutex, and the lock-free
//! ring channel that carries payloads between exactly two processes.

mod mutex;
mod ring;
mod segment;

pub use mutex::{ProcessMutex, ProcessMutexGuard};
pub use ring::{
    footprint, RingChannel, LENGTH_PREFIX, MAX_CAPACITY, MIN_CAPACITY, RING_HEADER_SIZE,
};
pub use segment::{page_size, round_to_page, SharedSegment};
