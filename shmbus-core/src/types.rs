// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Newtype wrappers for validated inputs.
//!
//! Bus keys, segment keys and terminal addresses are plain integers on the
//! wire. Wrapping them keeps derived-key arithmetic and address packing in one
//! place.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::HardValidationError;

/// Bits reserved below the bus key for derived pipe keys.
const PIPE_KEY_BITS: u32 = 16;

/// Bit position of the role class inside a terminal address.
const KIND_SHIFT: u32 = 16;

/// Mask selecting the instance id of a terminal address.
const INSTANCE_MASK: i32 = 0xFFFF;

/// Largest role class that keeps addresses non-negative.
pub const MAX_TERMINAL_KIND: u16 = 0x7FFF;

/// Integer key naming one shared memory segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentKey(u32);

impl SegmentKey {
    pub const fn new(key: u32) -> Self {
        Self(key)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    /// Name of the POSIX shared memory object backing this key.
    pub fn shm_name(&self) -> String {
        format!("/shmbus.{:08x}", self.0)
    }

    /// Name of the POSIX named semaphore guarding this key.
    pub fn semaphore_name(&self) -> String {
        format!("/shmbus.{:08x}.lock", self.0)
    }
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// 16-bit key identifying a bus.
///
/// The header segment lives at `key << 16`; pipe `n` lives at
/// `(key << 16) | (n + 1)`, so every pipe of a bus shares its high bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusKey(u16);

impl BusKey {
    pub const fn new(key: u16) -> Self {
        Self(key)
    }

    pub fn value(&self) -> u16 {
        self.0
    }

    /// Segment key of the shared bus header.
    pub fn header_key(&self) -> SegmentKey {
        SegmentKey((self.0 as u32) << PIPE_KEY_BITS)
    }

    /// Segment key of the pipe occupying roster slot `index`.
    pub fn pipe_key(&self, index: usize) -> SegmentKey {
        debug_assert!(index + 1 < (1usize << PIPE_KEY_BITS));
        SegmentKey(self.header_key().0 | (index as u32 + 1))
    }
}

impl fmt::Display for BusKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

impl FromStr for BusKey {
    type Err = HardValidationError;

    /// Accepts decimal or `0x`-prefixed hexadecimal.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u16::from_str_radix(hex, 16),
            None => s.parse::<u16>(),
        };
        parsed
            .map(Self)
            .map_err(|e| HardValidationError::InvalidFieldValue {
                field: "bus_key",
                value: s.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Address of a bus participant.
///
/// The high half is the role class ("kind"), the low 16 bits the instance
/// id. Addresses are never negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub struct TerminalAddress(i32);

impl TerminalAddress {
    /// Pack a role class and instance id into an address.
    pub fn new(kind: u16, instance: u16) -> Result<Self, HardValidationError> {
        if kind > MAX_TERMINAL_KIND {
            return Err(HardValidationError::InvalidAddress {
                value: format!("{}:{}", kind, instance),
                reason: format!("Kind must not exceed {}", MAX_TERMINAL_KIND),
            });
        }
        Ok(Self(((kind as i32) << KIND_SHIFT) | instance as i32))
    }

    /// Wrap a raw address value.
    pub fn from_raw(raw: i32) -> Result<Self, HardValidationError> {
        if raw < 0 {
            return Err(HardValidationError::InvalidAddress {
                value: raw.to_string(),
                reason: "Terminal addresses cannot be negative".to_string(),
            });
        }
        Ok(Self(raw))
    }

    pub fn raw(&self) -> i32 {
        self.0
    }

    /// Role class of this terminal.
    pub fn kind(&self) -> u16 {
        (self.0 >> KIND_SHIFT) as u16
    }

    /// Instance id within the role class.
    pub fn instance(&self) -> u16 {
        (self.0 & INSTANCE_MASK) as u16
    }

    /// Non-negative table key used by the peer caches.
    pub(crate) fn slot_key(&self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for TerminalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.instance())
    }
}

impl FromStr for TerminalAddress {
    type Err = HardValidationError;

    /// Accepts `kind:instance` or a raw non-negative integer.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| HardValidationError::InvalidAddress {
            value: s.to_string(),
            reason,
        };

        match s.split_once(':') {
            Some((kind, instance)) => {
                let kind = kind.trim().parse::<u16>().map_err(|e| invalid(e.to_string()))?;
                let instance = instance
                    .trim()
                    .parse::<u16>()
                    .map_err(|e| invalid(e.to_string()))?;
                Self::new(kind, instance)
            }
            None => {
                let raw = s.trim().parse::<i32>().map_err(|e| invalid(e.to_string()))?;
                Self::from_raw(raw)
            }
        }
    }
}

impl TryFrom<i32> for TerminalAddress {
    type Error = HardValidationError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Self::from_raw(value)
    }
}

impl From<TerminalAddress> for i32 {
    fn from(addr: TerminalAddress) -> Self {
        addr.0
    }
}
