//! Point-in-time view of a bus for diagnostics.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bus::pipe::Pipe;
use crate::types::{BusKey, SegmentKey, TerminalAddress};

/// Counters of one pipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeStats {
    pub key: SegmentKey,
    pub from: TerminalAddress,
    pub to: TerminalAddress,
    pub capacity: usize,
    /// Total bytes consumed, modulo 2^32.
    pub read_bytes: u32,
    /// Total bytes produced, modulo 2^32.
    pub write_bytes: u32,
    /// Framed bytes waiting to be read.
    pub pending_bytes: usize,
}

impl PipeStats {
    pub(crate) fn of(pipe: &Pipe) -> Self {
        let ring = pipe.ring();
        Self {
            key: pipe.key(),
            from: pipe.sender(),
            to: pipe.receiver(),
            capacity: ring.capacity(),
            read_bytes: ring.read_position(),
            write_bytes: ring.write_position(),
            pending_bytes: ring.read_available(),
        }
    }

    /// Fill level in `0.0..=1.0`.
    pub fn fill_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.pending_bytes as f64 / self.capacity as f64
    }
}

/// Roster and pipe counters as seen by one observer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusSnapshot {
    pub key: BusKey,
    /// Terminal that took the snapshot; `None` for an inspector.
    pub observer: Option<TerminalAddress>,
    pub terminal_version: u32,
    pub pipe_version: u32,
    pub terminals: Vec<TerminalAddress>,
    pub pipes: Vec<PipeStats>,
}

impl fmt::Display for BusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bus {} (terminal version {}, pipe version {})",
            self.key, self.terminal_version, self.pipe_version
        )?;
        if let Some(observer) = self.observer {
            write!(f, " viewed by {}", observer)?;
        }
        writeln!(f)?;

        writeln!(f, "terminals ({}):", self.terminals.len())?;
        for terminal in &self.terminals {
            let marker = if Some(*terminal) == self.observer { " *" } else { "" };
            writeln!(f, "  {}{}", terminal, marker)?;
        }

        writeln!(f, "pipes ({}):", self.pipes.len())?;
        if !self.pipes.is_empty() {
            writeln!(
                f,
                "  {:<12} {:<12} {:>10} {:>12} {:>12} {:>10}",
                "FROM", "TO", "CAPACITY", "READ", "WRITE", "PENDING"
            )?;
        }
        for pipe in &self.pipes {
            writeln!(
                f,
                "  {:<12} {:<12} {:>10} {:>12} {:>12} {:>10}",
                pipe.from.to_string(),
                pipe.to.to_string(),
                pipe.capacity,
                pipe.read_bytes,
                pipe.write_bytes,
                pipe.pending_bytes
            )?;
        }
        Ok(())
    }
}
