//! One directed pipe: a shared segment holding a copy of its
//! [`PipeHeader`] followed by a ring channel.
//!
//! Segment layout: `[PipeHeader][RingHeader][buffer; capacity]`.

use crate::bus::layout::{PipeHeader, PIPE_HEADER_SIZE};
use crate::error::SharedMemoryError;
use crate::shm::{footprint, RingChannel, SharedSegment, MAX_CAPACITY, MIN_CAPACITY};
use crate::types::{SegmentKey, TerminalAddress};

pub(crate) struct Pipe {
    header: PipeHeader,
    ring: RingChannel,
    /// Keeps the mapping behind `ring` alive.
    segment: SharedSegment,
}

impl Pipe {
    /// Create the segment for a new pipe and format its ring.
    ///
    /// The key was allocated under the bus lock, so a segment already
    /// present under it is a leftover from a destroyed bus and is replaced.
    pub(crate) fn create(
        key: SegmentKey,
        from: TerminalAddress,
        to: TerminalAddress,
        capacity: usize,
    ) -> Result<Self, SharedMemoryError> {
        let capacity = capacity.max(MIN_CAPACITY).next_power_of_two();
        if capacity > MAX_CAPACITY {
            return Err(SharedMemoryError::InvalidBufferState {
                reason: format!("Pipe capacity {} exceeds maximum {}", capacity, MAX_CAPACITY),
            });
        }
        let size = PIPE_HEADER_SIZE + footprint(capacity);

        let segment = match SharedSegment::create_or_attach(key, size, true) {
            Ok(segment) => segment,
            Err(SharedMemoryError::AlreadyExists { .. }) => {
                tracing::warn!(key = %key, "Replacing stale pipe segment");
                SharedSegment::unlink(key)?;
                SharedSegment::create_or_attach(key, size, true)?
            }
            Err(e) => return Err(e),
        };

        let header = PipeHeader {
            key: key.value(),
            from: from.raw(),
            to: to.raw(),
            size: capacity as u32,
        };

        // SAFETY: the fresh segment spans at least `size` bytes and is
        // page aligned; nobody else knows the key until it is published
        let ring = unsafe {
            (segment.as_ptr() as *mut PipeHeader).write(header);
            RingChannel::format(segment.as_ptr().add(PIPE_HEADER_SIZE), footprint(capacity))
        };

        let ring = match ring {
            Ok(ring) => ring,
            Err(e) => {
                segment.destroy()?;
                return Err(e);
            }
        };

        Ok(Self {
            header,
            ring,
            segment,
        })
    }

    /// Attach to a pipe published in the bus pipe table.
    pub(crate) fn attach(header: PipeHeader) -> Result<Self, SharedMemoryError> {
        let key = header.segment_key();
        let segment = SharedSegment::open(key)?;

        let capacity = header.size as usize;
        let needed = PIPE_HEADER_SIZE + footprint(capacity);
        if !capacity.is_power_of_two() || segment.size() < needed {
            return Err(SharedMemoryError::SizeMismatch {
                key,
                expected: needed,
                actual: segment.size(),
            });
        }

        // SAFETY: the segment spans at least `needed` bytes
        let stored = unsafe { (segment.as_ptr() as *const PipeHeader).read() };
        if stored != header {
            return Err(SharedMemoryError::InvalidBufferState {
                reason: format!(
                    "Pipe segment {} holds {:?}, table lists {:?}",
                    key, stored, header
                ),
            });
        }

        // SAFETY: bounds checked above; the mapping lives as long as `segment`
        let ring = unsafe {
            RingChannel::attach(segment.as_ptr().add(PIPE_HEADER_SIZE), footprint(capacity))
        }?;

        Ok(Self {
            header,
            ring,
            segment,
        })
    }

    pub(crate) fn header(&self) -> &PipeHeader {
        &self.header
    }

    pub(crate) fn ring(&self) -> &RingChannel {
        &self.ring
    }

    pub(crate) fn sender(&self) -> TerminalAddress {
        self.header.sender()
    }

    pub(crate) fn receiver(&self) -> TerminalAddress {
        self.header.receiver()
    }

    pub(crate) fn key(&self) -> SegmentKey {
        self.segment.key()
    }
}
