//! Byte-exact records living at the start of shared segments.
//!
//! All raw-pointer access to the bus header is confined to [`SharedHeader`].
//! Reads of the version counters are lock-free; everything else requires a
//! [`ProcessMutexGuard`] as proof that the bus mutex is held.

use std::ptr::{addr_of, addr_of_mut, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{BusError, BusResult, SharedMemoryError};
use crate::shm::{ProcessMutexGuard, SharedSegment, RING_HEADER_SIZE};
use crate::types::{SegmentKey, TerminalAddress};

/// Roster capacity.
pub const MAX_TERMINALS: usize = 64;

/// Pipe table capacity.
pub const MAX_PIPES: usize = 1024;

/// `"SBUS"` in little-endian byte order.
const BUS_MAGIC: u32 = u32::from_le_bytes(*b"SBUS");

/// Header of one directed pipe. Stored in the bus pipe table and repeated at
/// offset 0 of the pipe's own segment.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeHeader {
    /// Segment key of the pipe.
    pub key: u32,
    /// Writer terminal.
    pub from: i32,
    /// Reader terminal.
    pub to: i32,
    /// Ring buffer capacity in bytes.
    pub size: u32,
}

pub const PIPE_HEADER_SIZE: usize = std::mem::size_of::<PipeHeader>();

impl PipeHeader {
    pub fn segment_key(&self) -> SegmentKey {
        SegmentKey::new(self.key)
    }

    /// Writer address. Panics on a negative id, which only a corrupted
    /// table can contain.
    pub fn sender(&self) -> TerminalAddress {
        checked_address(self.from)
    }

    /// Reader address.
    pub fn receiver(&self) -> TerminalAddress {
        checked_address(self.to)
    }
}

fn checked_address(raw: i32) -> TerminalAddress {
    match TerminalAddress::from_raw(raw) {
        Ok(addr) => addr,
        Err(_) => panic!("corrupted bus header: negative terminal id {}", raw),
    }
}

/// Shared bus header.
#[repr(C)]
struct BusHeader {
    magic: u32,
    /// CRC32 over the layout constants; differs for foreign builds.
    layout: u32,
    /// Segment key the header was created under.
    key: u32,
    /// `size_of::<BusHeader>()` of the creator.
    size: u32,
    terminal_version: AtomicU32,
    terminal_count: u32,
    terminals: [i32; MAX_TERMINALS],
    pipe_version: AtomicU32,
    pipe_count: u32,
    pipes: [PipeHeader; MAX_PIPES],
}

/// Bytes occupied by the bus header.
pub const BUS_HEADER_SIZE: usize = std::mem::size_of::<BusHeader>();

/// Fingerprint of the record layout, stored in every header.
pub fn layout_fingerprint() -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for value in [
        MAX_TERMINALS,
        MAX_PIPES,
        BUS_HEADER_SIZE,
        PIPE_HEADER_SIZE,
        RING_HEADER_SIZE,
    ] {
        hasher.update(&(value as u64).to_le_bytes());
    }
    hasher.finalize()
}

/// Process-local view of a [`BusHeader`] inside a mapped segment.
///
/// The view owns the segment, so the mapping lives exactly as long as the
/// pointer into it.
pub(crate) struct SharedHeader {
    ptr: NonNull<BusHeader>,
    segment: SharedSegment,
}

// SAFETY: counters are atomics and every other field is only touched while
// the bus mutex is held.
unsafe impl Send for SharedHeader {}

impl SharedHeader {
    /// Take over `segment` and view its start as a bus header.
    pub(crate) fn new(segment: SharedSegment) -> Result<Self, SharedMemoryError> {
        if segment.size() < BUS_HEADER_SIZE {
            return Err(SharedMemoryError::SizeMismatch {
                key: segment.key(),
                expected: BUS_HEADER_SIZE,
                actual: segment.size(),
            });
        }
        let ptr = NonNull::new(segment.as_ptr() as *mut BusHeader).ok_or_else(|| {
            SharedMemoryError::MapFailed {
                key: segment.key(),
                reason: "null mapping".to_string(),
            }
        })?;
        Ok(Self { ptr, segment })
    }

    /// The mapped header segment.
    pub(crate) fn segment(&self) -> &SharedSegment {
        &self.segment
    }

    fn raw(&self) -> *mut BusHeader {
        self.ptr.as_ptr()
    }

    /// Initialize a freshly created header with `creator` as the only
    /// terminal and both versions at 1.
    pub(crate) fn format(
        &self,
        _guard: &ProcessMutexGuard<'_>,
        key: SegmentKey,
        creator: TerminalAddress,
    ) {
        let header = self.raw();
        // SAFETY: the segment is at least BUS_HEADER_SIZE bytes, zeroed, and
        // the lock is held
        unsafe {
            addr_of_mut!((*header).magic).write(BUS_MAGIC);
            addr_of_mut!((*header).layout).write(layout_fingerprint());
            addr_of_mut!((*header).key).write(key.value());
            addr_of_mut!((*header).size).write(BUS_HEADER_SIZE as u32);
            addr_of_mut!((*header).terminal_count).write(1);
            addr_of_mut!((*header).terminals)
                .cast::<i32>()
                .write(creator.raw());
            addr_of_mut!((*header).pipe_count).write(0);
            (*header).pipe_version.store(1, Ordering::Release);
            (*header).terminal_version.store(1, Ordering::Release);
        }
    }

    /// Check that the header was created for `key` with this layout.
    pub(crate) fn validate(
        &self,
        _guard: &ProcessMutexGuard<'_>,
        key: SegmentKey,
    ) -> Result<(), SharedMemoryError> {
        let header = self.raw();
        // SAFETY: plain reads of initialized fields under the lock
        let (magic, layout, stored_key, size) = unsafe {
            (
                addr_of!((*header).magic).read(),
                addr_of!((*header).layout).read(),
                addr_of!((*header).key).read(),
                addr_of!((*header).size).read(),
            )
        };

        if magic != BUS_MAGIC || layout != layout_fingerprint() || size as usize != BUS_HEADER_SIZE
        {
            return Err(SharedMemoryError::SizeMismatch {
                key,
                expected: BUS_HEADER_SIZE,
                actual: size as usize,
            });
        }
        if stored_key != key.value() {
            return Err(SharedMemoryError::InvalidBufferState {
                reason: format!(
                    "Bus header key {:#010x} does not match segment {}",
                    stored_key, key
                ),
            });
        }
        Ok(())
    }

    /// Current roster version. Lock-free and possibly stale.
    pub(crate) fn terminal_version(&self) -> u32 {
        // SAFETY: the counter is an atomic inside the mapping
        unsafe { (*self.raw()).terminal_version.load(Ordering::Acquire) }
    }

    /// Current pipe table version. Lock-free and possibly stale.
    pub(crate) fn pipe_version(&self) -> u32 {
        // SAFETY: the counter is an atomic inside the mapping
        unsafe { (*self.raw()).pipe_version.load(Ordering::Acquire) }
    }

    /// Copy of the roster.
    ///
    /// Panics if the shared roster is corrupted (count out of range or
    /// duplicate ids); such a segment is foreign, not recoverable.
    pub(crate) fn terminals(&self, _guard: &ProcessMutexGuard<'_>) -> Vec<TerminalAddress> {
        let header = self.raw();
        // SAFETY: reads under the lock; count is bounds-checked before use
        let raw: Vec<i32> = unsafe {
            let count = addr_of!((*header).terminal_count).read() as usize;
            assert!(
                count <= MAX_TERMINALS,
                "corrupted bus header: terminal_count {} exceeds {}",
                count,
                MAX_TERMINALS
            );
            let base = addr_of!((*header).terminals).cast::<i32>();
            (0..count).map(|i| base.add(i).read()).collect()
        };

        let roster: Vec<TerminalAddress> = raw.into_iter().map(checked_address).collect();
        for (i, addr) in roster.iter().enumerate() {
            assert!(
                !roster[..i].contains(addr),
                "corrupted bus header: terminal {} listed twice",
                addr
            );
        }
        roster
    }

    /// Append `addr` to the roster and bump the roster version.
    ///
    /// Returns `Ok(false)` if it was already present.
    pub(crate) fn add_terminal(
        &self,
        guard: &ProcessMutexGuard<'_>,
        addr: TerminalAddress,
    ) -> BusResult<bool> {
        let roster = self.terminals(guard);
        if roster.contains(&addr) {
            return Ok(false);
        }
        if roster.len() >= MAX_TERMINALS {
            return Err(BusError::TerminalTableFull { max: MAX_TERMINALS });
        }

        let header = self.raw();
        // SAFETY: index < MAX_TERMINALS; lock held
        unsafe {
            addr_of_mut!((*header).terminals)
                .cast::<i32>()
                .add(roster.len())
                .write(addr.raw());
            addr_of_mut!((*header).terminal_count).write(roster.len() as u32 + 1);
            (*header).terminal_version.fetch_add(1, Ordering::AcqRel);
        }
        Ok(true)
    }

    pub(crate) fn pipe_count(&self, _guard: &ProcessMutexGuard<'_>) -> usize {
        // SAFETY: read under the lock
        let count = unsafe { addr_of!((*self.raw()).pipe_count).read() } as usize;
        assert!(
            count <= MAX_PIPES,
            "corrupted bus header: pipe_count {} exceeds {}",
            count,
            MAX_PIPES
        );
        count
    }

    /// Copy of the pipe table.
    pub(crate) fn pipes(&self, guard: &ProcessMutexGuard<'_>) -> Vec<PipeHeader> {
        let count = self.pipe_count(guard);
        // SAFETY: count <= MAX_PIPES; reads under the lock
        unsafe {
            let base = addr_of!((*self.raw()).pipes).cast::<PipeHeader>();
            (0..count).map(|i| base.add(i).read()).collect()
        }
    }

    /// Append `pipe` and bump the pipe version. Returns the new version.
    ///
    /// The caller checked `pipe_count < MAX_PIPES` under the same guard.
    pub(crate) fn add_pipe(&self, guard: &ProcessMutexGuard<'_>, pipe: PipeHeader) -> u32 {
        let count = self.pipe_count(guard);
        assert!(count < MAX_PIPES, "pipe table overflow");

        let header = self.raw();
        // SAFETY: count < MAX_PIPES; lock held
        unsafe {
            addr_of_mut!((*header).pipes)
                .cast::<PipeHeader>()
                .add(count)
                .write(pipe);
            addr_of_mut!((*header).pipe_count).write(count as u32 + 1);
            (*header).pipe_version.fetch_add(1, Ordering::AcqRel) + 1
        }
    }
}
