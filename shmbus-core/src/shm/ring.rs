// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Lock-free, length-framed ring channel.
//!
//! One writer and one reader share a power-of-two byte buffer. Positions are
//! free-running 32-bit counters masked by `capacity - 1`; every message is a
//! native-endian `u32` length followed by the payload. No lock is taken on
//! the data path.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::SharedMemoryError;

/// Bytes of the per-message length prefix.
pub const LENGTH_PREFIX: usize = 4;

/// Smallest usable buffer.
pub const MIN_CAPACITY: usize = 16;

/// Largest buffer addressable with 32-bit free-running positions.
pub const MAX_CAPACITY: usize = 1 << 30;

/// Ring header stored in front of the buffer.
#[repr(C)]
struct RingHeader {
    /// Buffer size in bytes, a power of two. Fixed for the ring's lifetime.
    capacity: u32,
    /// Read position (owned by the consumer).
    read_pos: AtomicU32,
    /// Write position (owned by the producer).
    write_pos: AtomicU32,
    _reserved: u32,
}

/// Header size in bytes.
pub const RING_HEADER_SIZE: usize = std::mem::size_of::<RingHeader>();

/// Largest power of two not above `value` (0 for 0).
fn floor_pow2(value: usize) -> usize {
    if value == 0 {
        0
    } else {
        1 << (usize::BITS - 1 - value.leading_zeros())
    }
}

/// Bytes needed to hold a ring header plus `capacity` bytes of buffer.
pub const fn footprint(capacity: usize) -> usize {
    RING_HEADER_SIZE + capacity
}

/// A view over a ring header and its buffer.
///
/// The view is either backed by heap memory it owns ([`RingChannel::create`])
/// or by an external range, typically inside a shared segment
/// ([`RingChannel::format`], [`RingChannel::attach`]). Exactly one writer and
/// one reader may use a ring at a time.
pub struct RingChannel {
    header: NonNull<RingHeader>,
    data: NonNull<u8>,
    capacity: u32,
    mask: u32,
    /// Allocation to free on drop when the ring owns its memory.
    owned: Option<Layout>,
}

// SAFETY: the view only touches its memory through atomics and raw copies;
// moving it to another thread keeps the single-writer/single-reader contract.
unsafe impl Send for RingChannel {}

impl RingChannel {
    /// Create a heap-backed ring. `capacity` is rounded up to a power of two.
    pub fn create(capacity: usize) -> Result<Self, SharedMemoryError> {
        let capacity = capacity.max(MIN_CAPACITY).next_power_of_two();
        if capacity > MAX_CAPACITY {
            return Err(SharedMemoryError::InvalidBufferState {
                reason: format!("Capacity {} exceeds maximum {}", capacity, MAX_CAPACITY),
            });
        }

        let layout = Layout::from_size_align(footprint(capacity), std::mem::align_of::<u64>())
            .map_err(|e| SharedMemoryError::InvalidBufferState {
                reason: format!("Invalid layout: {}", e),
            })?;

        // SAFETY: layout has a non-zero size
        let mem = unsafe { alloc::alloc_zeroed(layout) };
        if mem.is_null() {
            alloc::handle_alloc_error(layout);
        }

        // SAFETY: mem is a fresh, aligned allocation of footprint(capacity) bytes
        let mut ring = unsafe { Self::format(mem, layout.size()) }?;
        ring.owned = Some(layout);
        Ok(ring)
    }

    /// Initialize a ring inside external memory and return a view over it.
    ///
    /// `size` covers header and buffer; the buffer part is rounded down to a
    /// power of two.
    ///
    /// # Safety
    /// `mem` must be valid for reads and writes of `size` bytes for the
    /// lifetime of the returned view, aligned to 4 bytes, and no other view
    /// may be in use while it is being formatted.
    pub unsafe fn format(mem: *mut u8, size: usize) -> Result<Self, SharedMemoryError> {
        let capacity = Self::usable_capacity(mem, size)?;

        std::ptr::write(
            mem as *mut RingHeader,
            RingHeader {
                capacity: capacity as u32,
                read_pos: AtomicU32::new(0),
                write_pos: AtomicU32::new(0),
                _reserved: 0,
            },
        );

        Ok(Self::view(mem, capacity))
    }

    /// Build a view over a ring previously initialized with
    /// [`RingChannel::format`], possibly by another process.
    ///
    /// # Safety
    /// `mem` must be valid for reads and writes of `size` bytes for the
    /// lifetime of the returned view and aligned to 4 bytes.
    pub unsafe fn attach(mem: *mut u8, size: usize) -> Result<Self, SharedMemoryError> {
        let capacity = Self::usable_capacity(mem, size)?;

        let header = &*(mem as *const RingHeader);
        if header.capacity as usize != capacity {
            return Err(SharedMemoryError::InvalidBufferState {
                reason: format!(
                    "Stored capacity {} does not match region capacity {}",
                    header.capacity, capacity
                ),
            });
        }

        let ring = Self::view(mem, capacity);
        if ring.read_available() > capacity {
            return Err(SharedMemoryError::InvalidBufferState {
                reason: "Read position is ahead of write position".to_string(),
            });
        }
        Ok(ring)
    }

    fn usable_capacity(mem: *mut u8, size: usize) -> Result<usize, SharedMemoryError> {
        if mem.is_null() || (mem as usize) % std::mem::align_of::<RingHeader>() != 0 {
            return Err(SharedMemoryError::InvalidBufferState {
                reason: "Ring memory is null or misaligned".to_string(),
            });
        }
        if size < footprint(MIN_CAPACITY) {
            return Err(SharedMemoryError::InvalidBufferState {
                reason: format!("Region too small: {} bytes", size),
            });
        }
        Ok(floor_pow2(size - RING_HEADER_SIZE).min(MAX_CAPACITY))
    }

    /// # Safety
    /// `mem` is non-null, aligned and covers `footprint(capacity)` bytes.
    unsafe fn view(mem: *mut u8, capacity: usize) -> Self {
        Self {
            header: NonNull::new_unchecked(mem as *mut RingHeader),
            data: NonNull::new_unchecked(mem.add(RING_HEADER_SIZE)),
            capacity: capacity as u32,
            mask: capacity as u32 - 1,
            owned: None,
        }
    }

    fn header(&self) -> &RingHeader {
        // SAFETY: the header was initialized before any view was built and
        // its plain fields are never written afterwards
        unsafe { self.header.as_ref() }
    }

    /// Buffer size in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Largest payload a single message may carry.
    pub fn max_message_len(&self) -> usize {
        self.capacity() - LENGTH_PREFIX
    }

    /// Bytes currently buffered, length prefixes included.
    pub fn read_available(&self) -> usize {
        let header = self.header();
        let write = header.write_pos.load(Ordering::Acquire);
        let read = header.read_pos.load(Ordering::Acquire);
        write.wrapping_sub(read) as usize
    }

    /// Largest payload that can be written right now.
    pub fn write_available(&self) -> usize {
        self.max_message_len().saturating_sub(self.read_available())
    }

    pub fn is_empty(&self) -> bool {
        self.read_available() == 0
    }

    /// Total bytes consumed so far (wrapping).
    pub fn read_position(&self) -> u32 {
        self.header().read_pos.load(Ordering::Acquire)
    }

    /// Total bytes produced so far (wrapping).
    pub fn write_position(&self) -> u32 {
        self.header().write_pos.load(Ordering::Acquire)
    }

    /// Append one message.
    ///
    /// Fails with [`SharedMemoryError::WouldOverflow`] when the payload does
    /// not fit the free space; payloads above `capacity - 4` never fit.
    pub fn write(&self, payload: &[u8]) -> Result<(), SharedMemoryError> {
        let header = self.header();
        let write = header.write_pos.load(Ordering::Relaxed);
        let read = header.read_pos.load(Ordering::Acquire);

        let used = write.wrapping_sub(read) as usize;
        let available = self.max_message_len().saturating_sub(used);
        if payload.len() > available {
            return Err(SharedMemoryError::WouldOverflow {
                size: payload.len(),
                available,
            });
        }

        let length = payload.len() as u32;
        self.write_at(write, &length.to_ne_bytes());
        self.write_at(write.wrapping_add(LENGTH_PREFIX as u32), payload);

        header
            .write_pos
            .store(write.wrapping_add(LENGTH_PREFIX as u32 + length), Ordering::Release);

        Ok(())
    }

    /// Copy the next message into `buf` without consuming it.
    pub fn peek(&self, buf: &mut [u8]) -> Result<usize, SharedMemoryError> {
        let (read, length) = self.front()?;
        if length > buf.len() {
            return Err(SharedMemoryError::TooLarge {
                size: length,
                capacity: buf.len(),
            });
        }
        self.read_at(read.wrapping_add(LENGTH_PREFIX as u32), &mut buf[..length]);
        Ok(length)
    }

    /// Copy the next message into `buf` and consume it.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, SharedMemoryError> {
        let length = self.peek(buf)?;
        self.advance(length);
        Ok(length)
    }

    /// Consume the next message into a freshly allocated vector.
    pub fn read_vec(&self) -> Result<Vec<u8>, SharedMemoryError> {
        let (read, length) = self.front()?;
        let mut payload = vec![0u8; length];
        self.read_at(read.wrapping_add(LENGTH_PREFIX as u32), &mut payload);
        self.advance(length);
        Ok(payload)
    }

    /// Payload length of the next message, if one is buffered.
    pub fn next_message_len(&self) -> Result<Option<usize>, SharedMemoryError> {
        match self.front() {
            Ok((_, length)) => Ok(Some(length)),
            Err(SharedMemoryError::Empty) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Locate the next complete message: its read position and payload length.
    fn front(&self) -> Result<(u32, usize), SharedMemoryError> {
        let header = self.header();
        let read = header.read_pos.load(Ordering::Relaxed);
        let write = header.write_pos.load(Ordering::Acquire);

        let buffered = write.wrapping_sub(read) as usize;
        if buffered < LENGTH_PREFIX {
            return Err(SharedMemoryError::Empty);
        }

        let mut prefix = [0u8; LENGTH_PREFIX];
        self.read_at(read, &mut prefix);
        let length = u32::from_ne_bytes(prefix) as usize;

        if length > self.max_message_len() || LENGTH_PREFIX + length > buffered {
            return Err(SharedMemoryError::InvalidBufferState {
                reason: format!(
                    "Corrupt length prefix {} ({} bytes buffered, capacity {})",
                    length,
                    buffered,
                    self.capacity()
                ),
            });
        }

        Ok((read, length))
    }

    fn advance(&self, length: usize) {
        let header = self.header();
        let read = header.read_pos.load(Ordering::Relaxed);
        header.read_pos.store(
            read.wrapping_add((LENGTH_PREFIX + length) as u32),
            Ordering::Release,
        );
    }

    /// Copy `src` into the buffer starting at free-running position `pos`,
    /// splitting at the physical end.
    fn write_at(&self, pos: u32, src: &[u8]) {
        debug_assert!(src.len() <= self.capacity());
        let start = (pos & self.mask) as usize;
        let first = src.len().min(self.capacity() - start);

        // SAFETY: start + first <= capacity and the tail copy starts at 0 with
        // src.len() - first <= start bytes; src is caller memory, never the ring
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.data.as_ptr().add(start), first);
            if first < src.len() {
                std::ptr::copy_nonoverlapping(
                    src.as_ptr().add(first),
                    self.data.as_ptr(),
                    src.len() - first,
                );
            }
        }
    }

    /// Copy `dst.len()` bytes out of the buffer starting at position `pos`,
    /// splitting at the physical end.
    fn read_at(&self, pos: u32, dst: &mut [u8]) {
        debug_assert!(dst.len() <= self.capacity());
        let start = (pos & self.mask) as usize;
        let first = dst.len().min(self.capacity() - start);

        // SAFETY: same bounds as write_at; dst is caller memory, never the ring
        unsafe {
            std::ptr::copy_nonoverlapping(self.data.as_ptr().add(start), dst.as_mut_ptr(), first);
            if first < dst.len() {
                std::ptr::copy_nonoverlapping(
                    self.data.as_ptr(),
                    dst.as_mut_ptr().add(first),
                    dst.len() - first,
                );
            }
        }
    }
}

impl Drop for RingChannel {
    fn drop(&mut self) {
        if let Some(layout) = self.owned {
            // SAFETY: the header pointer is the start of the allocation made
            // in create() with this layout
            unsafe { alloc::dealloc(self.header.as_ptr() as *mut u8, layout) };
        }
    }
}

impl std::fmt::Debug for RingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingChannel")
            .field("capacity", &self.capacity)
            .field("read_pos", &self.read_position())
            .field("write_pos", &self.write_position())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn test_capacity_rounded_up() {
        assert_eq!(RingChannel::create(1000).unwrap().capacity(), 1024);
        assert_eq!(RingChannel::create(1024).unwrap().capacity(), 1024);
        assert_eq!(RingChannel::create(1).unwrap().capacity(), MIN_CAPACITY);
        assert!(RingChannel::create(MAX_CAPACITY + 1).is_err());
    }

    #[test]
    fn test_floor_pow2() {
        assert_eq!(floor_pow2(0), 0);
        assert_eq!(floor_pow2(1), 1);
        assert_eq!(floor_pow2(4095), 2048);
        assert_eq!(floor_pow2(4096), 4096);
    }

    #[test]
    fn test_fill_to_capacity() {
        let ring = RingChannel::create(1024).unwrap();
        let message = payload(100, 7);

        for _ in 0..9 {
            ring.write(&message).unwrap();
        }
        assert_eq!(ring.read_available(), 9 * 104);
        assert!(matches!(
            ring.write(&message),
            Err(SharedMemoryError::WouldOverflow { size: 100, .. })
        ));

        let mut buf = [0u8; 128];
        assert_eq!(ring.read(&mut buf).unwrap(), 100);
        assert_eq!(&buf[..100], &message[..]);

        ring.write(&message).unwrap();
    }

    #[test]
    fn test_oversized_payload_always_rejected() {
        let ring = RingChannel::create(256).unwrap();
        let too_big = payload(ring.max_message_len() + 1, 0);
        assert!(ring.write(&too_big).is_err());

        // Exactly capacity - 4 fits into an empty ring.
        let max = payload(ring.max_message_len(), 1);
        ring.write(&max).unwrap();
        assert_eq!(ring.read_vec().unwrap(), max);
        assert!(ring.write(&too_big).is_err());
    }

    #[test]
    fn test_round_trip_across_wrap() {
        let ring = RingChannel::create(64).unwrap();

        // Sizes chosen so prefixes and payloads straddle the physical end
        // on different iterations.
        for round in 0..50u8 {
            let len = 5 + (round as usize * 7) % 40;
            let message = payload(len, round);
            ring.write(&message).unwrap();
            assert_eq!(ring.read_vec().unwrap(), message);
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn test_fifo_order() {
        let ring = RingChannel::create(256).unwrap();
        for i in 0..5u8 {
            ring.write(&[i; 10]).unwrap();
        }
        for i in 0..5u8 {
            assert_eq!(ring.read_vec().unwrap(), vec![i; 10]);
        }
        assert!(matches!(ring.read_vec(), Err(SharedMemoryError::Empty)));
    }

    #[test]
    fn test_peek_does_not_consume() {
        let ring = RingChannel::create(128).unwrap();
        ring.write(b"hello").unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(ring.peek(&mut buf).unwrap(), 5);
        assert_eq!(ring.peek(&mut buf).unwrap(), 5);
        assert_eq!(ring.next_message_len().unwrap(), Some(5));

        let mut small = [0u8; 3];
        assert!(matches!(
            ring.peek(&mut small),
            Err(SharedMemoryError::TooLarge { size: 5, capacity: 3 })
        ));

        assert_eq!(ring.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(ring.next_message_len().unwrap(), None);
    }

    #[test]
    fn test_empty_message() {
        let ring = RingChannel::create(32).unwrap();
        ring.write(&[]).unwrap();
        assert_eq!(ring.read_available(), LENGTH_PREFIX);
        assert_eq!(ring.read_vec().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_attach_sees_formatted_ring() {
        let mut backing = vec![0u64; footprint(512) / 8 + 3];
        let size = backing.len() * 8;
        let mem = backing.as_mut_ptr() as *mut u8;

        // SAFETY: backing outlives both views
        let writer = unsafe { RingChannel::format(mem, size) }.unwrap();
        let reader = unsafe { RingChannel::attach(mem, size) }.unwrap();
        assert_eq!(writer.capacity(), 512);
        assert_eq!(reader.capacity(), 512);

        writer.write(b"across views").unwrap();
        assert_eq!(reader.read_vec().unwrap(), b"across views");
        assert_eq!(writer.read_available(), 0);
    }

    #[test]
    fn test_attach_rejects_mismatch() {
        let mut backing = vec![0u64; footprint(256) / 8];
        let mem = backing.as_mut_ptr() as *mut u8;

        // SAFETY: backing outlives the views
        unsafe {
            RingChannel::format(mem, footprint(256)).unwrap();
            assert!(RingChannel::attach(mem, footprint(128)).is_err());
            assert!(RingChannel::attach(mem, RING_HEADER_SIZE).is_err());
        }
    }

    #[test]
    fn test_positions_wrap_u32() {
        let mut backing = vec![0u64; footprint(64) / 8];
        let mem = backing.as_mut_ptr() as *mut u8;
        let start = u32::MAX - 20;

        // SAFETY: backing is large enough and outlives the view
        let ring = unsafe {
            std::ptr::write(
                mem as *mut RingHeader,
                RingHeader {
                    capacity: 64,
                    read_pos: AtomicU32::new(start),
                    write_pos: AtomicU32::new(start),
                    _reserved: 0,
                },
            );
            RingChannel::attach(mem, footprint(64)).unwrap()
        };

        for round in 0..20u8 {
            let message = payload(13, round);
            ring.write(&message).unwrap();
            ring.write(&message).unwrap();
            assert_eq!(ring.read_vec().unwrap(), message);
            assert_eq!(ring.read_vec().unwrap(), message);
        }
        assert!(ring.write_position() < start);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_spsc_threads() {
        use std::sync::Arc;

        struct Shared(RingChannel);
        // SAFETY: one thread only writes, the other only reads
        unsafe impl Sync for Shared {}

        let ring = Arc::new(Shared(RingChannel::create(1024).unwrap()));
        let producer = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || {
                for i in 0..10_000u32 {
                    let bytes = i.to_le_bytes();
                    while ring.0.write(&bytes).is_err() {
                        std::thread::yield_now();
                    }
                }
            })
        };

        let mut expected = 0u32;
        let mut buf = [0u8; 4];
        while expected < 10_000 {
            match ring.0.read(&mut buf) {
                Ok(4) => {
                    assert_eq!(u32::from_le_bytes(buf), expected);
                    expected += 1;
                }
                Ok(n) => panic!("unexpected message length {}", n),
                Err(SharedMemoryError::Empty) => std::thread::yield_now(),
                Err(e) => panic!("read failed: {}", e),
            }
        }

        producer.join().unwrap();
    }
}
