//! SharedSegment - POSIX shared memory segment addressed by an integer key.
//!
//! Wraps `shm_open` + `mmap`. Creation is exclusive so exactly one process
//! initializes a segment; every other process attaches and validates size.
//! Unmapping (drop) and removal (`destroy`) are separate: a process detaches
//! its own mapping, while exactly one process removes the named object.

use std::ffi::CString;
use std::ptr::NonNull;

use nix::errno::Errno;

use crate::error::SharedMemoryError;
use crate::types::SegmentKey;

/// Fallback when `sysconf` cannot report the page size.
const DEFAULT_PAGE_SIZE: usize = 4096;

/// System page size in bytes.
pub fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        DEFAULT_PAGE_SIZE
    }
}

/// Round `size` up to a whole number of pages.
pub fn round_to_page(size: usize) -> usize {
    let page = page_size();
    size.div_ceil(page) * page
}

/// A mapped shared memory segment.
///
/// The mapping is released on drop. The named object stays in the system
/// until [`SharedSegment::destroy`] (or [`SharedSegment::unlink`]) runs.
pub struct SharedSegment {
    /// Integer key naming the segment.
    key: SegmentKey,
    /// Process-local address of the mapping.
    ptr: NonNull<u8>,
    /// Mapped size in bytes (page aligned).
    size: usize,
    /// File descriptor of the shared memory object.
    fd: i32,
    /// Whether this handle created (and zeroed) the segment.
    created: bool,
}

// SAFETY: SharedSegment owns its mapping; the pointer stays valid until drop.
unsafe impl Send for SharedSegment {}

// SAFETY: SharedSegment never hands out references itself. Concurrent access
// to the mapped bytes is synchronized by its users (ProcessMutex or the
// ring's atomics).
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Create a segment, or attach to an existing one.
    ///
    /// `size` is rounded up to the page size. With `exclusive` set, an
    /// existing segment is reported as [`SharedMemoryError::AlreadyExists`];
    /// otherwise the existing segment is attached and its size must match.
    pub fn create_or_attach(
        key: SegmentKey,
        size: usize,
        exclusive: bool,
    ) -> Result<Self, SharedMemoryError> {
        if size == 0 {
            return Err(SharedMemoryError::CreateFailed {
                key,
                reason: "Size cannot be zero".to_string(),
            });
        }

        let size = round_to_page(size);
        let c_name = Self::c_name(key)?;

        // SAFETY: c_name is a valid CString, flags are valid POSIX flags
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600,
            )
        };

        if fd < 0 {
            let errno = Errno::last();
            if errno == Errno::EEXIST {
                if exclusive {
                    return Err(SharedMemoryError::AlreadyExists { key });
                }
                return Self::attach(key, Some(size));
            }
            return Err(SharedMemoryError::CreateFailed {
                key,
                reason: format!("shm_open failed: {}", errno),
            });
        }

        // SAFETY: fd is a valid file descriptor
        let result = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if result < 0 {
            let errno = Errno::last();
            // SAFETY: fd is valid and c_name names the object we just created
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(SharedMemoryError::CreateFailed {
                key,
                reason: format!("ftruncate failed: {}", errno),
            });
        }

        let ptr = match Self::map(key, fd, size) {
            Ok(ptr) => ptr,
            Err(e) => {
                // SAFETY: fd is valid and c_name names the object we just created
                unsafe {
                    libc::close(fd);
                    libc::shm_unlink(c_name.as_ptr());
                }
                return Err(e);
            }
        };

        // SAFETY: ptr is a fresh mapping of exactly `size` bytes
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0, size);
        }

        tracing::debug!(key = %key, size = size, "Created shared memory segment");

        Ok(Self {
            key,
            ptr,
            size,
            fd,
            created: true,
        })
    }

    /// Attach to an existing segment, taking its size from the object.
    pub fn open(key: SegmentKey) -> Result<Self, SharedMemoryError> {
        Self::attach(key, None)
    }

    fn attach(key: SegmentKey, expected: Option<usize>) -> Result<Self, SharedMemoryError> {
        let c_name = Self::c_name(key)?;

        // SAFETY: c_name is a valid CString
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            let errno = Errno::last();
            if errno == Errno::ENOENT {
                return Err(SharedMemoryError::NotFound { key });
            }
            return Err(SharedMemoryError::CreateFailed {
                key,
                reason: format!("shm_open failed: {}", errno),
            });
        }

        let actual = match Self::object_size(fd) {
            Ok(actual) => actual,
            Err(errno) => {
                // SAFETY: fd is valid
                unsafe { libc::close(fd) };
                return Err(SharedMemoryError::MapFailed {
                    key,
                    reason: format!("fstat failed: {}", errno),
                });
            }
        };

        let size_ok = match expected {
            Some(expected) => actual == expected,
            None => actual > 0,
        };
        if !size_ok {
            // SAFETY: fd is valid
            unsafe { libc::close(fd) };
            return Err(SharedMemoryError::SizeMismatch {
                key,
                expected: expected.unwrap_or(0),
                actual,
            });
        }

        let ptr = match Self::map(key, fd, actual) {
            Ok(ptr) => ptr,
            Err(e) => {
                // SAFETY: fd is valid
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };

        tracing::debug!(key = %key, size = actual, "Attached shared memory segment");

        Ok(Self {
            key,
            ptr,
            size: actual,
            fd,
            created: false,
        })
    }

    fn map(key: SegmentKey, fd: i32, size: usize) -> Result<NonNull<u8>, SharedMemoryError> {
        // SAFETY: fd is valid and the object is at least `size` bytes long
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(SharedMemoryError::MapFailed {
                key,
                reason: format!("mmap failed: {}", Errno::last()),
            });
        }

        NonNull::new(ptr as *mut u8).ok_or_else(|| SharedMemoryError::MapFailed {
            key,
            reason: "mmap returned a null mapping".to_string(),
        })
    }

    fn object_size(fd: i32) -> Result<usize, Errno> {
        let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
        // SAFETY: fd is valid and stat points to writable storage
        let result = unsafe { libc::fstat(fd, stat.as_mut_ptr()) };
        if result < 0 {
            return Err(Errno::last());
        }
        // SAFETY: fstat succeeded and filled the struct
        let stat = unsafe { stat.assume_init() };
        Ok(stat.st_size as usize)
    }

    fn c_name(key: SegmentKey) -> Result<CString, SharedMemoryError> {
        CString::new(key.shm_name()).map_err(|e| SharedMemoryError::CreateFailed {
            key,
            reason: format!("Invalid name: {}", e),
        })
    }

    /// Remove the named segment. Returns `false` if it did not exist.
    ///
    /// Processes that still map the segment keep their mapping; the memory
    /// is reclaimed once the last of them detaches.
    pub fn unlink(key: SegmentKey) -> Result<bool, SharedMemoryError> {
        let c_name = Self::c_name(key)?;
        // SAFETY: c_name is a valid CString
        let result = unsafe { libc::shm_unlink(c_name.as_ptr()) };
        if result < 0 {
            let errno = Errno::last();
            if errno == Errno::ENOENT {
                return Ok(false);
            }
            return Err(SharedMemoryError::CreateFailed {
                key,
                reason: format!("shm_unlink failed: {}", errno),
            });
        }
        tracing::debug!(key = %key, "Unlinked shared memory segment");
        Ok(true)
    }

    /// Mark this segment for removal. Idempotent.
    pub fn destroy(&self) -> Result<(), SharedMemoryError> {
        Self::unlink(self.key).map(|_| ())
    }

    /// Detach this process's mapping without removing the segment.
    pub fn release(self) {
        drop(self);
    }

    pub fn key(&self) -> SegmentKey {
        self.key
    }

    /// Mapped size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether this handle created the segment rather than attaching to it.
    pub fn is_creator(&self) -> bool {
        self.created
    }

    /// Process-local base address of the mapping.
    ///
    /// Different processes see different addresses for the same segment;
    /// only offsets may be stored inside shared memory.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        // SAFETY: ptr and size describe the mapping created in create/attach
        let result = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size) };
        if result < 0 {
            tracing::error!(
                key = %self.key,
                error = %Errno::last(),
                "Failed to unmap shared memory segment"
            );
        }

        // SAFETY: fd was opened in create/attach
        unsafe { libc::close(self.fd) };
    }
}
