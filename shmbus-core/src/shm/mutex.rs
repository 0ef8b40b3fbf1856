//! ProcessMutex - cross-process binary lock backed by a POSIX named semaphore.
//!
//! Creation is race-free: the first creator initializes the semaphore to the
//! unlocked state with `O_EXCL`; a late creator that hits `EEXIST` re-opens
//! the existing object and never re-initializes it.

use std::ffi::CString;
use std::ptr::NonNull;
use std::time::{Duration, Instant};

use nix::errno::Errno;

use crate::error::SharedMemoryError;
use crate::types::SegmentKey;

/// Pause between attempts in [`ProcessMutex::lock_timeout`].
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// A named semaphore used as a mutex between processes.
pub struct ProcessMutex {
    /// Key the semaphore is derived from.
    key: SegmentKey,
    /// Semaphore name (`/shmbus.<key>.lock`).
    name: String,
    /// Process-local semaphore handle returned by `sem_open`.
    sem: NonNull<libc::sem_t>,
}

// SAFETY: POSIX semaphores may be used from any thread.
unsafe impl Send for ProcessMutex {}

// SAFETY: sem_wait/sem_post are thread-safe on a shared handle.
unsafe impl Sync for ProcessMutex {}

impl ProcessMutex {
    /// Create the semaphore for `key`, or open it if another process won the
    /// creation race.
    pub fn create_or_open(key: SegmentKey) -> Result<Self, SharedMemoryError> {
        let name = key.semaphore_name();
        let c_name = Self::c_name(&name)?;

        // SAFETY: c_name is a valid CString; mode and initial value are passed
        // as promoted variadic arguments
        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                1 as libc::c_uint,
            )
        };

        if Self::failed(sem) {
            let errno = Errno::last();
            if errno != Errno::EEXIST {
                return Err(Self::error(&name, "sem_open", errno));
            }
            return Self::open(key);
        }

        tracing::debug!(name = %name, "Created process mutex");
        Self::from_handle(key, name, sem)
    }

    /// Open the existing semaphore for `key` without creating it.
    ///
    /// Fails with `NotFound` if no process has created it.
    pub fn open(key: SegmentKey) -> Result<Self, SharedMemoryError> {
        let name = key.semaphore_name();
        let c_name = Self::c_name(&name)?;

        // SAFETY: c_name is a valid CString; no O_CREAT so no extra args
        let sem = unsafe { libc::sem_open(c_name.as_ptr(), 0) };
        if Self::failed(sem) {
            return match Errno::last() {
                Errno::ENOENT => Err(SharedMemoryError::NotFound { key }),
                errno => Err(Self::error(&name, "sem_open", errno)),
            };
        }

        tracing::debug!(name = %name, "Opened existing process mutex");
        Self::from_handle(key, name, sem)
    }

    fn from_handle(
        key: SegmentKey,
        name: String,
        sem: *mut libc::sem_t,
    ) -> Result<Self, SharedMemoryError> {
        let sem = NonNull::new(sem).ok_or_else(|| SharedMemoryError::Semaphore {
            name: name.clone(),
            operation: "sem_open",
            reason: "null semaphore handle".to_string(),
        })?;
        Ok(Self { key, name, sem })
    }

    fn c_name(name: &str) -> Result<CString, SharedMemoryError> {
        CString::new(name).map_err(|e| SharedMemoryError::Semaphore {
            name: name.to_string(),
            operation: "sem_open",
            reason: format!("Invalid name: {}", e),
        })
    }

    fn failed(sem: *mut libc::sem_t) -> bool {
        sem.is_null() || sem == libc::SEM_FAILED
    }

    fn error(name: &str, operation: &'static str, errno: Errno) -> SharedMemoryError {
        SharedMemoryError::Semaphore {
            name: name.to_string(),
            operation,
            reason: errno.to_string(),
        }
    }

    /// Block until the lock is acquired.
    pub fn lock(&self) -> Result<ProcessMutexGuard<'_>, SharedMemoryError> {
        loop {
            // SAFETY: sem is a live handle from sem_open
            if unsafe { libc::sem_wait(self.sem.as_ptr()) } == 0 {
                return Ok(ProcessMutexGuard { mutex: self });
            }
            let errno = Errno::last();
            if errno != Errno::EINTR {
                return Err(Self::error(&self.name, "sem_wait", errno));
            }
        }
    }

    /// Acquire the lock without blocking. `None` means it is busy.
    pub fn try_lock(&self) -> Result<Option<ProcessMutexGuard<'_>>, SharedMemoryError> {
        loop {
            // SAFETY: sem is a live handle from sem_open
            if unsafe { libc::sem_trywait(self.sem.as_ptr()) } == 0 {
                return Ok(Some(ProcessMutexGuard { mutex: self }));
            }
            match Errno::last() {
                Errno::EAGAIN => return Ok(None),
                Errno::EINTR => continue,
                errno => return Err(Self::error(&self.name, "sem_trywait", errno)),
            }
        }
    }

    /// Acquire the lock, giving up after `timeout`. `None` means it stayed
    /// busy.
    ///
    /// A holder that exits without unlocking never posts the semaphore
    /// again, so callers that must make progress regardless use this.
    pub fn lock_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<ProcessMutexGuard<'_>>, SharedMemoryError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(guard) = self.try_lock()? {
                return Ok(Some(guard));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(LOCK_RETRY_INTERVAL);
        }
    }

    fn post(&self) {
        // SAFETY: sem is a live handle from sem_open
        if unsafe { libc::sem_post(self.sem.as_ptr()) } != 0 {
            tracing::error!(name = %self.name, error = %Errno::last(), "Failed to unlock process mutex");
        }
    }

    /// Remove the named semaphore for `key`. Returns `false` if absent.
    ///
    /// Must be called by exactly one process; handles still open elsewhere
    /// keep working until closed, but new opens create a fresh semaphore.
    pub fn unlink(key: SegmentKey) -> Result<bool, SharedMemoryError> {
        let name = key.semaphore_name();
        let c_name = CString::new(name.as_str()).map_err(|e| SharedMemoryError::Semaphore {
            name: name.clone(),
            operation: "sem_unlink",
            reason: format!("Invalid name: {}", e),
        })?;

        // SAFETY: c_name is a valid CString
        if unsafe { libc::sem_unlink(c_name.as_ptr()) } != 0 {
            let errno = Errno::last();
            if errno == Errno::ENOENT {
                return Ok(false);
            }
            return Err(Self::error(&name, "sem_unlink", errno));
        }
        tracing::debug!(name = %name, "Unlinked process mutex");
        Ok(true)
    }

    /// Remove this semaphore from the system and close the handle.
    pub fn destroy(self) -> Result<(), SharedMemoryError> {
        let key = self.key;
        drop(self);
        Self::unlink(key).map(|_| ())
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ProcessMutex {
    fn drop(&mut self) {
        // SAFETY: sem came from sem_open and is closed exactly once
        unsafe { libc::sem_close(self.sem.as_ptr()) };
    }
}

/// Proof that the bus mutex is held. Unlocks on drop.
///
/// Shared-header mutators take `&ProcessMutexGuard` so they can only be
/// called with the lock held.
pub struct ProcessMutexGuard<'a> {
    mutex: &'a ProcessMutex,
}

impl ProcessMutexGuard<'_> {
    /// Release the lock explicitly.
    pub fn unlock(self) {
        drop(self);
    }
}

impl Drop for ProcessMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.post();
    }
}
