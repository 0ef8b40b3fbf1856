//! Read-only access to a bus, and its removal.

use std::time::Duration;

use crate::bus::layout::{PipeHeader, SharedHeader, MAX_PIPES};
use crate::bus::pipe::Pipe;
use crate::bus::snapshot::{BusSnapshot, PipeStats};
use crate::error::{BusResult, SharedMemoryError};
use crate::shm::{ProcessMutex, ProcessMutexGuard, SharedSegment};
use crate::types::{BusKey, SegmentKey};

/// How long [`purge`] waits for the bus lock before removing the bus anyway.
pub const PURGE_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Observer attached to a bus without joining its roster.
pub struct BusInspector {
    key: BusKey,
    header: SharedHeader,
    mutex: ProcessMutex,
}

impl BusInspector {
    /// Attach to an existing bus. Fails with `NotFound` if it was never
    /// created, without leaving anything behind.
    pub fn open(key: BusKey) -> BusResult<Self> {
        let header_key = key.header_key();
        let mutex = ProcessMutex::open(header_key)?;

        // The creator sizes and formats the header while holding the lock.
        let header = {
            let guard = mutex.lock()?;
            let header = SharedHeader::new(SharedSegment::open(header_key)?)?;
            header.validate(&guard, header_key)?;
            header
        };

        Ok(Self { key, header, mutex })
    }

    pub fn key(&self) -> BusKey {
        self.key
    }

    /// Current roster and the counters of every published pipe.
    ///
    /// Pipe counters are read lock-free after the table is copied, so they
    /// may be slightly newer than the versions reported.
    pub fn snapshot(&self) -> BusResult<BusSnapshot> {
        let (terminal_version, pipe_version, terminals, entries) = {
            let guard = self.mutex.lock()?;
            (
                self.header.terminal_version(),
                self.header.pipe_version(),
                self.header.terminals(&guard),
                self.header.pipes(&guard),
            )
        };

        let mut pipes = Vec::with_capacity(entries.len());
        for entry in entries {
            let pipe = Pipe::attach(entry)?;
            pipes.push(PipeStats::of(&pipe));
        }

        Ok(BusSnapshot {
            key: self.key,
            observer: None,
            terminal_version,
            pipe_version,
            terminals,
            pipes,
        })
    }
}

/// Remove every pipe segment, the header segment and the semaphore of bus
/// `key`. Succeeds if the bus does not exist.
///
/// Waits up to [`PURGE_LOCK_TIMEOUT`] for the bus lock; see
/// [`purge_with_timeout`].
pub fn purge(key: BusKey) -> BusResult<()> {
    purge_with_timeout(key, PURGE_LOCK_TIMEOUT)
}

/// [`purge`] with an explicit wait for the bus lock.
///
/// If the lock stays busy, its holder is presumed dead and the bus is removed
/// without it: every possible pipe key is unlinked rather than only those in
/// the table. Processes still attached keep their mappings; a later join
/// creates a fresh bus and a fresh lock.
pub fn purge_with_timeout(key: BusKey, timeout: Duration) -> BusResult<()> {
    let header_key = key.header_key();
    let mutex = ProcessMutex::create_or_open(header_key)?;

    let removed = match mutex.lock_timeout(timeout)? {
        Some(guard) => remove_locked(key, &guard)?,
        None => {
            tracing::warn!(
                bus = %key,
                waited_ms = timeout.as_millis() as u64,
                "Bus lock not released; removing the bus without it"
            );
            remove_segments(key, all_pipe_keys(key))?
        }
    };

    mutex.destroy()?;
    tracing::info!(bus = %key, pipes = removed, "Destroyed bus");
    Ok(())
}

fn remove_locked(key: BusKey, guard: &ProcessMutexGuard<'_>) -> BusResult<usize> {
    let header_key = key.header_key();
    let header = match SharedSegment::open(header_key) {
        Ok(segment) => SharedHeader::new(segment),
        Err(SharedMemoryError::NotFound { .. }) => return Ok(0),
        Err(e) => Err(e),
    };

    match header {
        Ok(header) if header.validate(guard, header_key).is_ok() => {
            let listed = header.pipes(guard);
            drop(header);
            remove_segments(key, listed.iter().map(PipeHeader::segment_key))
        }
        _ => {
            tracing::warn!(bus = %key, "Header segment is not a bus; sweeping every pipe key");
            remove_segments(key, all_pipe_keys(key))
        }
    }
}

fn all_pipe_keys(key: BusKey) -> impl Iterator<Item = SegmentKey> {
    (0..MAX_PIPES).map(move |index| key.pipe_key(index))
}

/// Unlink `pipes` and then the header. Returns how many pipes existed.
fn remove_segments(key: BusKey, pipes: impl Iterator<Item = SegmentKey>) -> BusResult<usize> {
    let mut removed = 0;
    for pipe in pipes {
        if SharedSegment::unlink(pipe)? {
            removed += 1;
        }
    }
    SharedSegment::unlink(key.header_key())?;
    Ok(removed)
}
