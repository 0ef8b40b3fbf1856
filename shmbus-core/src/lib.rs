//! shmbus core library
//!
//! Same-host message bus over POSIX shared memory. Processes join a bus by
//! key, exchange length-framed byte messages through lock-free ring
//! channels, and discover each other through a versioned shared registry.
//! Provides the shared memory primitives, the peer cache, the bus handle and
//! configuration parsing.

pub mod bus;
pub mod config;
pub mod error;
pub mod peer_cache;
pub mod shm;
pub mod types;

// Re-export commonly used types
pub use bus::{
    purge, purge_with_timeout, Bus, BusInspector, BusOptions, BusSnapshot, PipeStats,
    PURGE_LOCK_TIMEOUT,
};
pub use config::{BusConfig, ConfigLoader, DEFAULT_PIPE_CAPACITY};
pub use error::{BusError, BusResult, CacheError, HardValidationError, SharedMemoryError};
pub use peer_cache::PeerCache;
pub use shm::{ProcessMutex, RingChannel, SharedSegment};
pub use types::{BusKey, SegmentKey, TerminalAddress};
