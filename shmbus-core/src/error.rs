//! Custom error types for shmbus.
//!
//! Every failure is an explicit enum variant. Transient conditions such as an
//! empty ring or a full ring are ordinary values here, not exceptional paths.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{SegmentKey, TerminalAddress};

/// Top-level error type for bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    // =========================================================================
    // Configuration Errors - Fail-Fast on Invalid Config
    // =========================================================================
    #[error("Hard validation error: {0}")]
    HardValidation(#[from] HardValidationError),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Configuration parse error: {message}")]
    ConfigParse { message: String },

    // =========================================================================
    // Roster Errors
    // =========================================================================
    #[error("Terminal {peer} is not registered on the bus")]
    PeerNotFound { peer: TerminalAddress },

    #[error("Terminal table is full ({max} entries)")]
    TerminalTableFull { max: usize },

    // =========================================================================
    // Pipe Errors
    // =========================================================================
    #[error("Pipe table is full ({max} entries)")]
    PipeTableFull { max: usize },

    #[error("Failed to create pipe to {peer}: {reason}")]
    PipeCreateFailed {
        peer: TerminalAddress,
        reason: String,
    },

    // =========================================================================
    // Data Path Errors - Backpressure Is Surfaced, Never Dropped
    // =========================================================================
    #[error("Send to {peer} failed: {size} bytes requested, {available} available")]
    SendFailed {
        peer: TerminalAddress,
        size: usize,
        available: usize,
    },

    #[error("Receive from {peer} failed: {source}")]
    RecvFailed {
        peer: TerminalAddress,
        #[source]
        source: SharedMemoryError,
    },

    #[error("Peek on pipe from {peer} failed: {source}")]
    PeekFailed {
        peer: TerminalAddress,
        #[source]
        source: SharedMemoryError,
    },

    // =========================================================================
    // Shared Memory Errors
    // =========================================================================
    #[error("Shared memory error: {0}")]
    SharedMemory(#[from] SharedMemoryError),

    // =========================================================================
    // Precondition Errors
    // =========================================================================
    #[error("Operation failed: {reason}")]
    Fail { reason: String },

    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Hard validation errors prevent start-up.
/// Used when configuration is invalid and the bus cannot safely be joined.
#[derive(Debug, Error)]
pub enum HardValidationError {
    #[error("Missing required field: {field} in {context}")]
    MissingRequiredField {
        field: &'static str,
        context: String,
    },

    #[error("Invalid field value: {field} = {value} - {reason}")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid terminal address: {value} - {reason}")]
    InvalidAddress { value: String, reason: String },
}

/// Shared memory, semaphore and ring buffer errors.
#[derive(Debug, Error)]
pub enum SharedMemoryError {
    #[error("Failed to create shared memory segment {key}: {reason}")]
    CreateFailed { key: SegmentKey, reason: String },

    #[error("Shared memory segment {key} already exists")]
    AlreadyExists { key: SegmentKey },

    #[error("Shared memory segment {key} does not exist")]
    NotFound { key: SegmentKey },

    #[error("Failed to map shared memory segment {key}: {reason}")]
    MapFailed { key: SegmentKey, reason: String },

    #[error("Size mismatch on segment {key}: expected {expected} bytes, found {actual}")]
    SizeMismatch {
        key: SegmentKey,
        expected: usize,
        actual: usize,
    },

    #[error("Semaphore {name} failed in {operation}: {reason}")]
    Semaphore {
        name: String,
        operation: &'static str,
        reason: String,
    },

    #[error("Ring buffer would overflow - cannot write {size} bytes ({available} available)")]
    WouldOverflow { size: usize, available: usize },

    #[error("Ring buffer empty - no message available")]
    Empty,

    #[error("Message of {size} bytes does not fit the {capacity} byte buffer")]
    TooLarge { size: usize, capacity: usize },

    #[error("Invalid buffer state: {reason}")]
    InvalidBufferState { reason: String },
}

/// Errors raised by the fixed-capacity peer table.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Peer table is full ({capacity} slots)")]
    Full { capacity: usize },

    #[error("Peer {id} is already present")]
    Duplicate { id: u32 },
}

/// Result type alias using BusError.
pub type BusResult<T> = Result<T, BusError>;
