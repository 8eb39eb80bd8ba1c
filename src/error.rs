//! # Error Types
//!
//! Error handling for the transport core.
//!
//! This module defines every error variant that can surface from the buffer
//! arena, the context pools, the framing state machine and the connection
//! manager.
//!
//! ## Error Categories
//! - **Fatal**: arena/pool sizing and configuration errors, raised at startup
//! - **Transient**: pool exhaustion and full send queues (backpressure)
//! - **Defect**: double release or foreign context ownership (aliasing risk)
//! - **Connection-local**: framing, cipher and socket errors; only the owning
//!   connection is torn down
//!
//! ## Example Usage
//! ```rust
//! use framewire::error::{ErrorClass, ProtocolError};
//!
//! let err = ProtocolError::FrameSize { declared: 1 << 30, max: 1 << 20 };
//! assert_eq!(err.class(), ErrorClass::ConnectionLocal);
//! ```

use crate::core::context::OperationKind;
use crate::transport::connection::ConnectionId;
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Cipher state errors
    pub const ERR_CIPHER_LOCK: &str = "Failed to acquire cipher state lock";

    /// Pool errors
    pub const ERR_POOL_LOCK: &str = "Context pool lock poisoned";

    /// Arena errors
    pub const ERR_ARENA_OVERFLOW: &str = "Arena size overflows addressable memory";
    pub const ERR_ARENA_EMPTY: &str = "Arena must contain at least one non-empty segment";
    pub const ERR_ARENA_EXHAUSTED: &str = "All arena segments are already assigned";
}

/// Coarse classification driving how an error propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Fails startup.
    Fatal,
    /// Backpressure; the caller queues or rejects the work.
    Transient,
    /// Resource-lifecycle violation; indicates a bug.
    Defect,
    /// Tears down only the affected connection.
    ConnectionLocal,
}

// ProtocolError is the primary error type for all transport operations
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    #[serde(skip_serializing, skip_deserializing)]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    #[serde(skip_serializing, skip_deserializing)]
    Serialization(#[from] bincode::Error),

    #[error("Deserialize error: {0}")]
    DeserializeError(String),

    #[error("Capacity error: {0}")]
    Capacity(String),

    #[error("{0} context pool exhausted")]
    PoolExhausted(OperationKind),

    #[error("Context pool has been shut down")]
    PoolClosed,

    #[error("{kind} context in slot {slot} released twice")]
    DoubleRelease { kind: OperationKind, slot: usize },

    #[error("{kind} context in slot {slot} does not belong to this pool or owner")]
    InvalidOwnership { kind: OperationKind, slot: usize },

    #[error("Frame of {declared} bytes exceeds maximum of {max} bytes")]
    FrameSize { declared: usize, max: usize },

    #[error("Outbound message of {len} bytes exceeds maximum frame of {max} bytes")]
    MessageTooLarge { len: usize, max: usize },

    #[error("Connection {0} is not connected")]
    NotConnected(ConnectionId),

    #[error("Send queue for connection {0} is full")]
    SendQueueFull(ConnectionId),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Connection timed out (no activity)")]
    ConnectionTimeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Classify this error for propagation decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            ProtocolError::Capacity(_) | ProtocolError::ConfigError(_) => ErrorClass::Fatal,
            ProtocolError::PoolExhausted(_) | ProtocolError::SendQueueFull(_) => {
                ErrorClass::Transient
            }
            ProtocolError::DoubleRelease { .. } | ProtocolError::InvalidOwnership { .. } => {
                ErrorClass::Defect
            }
            _ => ErrorClass::ConnectionLocal,
        }
    }

    /// Whether this error leaves the connection's byte stream unusable.
    ///
    /// Outbound encryption and size errors are raised before any byte of the
    /// message is written, so the stream stays aligned and only that send
    /// fails.
    pub fn is_fatal_to_connection(&self) -> bool {
        match self.class() {
            ErrorClass::ConnectionLocal => matches!(
                self,
                ProtocolError::Io(_)
                    | ProtocolError::FrameSize { .. }
                    | ProtocolError::DecryptionFailure
                    | ProtocolError::ConnectionClosed
                    | ProtocolError::ConnectionTimeout
                    | ProtocolError::PoolClosed
            ),
            ErrorClass::Fatal | ErrorClass::Transient | ErrorClass::Defect => false,
        }
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
