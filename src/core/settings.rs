//! # Transport Settings
//!
//! Construction-time wiring of the buffer arena and the two context pools.
//! One arena of `(receive_count + send_count) × buffer_size` bytes is
//! allocated and every context of both pools is bound to one of its segments.
//!
//! Receive and send pools are sized independently and report their sizes
//! independently. Sizes are fixed for the lifetime of the settings.
//!
//! ```rust
//! use framewire::core::settings::TransportSettings;
//!
//! let settings = TransportSettings::new(4, 2, 1024).unwrap();
//! assert_eq!(settings.receive_count(), 4);
//! assert_eq!(settings.send_count(), 2);
//! settings.shutdown();
//! settings.shutdown(); // no-op
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing::{info, warn};

use crate::config::{TransportConfig, DEFAULT_ARENA_CEILING, DEFAULT_BUFFER_SIZE, DEFAULT_POOL_SIZE};
use crate::core::arena::BufferArena;
use crate::core::context::OperationKind;
use crate::core::pool::ContextPool;
use crate::error::{ProtocolError, Result};

/// Contexts still checked out when shutdown was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShutdownReport {
    pub receive_outstanding: usize,
    pub send_outstanding: usize,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.receive_outstanding == 0 && self.send_outstanding == 0
    }
}

pub struct TransportSettings {
    receive_pool: ContextPool,
    send_pool: ContextPool,
    arena: Mutex<BufferArena>,
    buffer_size: usize,
    shut_down: AtomicBool,
}

impl TransportSettings {
    /// Allocate pools of `receive_count` and `send_count` contexts with
    /// `buffer_size`-byte segments, under the default arena ceiling.
    pub fn new(receive_count: usize, send_count: usize, buffer_size: usize) -> Result<Self> {
        Self::with_ceiling(receive_count, send_count, buffer_size, DEFAULT_ARENA_CEILING)
    }

    /// Allocate the settings with an explicit arena ceiling in bytes.
    ///
    /// # Errors
    /// Returns `ProtocolError::Capacity` for zero-sized pools or segments, or
    /// when the arena would overflow or exceed `ceiling`.
    pub fn with_ceiling(
        receive_count: usize,
        send_count: usize,
        buffer_size: usize,
        ceiling: usize,
    ) -> Result<Self> {
        if receive_count == 0 || send_count == 0 {
            return Err(ProtocolError::Capacity(
                "Receive and send pool sizes must both be greater than 0".into(),
            ));
        }

        let count = receive_count.checked_add(send_count).ok_or_else(|| {
            ProtocolError::Capacity("Combined pool size overflows".into())
        })?;
        let mut arena = BufferArena::allocate(count, buffer_size, ceiling)?;
        let receive_pool = ContextPool::new(OperationKind::Receive, receive_count, &mut arena)?;
        let send_pool = ContextPool::new(OperationKind::Send, send_count, &mut arena)?;

        info!(
            receive_count,
            send_count,
            buffer_size,
            arena_bytes = arena.total_bytes(),
            "Transport settings initialised"
        );

        Ok(Self {
            receive_pool,
            send_pool,
            arena: Mutex::new(arena),
            buffer_size,
            shut_down: AtomicBool::new(false),
        })
    }

    /// 25 receive contexts, 25 send contexts, 65535-byte segments.
    pub fn defaults() -> Result<Self> {
        Self::new(DEFAULT_POOL_SIZE, DEFAULT_POOL_SIZE, DEFAULT_BUFFER_SIZE)
    }

    pub fn from_config(config: &TransportConfig) -> Result<Self> {
        Self::with_ceiling(
            config.receive_count,
            config.send_count,
            config.buffer_size,
            config.arena_ceiling,
        )
    }

    /// Number of receive contexts
    pub fn receive_count(&self) -> usize {
        self.receive_pool.capacity()
    }

    /// Number of send contexts
    pub fn send_count(&self) -> usize {
        self.send_pool.capacity()
    }

    /// Segment size in bytes
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn receive_pool(&self) -> &ContextPool {
        &self.receive_pool
    }

    pub fn send_pool(&self) -> &ContextPool {
        &self.send_pool
    }

    pub fn pool(&self, kind: OperationKind) -> &ContextPool {
        match kind {
            OperationKind::Receive => &self.receive_pool,
            OperationKind::Send => &self.send_pool,
        }
    }

    /// Total arena size in bytes
    pub fn arena_bytes(&self) -> usize {
        self.arena.lock().map(|a| a.total_bytes()).unwrap_or(0)
    }

    /// Whether the arena memory has been given back.
    pub fn arena_released(&self) -> bool {
        self.arena.lock().map(|a| a.is_released()).unwrap_or(false)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Close both pools. Idempotent; a repeated call reports what is still out.
    pub fn shutdown(&self) -> ShutdownReport {
        let first = !self.shut_down.swap(true, Ordering::AcqRel);

        let report = ShutdownReport {
            receive_outstanding: self.receive_pool.shutdown(),
            send_outstanding: self.send_pool.shutdown(),
        };

        if first && !report.is_clean() {
            warn!(
                receive_outstanding = report.receive_outstanding,
                send_outstanding = report.send_outstanding,
                "Shutting down with contexts still checked out"
            );
        }
        report
    }

    /// Shut down and wait until every context has come back.
    pub async fn shutdown_and_drain(&self) {
        self.shutdown();
        self.receive_pool.drained().await;
        self.send_pool.drained().await;
    }
}

impl std::fmt::Debug for TransportSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSettings")
            .field("receive_pool", &self.receive_pool)
            .field("send_pool", &self.send_pool)
            .field("buffer_size", &self.buffer_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::connection::ConnectionId;

    #[test]
    fn test_counts_reported_independently() {
        let settings = TransportSettings::new(3, 5, 64).unwrap();
        assert_eq!(settings.receive_count(), 3);
        assert_eq!(settings.send_count(), 5);
        assert_eq!(settings.arena_bytes(), 8 * 64);
    }

    #[test]
    fn test_exhaustion_is_per_direction() {
        let settings = TransportSettings::new(1, 2, 16).unwrap();
        let owner = ConnectionId::new(1);

        let _rx = settings.receive_pool().try_checkout(owner).unwrap();
        assert!(matches!(
            settings.receive_pool().try_checkout(owner),
            Err(ProtocolError::PoolExhausted(OperationKind::Receive))
        ));
        assert!(settings.send_pool().try_checkout(owner).is_ok());
        assert_eq!(settings.send_pool().stats().exhausted, 0);
    }

    #[test]
    fn test_pools_use_disjoint_segments() {
        let settings = TransportSettings::new(2, 2, 16).unwrap();
        let owner = ConnectionId::new(1);
        let rx: Vec<_> = (0..2)
            .map(|_| settings.receive_pool().try_checkout(owner).unwrap())
            .collect();
        let tx: Vec<_> = (0..2)
            .map(|_| settings.send_pool().try_checkout(owner).unwrap())
            .collect();

        for r in &rx {
            for t in &tx {
                assert!(!r.segment().overlaps(t.segment()));
            }
        }
    }

    #[test]
    fn test_zero_counts_rejected() {
        assert!(matches!(
            TransportSettings::new(0, 1, 16),
            Err(ProtocolError::Capacity(_))
        ));
        assert!(matches!(
            TransportSettings::new(1, 0, 16),
            Err(ProtocolError::Capacity(_))
        ));
    }

    #[test]
    fn test_ceiling_enforced() {
        assert!(matches!(
            TransportSettings::with_ceiling(10, 10, 1024, 1024),
            Err(ProtocolError::Capacity(_))
        ));
    }

    #[test]
    fn test_shutdown_releases_arena_after_return() {
        let settings = TransportSettings::new(2, 2, 16).unwrap();
        let held = settings.send_pool().try_checkout(ConnectionId::new(1)).unwrap();

        let report = settings.shutdown();
        assert_eq!(report.send_outstanding, 1);
        assert!(!settings.arena_released());

        held.release().unwrap();
        assert!(settings.arena_released());
        assert!(settings.shutdown().is_clean());
    }
}
