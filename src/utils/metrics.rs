//! Observability and Metrics
//!
//! Counters for monitoring transport throughput, pool pressure and health.
//! Each manager owns one [`Metrics`] instance.
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

use crate::core::context::OperationKind;

/// Metrics collector for transport operations
#[derive(Debug)]
pub struct Metrics {
    /// Total connections established
    pub connections_total: AtomicU64,
    /// Currently active connections
    pub connections_active: AtomicU64,
    /// Total frames sent
    pub frames_sent: AtomicU64,
    /// Total frames received
    pub frames_received: AtomicU64,
    /// Total bytes written to sockets
    pub bytes_sent: AtomicU64,
    /// Total bytes read from sockets
    pub bytes_received: AtomicU64,
    /// Receive contexts checked out
    pub receive_checkouts: AtomicU64,
    /// Send contexts checked out
    pub send_checkouts: AtomicU64,
    /// Checkouts that had to wait for a context
    pub pool_exhausted: AtomicU64,
    /// Framing errors (oversized frames, truncated streams)
    pub frame_errors: AtomicU64,
    /// Payload decode failures
    pub decode_errors: AtomicU64,
    /// Cipher failures
    pub cipher_errors: AtomicU64,
    /// Connection errors
    pub connection_errors: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            receive_checkouts: AtomicU64::new(0),
            send_checkouts: AtomicU64::new(0),
            pool_exhausted: AtomicU64::new(0),
            frame_errors: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            cipher_errors: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a new connection
    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection closed
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a fully written frame
    pub fn frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a fully assembled frame
    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record bytes written by one send operation
    pub fn bytes_written(&self, byte_count: u64) {
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record bytes read by one receive operation
    pub fn bytes_read(&self, byte_count: u64) {
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a context checkout
    pub fn context_checkout(&self, kind: OperationKind) {
        match kind {
            OperationKind::Receive => self.receive_checkouts.fetch_add(1, Ordering::Relaxed),
            OperationKind::Send => self.send_checkouts.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Record a checkout that found the pool empty
    pub fn pool_exhausted(&self) {
        self.pool_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a framing error
    pub fn frame_error(&self) {
        self.frame_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a payload decode failure
    pub fn decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a cipher failure
    pub fn cipher_error(&self) {
        self.cipher_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection error
    pub fn connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            receive_checkouts: self.receive_checkouts.load(Ordering::Relaxed),
            send_checkouts: self.send_checkouts.load(Ordering::Relaxed),
            pool_exhausted: self.pool_exhausted.load(Ordering::Relaxed),
            frame_errors: self.frame_errors.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            cipher_errors: self.cipher_errors.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            frames_sent = snapshot.frames_sent,
            frames_received = snapshot.frames_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            receive_checkouts = snapshot.receive_checkouts,
            send_checkouts = snapshot.send_checkouts,
            pool_exhausted = snapshot.pool_exhausted,
            frame_errors = snapshot.frame_errors,
            decode_errors = snapshot.decode_errors,
            cipher_errors = snapshot.cipher_errors,
            connection_errors = snapshot.connection_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "Transport metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub receive_checkouts: u64,
    pub send_checkouts: u64,
    pub pool_exhausted: u64,
    pub frame_errors: u64,
    pub decode_errors: u64,
    pub cipher_errors: u64,
    pub connection_errors: u64,
    pub uptime_seconds: u64,
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_us = duration.as_micros() as u64,
            "Operation completed"
        );
    }
}
