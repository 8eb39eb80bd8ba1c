//! # Operation Context Pool
//!
//! A fixed set of [`OperationContext`]s created once at startup, each bound to
//! its own arena segment. Contexts are handed out as [`PooledContext`] guards
//! and come back either through an explicit [`PooledContext::release`] or when
//! the guard is dropped (a cancelled operation, an early return), so a
//! context is returned exactly once whatever happens to the operation.
//!
//! The pool never grows. When it is empty, [`ContextPool::try_checkout`]
//! reports [`ProtocolError::PoolExhausted`] and [`ContextPool::checkout`]
//! waits, first come first served, for the next release.
//!
//! Every slot carries an owner tag. Releasing a context whose slot is already
//! free, or that belongs to another pool or owner, is a defect: it is logged
//! at error level and returned as `DoubleRelease` / `InvalidOwnership`.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Notify, Semaphore, TryAcquireError};
use tracing::{debug, error, info, trace};

use crate::core::arena::BufferArena;
use crate::core::context::{OperationContext, OperationKind};
use crate::error::{constants, ProtocolError, Result};
use crate::transport::connection::ConnectionId;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotOwner {
    Free,
    CheckedOut(ConnectionId),
    /// Dropped after shutdown; never handed out again.
    Retired,
}

struct PoolState {
    free: Vec<OperationContext>,
    owners: Vec<SlotOwner>,
    checked_out: usize,
    closed: bool,
}

#[derive(Default)]
struct PoolCounters {
    checkouts: AtomicU64,
    releases: AtomicU64,
    reclaimed: AtomicU64,
    exhausted: AtomicU64,
    high_water: AtomicUsize,
}

struct PoolShared {
    id: u64,
    kind: OperationKind,
    capacity: usize,
    segment_size: usize,
    state: Mutex<PoolState>,
    permits: Semaphore,
    drained: Notify,
    counters: PoolCounters,
}

/// Point-in-time pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub available: usize,
    pub in_use: usize,
    pub checkouts: u64,
    /// Returns through either path (explicit release or guard drop)
    pub releases: u64,
    /// Returns that happened because a guard was dropped
    pub reclaimed: u64,
    /// Checkouts that found the pool empty
    pub exhausted: u64,
    /// Largest number of contexts checked out at once
    pub high_water: usize,
}

/// Bounded, thread-safe pool of operation contexts for one direction.
#[derive(Clone)]
pub struct ContextPool {
    shared: Arc<PoolShared>,
}

impl ContextPool {
    /// Build a pool of exactly `capacity` contexts, binding each to a fresh
    /// segment of `arena`.
    ///
    /// # Errors
    /// Returns `ProtocolError::Capacity` if `capacity` is zero or the arena
    /// runs out of segments.
    pub fn new(kind: OperationKind, capacity: usize, arena: &mut BufferArena) -> Result<Self> {
        if capacity == 0 {
            return Err(ProtocolError::Capacity(format!(
                "{kind} pool capacity must be greater than 0"
            )));
        }

        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let mut free = Vec::with_capacity(capacity);
        for slot in 0..capacity {
            let segment = arena.assign_segment()?;
            free.push(OperationContext::new(slot, id, kind, segment));
        }
        // lowest slot first out
        free.reverse();

        debug!(%kind, capacity, segment_size = arena.segment_size(), "Context pool created");

        Ok(Self {
            shared: Arc::new(PoolShared {
                id,
                kind,
                capacity,
                segment_size: arena.segment_size(),
                state: Mutex::new(PoolState {
                    free,
                    owners: vec![SlotOwner::Free; capacity],
                    checked_out: 0,
                    closed: false,
                }),
                permits: Semaphore::new(capacity),
                drained: Notify::new(),
                counters: PoolCounters::default(),
            }),
        })
    }

    pub fn kind(&self) -> OperationKind {
        self.shared.kind
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Segment size of every context in the pool
    pub fn segment_size(&self) -> usize {
        self.shared.segment_size
    }

    /// Contexts currently sitting in the pool
    pub fn available(&self) -> usize {
        self.lock().map(|state| state.free.len()).unwrap_or(0)
    }

    /// Contexts currently checked out
    pub fn in_use(&self) -> usize {
        self.lock().map(|state| state.checked_out).unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().map(|state| state.closed).unwrap_or(true)
    }

    pub fn stats(&self) -> PoolStats {
        let (available, in_use) = self
            .lock()
            .map(|state| (state.free.len(), state.checked_out))
            .unwrap_or((0, 0));
        let counters = &self.shared.counters;

        PoolStats {
            capacity: self.shared.capacity,
            available,
            in_use,
            checkouts: counters.checkouts.load(Ordering::Relaxed),
            releases: counters.releases.load(Ordering::Relaxed),
            reclaimed: counters.reclaimed.load(Ordering::Relaxed),
            exhausted: counters.exhausted.load(Ordering::Relaxed),
            high_water: counters.high_water.load(Ordering::Relaxed),
        }
    }

    /// Check out a context without waiting.
    ///
    /// # Errors
    /// `PoolExhausted` when every context is in use, `PoolClosed` after shutdown.
    pub fn try_checkout(&self, owner: ConnectionId) -> Result<PooledContext> {
        match self.shared.permits.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.take(owner)
            }
            Err(TryAcquireError::NoPermits) => {
                self.shared.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                trace!(kind = %self.shared.kind, %owner, "Context pool exhausted");
                Err(ProtocolError::PoolExhausted(self.shared.kind))
            }
            Err(TryAcquireError::Closed) => Err(ProtocolError::PoolClosed),
        }
    }

    /// Check out a context, waiting in FIFO order while the pool is empty.
    ///
    /// # Errors
    /// `PoolClosed` if the pool is shut down before a context becomes free.
    pub async fn checkout(&self, owner: ConnectionId) -> Result<PooledContext> {
        match self.try_checkout(owner) {
            Err(ProtocolError::PoolExhausted(_)) => {}
            other => return other,
        }

        let permit = self
            .shared
            .permits
            .acquire()
            .await
            .map_err(|_| ProtocolError::PoolClosed)?;
        permit.forget();
        self.take(owner)
    }

    /// Return a context to this pool.
    ///
    /// # Errors
    /// `InvalidOwnership` if the guard belongs to another pool; otherwise the
    /// result of [`PooledContext::release`].
    pub fn release(&self, ctx: PooledContext) -> Result<()> {
        if !Arc::ptr_eq(&self.shared, &ctx.pool.shared) {
            let slot = ctx.slot();
            let kind = ctx.kind();
            error!(%kind, slot, "Context released into a foreign pool");
            // the guard still returns it to its own pool on drop
            return Err(ProtocolError::InvalidOwnership { kind, slot });
        }
        ctx.release()
    }

    /// Close the pool. Idempotent.
    ///
    /// Pooled contexts are dropped right away together with their segments;
    /// contexts still checked out are dropped when they come back. Returns
    /// the number of contexts still outstanding.
    pub fn shutdown(&self) -> usize {
        let (retired, outstanding) = {
            let Ok(mut state) = self.lock() else {
                return 0;
            };
            if state.closed {
                return state.checked_out;
            }
            state.closed = true;
            self.shared.permits.close();

            let retired: Vec<OperationContext> = state.free.drain(..).collect();
            for ctx in &retired {
                state.owners[ctx.slot()] = SlotOwner::Retired;
            }
            (retired, state.checked_out)
        };

        info!(
            kind = %self.shared.kind,
            retired = retired.len(),
            outstanding,
            "Context pool shut down"
        );
        drop(retired);
        if outstanding == 0 {
            self.shared.drained.notify_waiters();
        }
        outstanding
    }

    /// Wait until no context is checked out.
    pub async fn drained(&self) {
        loop {
            let notified = self.shared.drained.notified();
            if self.in_use() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, PoolState>> {
        self.shared
            .state
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_POOL_LOCK.into()))
    }

    /// Pop a free context after a permit has been consumed.
    fn take(&self, owner: ConnectionId) -> Result<PooledContext> {
        let mut ctx = {
            let mut state = self.lock()?;
            let Some(ctx) = state.free.pop() else {
                // a permit without a free context means the pool was closed underneath us
                return Err(ProtocolError::PoolClosed);
            };
            state.owners[ctx.slot()] = SlotOwner::CheckedOut(owner);
            state.checked_out += 1;
            self.shared
                .counters
                .high_water
                .fetch_max(state.checked_out, Ordering::Relaxed);
            ctx
        };

        ctx.bind(owner);
        self.shared.counters.checkouts.fetch_add(1, Ordering::Relaxed);
        trace!(kind = %self.shared.kind, slot = ctx.slot(), %owner, "Context checked out");

        Ok(PooledContext {
            ctx: Some(ctx),
            pool: self.clone(),
        })
    }

    /// Validate the owner tag and put the context back.
    pub(crate) fn release_context(&self, mut ctx: OperationContext) -> Result<()> {
        let kind = ctx.kind();
        let slot = ctx.slot();

        if ctx.pool_id() != self.shared.id || slot >= self.shared.capacity {
            error!(%kind, slot, "Context does not belong to this pool");
            return Err(ProtocolError::InvalidOwnership { kind, slot });
        }

        let (retired, drained) = {
            let mut state = self.lock()?;
            match state.owners[slot] {
                SlotOwner::Free | SlotOwner::Retired => {
                    error!(%kind, slot, "Context released twice");
                    return Err(ProtocolError::DoubleRelease { kind, slot });
                }
                SlotOwner::CheckedOut(owner) if ctx.owner() != Some(owner) => {
                    error!(%kind, slot, %owner, actual = ?ctx.owner(), "Context owner tag mismatch");
                    return Err(ProtocolError::InvalidOwnership { kind, slot });
                }
                SlotOwner::CheckedOut(_) => {}
            }

            ctx.unbind();
            state.checked_out -= 1;
            let retired = if state.closed {
                state.owners[slot] = SlotOwner::Retired;
                Some(ctx)
            } else {
                state.owners[slot] = SlotOwner::Free;
                state.free.push(ctx);
                self.shared.permits.add_permits(1);
                None
            };
            (retired, state.checked_out == 0)
        };

        self.shared.counters.releases.fetch_add(1, Ordering::Relaxed);
        trace!(%kind, slot, "Context released");
        drop(retired);
        if drained {
            self.shared.drained.notify_waiters();
        }
        Ok(())
    }
}

impl fmt::Debug for ContextPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextPool")
            .field("kind", &self.shared.kind)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A checked-out context. Returns itself to its pool when dropped.
pub struct PooledContext {
    ctx: Option<OperationContext>,
    pool: ContextPool,
}

impl PooledContext {
    /// Return the context to its pool, surfacing ownership violations.
    pub fn release(mut self) -> Result<()> {
        match self.ctx.take() {
            Some(ctx) => self.pool.release_context(ctx),
            None => Ok(()),
        }
    }
}

// `ctx` is only emptied by `release(self)` and `Drop`, both of which consume
// the guard, so it is always present while the guard can be dereferenced.
impl Deref for PooledContext {
    type Target = OperationContext;

    fn deref(&self) -> &OperationContext {
        self.ctx.as_ref().expect("context present until released")
    }
}

impl DerefMut for PooledContext {
    fn deref_mut(&mut self) -> &mut OperationContext {
        self.ctx.as_mut().expect("context present until released")
    }
}

impl Drop for PooledContext {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            let slot = ctx.slot();
            match self.pool.release_context(ctx) {
                Ok(()) => {
                    self.pool
                        .shared
                        .counters
                        .reclaimed
                        .fetch_add(1, Ordering::Relaxed);
                    trace!(kind = %self.pool.kind(), slot, "Context reclaimed on drop");
                }
                Err(e) => error!(error = %e, slot, "Failed to reclaim context"),
            }
        }
    }
}

impl fmt::Debug for PooledContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PooledContext").field(&self.ctx).finish()
    }
}
