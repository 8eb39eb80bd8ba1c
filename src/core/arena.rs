//! # Buffer Arena
//!
//! One contiguous, zero-initialised byte region sliced into fixed-size
//! segments. Every operation context is bound to exactly one segment for its
//! whole lifetime, so steady-state socket I/O never allocates.
//!
//! Segments are carved out of the region with [`BytesMut::split_to`]: they
//! share the single backing allocation, never overlap, and the allocation is
//! freed only when the last segment is dropped. Tearing down the pools
//! therefore releases the arena memory as a side effect, and only once every
//! context has come back.
//!
//! ```rust
//! use framewire::core::arena::BufferArena;
//!
//! let mut arena = BufferArena::allocate(4, 1024, usize::MAX).unwrap();
//! let first = arena.assign_segment().unwrap();
//! let second = arena.assign_segment().unwrap();
//! assert_eq!(first.offset(), 0);
//! assert_eq!(second.offset(), 1024);
//! assert!(!first.overlaps(&second));
//! ```

use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tracing::debug;

use crate::error::{constants, ProtocolError, Result};

/// Pre-allocated arena handing out non-overlapping fixed-size segments.
pub struct BufferArena {
    /// Unassigned tail of the region.
    remaining: BytesMut,
    segment_size: usize,
    segment_count: usize,
    assigned: usize,
    live: Arc<AtomicUsize>,
}

impl BufferArena {
    /// Allocate an arena of `count` segments of `segment_size` bytes each.
    ///
    /// # Errors
    /// Returns `ProtocolError::Capacity` if the total size is zero, overflows
    /// `usize`, or exceeds `ceiling`.
    pub fn allocate(count: usize, segment_size: usize, ceiling: usize) -> Result<Self> {
        if count == 0 || segment_size == 0 {
            return Err(ProtocolError::Capacity(constants::ERR_ARENA_EMPTY.into()));
        }

        let total = count
            .checked_mul(segment_size)
            .filter(|total| *total <= isize::MAX as usize)
            .ok_or_else(|| ProtocolError::Capacity(constants::ERR_ARENA_OVERFLOW.into()))?;

        if total > ceiling {
            return Err(ProtocolError::Capacity(format!(
                "Arena of {total} bytes exceeds ceiling of {ceiling} bytes"
            )));
        }

        debug!(count, segment_size, total, "Allocating buffer arena");

        Ok(Self {
            remaining: BytesMut::zeroed(total),
            segment_size,
            segment_count: count,
            assigned: 0,
            live: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Assign the next segment, in sequential order.
    ///
    /// # Errors
    /// Returns `ProtocolError::Capacity` once every segment has been assigned.
    pub fn assign_segment(&mut self) -> Result<Segment> {
        if self.assigned == self.segment_count {
            return Err(ProtocolError::Capacity(
                constants::ERR_ARENA_EXHAUSTED.into(),
            ));
        }

        let index = self.assigned;
        let buf = self.remaining.split_to(self.segment_size);
        self.assigned += 1;
        if self.assigned == self.segment_count {
            // drop the arena's own handle on the shared allocation
            self.remaining = BytesMut::new();
        }
        self.live.fetch_add(1, Ordering::AcqRel);

        Ok(Segment {
            index,
            offset: index * self.segment_size,
            buf,
            live: Arc::clone(&self.live),
        })
    }

    /// Number of segments the arena was sized for
    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    /// Size of every segment in bytes
    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// Number of segments handed out so far
    pub fn assigned(&self) -> usize {
        self.assigned
    }

    /// Total size of the region in bytes
    pub fn total_bytes(&self) -> usize {
        self.segment_count * self.segment_size
    }

    /// Segments assigned and not yet dropped
    pub fn live_segments(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Whether every assigned segment has been dropped.
    pub fn is_released(&self) -> bool {
        self.live_segments() == 0
    }
}

impl fmt::Debug for BufferArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferArena")
            .field("segment_size", &self.segment_size)
            .field("segment_count", &self.segment_count)
            .field("assigned", &self.assigned)
            .field("live", &self.live_segments())
            .finish()
    }
}

/// A fixed-length slice `[offset, offset + len)` of the arena.
pub struct Segment {
    index: usize,
    offset: usize,
    buf: BytesMut,
    live: Arc<AtomicUsize>,
}

impl Segment {
    /// Sequential index of this segment within the arena
    pub fn index(&self) -> usize {
        self.index
    }

    /// Byte offset of this segment within the arena
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Segment length in bytes (fixed)
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Arena-relative byte range
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len()
    }

    /// Whether two segments share any byte of the arena.
    pub fn overlaps(&self, other: &Segment) -> bool {
        self.offset < other.offset + other.len() && other.offset < self.offset + self.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf[..]
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("index", &self.index)
            .field("range", &self.range())
            .finish()
    }
}
