//! Buffer arena: one contiguous allocation carved into fixed-size, disjoint regions.
//!
//! Regions are handed out once, in order, and stay with the context that received
//! them for the life of the arena. When every region is assigned the arena issues
//! nothing further; callers fall back to [`Region::detached`].

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};

use bytes::BytesMut;
use parking_lot::Mutex;

/// A fixed-size byte region owned by exactly one operation context.
#[derive(Debug)]
pub struct Region {
    index: Option<usize>,
    offset: usize,
    buf: BytesMut,
}

impl Region {
    /// Standalone region outside the arena, for bursts beyond the preallocated count.
    pub fn detached(len: usize) -> Self {
        Region {
            index: None,
            offset: 0,
            buf: BytesMut::zeroed(len),
        }
    }

    /// Partition index inside the arena, or `None` for a detached region.
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    /// Byte offset of this region from the start of the arena block.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn is_detached(&self) -> bool {
        self.index.is_none()
    }
}

impl Deref for Region {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for Region {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

/// Preallocated block split into `capacity()` regions of `region_size()` bytes.
pub struct BufferArena {
    region_size: usize,
    capacity: usize,
    unassigned: Mutex<VecDeque<Region>>,
}

impl BufferArena {
    /// Allocate `total_size` bytes and partition them into `total_size / per_context_size`
    /// regions. Any remainder is unused.
    pub fn initialize(total_size: usize, per_context_size: usize) -> Result<Self, ArenaError> {
        if per_context_size == 0 {
            return Err(ArenaError::ZeroRegionSize);
        }
        let capacity = total_size / per_context_size;
        if capacity == 0 {
            return Err(ArenaError::TooSmall {
                total_size,
                per_context_size,
            });
        }
        let mut block = BytesMut::zeroed(capacity * per_context_size);
        let mut unassigned = VecDeque::with_capacity(capacity);
        for index in 0..capacity {
            // split_to keeps every region inside the original allocation.
            let buf = block.split_to(per_context_size);
            unassigned.push_back(Region {
                index: Some(index),
                offset: index * per_context_size,
                buf,
            });
        }
        tracing::debug!(capacity, region_size = per_context_size, "buffer arena initialized");
        Ok(BufferArena {
            region_size: per_context_size,
            capacity,
            unassigned: Mutex::new(unassigned),
        })
    }

    /// Arena sized for exactly `count` regions of `region_size` bytes.
    pub fn for_contexts(count: usize, region_size: usize) -> Result<Self, ArenaError> {
        let total = count
            .checked_mul(region_size)
            .ok_or(ArenaError::Overflow)?;
        Self::initialize(total, region_size)
    }

    /// Hand out the next unassigned region, or `None` once all are taken.
    pub fn assign(&self) -> Option<Region> {
        self.unassigned.lock().pop_front()
    }

    /// Next region, or a detached one of the same size when the arena is exhausted.
    pub fn assign_or_detached(&self) -> Region {
        match self.assign() {
            Some(region) => region,
            None => {
                tracing::warn!(
                    region_size = self.region_size,
                    "buffer arena exhausted, allocating detached region"
                );
                Region::detached(self.region_size)
            }
        }
    }

    pub fn region_size(&self) -> usize {
        self.region_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn assigned(&self) -> usize {
        self.capacity - self.unassigned.lock().len()
    }
}

/// Error building an arena.
#[derive(Debug, thiserror::Error)]
pub enum ArenaError {
    #[error("region size must be non-zero")]
    ZeroRegionSize,
    #[error("arena of {total_size} bytes cannot hold one {per_context_size}-byte region")]
    TooSmall {
        total_size: usize,
        per_context_size: usize,
    },
    #[error("arena size overflows usize")]
    Overflow,
}
