//! # Persistent Block Allocator
//!
//! Fixed-size blocks over a shared heap region, recoverable from one marker
//! byte per block.
//!
//! ## Layout
//!
//! Block `n` occupies `[n * (block_size + 1), (n + 1) * (block_size + 1))`:
//! `block_size` payload bytes followed by a trailer holding [`ALLOCATED`],
//! [`HEAP_END`] or [`FREED`]. Block 0 is reserved and never handed out.
//!
//! ## Invariants
//!
//! - The block at the allocation border carries `HEAP_END`.
//! - Blocks below the border carry `ALLOCATED` or `FREED`; the `FREED` ones
//!   form the free set.
//! - A new `HEAP_END` is always durable before the old one is downgraded,
//!   so a crash never leaves a heap without an end marker.
//!
//! All operations are serialised by one mutex. The CAS register and
//! notification matrix, which also live in the heap, never take it.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{Result, RuntimeError};
use crate::region::Region;

/// Trailer of an allocated block (and of the reserved block 0 once the
/// heap has grown).
pub const ALLOCATED: u8 = 0x00;

/// Trailer of the block at the allocation border.
pub const HEAP_END: u8 = 0x01;

/// Trailer of a released block below the border.
pub const FREED: u8 = 0x02;

/// Mutable allocator state, guarded by the allocator's mutex.
#[derive(Debug)]
struct AllocState {
    /// Index of the block carrying `HEAP_END`.
    border: u64,
    /// Indices below the border whose trailer reads `FREED`.
    free: BTreeSet<u64>,
}

/// Allocator of fixed-size blocks inside a persistent heap.
#[derive(Debug)]
pub struct PmemAllocator {
    heap: Arc<Region>,
    block_size: u64,
    max_border: u64,
    state: Mutex<AllocState>,
}

impl PmemAllocator {
    /// Create an allocator over `heap`.
    ///
    /// With `init_new` the heap is formatted (block 0 becomes the border);
    /// otherwise the free set and border are recovered by scanning trailers.
    pub fn new(heap: Arc<Region>, block_size: u64, max_border: u64, init_new: bool) -> Result<Self> {
        if block_size == 0 {
            return Err(RuntimeError::InvalidConfig(
                "block size must be at least 1 byte".into(),
            ));
        }
        let fits = max_border
            .checked_add(1)
            .and_then(|blocks| blocks.checked_mul(block_size + 1))
            .is_some_and(|span| span <= heap.len());
        if !fits {
            return Err(RuntimeError::InvalidConfig(format!(
                "{} blocks of {} bytes do not fit a heap of {} bytes",
                max_border.saturating_add(1),
                block_size,
                heap.len()
            )));
        }

        let allocator = Self {
            heap,
            block_size,
            max_border,
            state: Mutex::new(AllocState {
                border: 0,
                free: BTreeSet::new(),
            }),
        };

        if init_new {
            allocator.set_trailer(0, HEAP_END)?;
            debug!(block_size, max_border, "formatted new heap");
        } else {
            let recovered = allocator.scan()?;
            debug!(
                block_size,
                border = recovered.border,
                free = recovered.free.len(),
                "recovered heap"
            );
            *allocator.state.lock() = recovered;
        }
        Ok(allocator)
    }

    fn scan(&self) -> Result<AllocState> {
        let mut free = BTreeSet::new();
        let mut last = (0, ALLOCATED);
        for index in 0..=self.max_border {
            let offset = self.trailer_offset(index);
            let value = self.heap.read_u8(offset)?;
            match value {
                HEAP_END => return Ok(AllocState { border: index, free }),
                FREED => {
                    free.insert(index);
                }
                ALLOCATED => {}
                _ => return Err(RuntimeError::CorruptedMarker { offset, value }),
            }
            last = (offset, value);
        }
        // No end marker within the managed span.
        Err(RuntimeError::CorruptedMarker {
            offset: last.0,
            value: last.1,
        })
    }

    /// Allocate one block and return the offset of its first byte.
    pub fn alloc(&self) -> Result<u64> {
        let mut state = self.state.lock();

        if let Some(index) = state.free.pop_first() {
            // Recycled blocks are marked durably so a crash cannot make them
            // look free again.
            self.set_trailer(index, ALLOCATED)?;
            trace!(index, "reused block");
            return Ok(self.block_offset(index));
        }

        if state.border == self.max_border {
            return Err(RuntimeError::HeapExhausted);
        }
        let old = state.border;
        self.set_trailer(old + 1, HEAP_END)?;
        self.set_trailer(old, ALLOCATED)?;
        state.border = old + 1;
        trace!(index = old + 1, "bumped border");
        Ok(self.block_offset(old + 1))
    }

    /// Release the block starting at `offset`.
    pub fn free(&self, offset: u64) -> Result<()> {
        let mut state = self.state.lock();
        let index = self.allocated_index(&state, offset)?;

        if index < state.border {
            self.set_trailer(index, FREED)?;
            state.free.insert(index);
            trace!(index, "freed block");
            return Ok(());
        }

        // Freeing the border block: shrink over the run of freed blocks
        // directly below it.
        let mut new_border = index - 1;
        while new_border > 0 {
            match self.trailer(new_border)? {
                FREED => {
                    state.free.remove(&new_border);
                    new_border -= 1;
                }
                ALLOCATED => break,
                value => {
                    return Err(RuntimeError::CorruptedMarker {
                        offset: self.trailer_offset(new_border),
                        value,
                    })
                }
            }
        }
        self.set_trailer(new_border, HEAP_END)?;
        state.border = new_border;
        trace!(index, border = new_border, "shrunk border");
        Ok(())
    }

    /// Whether the block starting at `offset` is currently allocated.
    pub fn is_allocated(&self, offset: u64) -> Result<bool> {
        let state = self.state.lock();
        let index = offset / self.stride();
        if index > state.border {
            return Ok(false);
        }
        Ok(self.trailer(index)? != FREED)
    }

    /// Payload bytes per block.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Current allocation border.
    pub fn border(&self) -> u64 {
        self.state.lock().border
    }

    /// Highest index the border may reach.
    pub fn max_border(&self) -> u64 {
        self.max_border
    }

    /// Number of blocks in the free set.
    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Offset of the first byte of block `index`.
    pub fn block_offset(&self, index: u64) -> u64 {
        index * self.stride()
    }

    /// The heap this allocator manages.
    pub fn heap(&self) -> &Arc<Region> {
        &self.heap
    }

    fn stride(&self) -> u64 {
        self.block_size + 1
    }

    fn trailer_offset(&self, index: u64) -> u64 {
        self.block_offset(index) + self.block_size
    }

    fn trailer(&self, index: u64) -> Result<u8> {
        self.heap.read_u8(self.trailer_offset(index))
    }

    fn set_trailer(&self, index: u64, marker: u8) -> Result<()> {
        let offset = self.trailer_offset(index);
        self.heap.write_u8(offset, marker)?;
        self.heap.flush(offset, 1)
    }

    /// Resolve `offset` to the index of a block that may be freed.
    fn allocated_index(&self, state: &AllocState, offset: u64) -> Result<u64> {
        let invalid = RuntimeError::InvalidBlock { offset };
        if offset % self.stride() != 0 {
            return Err(invalid);
        }
        let index = offset / self.stride();
        if index == 0 || index > state.border || state.free.contains(&index) {
            return Err(invalid);
        }
        Ok(index)
    }
}
