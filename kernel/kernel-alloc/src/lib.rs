//! # Physical and Heap Allocators
//!
//! Three allocators over the memory the boot layer discovered:
//!
//! - [`FrameAllocator`]: a flat free list of 4 KiB frames with reference
//!   counting; the **sole** general-purpose source of single frames.
//! - [`BuddyAllocator`]: power-of-two blocks for multi-page contiguous
//!   allocations (DMA buffers, large tables), fed disjoint zones so it can
//!   never hand out a byte the frame allocator also owns.
//! - [`KernelHeap`]: byte-granular `alloc`/`free` with segregated size
//!   classes, header validation and physical-neighbor coalescing.
//!
//! All bookkeeping is arena + index: free lists are linked `u32` indices
//! (or byte offsets, for the heap) into flat descriptor storage, never
//! chains of raw pointers.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

mod buddy;
mod frame;
mod heap;

pub use buddy::{BlockDesc, BuddyAllocator, BuddyError};
pub use frame::{FrameAllocator, FrameDesc, FrameError, FrameState};
pub use heap::{HeapError, HeapGrow, KernelHeap, MIN_CLASS_BYTES};

bitflags::bitflags! {
    /// Allocation request modifiers, shared by the frame and buddy
    /// allocators.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct AllocFlags: u32 {
        /// Zero the memory through the phys→virt helper before returning.
        const ZERO = 1 << 0;
        /// Only satisfy from zones below the ISA DMA limit.
        const DMA  = 1 << 1;
    }
}

/// Index sentinel for all intrusive `u32` lists in this crate.
pub(crate) const NIL: u32 = u32::MAX;
