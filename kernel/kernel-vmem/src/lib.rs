//! # Virtual Memory Support
//!
//! x86-64 four-level paging for the kernel: typed addresses, the bit-exact
//! hardware entry, 512-entry tables, and an [`AddressSpace`] that maps,
//! unmaps and translates with rollback-safe failure handling.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! Each 48-bit virtual address is divided into five fields:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! The CPU uses these fields as indices into four levels of page tables,
//! each containing 512 entries of 64 bits:
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  physical page
//!            PS=1 ↘    PS=1 ↘
//!            1 GiB leaf  2 MiB leaf
//! ```
//!
//! A PTE is always a 4 KiB leaf; a PDE or PDPTE with `PS=1` terminates the
//! walk early as a 2 MiB or 1 GiB "huge" leaf. The `PS` bit is never valid
//! at the PML4 or PT level, and the typed `map_*` entry points make that
//! state unrepresentable.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod address_space;
mod addresses;
mod entry;
mod page_table;

pub use address_space::{AddressSpace, MapError, UnmapError};
pub use addresses::{PhysAddr, VirtAddr};
pub use entry::PageEntry;
pub use page_table::{ENTRY_COUNT, KERNEL_HALF_FIRST_INDEX, Level, PageTable, split_indices};

/// Supported x86-64 page sizes.
///
/// 4 KiB pages are mapped through the PT level; 2 MiB and 1 GiB are huge
/// pages that terminate early at PD or PDPT.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageSize {
    /// 4 KiB page mapped by a PTE (PT leaf).
    Size4K,
    /// 2 MiB page mapped by a PDE with `PS=1` (PD leaf).
    Size2M,
    /// 1 GiB page mapped by a PDPTE with `PS=1` (PDPT leaf).
    Size1G,
}

impl PageSize {
    /// Mapping granule in bytes; also the required VA/PA alignment.
    #[inline]
    #[must_use]
    pub const fn bytes(self) -> u64 {
        match self {
            Self::Size4K => 4096,
            Self::Size2M => 2 * 1024 * 1024,
            Self::Size1G => 1024 * 1024 * 1024,
        }
    }

    /// The level whose table holds this size's leaf entry.
    #[inline]
    #[must_use]
    pub const fn leaf_level(self) -> Level {
        match self {
            Self::Size4K => Level::Pt,
            Self::Size2M => Level::Pd,
            Self::Size1G => Level::Pdpt,
        }
    }
}

bitflags::bitflags! {
    /// Software-visible mapping permissions and attributes.
    ///
    /// Translated into hardware [`PageEntry`] bits by the mapping calls;
    /// `PRESENT` and `PS` are managed internally and never exposed here.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct MapFlags: u32 {
        /// Writes allowed (RW).
        const WRITABLE      = 1 << 0;
        /// User-mode access allowed (US); also propagated to non-leaf links.
        const USER          = 1 << 1;
        /// Survives CR3 reloads (G); kernel-half mappings only.
        const GLOBAL        = 1 << 2;
        /// Instruction fetch disallowed (NX).
        const NO_EXECUTE    = 1 << 3;
        /// Write-through caching (PWT); MMIO-adjacent mappings.
        const WRITE_THROUGH = 1 << 4;
        /// Caching disabled (PCD); device memory.
        const CACHE_DISABLE = 1 << 5;
    }
}

/// Minimal frame allocator used to obtain **physical** 4 KiB frames for
/// page tables.
///
/// The implementation decides where frames come from. Returned frames must
/// be 4 KiB aligned; `alloc_4k` returns `None` on out-of-memory. `free_4k`
/// exists so a failed mapping call can return the tables it allocated.
pub trait FrameAlloc {
    /// Allocate one 4 KiB physical frame. Must return page-aligned frames.
    fn alloc_4k(&mut self) -> Option<PhysAddr>;

    /// Return a frame previously obtained from `alloc_4k`.
    fn free_4k(&mut self, frame: PhysAddr);
}

/// Converts physical addresses to usable pointers in the current virtual
/// address space (identity map, higher-half direct map, …).
///
/// # Safety
/// - `pa` must be mapped writable in the current page tables for `&mut T`.
/// - Lifetime `'a` is purely borrow-checked; the mapping must remain valid
///   for `'a`.
/// - Type `T` must match the bytes at `pa` (no aliasing UB).
pub trait PhysMapper {
    /// Convert a physical address to a usable mutable pointer.
    ///
    /// # Safety
    /// See the trait-level contract.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysAddr) -> &'a mut T;
}

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be non-zero and a power of two; no runtime checks are made.
///
/// ### Examples
/// ```rust
/// # use kernel_vmem::align_down;
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(4096, 4096), 4096);
/// assert_eq!(align_down(0x12345, 16), 0x12340);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// `a` must be non-zero and a power of two; `x + (a - 1)` must not
/// overflow.
///
/// ### Examples
/// ```rust
/// # use kernel_vmem::align_up;
/// assert_eq!(align_up(1, 4096), 4096);
/// assert_eq!(align_up(4096, 4096), 4096);
/// assert_eq!(align_up(0x12345, 16), 0x12350);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}
