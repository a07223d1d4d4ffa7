//! 512-entry hardware tables and the translation-level walk order.

use crate::addresses::VirtAddr;
use crate::entry::PageEntry;

/// Entries per table at every level (2⁹ × 8 bytes = 4 KiB).
pub const ENTRY_COUNT: usize = 512;

/// First PML4 slot of the kernel half (VA bit 47 set).
pub const KERNEL_HALF_FIRST_INDEX: usize = 256;

/// One of the four translation levels, in walk order.
///
/// Walks iterate over these explicitly; there is no recursion anywhere in
/// the table code, so stack depth is fixed and obvious.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Level {
    /// Page Map Level 4: the per-address-space root, referenced by CR3.
    Pml4,
    /// Page Directory Pointer Table; a PS=1 entry here is a 1 GiB leaf.
    Pdpt,
    /// Page Directory; a PS=1 entry here is a 2 MiB leaf.
    Pd,
    /// Page Table; entries are always 4 KiB leaves.
    Pt,
}

impl Level {
    /// Bit position of this level's 9-bit index within a virtual address.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Pml4 => 39,
            Self::Pdpt => 30,
            Self::Pd => 21,
            Self::Pt => 12,
        }
    }

    /// This level's table index for `va`.
    #[inline]
    #[must_use]
    pub const fn index_of(self, va: VirtAddr) -> usize {
        ((va.as_u64() >> self.shift()) & 0x1ff) as usize
    }

    /// The next level down; `Pt` is terminal.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        match self {
            Self::Pml4 => Self::Pdpt,
            Self::Pdpt => Self::Pd,
            Self::Pd | Self::Pt => Self::Pt,
        }
    }
}

/// A 4 KiB-aligned table of 512 [`PageEntry`]s, one per level.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntry; ENTRY_COUNT],
}

impl PageTable {
    /// An empty (all not-present) table.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            entries: [PageEntry::zero(); ENTRY_COUNT],
        }
    }

    /// Clear every entry. Fresh table frames must be zeroed before they are
    /// linked into a live hierarchy.
    pub const fn zero(&mut self) {
        self.entries = [PageEntry::zero(); ENTRY_COUNT];
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, index: usize) -> PageEntry {
        self.entries[index]
    }

    #[inline]
    pub const fn set(&mut self, index: usize, entry: PageEntry) {
        self.entries[index] = entry;
    }
}

/// The four per-level indices of `va`, in walk order.
#[inline]
#[must_use]
pub const fn split_indices(va: VirtAddr) -> [usize; 4] {
    [
        Level::Pml4.index_of(va),
        Level::Pdpt.index_of(va),
        Level::Pd.index_of(va),
        Level::Pt.index_of(va),
    ]
}
