//! Normalized firmware memory map.
//!
//! The boot layer hands the kernel an ordered list of `(base, length, kind)`
//! regions plus an optional direct-map offset; this module is the kernel's
//! owned copy of that list. Only [`RegionKind::Usable`] regions ever feed
//! the allocators.

use kernel_info::memory::{MAX_REGIONS, PAGE_SIZE};
use kernel_vmem::PhysAddr;

/// Classification of one firmware-reported physical region.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegionKind {
    /// Conventional RAM, free for allocator use.
    Usable,
    /// Firmware-reserved; never allocated, never translated.
    Reserved,
    /// ACPI tables the kernel may reclaim after parsing.
    AcpiReclaimable,
    /// ACPI non-volatile storage.
    AcpiNvs,
    /// Memory-mapped device registers (APIC, HPET, PCI BARs).
    Mmio,
    /// The bootloader-provided framebuffer.
    Framebuffer,
    /// Physical pages holding the kernel image itself.
    KernelImage,
}

impl RegionKind {
    /// Whether regions of this kind contribute frames to the allocators.
    #[inline]
    #[must_use]
    pub const fn is_usable(self) -> bool {
        matches!(self, Self::Usable)
    }
}

/// One `(base, length, kind)` region as reported by the boot layer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryMapEntry {
    pub base: PhysAddr,
    pub length: u64,
    pub kind: RegionKind,
}

impl MemoryMapEntry {
    /// Exclusive end address of the region.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.as_u64() + self.length
    }

    /// The page-aligned interior of the region: base rounded up, end
    /// rounded down. Partial edge pages are unusable as frames.
    #[must_use]
    pub const fn aligned_span(&self) -> (u64, u64) {
        let start = kernel_vmem::align_up(self.base.as_u64(), PAGE_SIZE);
        let end = kernel_vmem::align_down(self.end(), PAGE_SIZE);
        (start, end)
    }
}

/// The kernel's copy of the firmware memory map, sorted by base address.
///
/// Bounded table; firmware maps exceeding [`MAX_REGIONS`] entries drop the
/// excess with a warning (real maps on the supported platforms are far
/// smaller).
pub struct MemoryMap {
    entries: [MemoryMapEntry; MAX_REGIONS],
    len: usize,
}

const EMPTY_ENTRY: MemoryMapEntry = MemoryMapEntry {
    base: PhysAddr::ZERO,
    length: 0,
    kind: RegionKind::Reserved,
};

impl MemoryMap {
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            entries: [EMPTY_ENTRY; MAX_REGIONS],
            len: 0,
        }
    }

    /// Copy, filter and sort the boot layer's region list.
    ///
    /// Zero-length regions are dropped silently; regions beyond capacity
    /// are dropped with a warning.
    #[must_use]
    pub fn from_entries(raw: &[MemoryMapEntry]) -> Self {
        let mut map = Self::empty();
        for e in raw {
            if e.length == 0 {
                continue;
            }
            if map.len == MAX_REGIONS {
                log::warn!("memory map overflow, dropping region at {}", e.base);
                continue;
            }
            map.entries[map.len] = *e;
            map.len += 1;
        }
        map.entries[..map.len].sort_unstable_by_key(|e| e.base);
        map
    }

    /// All regions, sorted by base.
    #[inline]
    #[must_use]
    pub fn entries(&self) -> &[MemoryMapEntry] {
        &self.entries[..self.len]
    }

    /// Only the regions that may feed the allocators.
    pub fn usable(&self) -> impl Iterator<Item = &MemoryMapEntry> {
        self.entries().iter().filter(|e| e.kind.is_usable())
    }

    /// The single largest usable region; bootstrap metadata is carved from
    /// its front.
    #[must_use]
    pub fn largest_usable(&self) -> Option<MemoryMapEntry> {
        self.usable().copied().max_by_key(|e| e.length)
    }

    /// Exclusive end of the highest usable region; sizes the frame
    /// descriptor array (`end / 4096` descriptors).
    #[must_use]
    pub fn highest_usable_end(&self) -> u64 {
        self.usable().map(MemoryMapEntry::end).max().unwrap_or(0)
    }

    /// Total bytes of usable RAM (unaligned, informational).
    #[must_use]
    pub fn total_usable_bytes(&self) -> u64 {
        self.usable().map(|e| e.length).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(base: u64, length: u64, kind: RegionKind) -> MemoryMapEntry {
        MemoryMapEntry {
            base: PhysAddr::new(base),
            length,
            kind,
        }
    }

    #[test]
    fn sorts_and_filters() {
        let map = MemoryMap::from_entries(&[
            entry(0x10_0000, 0x40_0000, RegionKind::KernelImage),
            entry(0x0, 0x9_f000, RegionKind::Usable),
            entry(0x5000_0000, 0, RegionKind::Usable), // dropped
            entry(0x100_0000, 0x1f00_0000, RegionKind::Usable),
        ]);
        assert_eq!(map.entries().len(), 3);
        assert!(map.entries().windows(2).all(|w| w[0].base <= w[1].base));
        assert_eq!(map.usable().count(), 2);
    }

    #[test]
    fn largest_and_highest() {
        let map = MemoryMap::from_entries(&[
            entry(0x0, 0x9_f000, RegionKind::Usable),
            entry(0x100_0000, 0x1f00_0000, RegionKind::Usable),
            entry(0xfee0_0000, 0x1000, RegionKind::Mmio),
        ]);
        assert_eq!(map.largest_usable().unwrap().base, PhysAddr::new(0x100_0000));
        assert_eq!(map.highest_usable_end(), 0x2000_0000);
        assert_eq!(map.total_usable_bytes(), 0x9_f000 + 0x1f00_0000);
    }

    #[test]
    fn aligned_span_trims_partial_pages() {
        let e = entry(0x1234, 0x5000, RegionKind::Usable);
        let (start, end) = e.aligned_span();
        assert_eq!(start, 0x2000);
        assert_eq!(end, 0x6000);
    }
}
