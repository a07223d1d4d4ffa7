//! Reservation registry for physical ranges the allocators must not touch.
//!
//! Registered once at bootstrap, before the frame or buddy allocator
//! ingests the memory map; that ordering is load-bearing, since the first
//! reservation is the allocators' own descriptor storage.

use kernel_info::memory::{MAX_RESERVATIONS, PAGE_SIZE};
use kernel_vmem::{PhysAddr, align_down, align_up};

bitflags::bitflags! {
    /// Per-reservation behavior flags.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct ResFlags: u32 {
        /// Excluded from the frame and buddy allocators.
        const NO_ALLOC    = 1 << 0;
        /// May be resolved by the phys→virt helper (MMIO, framebuffer);
        /// reservations without this bit are rejected at translation time.
        const TRANSLATABLE = 1 << 1;
    }
}

/// What a reservation protects; informational except where noted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReservationKind {
    /// The allocators' own descriptor arrays (the bootstrap carve-out).
    AllocatorMetadata,
    /// Kernel image code and data.
    KernelImage,
    /// Firmware/ACPI tables.
    FirmwareTables,
    /// Memory-mapped device registers.
    Mmio,
    /// Bootloader framebuffer.
    Framebuffer,
}

/// One page-granular reserved physical range `[base, end)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Reservation {
    pub base: u64,
    pub end: u64,
    pub kind: ReservationKind,
    pub flags: ResFlags,
    pub label: &'static str,
}

impl Reservation {
    #[inline]
    #[must_use]
    pub const fn contains(&self, pa: PhysAddr) -> bool {
        let a = pa.as_u64();
        self.base <= a && a < self.end
    }

    #[inline]
    #[must_use]
    const fn overlaps(&self, base: u64, end: u64) -> bool {
        self.base < end && base < self.end
    }

    /// Overlapping **or adjacent**, the merge criterion.
    #[inline]
    #[must_use]
    const fn touches(&self, base: u64, end: u64) -> bool {
        self.base <= end && base <= self.end
    }
}

/// Rejected registry requests. All are soft failures at the caller's
/// discretion; none of them corrupt existing reservations.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum RegistryError {
    /// Zero-length ranges carry no information.
    #[error("zero-length reservation")]
    ZeroLength,
    /// The bounded table is full; the request was dropped.
    #[error("reservation registry capacity exceeded")]
    CapacityExceeded,
}

/// Bounded, base-sorted table of [`Reservation`]s.
pub struct ReservationRegistry {
    entries: [Reservation; MAX_RESERVATIONS],
    len: usize,
}

const EMPTY: Reservation = Reservation {
    base: 0,
    end: 0,
    kind: ReservationKind::FirmwareTables,
    flags: ResFlags::empty(),
    label: "",
};

impl ReservationRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [EMPTY; MAX_RESERVATIONS],
            len: 0,
        }
    }

    /// Register `[base, base+length)` as reserved.
    ///
    /// Boundaries are widened to page granularity (base down, end up)
    /// before storage; a reservation never silently shrinks. Overlapping
    /// or adjacent entries of the same kind and flags are merged in place
    /// instead of duplicated. A full table logs and drops the request;
    /// a handful of missed reservations is recoverable by later
    /// validation, unlike silent corruption.
    pub fn add(
        &mut self,
        base: PhysAddr,
        length: u64,
        kind: ReservationKind,
        flags: ResFlags,
        label: &'static str,
    ) -> Result<(), RegistryError> {
        if length == 0 {
            log::warn!("rejecting zero-length reservation '{label}'");
            return Err(RegistryError::ZeroLength);
        }
        let mut new_base = align_down(base.as_u64(), PAGE_SIZE);
        let mut new_end = align_up(base.as_u64() + length, PAGE_SIZE);

        // Absorb every mergeable existing entry into the new range.
        let mut i = 0;
        while i < self.len {
            let e = self.entries[i];
            if e.kind == kind && e.flags == flags && e.touches(new_base, new_end) {
                new_base = new_base.min(e.base);
                new_end = new_end.max(e.end);
                self.remove(i);
            } else {
                i += 1;
            }
        }

        if self.len == MAX_RESERVATIONS {
            log::warn!(
                "reservation registry full, dropping '{label}' ({:#x}..{:#x})",
                new_base,
                new_end
            );
            return Err(RegistryError::CapacityExceeded);
        }

        // Sorted insertion by base.
        let pos = self.entries[..self.len]
            .iter()
            .position(|e| e.base > new_base)
            .unwrap_or(self.len);
        self.entries.copy_within(pos..self.len, pos + 1);
        self.entries[pos] = Reservation {
            base: new_base,
            end: new_end,
            kind,
            flags,
            label,
        };
        self.len += 1;
        log::debug!("reserved {new_base:#x}..{new_end:#x} '{label}'");
        Ok(())
    }

    fn remove(&mut self, index: usize) {
        self.entries.copy_within(index + 1..self.len, index);
        self.len -= 1;
    }

    /// All reservations, sorted by base.
    #[inline]
    #[must_use]
    pub fn entries(&self) -> &[Reservation] {
        &self.entries[..self.len]
    }

    /// The reservation owning `pa`, if any.
    #[must_use]
    pub fn find(&self, pa: PhysAddr) -> Option<&Reservation> {
        self.entries().iter().find(|r| r.contains(pa))
    }

    /// Whether any reservation overlaps `[base, base+length)`.
    #[must_use]
    pub fn is_range_reserved(&self, base: PhysAddr, length: u64) -> bool {
        let end = base.as_u64() + length;
        self.entries().iter().any(|r| r.overlaps(base.as_u64(), end))
    }

    /// Whether an allocator must skip `[base, base+length)`.
    #[must_use]
    pub fn blocks_allocation(&self, base: PhysAddr, length: u64) -> bool {
        let end = base.as_u64() + length;
        self.entries()
            .iter()
            .any(|r| r.flags.contains(ResFlags::NO_ALLOC) && r.overlaps(base.as_u64(), end))
    }

    /// Whether the phys→virt helper may hand out a pointer into `pa`.
    ///
    /// Unreserved addresses are translatable; reserved ones only when the
    /// reservation carries [`ResFlags::TRANSLATABLE`].
    #[must_use]
    pub fn is_translatable(&self, pa: PhysAddr) -> bool {
        self.find(pa)
            .is_none_or(|r| r.flags.contains(ResFlags::TRANSLATABLE))
    }
}

impl Default for ReservationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NA: ResFlags = ResFlags::NO_ALLOC;

    #[test]
    fn boundaries_widen_to_pages() {
        let mut reg = ReservationRegistry::new();
        reg.add(PhysAddr::new(0x1234), 0x100, ReservationKind::FirmwareTables, NA, "t")
            .unwrap();
        let r = reg.find(PhysAddr::new(0x1000)).expect("rounded down");
        assert_eq!(r.base, 0x1000);
        assert_eq!(r.end, 0x2000);
    }

    #[test]
    fn adjacent_same_kind_merges() {
        let mut reg = ReservationRegistry::new();
        reg.add(PhysAddr::new(0x1000), 0x1000, ReservationKind::Mmio, NA, "a")
            .unwrap();
        reg.add(PhysAddr::new(0x2000), 0x1000, ReservationKind::Mmio, NA, "b")
            .unwrap();
        assert_eq!(reg.entries().len(), 1);
        assert_eq!(reg.entries()[0].base, 0x1000);
        assert_eq!(reg.entries()[0].end, 0x3000);
    }

    #[test]
    fn overlapping_merge_bridges_entries() {
        let mut reg = ReservationRegistry::new();
        reg.add(PhysAddr::new(0x1000), 0x1000, ReservationKind::Mmio, NA, "a")
            .unwrap();
        reg.add(PhysAddr::new(0x4000), 0x1000, ReservationKind::Mmio, NA, "c")
            .unwrap();
        // Spans both, plus the gap.
        reg.add(PhysAddr::new(0x1800), 0x3000, ReservationKind::Mmio, NA, "b")
            .unwrap();
        assert_eq!(reg.entries().len(), 1);
        assert_eq!(reg.entries()[0].base, 0x1000);
        assert_eq!(reg.entries()[0].end, 0x5000);
    }

    #[test]
    fn different_kinds_do_not_merge() {
        let mut reg = ReservationRegistry::new();
        reg.add(PhysAddr::new(0x1000), 0x1000, ReservationKind::Mmio, NA, "a")
            .unwrap();
        reg.add(PhysAddr::new(0x2000), 0x1000, ReservationKind::Framebuffer, NA, "b")
            .unwrap();
        assert_eq!(reg.entries().len(), 2);
    }

    #[test]
    fn zero_length_rejected() {
        let mut reg = ReservationRegistry::new();
        assert_eq!(
            reg.add(PhysAddr::new(0x1000), 0, ReservationKind::Mmio, NA, "z"),
            Err(RegistryError::ZeroLength)
        );
        assert!(reg.entries().is_empty());
    }

    #[test]
    fn capacity_overflow_is_soft() {
        let mut reg = ReservationRegistry::new();
        for i in 0..MAX_RESERVATIONS as u64 {
            // Disjoint, non-adjacent, so nothing merges.
            reg.add(
                PhysAddr::new(i * 0x10_0000),
                0x1000,
                ReservationKind::Mmio,
                NA,
                "fill",
            )
            .unwrap();
        }
        assert_eq!(
            reg.add(
                PhysAddr::new(0xffff_0000_0000),
                0x1000,
                ReservationKind::Mmio,
                NA,
                "extra"
            ),
            Err(RegistryError::CapacityExceeded)
        );
        // Existing reservations are untouched.
        assert_eq!(reg.entries().len(), MAX_RESERVATIONS);
    }

    #[test]
    fn range_and_allocation_queries() {
        let mut reg = ReservationRegistry::new();
        reg.add(PhysAddr::new(0x10_0000), 0x4000, ReservationKind::AllocatorMetadata, NA, "meta")
            .unwrap();
        reg.add(
            PhysAddr::new(0xfee0_0000),
            0x1000,
            ReservationKind::Mmio,
            ResFlags::NO_ALLOC | ResFlags::TRANSLATABLE,
            "lapic",
        )
        .unwrap();

        assert!(reg.is_range_reserved(PhysAddr::new(0x10_2000), 0x1000));
        assert!(!reg.is_range_reserved(PhysAddr::new(0x20_0000), 0x1000));
        assert!(reg.blocks_allocation(PhysAddr::new(0xf_f000), 0x2000));

        // Metadata is reserved but not translatable; the LAPIC page is both.
        assert!(!reg.is_translatable(PhysAddr::new(0x10_0000)));
        assert!(reg.is_translatable(PhysAddr::new(0xfee0_0000)));
        assert!(reg.is_translatable(PhysAddr::new(0x5000_0000)));
    }
}
