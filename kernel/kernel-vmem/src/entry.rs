//! Hardware page-table entry, bit-exact per the AMD64/Intel manuals.

use crate::MapFlags;
use crate::addresses::PhysAddr;
use bitfield_struct::bitfield;

/// One 64-bit x86-64 page-table entry in its raw bitfield form.
///
/// Models the common superset of fields found in all four paging levels
/// (PML4E, PDPTE, PDE, PTE). An entry either points to a next-level table
/// or, with the `huge` (PS) bit set at the PDPT/PD level, directly maps a
/// physical page.
///
/// ### Bit layout
///
/// | Bits  | Name | Meaning |
/// |-------|------|---------|
/// | 0     | `P`  | Present |
/// | 1     | `RW` | Writable |
/// | 2     | `US` | User-accessible |
/// | 3     | `PWT`| Write-through caching |
/// | 4     | `PCD`| Cache disable |
/// | 5     | `A`  | Accessed |
/// | 6     | `D`  | Dirty (leaf only) |
/// | 7     | `PS` | Huge page (PDPTE/PDE only; PAT in a PTE, kept 0 here) |
/// | 8     | `G`  | Global (leaf only) |
/// | 9–11  | –    | OS-available |
/// | 12–51 | addr | Physical base, 4 KiB aligned |
/// | 52–58 | –    | OS-available |
/// | 59–62 | PKU  | Protection key / OS use |
/// | 63    | `NX` | Execute disable |
#[bitfield(u64)]
pub struct PageEntry {
    /// Present (P, bit 0). Clear means not mapped; access faults.
    pub present: bool,

    /// Writable (RW, bit 1). Clear for read-only.
    pub writable: bool,

    /// User/Supervisor (US, bit 2). Set to allow CPL3 access.
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4). Set for MMIO-backed mappings.
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU on first access.
    pub accessed: bool,

    /// Dirty (D, bit 6), leaf only. Set by the CPU on first write.
    pub dirty: bool,

    /// Huge page / Page Size (PS, bit 7).
    ///
    /// Valid only at PDPT (1 GiB leaf) and PD (2 MiB leaf) level; must be
    /// clear in PML4E and PTE entries.
    pub huge: bool,

    /// Global (G, bit 8), leaf only. Survives CR3 reloads when CR4.PGE.
    pub global: bool,

    /// OS-available (bits 9..=11).
    #[bits(3)]
    pub os_low: u8,

    /// Physical base address bits [51:12].
    #[bits(40)]
    frame_bits: u64,

    /// OS-available (bits 52..=58).
    #[bits(7)]
    pub os_high: u8,

    /// Protection key (bits 59..=62) when PKU is active; OS use otherwise.
    #[bits(4)]
    pub protection_key: u8,

    /// No-Execute (NX, bit 63). Requires `EFER.NXE`.
    pub no_execute: bool,
}

impl PageEntry {
    /// Store the page-aligned physical base address (low 12 bits dropped).
    #[inline]
    pub const fn set_address(&mut self, phys: PhysAddr) {
        self.set_frame_bits(phys.as_u64() >> 12);
    }

    /// The physical base address carried by this entry.
    #[inline]
    #[must_use]
    pub const fn address(&self) -> PhysAddr {
        PhysAddr::new(self.frame_bits() << 12)
    }

    /// A non-leaf entry pointing at the next-level table.
    ///
    /// Non-leaf links are created present + writable; `user` must be set
    /// whenever any user-accessible leaf will hang below this entry, since
    /// the effective permission is the intersection over the walk.
    #[inline]
    #[must_use]
    pub fn table(next: PhysAddr, user: bool) -> Self {
        let mut e = Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(user);
        e.set_address(next);
        e
    }

    /// A leaf entry mapping `base` with `flags`; `huge` selects a PDPTE/PDE
    /// large-page leaf.
    #[inline]
    #[must_use]
    pub fn leaf(base: PhysAddr, flags: MapFlags, huge: bool) -> Self {
        let mut e = Self::new()
            .with_present(true)
            .with_huge(huge)
            .with_writable(flags.contains(MapFlags::WRITABLE))
            .with_user_access(flags.contains(MapFlags::USER))
            .with_global(flags.contains(MapFlags::GLOBAL))
            .with_write_through(flags.contains(MapFlags::WRITE_THROUGH))
            .with_cache_disabled(flags.contains(MapFlags::CACHE_DISABLE))
            .with_no_execute(flags.contains(MapFlags::NO_EXECUTE));
        e.set_address(base);
        e
    }

    /// The cleared (not-present) entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_positions_match_hardware_layout() {
        let mut e = PageEntry::new().with_present(true);
        assert_eq!(e.into_bits(), 1 << 0);
        e = PageEntry::new().with_writable(true);
        assert_eq!(e.into_bits(), 1 << 1);
        e = PageEntry::new().with_user_access(true);
        assert_eq!(e.into_bits(), 1 << 2);
        e = PageEntry::new().with_write_through(true);
        assert_eq!(e.into_bits(), 1 << 3);
        e = PageEntry::new().with_cache_disabled(true);
        assert_eq!(e.into_bits(), 1 << 4);
        e = PageEntry::new().with_accessed(true);
        assert_eq!(e.into_bits(), 1 << 5);
        e = PageEntry::new().with_dirty(true);
        assert_eq!(e.into_bits(), 1 << 6);
        e = PageEntry::new().with_huge(true);
        assert_eq!(e.into_bits(), 1 << 7);
        e = PageEntry::new().with_global(true);
        assert_eq!(e.into_bits(), 1 << 8);
        e = PageEntry::new().with_no_execute(true);
        assert_eq!(e.into_bits(), 1 << 63);
    }

    #[test]
    fn address_occupies_bits_12_to_51() {
        let mut e = PageEntry::new();
        e.set_address(PhysAddr::new(0x0008_f00d_e000));
        assert_eq!(e.into_bits(), 0x0008_f00d_e000);
        assert_eq!(e.address().as_u64(), 0x0008_f00d_e000);

        // Low 12 bits of the input are dropped, flag bits untouched.
        let mut e = PageEntry::new().with_present(true);
        e.set_address(PhysAddr::new(0x1fff));
        assert_eq!(e.address().as_u64(), 0x1000);
        assert!(e.present());
    }

    #[test]
    fn leaf_carries_requested_flags() {
        let e = PageEntry::leaf(
            PhysAddr::new(0x20_0000),
            MapFlags::WRITABLE | MapFlags::GLOBAL | MapFlags::NO_EXECUTE,
            true,
        );
        assert!(e.present());
        assert!(e.writable());
        assert!(e.global());
        assert!(e.no_execute());
        assert!(e.huge());
        assert!(!e.user_access());
        assert_eq!(e.address().as_u64(), 0x20_0000);
    }
}
