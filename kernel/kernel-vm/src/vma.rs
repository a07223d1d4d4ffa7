//! Virtual memory areas: what a process's lower half is allowed to hold.

use kernel_info::memory::PAGE_SIZE;
use kernel_vmem::{MapFlags, VirtAddr};

bitflags::bitflags! {
    /// Access permissions of one area.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct VmaPerms: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

/// Purpose of an area within the canonical process layout.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VmaKind {
    Code,
    Data,
    Heap,
    Stack,
}

/// One contiguous, page-aligned, uniformly-permissioned region
/// `[start, end)` of a process's address space.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Vma {
    pub start: u64,
    pub end: u64,
    pub kind: VmaKind,
    pub perms: VmaPerms,
}

impl Vma {
    #[must_use]
    pub const fn new(start: u64, end: u64, kind: VmaKind, perms: VmaPerms) -> Self {
        Self {
            start,
            end,
            kind,
            perms,
        }
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, va: VirtAddr) -> bool {
        self.start <= va.as_u64() && va.as_u64() < self.end
    }

    #[inline]
    #[must_use]
    pub const fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }

    #[inline]
    #[must_use]
    pub const fn pages(&self) -> u64 {
        (self.end - self.start) / PAGE_SIZE
    }

    /// Hardware mapping flags for pages of this area. Process pages are
    /// always user-accessible; NX tracks the absence of `EXEC`.
    #[must_use]
    pub fn map_flags(&self) -> MapFlags {
        let mut flags = MapFlags::USER;
        if self.perms.contains(VmaPerms::WRITE) {
            flags |= MapFlags::WRITABLE;
        }
        if !self.perms.contains(VmaPerms::EXEC) {
            flags |= MapFlags::NO_EXECUTE;
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn containment_and_overlap() {
        let v = Vma::new(0x40_0000, 0x80_0000, VmaKind::Code, VmaPerms::READ | VmaPerms::EXEC);
        assert!(v.contains(VirtAddr::new(0x40_0000)));
        assert!(v.contains(VirtAddr::new(0x7f_ffff)));
        assert!(!v.contains(VirtAddr::new(0x80_0000)));
        assert!(v.overlaps(0x70_0000, 0x90_0000));
        assert!(!v.overlaps(0x80_0000, 0x90_0000));
    }

    #[test]
    fn map_flags_follow_perms() {
        let code = Vma::new(0, PAGE_SIZE, VmaKind::Code, VmaPerms::READ | VmaPerms::EXEC);
        assert_eq!(code.map_flags(), MapFlags::USER);

        let data = Vma::new(0, PAGE_SIZE, VmaKind::Data, VmaPerms::READ | VmaPerms::WRITE);
        assert_eq!(
            data.map_flags(),
            MapFlags::USER | MapFlags::WRITABLE | MapFlags::NO_EXECUTE
        );
    }
}
