//! # Address Space (x86-64, PML4-rooted)
//!
//! Map/unmap/translate over the four-level tree rooted at one PML4.
//!
//! ## Design
//!
//! - Walks are explicit iterative loops over [`Level`]; no recursion.
//! - Mapping an **already present** target is an error, never an overwrite;
//!   the absent → present transition is the only one `map_*` performs.
//! - Every intermediate table allocated during one `map_*` call is unwound
//!   and returned to the frame allocator if the call fails mid-walk, so no
//!   partial mapping is ever observable.
//! - `unmap` clears the terminal entry only; emptied intermediate tables
//!   are not reclaimed (internal fragmentation, not a correctness issue).
//! - Non-leaf links are created present + writable, with `US` propagated
//!   from the mapping flags (the effective permission is the intersection
//!   over the walk).
//!
//! ## Safety
//!
//! - Mutating the **active** space requires TLB maintenance afterwards
//!   (`kernel_cpu::invlpg` per page or a CR3 reload); that is the caller's
//!   job, since only the caller knows which space is live.
//! - The [`PhysMapper`] must yield writable references to table frames.

use crate::addresses::{PhysAddr, VirtAddr};
use crate::entry::PageEntry;
use crate::page_table::{ENTRY_COUNT, KERNEL_HALF_FIRST_INDEX, Level, PageTable, split_indices};
use crate::{FrameAlloc, MapFlags, PageSize, PhysMapper};

/// Failure modes of `map_4k`/`map_2m`/`map_1g`.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    /// The target entry (or an entry on the walk to it) is already present.
    #[error("target is already mapped")]
    AlreadyMapped,
    /// Virtual or physical address not aligned to the requested page size.
    #[error("address not aligned to the requested page size")]
    Unaligned,
    /// The frame allocator could not supply an intermediate table frame.
    /// All tables allocated by the failing call have been freed again.
    #[error("out of physical memory for page tables")]
    OutOfMemory,
}

/// Failure modes of `unmap`.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum UnmapError {
    /// No leaf of any size is mapped at the given address.
    #[error("address is not mapped")]
    NotMapped,
}

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysAddr, // PML4 frame
    mapper: &'m M,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Wrap an existing PML4 frame (e.g. one just allocated and zeroed).
    #[inline]
    pub const fn from_root(mapper: &'m M, root: PhysAddr) -> Self {
        Self { root, mapper }
    }

    /// View the **currently active** address space by reading CR3.
    ///
    /// # Safety
    /// - Must run at CPL0 with paging enabled.
    /// - Assumes CR3 points at a valid PML4 frame.
    #[inline]
    pub unsafe fn from_current(mapper: &'m M) -> Self {
        let root = PhysAddr::new(unsafe { kernel_cpu::read_cr3() });
        Self { root, mapper }
    }

    /// Physical address of the PML4.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysAddr {
        self.root
    }

    /// Load CR3 with this space's root, making it the active translation.
    ///
    /// # Safety
    /// The space's kernel-half mappings must cover the currently executing
    /// code, data and stack, or the switch faults immediately.
    #[inline]
    pub unsafe fn activate(&self) {
        unsafe { kernel_cpu::write_cr3(self.root.as_u64()) }
    }

    /// Borrow the table stored in `frame` through the mapper.
    #[inline]
    fn table_mut(&self, frame: PhysAddr) -> &mut PageTable {
        // SAFETY: `frame` is a table frame owned by this hierarchy and the
        // mapper yields writable access to it.
        unsafe { self.mapper.phys_to_mut::<PageTable>(frame) }
    }

    /// Copy the kernel-half PML4 slots (256..512) from `src`.
    ///
    /// Process roots are created by cloning the kernel's upper half so
    /// kernel code, data and interrupt handlers stay valid under every
    /// address space without retranslation.
    pub fn copy_higher_half_from(&self, src: &Self) {
        let dst = self.table_mut(self.root);
        let src = src.table_mut(src.root);
        for i in KERNEL_HALF_FIRST_INDEX..ENTRY_COUNT {
            dst.set(i, src.get(i));
        }
    }

    /// Map one 4 KiB page `va → pa`.
    pub fn map_4k<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtAddr,
        pa: PhysAddr,
        flags: MapFlags,
    ) -> Result<(), MapError> {
        self.map_one(alloc, va, pa, flags, PageSize::Size4K)
    }

    /// Map one 2 MiB page as a PS=1 leaf at the PD level.
    pub fn map_2m<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtAddr,
        pa: PhysAddr,
        flags: MapFlags,
    ) -> Result<(), MapError> {
        self.map_one(alloc, va, pa, flags, PageSize::Size2M)
    }

    /// Map one 1 GiB page as a PS=1 leaf at the PDPT level.
    pub fn map_1g<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtAddr,
        pa: PhysAddr,
        flags: MapFlags,
    ) -> Result<(), MapError> {
        self.map_one(alloc, va, pa, flags, PageSize::Size1G)
    }

    fn map_one<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtAddr,
        pa: PhysAddr,
        flags: MapFlags,
        size: PageSize,
    ) -> Result<(), MapError> {
        let granule = size.bytes();
        if !va.is_aligned(granule) || !pa.is_aligned(granule) {
            return Err(MapError::Unaligned);
        }

        // Tables allocated by *this call*, as (parent frame, parent index,
        // new table frame); unwound in reverse on any failure.
        let mut allocated = [(PhysAddr::ZERO, 0usize, PhysAddr::ZERO); 3];
        let mut allocated_len = 0usize;

        let leaf_level = size.leaf_level();
        let mut table_pa = self.root;
        let mut level = Level::Pml4;
        while level != leaf_level {
            let idx = level.index_of(va);
            let entry = self.table_mut(table_pa).get(idx);
            if entry.present() {
                if entry.huge() {
                    // A larger leaf already covers this VA.
                    self.unwind(alloc, &allocated[..allocated_len]);
                    return Err(MapError::AlreadyMapped);
                }
                table_pa = entry.address();
            } else {
                let Some(frame) = alloc.alloc_4k() else {
                    self.unwind(alloc, &allocated[..allocated_len]);
                    return Err(MapError::OutOfMemory);
                };
                self.table_mut(frame).zero();
                self.table_mut(table_pa)
                    .set(idx, PageEntry::table(frame, flags.contains(MapFlags::USER)));
                allocated[allocated_len] = (table_pa, idx, frame);
                allocated_len += 1;
                table_pa = frame;
            }
            level = level.next();
        }

        let idx = leaf_level.index_of(va);
        let leaf_table = self.table_mut(table_pa);
        if leaf_table.get(idx).present() {
            self.unwind(alloc, &allocated[..allocated_len]);
            return Err(MapError::AlreadyMapped);
        }
        let huge = !matches!(leaf_level, Level::Pt);
        leaf_table.set(idx, PageEntry::leaf(pa, flags, huge));
        Ok(())
    }

    /// Undo the table allocations of a failed `map_one` call, deepest first.
    fn unwind<A: FrameAlloc>(&self, alloc: &mut A, allocated: &[(PhysAddr, usize, PhysAddr)]) {
        for &(parent, idx, frame) in allocated.iter().rev() {
            self.table_mut(parent).set(idx, PageEntry::zero());
            alloc.free_4k(frame);
        }
        if !allocated.is_empty() {
            log::debug!(
                "map rollback: unwound {} freshly allocated table frame(s)",
                allocated.len()
            );
        }
    }

    /// Clear the terminal entry for `va`, whatever its size, and report
    /// which size was found.
    ///
    /// Emptied intermediate tables are not reclaimed. The caller is
    /// responsible for `invlpg` if this space is active.
    pub fn unmap(&self, va: VirtAddr) -> Result<PageSize, UnmapError> {
        let [i4, i3, i2, i1] = split_indices(va);

        let e4 = self.table_mut(self.root).get(i4);
        if !e4.present() {
            return Err(UnmapError::NotMapped);
        }

        let pdpt_pa = e4.address();
        let e3 = self.table_mut(pdpt_pa).get(i3);
        if !e3.present() {
            return Err(UnmapError::NotMapped);
        }
        if e3.huge() {
            self.table_mut(pdpt_pa).set(i3, PageEntry::zero());
            return Ok(PageSize::Size1G);
        }

        let pd_pa = e3.address();
        let e2 = self.table_mut(pd_pa).get(i2);
        if !e2.present() {
            return Err(UnmapError::NotMapped);
        }
        if e2.huge() {
            self.table_mut(pd_pa).set(i2, PageEntry::zero());
            return Ok(PageSize::Size2M);
        }

        let pt_pa = e2.address();
        let e1 = self.table_mut(pt_pa).get(i1);
        if !e1.present() {
            return Err(UnmapError::NotMapped);
        }
        self.table_mut(pt_pa).set(i1, PageEntry::zero());
        Ok(PageSize::Size4K)
    }

    /// Translate `va` to its physical address if mapped.
    ///
    /// Read-only walk; handles 1 GiB and 2 MiB leaves by adding the
    /// appropriate in-page offset.
    #[must_use]
    pub fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        let [i4, i3, i2, i1] = split_indices(va);

        let e4 = self.table_mut(self.root).get(i4);
        if !e4.present() {
            return None;
        }

        let e3 = self.table_mut(e4.address()).get(i3);
        if !e3.present() {
            return None;
        }
        if e3.huge() {
            let off = va.as_u64() & (PageSize::Size1G.bytes() - 1);
            return Some(e3.address() + off);
        }

        let e2 = self.table_mut(e3.address()).get(i2);
        if !e2.present() {
            return None;
        }
        if e2.huge() {
            let off = va.as_u64() & (PageSize::Size2M.bytes() - 1);
            return Some(e2.address() + off);
        }

        let e1 = self.table_mut(e2.address()).get(i1);
        if !e1.present() {
            return None;
        }
        let off = va.as_u64() & (PageSize::Size4K.bytes() - 1);
        Some(e1.address() + off)
    }
}
