//! Flat physical frame allocator with reference counting.
//!
//! One [`FrameDesc`] per 4 KiB frame, in descriptor storage the bootstrap
//! layer carves out of RAM before this allocator ever runs. The free list
//! is intrusive: each free descriptor stores the index of the next free
//! frame.
//!
//! Two-phase setup is deliberate: regions are recorded with
//! [`add_region`](FrameAllocator::add_region) first, and the free list is
//! populated only by [`finalize`](FrameAllocator::finalize), after every
//! reservation (including the descriptor storage itself) is registered.
//! Frames backing reservations are marked [`FrameState::Reserved`] and are
//! never issued.

use kernel_info::memory::{MAX_REGIONS, PAGE_SIZE};
use kernel_mmap::{RegionKind, ReservationRegistry};
use kernel_vmem::{PhysAddr, PhysMapper};

use crate::{AllocFlags, NIL};

/// Lifecycle state of one physical frame.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FrameState {
    /// Not covered by any usable region; never issued.
    Unusable,
    /// On the free list.
    Free,
    /// Issued to a caller; `ref_count` holds the number of owners.
    Allocated,
    /// Covered by a no-alloc reservation; never issued.
    Reserved,
}

/// Descriptor for one 4 KiB frame.
#[derive(Copy, Clone, Debug)]
pub struct FrameDesc {
    pub state: FrameState,
    /// Owners of an [`FrameState::Allocated`] frame; zero otherwise.
    pub ref_count: u16,
    /// Next free frame index while on the free list.
    next: u32,
}

impl FrameDesc {
    /// Initial descriptor value for storage that was just carved out.
    pub const UNUSABLE: Self = Self {
        state: FrameState::Unusable,
        ref_count: 0,
        next: NIL,
    };
}

/// Rejected frame operations.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum FrameError {
    /// Address unaligned, below the managed base or past the last
    /// descriptor.
    #[error("physical address is not a managed frame")]
    InvalidAddress,
    /// `free`/`retain` on a frame that is not allocated (double free).
    #[error("frame is not in the allocated state")]
    NotAllocated,
    /// `add_region` after `finalize`.
    #[error("allocator is already finalized")]
    AlreadyFinalized,
    /// The bounded region table is full.
    #[error("physical region table is full")]
    RegionTableFull,
}

/// The flat 4 KiB frame allocator; sole general-purpose frame source.
pub struct FrameAllocator {
    /// One descriptor per frame of `[base, base + len*4096)`.
    descs: &'static mut [FrameDesc],
    /// Physical address of frame index 0.
    base: u64,
    /// Page-aligned `(start, end)` spans of recorded usable regions.
    regions: [(u64, u64); MAX_REGIONS],
    region_count: usize,
    free_head: u32,
    free_frames: u64,
    finalized: bool,
}

impl FrameAllocator {
    /// Take ownership of descriptor storage covering physical memory from
    /// `base` upward. Descriptors are reset; every frame starts unusable.
    pub fn new(descs: &'static mut [FrameDesc], base: PhysAddr) -> Self {
        descs.fill(FrameDesc::UNUSABLE);
        Self {
            descs,
            base: base.as_u64(),
            regions: [(0, 0); MAX_REGIONS],
            region_count: 0,
            free_head: NIL,
            free_frames: 0,
            finalized: false,
        }
    }

    /// Record a physical region. Only usable regions contribute frames;
    /// everything else is accepted and ignored.
    pub fn add_region(
        &mut self,
        base: PhysAddr,
        size: u64,
        kind: RegionKind,
    ) -> Result<(), FrameError> {
        if self.finalized {
            return Err(FrameError::AlreadyFinalized);
        }
        if !kind.is_usable() {
            return Ok(());
        }
        let start = kernel_vmem::align_up(base.as_u64(), PAGE_SIZE);
        let end = kernel_vmem::align_down(base.as_u64() + size, PAGE_SIZE);
        if end <= start {
            return Ok(());
        }
        if self.region_count == MAX_REGIONS {
            log::warn!("frame region table full, dropping region at {base}");
            return Err(FrameError::RegionTableFull);
        }
        self.regions[self.region_count] = (start, end);
        self.region_count += 1;
        Ok(())
    }

    /// Populate the free list from the recorded regions, skipping every
    /// frame a no-alloc reservation covers. Returns the number of free
    /// frames.
    ///
    /// Must run after all reservations are registered; that is the entire
    /// point of the two-phase setup.
    pub fn finalize(&mut self, registry: &ReservationRegistry) -> Result<u64, FrameError> {
        if self.finalized {
            return Err(FrameError::AlreadyFinalized);
        }
        for i in 0..self.region_count {
            let (start, end) = self.regions[i];
            let mut pa = start;
            while pa < end {
                if let Ok(idx) = self.index_of(PhysAddr::new(pa)) {
                    if registry.blocks_allocation(PhysAddr::new(pa), PAGE_SIZE) {
                        self.descs[idx].state = FrameState::Reserved;
                    } else {
                        self.descs[idx].state = FrameState::Free;
                        self.descs[idx].next = self.free_head;
                        self.free_head = idx as u32;
                        self.free_frames += 1;
                    }
                }
                pa += PAGE_SIZE;
            }
        }
        self.finalized = true;
        log::info!(
            "frame allocator: {} free frames ({} MiB)",
            self.free_frames,
            self.free_frames * PAGE_SIZE / 1024 / 1024
        );
        Ok(self.free_frames)
    }

    /// Pop one frame without touching its contents.
    pub fn alloc_raw(&mut self) -> Option<PhysAddr> {
        let idx = self.free_head;
        if idx == NIL {
            return None;
        }
        let desc = &mut self.descs[idx as usize];
        self.free_head = desc.next;
        desc.next = NIL;
        desc.state = FrameState::Allocated;
        desc.ref_count = 1;
        self.free_frames -= 1;
        Some(PhysAddr::new(self.base + u64::from(idx) * PAGE_SIZE))
    }

    /// Allocate one frame; [`AllocFlags::ZERO`] clears it through the
    /// mapper first. Returns `None` when no frame is free.
    pub fn alloc<M: PhysMapper>(&mut self, flags: AllocFlags, mapper: &M) -> Option<PhysAddr> {
        let pa = self.alloc_raw()?;
        if flags.contains(AllocFlags::ZERO) {
            // SAFETY: a frame just popped from the free list is exclusively
            // ours and reachable through the mapper.
            let bytes = unsafe { mapper.phys_to_mut::<[u8; PAGE_SIZE as usize]>(pa) };
            bytes.fill(0);
        }
        Some(pa)
    }

    /// Add an owner to an allocated frame (shared mappings).
    pub fn retain(&mut self, pa: PhysAddr) -> Result<(), FrameError> {
        let idx = self.index_of(pa)?;
        let desc = &mut self.descs[idx];
        if desc.state != FrameState::Allocated {
            return Err(FrameError::NotAllocated);
        }
        desc.ref_count += 1;
        Ok(())
    }

    /// Drop one owner; the frame returns to the free list at zero owners.
    ///
    /// A frame that is not allocated is rejected with a diagnostic and no
    /// state is touched; trusting a bad free corrupts the free list.
    pub fn free(&mut self, pa: PhysAddr) -> Result<(), FrameError> {
        let idx = self.index_of(pa).inspect_err(|_| {
            log::error!("free of invalid physical address {pa}");
        })?;
        let desc = &mut self.descs[idx];
        if desc.state != FrameState::Allocated {
            log::error!("double free of frame {pa} (state {:?})", desc.state);
            return Err(FrameError::NotAllocated);
        }
        desc.ref_count -= 1;
        if desc.ref_count == 0 {
            desc.state = FrameState::Free;
            desc.next = self.free_head;
            self.free_head = idx as u32;
            self.free_frames += 1;
        }
        Ok(())
    }

    /// Frames currently on the free list.
    #[inline]
    #[must_use]
    pub const fn free_frames(&self) -> u64 {
        self.free_frames
    }

    /// Current state of the frame holding `pa`, for diagnostics.
    #[must_use]
    pub fn state_of(&self, pa: PhysAddr) -> Option<FrameState> {
        self.index_of(pa).ok().map(|i| self.descs[i].state)
    }

    fn index_of(&self, pa: PhysAddr) -> Result<usize, FrameError> {
        let p = pa.as_u64();
        if !pa.is_aligned(PAGE_SIZE) || p < self.base {
            return Err(FrameError::InvalidAddress);
        }
        let idx = ((p - self.base) / PAGE_SIZE) as usize;
        if idx >= self.descs.len() {
            return Err(FrameError::InvalidAddress);
        }
        Ok(idx)
    }
}

/// Page-table code draws intermediate tables from the same allocator.
impl kernel_vmem::FrameAlloc for FrameAllocator {
    fn alloc_4k(&mut self) -> Option<PhysAddr> {
        self.alloc_raw()
    }

    fn free_4k(&mut self, frame: PhysAddr) {
        if let Err(e) = self.free(frame) {
            log::error!("page-table frame release failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_mmap::{DirectMap, ResFlags, ReservationKind};

    fn storage(n: usize) -> &'static mut [FrameDesc] {
        Box::leak(vec![FrameDesc::UNUSABLE; n].into_boxed_slice())
    }

    fn finalized(n_frames: usize) -> FrameAllocator {
        let mut fa = FrameAllocator::new(storage(n_frames), PhysAddr::ZERO);
        fa.add_region(PhysAddr::ZERO, n_frames as u64 * PAGE_SIZE, RegionKind::Usable)
            .unwrap();
        fa.finalize(&ReservationRegistry::new()).unwrap();
        fa
    }

    #[test]
    fn no_frames_before_finalize() {
        let mut fa = FrameAllocator::new(storage(8), PhysAddr::ZERO);
        fa.add_region(PhysAddr::ZERO, 8 * PAGE_SIZE, RegionKind::Usable)
            .unwrap();
        assert_eq!(fa.alloc_raw(), None);
        assert_eq!(fa.finalize(&ReservationRegistry::new()), Ok(8));
        assert!(fa.alloc_raw().is_some());
    }

    #[test]
    fn non_usable_regions_contribute_nothing() {
        let mut fa = FrameAllocator::new(storage(8), PhysAddr::ZERO);
        fa.add_region(PhysAddr::ZERO, 8 * PAGE_SIZE, RegionKind::Mmio)
            .unwrap();
        assert_eq!(fa.finalize(&ReservationRegistry::new()), Ok(0));
    }

    #[test]
    fn frames_are_never_double_issued() {
        let mut fa = finalized(16);
        let mut seen = std::collections::HashSet::new();
        while let Some(pa) = fa.alloc_raw() {
            assert!(seen.insert(pa.as_u64()), "frame {pa} issued twice");
        }
        assert_eq!(seen.len(), 16);
        assert_eq!(fa.free_frames(), 0);

        // Free two, realloc: only those two come back, exactly once each.
        let a = PhysAddr::new(0x3000);
        let b = PhysAddr::new(0x7000);
        fa.free(a).unwrap();
        fa.free(b).unwrap();
        let r1 = fa.alloc_raw().unwrap();
        let r2 = fa.alloc_raw().unwrap();
        assert_ne!(r1, r2);
        assert!(r1 == a || r1 == b);
        assert!(r2 == a || r2 == b);
        assert_eq!(fa.alloc_raw(), None);
    }

    #[test]
    fn double_free_is_rejected_without_state_damage() {
        let mut fa = finalized(4);
        let pa = fa.alloc_raw().unwrap();
        fa.free(pa).unwrap();
        assert_eq!(fa.free(pa), Err(FrameError::NotAllocated));
        assert_eq!(fa.free_frames(), 4);
        // Never-allocated and out-of-range addresses are rejected too.
        assert_eq!(fa.free(PhysAddr::new(0x123)), Err(FrameError::InvalidAddress));
        assert_eq!(
            fa.free(PhysAddr::new(0x10_0000)),
            Err(FrameError::InvalidAddress)
        );
    }

    #[test]
    fn retain_keeps_frame_alive_until_last_owner() {
        let mut fa = finalized(4);
        let pa = fa.alloc_raw().unwrap();
        fa.retain(pa).unwrap();
        fa.free(pa).unwrap();
        assert_eq!(fa.state_of(pa), Some(FrameState::Allocated));
        fa.free(pa).unwrap();
        assert_eq!(fa.state_of(pa), Some(FrameState::Free));
    }

    #[test]
    fn reservations_are_excluded_at_finalize() {
        let mut reg = ReservationRegistry::new();
        reg.add(
            PhysAddr::new(0x2000),
            2 * PAGE_SIZE,
            ReservationKind::AllocatorMetadata,
            ResFlags::NO_ALLOC,
            "meta",
        )
        .unwrap();

        let mut fa = FrameAllocator::new(storage(8), PhysAddr::ZERO);
        fa.add_region(PhysAddr::ZERO, 8 * PAGE_SIZE, RegionKind::Usable)
            .unwrap();
        assert_eq!(fa.finalize(&reg), Ok(6));

        let mut issued = Vec::new();
        while let Some(pa) = fa.alloc_raw() {
            issued.push(pa.as_u64());
        }
        assert!(!issued.contains(&0x2000));
        assert!(!issued.contains(&0x3000));
        assert_eq!(fa.state_of(PhysAddr::new(0x2000)), Some(FrameState::Reserved));
    }

    #[test]
    fn zeroing_alloc_clears_the_frame() {
        // Real backing memory so the identity mapper points somewhere valid.
        let buf: &'static mut [u8] = Box::leak(vec![0xAAu8; 3 * PAGE_SIZE as usize].into_boxed_slice());
        let base = kernel_vmem::align_up(buf.as_ptr() as u64, PAGE_SIZE);

        let mut fa = FrameAllocator::new(storage(2), PhysAddr::new(base));
        fa.add_region(PhysAddr::new(base), 2 * PAGE_SIZE, RegionKind::Usable)
            .unwrap();
        fa.finalize(&ReservationRegistry::new()).unwrap();

        let dm = DirectMap::identity();
        let pa = fa.alloc(AllocFlags::ZERO, &dm).unwrap();
        let bytes = unsafe { dm.phys_to_mut::<[u8; PAGE_SIZE as usize]>(pa) };
        assert!(bytes.iter().all(|&b| b == 0));
    }
}
