//! Bootstrap orchestration: firmware memory map in, running engine out.
//!
//! Initialization order is forced by the dependencies between the parts:
//!
//! 1. normalize the memory map and pick the largest usable region;
//! 2. carve descriptor storage for both allocators out of its front and
//!    **reserve it** along with the kernel image, MMIO and firmware
//!    ranges;
//! 3. feed the frame allocator every usable region except the buddy
//!    zones, then finalize it against the reservations;
//! 4. hand the buddy allocator its disjoint zones (the tail of the
//!    largest region, plus a sub-16 MiB zone for ISA DMA when one
//!    exists);
//! 5. build the kernel address space, verify it with a probe mapping,
//!    and set up the lazy heap and the process manager on top.
//!
//! A failure at any step aborts with a [`BootError`]; there is no partial
//! success to limp along with.

use core::ptr::NonNull;

use kernel_alloc::{
    AllocFlags, BlockDesc, BuddyAllocator, BuddyError, FrameAllocator, FrameDesc, FrameError,
    HeapGrow, KernelHeap,
};
use kernel_info::memory::{
    DMA_LIMIT, KERNEL_BASE, KERNEL_HEAP_BASE, KERNEL_HEAP_MAX, KERNEL_PHYS_LOAD, PAGE_SIZE,
};
use kernel_mmap::{
    DirectMap, MemoryMap, MemoryMapEntry, RegionKind, ResFlags, ReservationKind,
    ReservationRegistry,
};
use kernel_vm::{Pid, VmError, VmManager};
use kernel_vmem::{
    AddressSpace, ENTRY_COUNT, FrameAlloc, KERNEL_HALF_FIRST_INDEX, MapError, MapFlags, PageEntry,
    PageSize, PageTable, PhysAddr, PhysMapper, UnmapError, VirtAddr, align_down, align_up,
};

/// Cap on the buddy tail zone carved from the largest usable region; the
/// flat frame allocator keeps the rest.
const BUDDY_ZONE_MAX: u64 = 64 * 1024 * 1024;

/// Scratch VA for the post-build page-table self check. Sits between the
/// kernel image and the heap window, used by nothing else.
const PROBE_VA: u64 = 0xffff_ffff_b000_0000;

/// Everything the boot layer must hand over before memory comes up.
pub struct BootInfo<'a> {
    /// Firmware memory map, in no particular order.
    pub memory_map: &'a [MemoryMapEntry],
    /// `virt = phys + offset` direct map, when the bootloader provides one.
    pub direct_map_offset: Option<u64>,
    /// Bytes of the loaded kernel image, starting at
    /// [`KERNEL_PHYS_LOAD`].
    pub kernel_image_size: u64,
}

/// Fatal bootstrap failures. The kernel cannot run without memory, so the
/// surface turns these into a panic; the split exists for testability.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum BootError {
    /// A second initialization attempt.
    #[error("memory engine is already initialized")]
    AlreadyInitialized,
    /// The firmware map contains no usable RAM at all.
    #[error("no usable memory region")]
    NoUsableMemory,
    /// The largest usable region cannot hold the allocator metadata.
    #[error("insufficient memory for allocator metadata")]
    InsufficientMemory,
    /// No translation window reaches the carved metadata.
    #[error("allocator metadata is not reachable through any window")]
    MetadataUnreachable,
    /// Building the kernel address space ran out of frames.
    #[error("failed to build the kernel address space")]
    AddressSpaceInit,
    /// The page-table self check came back wrong.
    #[error("page-table verification failed")]
    VerificationFailed,
}

/// The assembled memory engine. One instance exists, owned by the locked
/// surface; every method runs under that lock.
pub struct MemoryContext {
    map: MemoryMap,
    registry: ReservationRegistry,
    direct_map: DirectMap,
    frames: FrameAllocator,
    buddy: BuddyAllocator,
    /// The kernel's PML4; its upper half is fully pre-populated so heap
    /// growth is visible in every process space without resync.
    kernel_root: PhysAddr,
    heap: KernelHeap,
    vmm: VmManager,
}

impl MemoryContext {
    /// Run the whole bootstrap sequence.
    pub fn init(info: &BootInfo<'_>) -> Result<Self, BootError> {
        let map = MemoryMap::from_entries(info.memory_map);
        let largest = map.largest_usable().ok_or(BootError::NoUsableMemory)?;
        let (l_start, l_end) = largest.aligned_span();
        if l_end <= l_start {
            return Err(BootError::NoUsableMemory);
        }
        log::info!(
            "memory: {} MiB usable, largest region {:#x}..{:#x}",
            map.total_usable_bytes() / 1024 / 1024,
            l_start,
            l_end
        );

        // A separate usable region entirely below the ISA limit becomes a
        // DMA buddy zone instead of feeding the frame allocator.
        let dma_span = map
            .usable()
            .filter(|e| **e != largest)
            .map(MemoryMapEntry::aligned_span)
            .find(|&(s, e)| e > s && e <= DMA_LIMIT);

        // Descriptor storage for both allocators, carved from the front
        // of the largest region. The buddy descriptor count is an upper
        // bound because the tail zone is sized only after the carve.
        let frame_desc_count = (map.highest_usable_end() / PAGE_SIZE) as usize;
        let dma_frames = dma_span.map_or(0, |(s, e)| (e - s) / PAGE_SIZE) as usize;
        let buddy_desc_count = (BUDDY_ZONE_MAX / PAGE_SIZE) as usize + dma_frames;
        let meta_bytes = align_up(
            (frame_desc_count * core::mem::size_of::<FrameDesc>()
                + buddy_desc_count * core::mem::size_of::<BlockDesc>()) as u64,
            PAGE_SIZE,
        );
        if meta_bytes >= l_end - l_start {
            log::error!("metadata ({meta_bytes} bytes) exceeds the largest usable region");
            return Err(BootError::InsufficientMemory);
        }
        let meta_start = l_start;
        let meta_end = meta_start + meta_bytes;

        // Reservations must all be in place before the frame allocator
        // finalizes; the metadata reservation is what keeps the allocator
        // from issuing its own descriptor frames. Registry overflow is a
        // logged soft failure everywhere below.
        let mut registry = ReservationRegistry::new();
        let _ = registry.add(
            PhysAddr::new(meta_start),
            meta_bytes,
            ReservationKind::AllocatorMetadata,
            ResFlags::NO_ALLOC | ResFlags::TRANSLATABLE,
            "allocator metadata",
        );
        if info.kernel_image_size > 0 {
            let _ = registry.add(
                PhysAddr::new(KERNEL_PHYS_LOAD),
                info.kernel_image_size,
                ReservationKind::KernelImage,
                ResFlags::NO_ALLOC,
                "kernel image",
            );
        }
        for e in map.entries() {
            match e.kind {
                RegionKind::Mmio => {
                    let _ = registry.add(
                        e.base,
                        e.length,
                        ReservationKind::Mmio,
                        ResFlags::NO_ALLOC | ResFlags::TRANSLATABLE,
                        "mmio",
                    );
                }
                RegionKind::Framebuffer => {
                    let _ = registry.add(
                        e.base,
                        e.length,
                        ReservationKind::Framebuffer,
                        ResFlags::NO_ALLOC | ResFlags::TRANSLATABLE,
                        "framebuffer",
                    );
                }
                RegionKind::AcpiReclaimable | RegionKind::AcpiNvs => {
                    let _ = registry.add(
                        e.base,
                        e.length,
                        ReservationKind::FirmwareTables,
                        ResFlags::NO_ALLOC,
                        "acpi",
                    );
                }
                _ => {}
            }
        }

        let direct_map = DirectMap::new(info.direct_map_offset, info.kernel_image_size);
        let meta_va = direct_map
            .phys_to_virt(&registry, PhysAddr::new(meta_start))
            .ok_or(BootError::MetadataUnreachable)?;
        // SAFETY: `[meta_start, meta_end)` was just carved out of usable
        // RAM, is page-aligned, reserved against allocation, and reachable
        // through the window `meta_va` came from. Nothing else points here.
        let (frame_descs, block_descs) = unsafe {
            let frame_descs = core::slice::from_raw_parts_mut(
                meta_va.as_mut_ptr::<FrameDesc>(),
                frame_desc_count,
            );
            let block_base =
                meta_va + (frame_desc_count * core::mem::size_of::<FrameDesc>()) as u64;
            let block_descs = core::slice::from_raw_parts_mut(
                block_base.as_mut_ptr::<BlockDesc>(),
                buddy_desc_count,
            );
            (frame_descs, block_descs)
        };

        // Buddy tail: up to half of what remains of the largest region
        // after the carve, capped. The frame allocator gets the rest.
        let tail_size = BUDDY_ZONE_MAX.min(align_down((l_end - meta_end) / 2, PAGE_SIZE));
        let buddy_start = l_end - tail_size;

        let mut frames = FrameAllocator::new(frame_descs, PhysAddr::ZERO);
        for e in map.usable() {
            let (s, end) = e.aligned_span();
            if dma_span == Some((s, end)) {
                continue; // buddy-owned
            }
            if *e == largest {
                let _ = frames.add_region(PhysAddr::new(l_start), buddy_start - l_start, e.kind);
            } else {
                let _ = frames.add_region(e.base, e.length, e.kind);
            }
        }
        let free = frames
            .finalize(&registry)
            .map_err(|_| BootError::AddressSpaceInit)?;
        if free == 0 {
            return Err(BootError::InsufficientMemory);
        }

        let mut buddy = BuddyAllocator::new(block_descs);
        if tail_size > 0 {
            let _ = buddy.add_zone(PhysAddr::new(buddy_start), tail_size, RegionKind::Usable);
        }
        if let Some((s, end)) = dma_span {
            let _ = buddy.add_zone(PhysAddr::new(s), end - s, RegionKind::Usable);
        }

        let (kernel_root, heap) = build_kernel_space(&mut frames, &direct_map, info, &map)?;

        log::info!("memory engine up: kernel root at {kernel_root}");
        Ok(Self {
            map,
            registry,
            direct_map,
            frames,
            buddy,
            kernel_root,
            heap,
            vmm: VmManager::new(kernel_root),
        })
    }

    // ---- introspection -------------------------------------------------

    #[inline]
    #[must_use]
    pub fn memory_map(&self) -> &MemoryMap {
        &self.map
    }

    #[inline]
    #[must_use]
    pub fn reservations(&self) -> &ReservationRegistry {
        &self.registry
    }

    /// Physical address of the kernel PML4.
    #[inline]
    #[must_use]
    pub const fn kernel_root(&self) -> PhysAddr {
        self.kernel_root
    }

    #[inline]
    #[must_use]
    pub const fn free_frames(&self) -> u64 {
        self.frames.free_frames()
    }

    #[inline]
    #[must_use]
    pub fn buddy_free_bytes(&self) -> u64 {
        self.buddy.free_bytes()
    }

    #[inline]
    #[must_use]
    pub const fn heap_free_bytes(&self) -> u64 {
        self.heap.free_bytes()
    }

    #[inline]
    #[must_use]
    pub const fn heap_committed_bytes(&self) -> u64 {
        self.heap.committed_bytes()
    }

    // ---- frames and blocks ---------------------------------------------

    pub fn alloc_frame(&mut self, flags: AllocFlags) -> Option<PhysAddr> {
        self.frames.alloc(flags, &self.direct_map)
    }

    pub fn free_frame(&mut self, pa: PhysAddr) -> Result<(), FrameError> {
        self.frames.free(pa)
    }

    pub fn retain_frame(&mut self, pa: PhysAddr) -> Result<(), FrameError> {
        self.frames.retain(pa)
    }

    /// Contiguous block of `2^ceil(log2(count))` frames from the buddy
    /// zones; [`AllocFlags::ZERO`] clears the whole rounded block.
    pub fn alloc_pages(&mut self, count: u64, flags: AllocFlags) -> Option<PhysAddr> {
        let pa = self.buddy.alloc_pages(count, flags)?;
        if flags.contains(AllocFlags::ZERO) {
            for i in 0..count.next_power_of_two() {
                // SAFETY: the block was just issued to us and buddy zones
                // are plain RAM reachable through the direct map.
                let bytes = unsafe {
                    self.direct_map
                        .phys_to_mut::<[u8; PAGE_SIZE as usize]>(pa + i * PAGE_SIZE)
                };
                bytes.fill(0);
            }
        }
        Some(pa)
    }

    pub fn free_pages(&mut self, pa: PhysAddr) -> Result<(), BuddyError> {
        self.buddy.free_pages(pa)
    }

    // ---- kernel mappings -----------------------------------------------

    /// Map one 4 KiB page into the kernel address space.
    ///
    /// The caller handles TLB maintenance; a fresh mapping needs none
    /// because absent entries are never cached.
    pub fn map_page(
        &mut self,
        va: VirtAddr,
        pa: PhysAddr,
        flags: MapFlags,
    ) -> Result<(), MapError> {
        let space = AddressSpace::from_root(&self.direct_map, self.kernel_root);
        space.map_4k(&mut self.frames, va, pa, flags)
    }

    /// Unmap the kernel leaf at `va`, reporting the page size found. The
    /// surface follows up with `invlpg`.
    pub fn unmap_page(&mut self, va: VirtAddr) -> Result<PageSize, UnmapError> {
        AddressSpace::from_root(&self.direct_map, self.kernel_root).unmap(va)
    }

    #[must_use]
    pub fn virt_to_phys(&self, va: VirtAddr) -> Option<PhysAddr> {
        AddressSpace::from_root(&self.direct_map, self.kernel_root).translate(va)
    }

    #[must_use]
    pub fn phys_to_virt(&self, pa: PhysAddr) -> Option<VirtAddr> {
        self.direct_map.phys_to_virt(&self.registry, pa)
    }

    #[must_use]
    pub fn map_mmio_region(&self, pa: PhysAddr, size: u64) -> Option<VirtAddr> {
        self.direct_map.map_mmio_region(&self.registry, pa, size)
    }

    pub fn unmap_mmio_region(&self, va: VirtAddr, size: u64) {
        self.direct_map.unmap_mmio_region(va, size);
    }

    // ---- kernel heap ---------------------------------------------------

    pub fn heap_alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        let mut backing = HeapBacking {
            frames: &mut self.frames,
            direct_map: &self.direct_map,
            root: self.kernel_root,
        };
        self.heap.alloc(&mut backing, size)
    }

    pub fn heap_zalloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        let mut backing = HeapBacking {
            frames: &mut self.frames,
            direct_map: &self.direct_map,
            root: self.kernel_root,
        };
        self.heap.zalloc(&mut backing, size)
    }

    pub fn heap_free(&mut self, ptr: NonNull<u8>) -> Result<(), kernel_alloc::HeapError> {
        self.heap.free(ptr)
    }

    // ---- process address spaces ----------------------------------------

    pub fn create_process_vm(&mut self) -> Result<Pid, VmError> {
        self.vmm.create(&mut self.frames, &self.direct_map)
    }

    pub fn destroy_process_vm(&mut self, pid: Pid) {
        self.vmm.destroy(&mut self.frames, &self.direct_map, pid);
    }

    #[must_use]
    pub fn get_page_dir(&self, pid: Pid) -> Option<PhysAddr> {
        self.vmm.get_page_dir(pid)
    }

    pub fn process_alloc(&mut self, pid: Pid, size: u64) -> Result<VirtAddr, VmError> {
        self.vmm
            .alloc(&mut self.frames, &self.direct_map, pid, size)
    }

    pub fn process_free(&mut self, pid: Pid, vaddr: VirtAddr, size: u64) -> Result<(), VmError> {
        self.vmm
            .free(&mut self.frames, &self.direct_map, pid, vaddr, size)
    }

    pub fn handle_page_fault(&mut self, pid: Pid, addr: VirtAddr) -> Result<(), VmError> {
        self.vmm
            .handle_page_fault(&mut self.frames, &self.direct_map, pid, addr)
    }
}

/// Build and verify the kernel address space; returns its root and the
/// (still empty) heap that lives in it.
fn build_kernel_space(
    frames: &mut FrameAllocator,
    direct_map: &DirectMap,
    info: &BootInfo<'_>,
    map: &MemoryMap,
) -> Result<(PhysAddr, KernelHeap), BootError> {
    let kernel_root = frames
        .alloc(AllocFlags::ZERO, direct_map)
        .ok_or(BootError::AddressSpaceInit)?;
    let space = AddressSpace::from_root(direct_map, kernel_root);

    // Pre-populate every kernel-half PML4 slot with an (empty) table.
    // Process roots clone these 256 entries at creation, so any later
    // kernel mapping lands in a shared table and is visible everywhere.
    for i in KERNEL_HALF_FIRST_INDEX..ENTRY_COUNT {
        let frame = frames
            .alloc(AllocFlags::ZERO, direct_map)
            .ok_or(BootError::AddressSpaceInit)?;
        // SAFETY: `kernel_root` is a zeroed table frame owned right here.
        let pml4 = unsafe { direct_map.phys_to_mut::<PageTable>(kernel_root) };
        pml4.set(i, PageEntry::table(frame, false));
    }

    // Identity-map the first gigabyte as one huge leaf; early drivers and
    // the fallback translation window rely on it.
    space
        .map_1g(
            frames,
            VirtAddr::new(0),
            PhysAddr::ZERO,
            MapFlags::WRITABLE | MapFlags::GLOBAL,
        )
        .map_err(|_| BootError::AddressSpaceInit)?;

    // Re-establish the bootloader's direct map with 1 GiB leaves over all
    // of RAM, when its offset permits huge pages at all.
    if let Some(offset) = info.direct_map_offset {
        let gib = PageSize::Size1G.bytes();
        if offset.is_multiple_of(gib) {
            let top = align_up(map.highest_usable_end(), gib);
            let mut pa = 0u64;
            while pa < top {
                space
                    .map_1g(
                        frames,
                        VirtAddr::new(offset + pa),
                        PhysAddr::new(pa),
                        MapFlags::WRITABLE | MapFlags::GLOBAL | MapFlags::NO_EXECUTE,
                    )
                    .map_err(|_| BootError::AddressSpaceInit)?;
                pa += gib;
            }
        } else {
            log::warn!("direct-map offset {offset:#x} is not 1 GiB aligned, not remapped");
        }
    }

    // The kernel image itself, 4 KiB pages: its 1 MiB load address rules
    // out 2 MiB leaves.
    let image_end = KERNEL_PHYS_LOAD + align_up(info.kernel_image_size, PAGE_SIZE);
    let mut pa = KERNEL_PHYS_LOAD;
    while pa < image_end {
        space
            .map_4k(
                frames,
                VirtAddr::new(KERNEL_BASE + (pa - KERNEL_PHYS_LOAD)),
                PhysAddr::new(pa),
                MapFlags::WRITABLE | MapFlags::GLOBAL,
            )
            .map_err(|_| BootError::AddressSpaceInit)?;
        pa += PAGE_SIZE;
    }

    verify_space(frames, &space)?;

    Ok((
        kernel_root,
        KernelHeap::new(VirtAddr::new(KERNEL_HEAP_BASE), KERNEL_HEAP_MAX as u32),
    ))
}

/// Probe the fresh tables before trusting them with CR3: map a scratch
/// frame, translate it back (with and without an in-page offset), unmap
/// it, and check the hole.
fn verify_space<M: PhysMapper>(
    frames: &mut FrameAllocator,
    space: &AddressSpace<'_, M>,
) -> Result<(), BootError> {
    let probe_va = VirtAddr::new(PROBE_VA);
    let frame = frames.alloc_raw().ok_or(BootError::AddressSpaceInit)?;
    space
        .map_4k(frames, probe_va, frame, MapFlags::WRITABLE | MapFlags::NO_EXECUTE)
        .map_err(|_| BootError::VerificationFailed)?;
    if space.translate(probe_va) != Some(frame) {
        log::error!("probe page translated wrong");
        return Err(BootError::VerificationFailed);
    }
    if space.translate(VirtAddr::new(PROBE_VA + 0x123)) != Some(frame + 0x123) {
        log::error!("probe page offset translated wrong");
        return Err(BootError::VerificationFailed);
    }
    if space.unmap(probe_va) != Ok(PageSize::Size4K) {
        return Err(BootError::VerificationFailed);
    }
    if space.translate(probe_va).is_some() {
        log::error!("probe page still mapped after unmap");
        return Err(BootError::VerificationFailed);
    }
    frames.free_4k(frame);
    Ok(())
}

/// Heap backing: fresh zeroed frames mapped into the kernel space.
///
/// Mapping into the live space without TLB maintenance is sound here:
/// the pages go from absent to present, and absent entries are never
/// cached.
struct HeapBacking<'a> {
    frames: &'a mut FrameAllocator,
    direct_map: &'a DirectMap,
    root: PhysAddr,
}

impl HeapGrow for HeapBacking<'_> {
    fn grow(&mut self, va: VirtAddr, bytes: u64) -> bool {
        let dm: &DirectMap = self.direct_map;
        let space = AddressSpace::from_root(dm, self.root);
        let flags = MapFlags::WRITABLE | MapFlags::GLOBAL | MapFlags::NO_EXECUTE;
        let mut mapped = 0u64;
        while mapped < bytes {
            let page = VirtAddr::new(va.as_u64() + mapped);
            let Some(frame) = self.frames.alloc(AllocFlags::ZERO, dm) else {
                unwind_grow(self.frames, &space, va, mapped);
                return false;
            };
            if space.map_4k(self.frames, page, frame, flags).is_err() {
                self.frames.free_4k(frame);
                unwind_grow(self.frames, &space, va, mapped);
                return false;
            }
            mapped += PAGE_SIZE;
        }
        true
    }
}

/// Roll back a partial heap expansion; the heap never sees it.
fn unwind_grow<M: PhysMapper>(
    frames: &mut FrameAllocator,
    space: &AddressSpace<'_, M>,
    va: VirtAddr,
    mapped: u64,
) {
    let mut off = 0u64;
    while off < mapped {
        let page = VirtAddr::new(va.as_u64() + off);
        if let Some(pa) = space.translate(page) {
            let _ = space.unmap(page);
            frames.free_4k(pa);
        }
        off += PAGE_SIZE;
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

    /// Fake RAM: a leaked host buffer stands in for physical `[0, size)`,
    /// reached through a direct-map offset equal to the buffer base.
    fn fake_ram(size: usize) -> u64 {
        let buf: &'static mut [u8] =
            Box::leak(vec![0u8; size + PAGE_SIZE as usize].into_boxed_slice());
        align_up(buf.as_ptr() as u64, PAGE_SIZE)
    }

    /// A small PC-like map over 8 MiB of fake RAM.
    fn pc_entries() -> &'static [MemoryMapEntry] {
        Box::leak(Box::new([
            entry(0x0, 0x9_f000, RegionKind::Usable),
            entry(0x9_f000, 0x6_1000, RegionKind::Reserved),
            entry(0x10_0000, 0x10_0000, RegionKind::KernelImage),
            entry(0x20_0000, 0x60_0000, RegionKind::Usable),
            entry(0xfee0_0000, 0x1000, RegionKind::Mmio),
        ]))
    }

    fn booted() -> MemoryContext {
        let info = BootInfo {
            memory_map: pc_entries(),
            direct_map_offset: Some(fake_ram(8 * 1024 * 1024)),
            kernel_image_size: 0x10_0000,
        };
        MemoryContext::init(&info).unwrap()
    }

    #[test]
    fn bootstrap_builds_and_verifies_the_engine() {
        let mut ctx = booted();
        assert!(ctx.free_frames() > 0);
        assert!(ctx.buddy_free_bytes() > 0);

        // The kernel image is translated by the address space it built.
        assert_eq!(
            ctx.virt_to_phys(VirtAddr::new(KERNEL_BASE)),
            Some(PhysAddr::new(KERNEL_PHYS_LOAD))
        );
        // The identity gigabyte is one huge leaf.
        assert_eq!(
            ctx.virt_to_phys(VirtAddr::new(0x1234)),
            Some(PhysAddr::new(0x1234))
        );

        // Kernel map/unmap round trip through fresh tables.
        let frame = ctx.alloc_frame(AllocFlags::empty()).unwrap();
        let va = VirtAddr::new(0xffff_ffff_b100_0000);
        ctx.map_page(va, frame, MapFlags::WRITABLE).unwrap();
        assert_eq!(ctx.virt_to_phys(va), Some(frame));
        assert_eq!(ctx.unmap_page(va), Ok(PageSize::Size4K));
        assert_eq!(ctx.virt_to_phys(va), None);
        ctx.free_frame(frame).unwrap();
    }

    #[test]
    fn metadata_and_image_frames_are_never_issued() {
        let mut ctx = booted();
        let meta = ctx
            .reservations()
            .entries()
            .iter()
            .find(|r| r.kind == ReservationKind::AllocatorMetadata)
            .copied()
            .unwrap();

        let mut issued = Vec::new();
        while let Some(pa) = ctx.alloc_frame(AllocFlags::empty()) {
            issued.push(pa.as_u64());
        }
        assert!(!issued.is_empty());
        for pa in issued {
            assert!(
                pa < meta.base || pa >= meta.end,
                "metadata frame {pa:#x} was issued"
            );
            assert!(
                !(0x10_0000..0x20_0000).contains(&pa),
                "kernel image frame {pa:#x} was issued"
            );
        }
    }

    #[test]
    fn buddy_zones_are_disjoint_from_the_frame_inventory() {
        let mut ctx = booted();
        let meta = ctx
            .reservations()
            .entries()
            .iter()
            .find(|r| r.kind == ReservationKind::AllocatorMetadata)
            .copied()
            .unwrap();
        let mut issued = std::collections::HashSet::new();
        while let Some(pa) = ctx.alloc_frame(AllocFlags::empty()) {
            issued.insert(pa.as_u64());
        }

        // The frame allocator is drained, yet buddy blocks still come out,
        // and none of their pages was ever frame-allocator inventory or
        // part of the metadata carve.
        let block = ctx.alloc_pages(4, AllocFlags::empty()).unwrap();
        for i in 0..4 {
            let page = block.as_u64() + i * PAGE_SIZE;
            assert!(!issued.contains(&page));
            assert!(page < meta.base || page >= meta.end);
        }
        ctx.free_pages(block).unwrap();

        // The DMA zone sits below the ISA limit.
        let dma = ctx.alloc_pages(1, AllocFlags::DMA).unwrap();
        assert!(dma.as_u64() < DMA_LIMIT);
    }

    #[test]
    fn empty_map_is_rejected() {
        let info = BootInfo {
            memory_map: &[],
            direct_map_offset: None,
            kernel_image_size: 0,
        };
        assert_eq!(
            MemoryContext::init(&info).err(),
            Some(BootError::NoUsableMemory)
        );
    }

    #[test]
    fn metadata_must_fit_the_largest_region() {
        // 64 KiB of usable RAM cannot hold the descriptor arrays.
        let info = BootInfo {
            memory_map: &[entry(0x20_0000, 0x1_0000, RegionKind::Usable)],
            direct_map_offset: None,
            kernel_image_size: 0,
        };
        assert_eq!(
            MemoryContext::init(&info).err(),
            Some(BootError::InsufficientMemory)
        );
    }

    #[test]
    fn metadata_must_be_reachable() {
        // RAM above the identity limit with no direct map: no window
        // reaches the carve.
        let info = BootInfo {
            memory_map: &[entry(0x8000_0000, 16 * 1024 * 1024, RegionKind::Usable)],
            direct_map_offset: None,
            kernel_image_size: 0,
        };
        assert_eq!(
            MemoryContext::init(&info).err(),
            Some(BootError::MetadataUnreachable)
        );
    }

    #[test]
    fn process_lifecycle_runs_on_a_booted_engine() {
        let mut ctx = booted();
        let before = ctx.free_frames();

        let pid = ctx.create_process_vm().unwrap();
        let root = ctx.get_page_dir(pid).unwrap();
        assert_ne!(root, ctx.kernel_root());

        // Lazy page-in through the engine's own fault path.
        ctx.handle_page_fault(pid, VirtAddr::new(kernel_info::memory::USER_CODE_BASE))
            .unwrap();

        ctx.destroy_process_vm(pid);
        assert_eq!(ctx.get_page_dir(pid), None);
        assert_eq!(ctx.free_frames(), before);
    }
}
