//! Process table and address-space lifecycle.

use kernel_alloc::{AllocFlags, FrameAllocator};
use kernel_info::memory::{
    MAX_PROCESSES, MAX_VMAS, PAGE_SIZE, USER_CODE_BASE, USER_CODE_SIZE, USER_DATA_BASE,
    USER_DATA_SIZE, USER_HEAP_BASE, USER_STACK_GUARD, USER_STACK_SIZE, USER_STACK_TOP,
};
use kernel_vmem::{
    AddressSpace, ENTRY_COUNT, FrameAlloc, KERNEL_HALF_FIRST_INDEX, MapError, PageTable, PhysAddr,
    PhysMapper, VirtAddr, align_down, align_up,
};

use crate::{Vma, VmaKind, VmaPerms};

/// Process identifier; the slot index in the process table.
pub type Pid = usize;

/// Rejected process-VM operations.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum VmError {
    /// No live process occupies that pid.
    #[error("unknown process id")]
    UnknownProcess,
    /// All process slots are in use.
    #[error("process table is full")]
    ProcessTableFull,
    /// The frame allocator ran dry; any partial work was rolled back.
    #[error("out of physical memory")]
    OutOfMemory,
    /// Fault or access outside every VMA, or into a present mapping.
    #[error("access violation")]
    AccessViolation,
    /// The per-process VMA table is full.
    #[error("virtual memory area table is full")]
    VmaTableFull,
    /// Zero-length, misaligned, overlapping or unknown range.
    #[error("invalid virtual range")]
    InvalidRange,
}

/// One process's address space: page-table root plus its VMA list.
pub struct ProcessVm {
    root: PhysAddr,
    vmas: [Option<Vma>; MAX_VMAS],
    /// Top of the heap; grows monotonically while the process lives.
    heap_end: u64,
}

impl ProcessVm {
    /// Physical address of the process's PML4.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysAddr {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn heap_end(&self) -> u64 {
        self.heap_end
    }

    pub fn vmas(&self) -> impl Iterator<Item = &Vma> {
        self.vmas.iter().flatten()
    }

    fn vma_containing(&self, va: VirtAddr) -> Option<&Vma> {
        self.vmas().find(|v| v.contains(va))
    }

    fn can_add(&self, start: u64, end: u64) -> Result<(), VmError> {
        if self.vmas().any(|v| v.overlaps(start, end)) {
            return Err(VmError::InvalidRange);
        }
        if self.vmas.iter().all(Option::is_some) {
            return Err(VmError::VmaTableFull);
        }
        Ok(())
    }

    fn add_vma(&mut self, vma: Vma) -> Result<(), VmError> {
        self.can_add(vma.start, vma.end)?;
        let slot = self
            .vmas
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or(VmError::VmaTableFull)?;
        *slot = Some(vma);
        Ok(())
    }
}

/// The process table. Pids are slot indices; the lowest free slot is
/// reused first.
pub struct VmManager {
    slots: [Option<ProcessVm>; MAX_PROCESSES],
    /// The kernel's PML4; its upper half is mirrored into every process
    /// root at creation.
    kernel_root: PhysAddr,
}

impl VmManager {
    #[must_use]
    pub const fn new(kernel_root: PhysAddr) -> Self {
        Self {
            slots: [const { None }; MAX_PROCESSES],
            kernel_root,
        }
    }

    /// Live processes.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// The page-directory handle of a live process.
    #[must_use]
    pub fn get_page_dir(&self, pid: Pid) -> Option<PhysAddr> {
        self.slots.get(pid)?.as_ref().map(ProcessVm::root)
    }

    /// Create a process address space with the canonical layout.
    ///
    /// The root's kernel half mirrors the kernel's; code, data and stack
    /// VMAs are registered and the stack is mapped eagerly (code and data
    /// page in lazily on first fault). Any failure rolls everything back,
    /// so a half-created address space is never observable.
    pub fn create<M: PhysMapper>(
        &mut self,
        frames: &mut FrameAllocator,
        mapper: &M,
    ) -> Result<Pid, VmError> {
        let pid = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(VmError::ProcessTableFull)
            .inspect_err(|_| log::warn!("process table full"))?;

        let root = frames
            .alloc(AllocFlags::ZERO, mapper)
            .ok_or(VmError::OutOfMemory)?;
        let space = AddressSpace::from_root(mapper, root);
        space.copy_higher_half_from(&AddressSpace::from_root(mapper, self.kernel_root));

        let mut vm = ProcessVm {
            root,
            vmas: [None; MAX_VMAS],
            heap_end: USER_HEAP_BASE,
        };
        let stack = Vma::new(
            USER_STACK_TOP - USER_STACK_SIZE,
            USER_STACK_TOP,
            VmaKind::Stack,
            VmaPerms::READ | VmaPerms::WRITE,
        );
        // Infallible: the fresh table is empty and has capacity.
        let _ = vm.add_vma(Vma::new(
            USER_CODE_BASE,
            USER_CODE_BASE + USER_CODE_SIZE,
            VmaKind::Code,
            VmaPerms::READ | VmaPerms::EXEC,
        ));
        let _ = vm.add_vma(Vma::new(
            USER_DATA_BASE,
            USER_DATA_BASE + USER_DATA_SIZE,
            VmaKind::Data,
            VmaPerms::READ | VmaPerms::WRITE,
        ));
        let _ = vm.add_vma(stack);
        // The page below the stack stays outside every VMA on purpose: a
        // fault there is an overflow report, never a lazy page-in.

        if let Err(e) = map_range_eagerly(frames, mapper, &space, &stack) {
            release_space(frames, mapper, &vm);
            return Err(e);
        }

        log::info!("created process {pid} (root {root})");
        self.slots[pid] = Some(vm);
        Ok(pid)
    }

    /// Tear down a process address space.
    ///
    /// Idempotent: destroying an unknown or already-destroyed pid is
    /// success, so shutdown and panic paths never need to track whether
    /// cleanup already ran.
    pub fn destroy<M: PhysMapper>(
        &mut self,
        frames: &mut FrameAllocator,
        mapper: &M,
        pid: Pid,
    ) {
        let Some(vm) = self.slots.get_mut(pid).and_then(Option::take) else {
            log::debug!("destroy of inactive process {pid} (no-op)");
            return;
        };
        release_space(frames, mapper, &vm);
        log::info!("destroyed process {pid}");
    }

    /// Grow the process heap by `size` bytes (page-rounded), eagerly
    /// mapped read-write, recorded as one new VMA. Returns the base of
    /// the new range.
    pub fn alloc<M: PhysMapper>(
        &mut self,
        frames: &mut FrameAllocator,
        mapper: &M,
        pid: Pid,
        size: u64,
    ) -> Result<VirtAddr, VmError> {
        let vm = self
            .slots
            .get_mut(pid)
            .and_then(Option::as_mut)
            .ok_or(VmError::UnknownProcess)?;
        if size == 0 {
            return Err(VmError::InvalidRange);
        }
        let start = vm.heap_end;
        let end = start + align_up(size, PAGE_SIZE);
        let ceiling = USER_STACK_TOP - USER_STACK_SIZE - USER_STACK_GUARD;
        if end > ceiling {
            log::warn!("process {pid} heap would collide with the stack guard");
            return Err(VmError::InvalidRange);
        }
        vm.can_add(start, end)?;

        let vma = Vma::new(start, end, VmaKind::Heap, VmaPerms::READ | VmaPerms::WRITE);
        let space = AddressSpace::from_root(mapper, vm.root);
        map_range_eagerly(frames, mapper, &space, &vma)?;

        // Checked above; the record cannot fail now.
        let _ = vm.add_vma(vma);
        vm.heap_end = end;
        Ok(VirtAddr::new(start))
    }

    /// Remove the VMA starting at `vaddr`, unmapping its pages and
    /// returning their frames. `size` must match the recorded span.
    pub fn free<M: PhysMapper>(
        &mut self,
        frames: &mut FrameAllocator,
        mapper: &M,
        pid: Pid,
        vaddr: VirtAddr,
        size: u64,
    ) -> Result<(), VmError> {
        let vm = self
            .slots
            .get_mut(pid)
            .and_then(Option::as_mut)
            .ok_or(VmError::UnknownProcess)?;
        let idx = vm
            .vmas
            .iter()
            .position(|s| s.is_some_and(|v| v.start == vaddr.as_u64()))
            .ok_or(VmError::InvalidRange)?;
        let vma = vm.vmas[idx].ok_or(VmError::InvalidRange)?;
        if vma.end - vma.start != align_up(size, PAGE_SIZE) {
            log::warn!("process {pid} free of {vaddr} with mismatched size");
            return Err(VmError::InvalidRange);
        }

        let space = AddressSpace::from_root(mapper, vm.root);
        unmap_range(frames, &space, &vma);
        vm.vmas[idx] = None;
        Ok(())
    }

    /// Resolve a page fault at `addr` by lazy page-in.
    ///
    /// A fault inside a registered VMA whose page is absent gets a fresh
    /// zeroed frame mapped with the VMA's permissions. A fault outside
    /// every VMA, or on a page that is already present (a permission
    /// violation), is reported as an access violation for the caller to
    /// escalate.
    pub fn handle_page_fault<M: PhysMapper>(
        &mut self,
        frames: &mut FrameAllocator,
        mapper: &M,
        pid: Pid,
        addr: VirtAddr,
    ) -> Result<(), VmError> {
        let vm = self
            .slots
            .get_mut(pid)
            .and_then(Option::as_mut)
            .ok_or(VmError::UnknownProcess)?;
        let Some(vma) = vm.vma_containing(addr) else {
            log::warn!("process {pid}: fault at {addr} outside every VMA");
            return Err(VmError::AccessViolation);
        };
        let flags = vma.map_flags();
        let page = VirtAddr::new(align_down(addr.as_u64(), PAGE_SIZE));

        let space = AddressSpace::from_root(mapper, vm.root);
        if space.translate(page).is_some() {
            log::warn!("process {pid}: fault at {addr} on a present mapping");
            return Err(VmError::AccessViolation);
        }
        let frame = frames
            .alloc(AllocFlags::ZERO, mapper)
            .ok_or(VmError::OutOfMemory)?;
        space.map_4k(frames, page, frame, flags).map_err(|e| {
            frames.free_4k(frame);
            match e {
                MapError::OutOfMemory => VmError::OutOfMemory,
                MapError::AlreadyMapped | MapError::Unaligned => VmError::AccessViolation,
            }
        })
    }
}

/// Map every page of `vma` with fresh zeroed frames, unwinding the whole
/// range on failure.
fn map_range_eagerly<M: PhysMapper>(
    frames: &mut FrameAllocator,
    mapper: &M,
    space: &AddressSpace<'_, M>,
    vma: &Vma,
) -> Result<(), VmError> {
    let flags = vma.map_flags();
    let mut va = vma.start;
    while va < vma.end {
        let Some(frame) = frames.alloc(AllocFlags::ZERO, mapper) else {
            unmap_partial(frames, space, vma.start, va);
            return Err(VmError::OutOfMemory);
        };
        if space.map_4k(frames, VirtAddr::new(va), frame, flags).is_err() {
            frames.free_4k(frame);
            unmap_partial(frames, space, vma.start, va);
            return Err(VmError::OutOfMemory);
        }
        va += PAGE_SIZE;
    }
    Ok(())
}

/// Unmap `[start, end)` and return the leaf frames. TLB maintenance is
/// unnecessary here: these spaces are never active while being torn down.
fn unmap_partial<M: PhysMapper>(
    frames: &mut FrameAllocator,
    space: &AddressSpace<'_, M>,
    start: u64,
    end: u64,
) {
    let mut va = start;
    while va < end {
        let v = VirtAddr::new(va);
        if let Some(pa) = space.translate(v) {
            let _ = space.unmap(v);
            frames.free_4k(pa);
        }
        va += PAGE_SIZE;
    }
}

/// Unmap every present page of `vma` and return its frames.
fn unmap_range<M: PhysMapper>(
    frames: &mut FrameAllocator,
    space: &AddressSpace<'_, M>,
    vma: &Vma,
) {
    unmap_partial(frames, space, vma.start, vma.end);
}

/// Free everything an address space owns: leaf frames of every VMA, the
/// lower-half table tree, and the root itself. The kernel half is shared
/// and is never touched.
fn release_space<M: PhysMapper>(frames: &mut FrameAllocator, mapper: &M, vm: &ProcessVm) {
    let space = AddressSpace::from_root(mapper, vm.root);
    for vma in vm.vmas() {
        unmap_range(frames, &space, vma);
    }

    // Sweep the lower-half table tree bottom-up. Huge leaves are skipped
    // defensively; this manager only creates 4 KiB mappings.
    // SAFETY: the tables below `vm.root` are exclusively owned by this
    // (now dead) process and reachable through the mapper.
    let pml4 = unsafe { mapper.phys_to_mut::<PageTable>(vm.root) };
    for i4 in 0..KERNEL_HALF_FIRST_INDEX {
        let e4 = pml4.get(i4);
        if !e4.present() {
            continue;
        }
        let pdpt = unsafe { mapper.phys_to_mut::<PageTable>(e4.address()) };
        for i3 in 0..ENTRY_COUNT {
            let e3 = pdpt.get(i3);
            if !e3.present() || e3.huge() {
                continue;
            }
            let pd = unsafe { mapper.phys_to_mut::<PageTable>(e3.address()) };
            for i2 in 0..ENTRY_COUNT {
                let e2 = pd.get(i2);
                if e2.present() && !e2.huge() {
                    frames.free_4k(e2.address());
                }
            }
            frames.free_4k(e3.address());
        }
        frames.free_4k(e4.address());
    }
    frames.free_4k(vm.root);
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_mmap::{DirectMap, RegionKind, ReservationRegistry};

    struct Harness {
        frames: FrameAllocator,
        dm: DirectMap,
        baseline: u64,
        kernel_root: PhysAddr,
    }

    /// Real host memory as "RAM": identity direct map, frame allocator
    /// over a leaked page-aligned buffer.
    fn harness(n_frames: usize) -> (VmManager, Harness) {
        let buf: &'static mut [u8] =
            Box::leak(vec![0u8; (n_frames + 1) * PAGE_SIZE as usize].into_boxed_slice());
        let base = kernel_vmem::align_up(buf.as_ptr() as u64, PAGE_SIZE);
        let descs = Box::leak(
            vec![kernel_alloc::FrameDesc::UNUSABLE; n_frames].into_boxed_slice(),
        );
        let mut frames = FrameAllocator::new(descs, PhysAddr::new(base));
        frames
            .add_region(
                PhysAddr::new(base),
                n_frames as u64 * PAGE_SIZE,
                RegionKind::Usable,
            )
            .unwrap();
        frames.finalize(&ReservationRegistry::new()).unwrap();

        let dm = DirectMap::identity();
        let kernel_root = frames.alloc(AllocFlags::ZERO, &dm).unwrap();
        let baseline = frames.free_frames();
        (
            VmManager::new(kernel_root),
            Harness {
                frames,
                dm,
                baseline,
                kernel_root,
            },
        )
    }

    #[test]
    fn create_maps_the_stack_eagerly() {
        let (mut vmm, mut h) = harness(256);
        let pid = vmm.create(&mut h.frames, &h.dm).unwrap();
        assert_eq!(pid, 0);
        let root = vmm.get_page_dir(pid).unwrap();

        let space = AddressSpace::from_root(&h.dm, root);
        // Every stack page is present; the guard page below is not.
        let stack_bottom = USER_STACK_TOP - USER_STACK_SIZE;
        assert!(space.translate(VirtAddr::new(stack_bottom)).is_some());
        assert!(space.translate(VirtAddr::new(USER_STACK_TOP - PAGE_SIZE)).is_some());
        assert!(space.translate(VirtAddr::new(stack_bottom - PAGE_SIZE)).is_none());
        // Code pages in lazily, so nothing is mapped there yet.
        assert!(space.translate(VirtAddr::new(USER_CODE_BASE)).is_none());
    }

    #[test]
    fn destroy_is_idempotent_and_leak_free() {
        let (mut vmm, mut h) = harness(256);
        let pid = vmm.create(&mut h.frames, &h.dm).unwrap();
        assert!(h.frames.free_frames() < h.baseline);

        vmm.destroy(&mut h.frames, &h.dm, pid);
        assert_eq!(h.frames.free_frames(), h.baseline);
        assert_eq!(vmm.get_page_dir(pid), None);

        // Second destroy is a no-op, not a double free.
        vmm.destroy(&mut h.frames, &h.dm, pid);
        assert_eq!(h.frames.free_frames(), h.baseline);
        // So is destroying a pid that never existed.
        vmm.destroy(&mut h.frames, &h.dm, 63);
        vmm.destroy(&mut h.frames, &h.dm, 9999);
        assert_eq!(h.frames.free_frames(), h.baseline);
    }

    #[test]
    fn destroyed_slots_are_reused_lowest_first() {
        let (mut vmm, mut h) = harness(512);
        let before = vmm.active_count();

        let pids: Vec<Pid> = (0..5).map(|_| vmm.create(&mut h.frames, &h.dm).unwrap()).collect();
        assert_eq!(pids, vec![0, 1, 2, 3, 4]);
        let root0 = vmm.get_page_dir(0).unwrap();
        let root4 = vmm.get_page_dir(4).unwrap();

        for pid in [1, 2, 3] {
            vmm.destroy(&mut h.frames, &h.dm, pid);
        }
        for pid in [1, 2, 3] {
            assert_eq!(vmm.get_page_dir(pid), None);
        }
        assert!(vmm.get_page_dir(0).is_some());
        assert!(vmm.get_page_dir(4).is_some());

        // New processes land in the freed slots, lowest first.
        let reused: Vec<Pid> = (0..3).map(|_| vmm.create(&mut h.frames, &h.dm).unwrap()).collect();
        assert_eq!(reused, vec![1, 2, 3]);
        assert_eq!(vmm.get_page_dir(0), Some(root0));
        assert_eq!(vmm.get_page_dir(4), Some(root4));

        for pid in 0..5 {
            vmm.destroy(&mut h.frames, &h.dm, pid);
        }
        assert_eq!(vmm.active_count(), before);
    }

    #[test]
    fn fault_in_vma_pages_in_lazily() {
        let (mut vmm, mut h) = harness(256);
        let pid = vmm.create(&mut h.frames, &h.dm).unwrap();

        let addr = VirtAddr::new(USER_CODE_BASE + 0x123);
        vmm.handle_page_fault(&mut h.frames, &h.dm, pid, addr).unwrap();

        let space = AddressSpace::from_root(&h.dm, vmm.get_page_dir(pid).unwrap());
        assert!(space.translate(VirtAddr::new(USER_CODE_BASE)).is_some());

        // Faulting a present page again is a protection violation.
        assert_eq!(
            vmm.handle_page_fault(&mut h.frames, &h.dm, pid, addr),
            Err(VmError::AccessViolation)
        );
    }

    #[test]
    fn fault_outside_every_vma_is_reported() {
        let (mut vmm, mut h) = harness(256);
        let pid = vmm.create(&mut h.frames, &h.dm).unwrap();

        // Stack guard page.
        let guard = USER_STACK_TOP - USER_STACK_SIZE - PAGE_SIZE;
        assert_eq!(
            vmm.handle_page_fault(&mut h.frames, &h.dm, pid, VirtAddr::new(guard)),
            Err(VmError::AccessViolation)
        );
        // Wild address.
        assert_eq!(
            vmm.handle_page_fault(&mut h.frames, &h.dm, pid, VirtAddr::new(0x1000)),
            Err(VmError::AccessViolation)
        );
        // Unknown process.
        assert_eq!(
            vmm.handle_page_fault(&mut h.frames, &h.dm, 42, VirtAddr::new(USER_CODE_BASE)),
            Err(VmError::UnknownProcess)
        );
    }

    #[test]
    fn heap_grows_monotonically_and_frees_by_vma() {
        let (mut vmm, mut h) = harness(256);
        let pid = vmm.create(&mut h.frames, &h.dm).unwrap();

        let a = vmm.alloc(&mut h.frames, &h.dm, pid, 2 * PAGE_SIZE).unwrap();
        assert_eq!(a.as_u64(), USER_HEAP_BASE);
        let b = vmm.alloc(&mut h.frames, &h.dm, pid, 100).unwrap();
        assert_eq!(b.as_u64(), USER_HEAP_BASE + 2 * PAGE_SIZE);

        let space = AddressSpace::from_root(&h.dm, vmm.get_page_dir(pid).unwrap());
        assert!(space.translate(a).is_some());
        assert!(space.translate(b).is_some());

        let free_before = h.frames.free_frames();
        vmm.free(&mut h.frames, &h.dm, pid, a, 2 * PAGE_SIZE).unwrap();
        assert!(space.translate(a).is_none());
        assert_eq!(h.frames.free_frames(), free_before + 2);
        // The second range is untouched.
        assert!(space.translate(b).is_some());

        // Mismatched size and unknown ranges are rejected.
        assert_eq!(
            vmm.free(&mut h.frames, &h.dm, pid, b, 3 * PAGE_SIZE),
            Err(VmError::InvalidRange)
        );
        assert_eq!(
            vmm.free(&mut h.frames, &h.dm, pid, VirtAddr::new(0x5000_0000), PAGE_SIZE),
            Err(VmError::InvalidRange)
        );
    }

    #[test]
    fn failed_create_rolls_back_completely() {
        // Too few frames to map a whole stack.
        let (mut vmm, mut h) = harness(8);
        assert_eq!(
            vmm.create(&mut h.frames, &h.dm),
            Err(VmError::OutOfMemory)
        );
        assert_eq!(vmm.active_count(), 0);
        // Every frame taken during the attempt came back; the kernel root
        // was not among them.
        assert_eq!(h.frames.free_frames(), h.baseline);
        assert_eq!(
            h.frames.state_of(h.kernel_root),
            Some(kernel_alloc::FrameState::Allocated)
        );
    }
}
