//! Address-space management over the page-table walker.
//!
//! Every address space shares the kernel's upper-half top-level entries by value, so kernel
//! code, data and heap stay mapped no matter which space is active. The sharing is structural:
//! the child nodes behind those entries are owned by the kernel space and live as long as it
//! does. Lower-half entries are private to each space and are torn down with it.

use arrayvec::ArrayVec;
use log::debug;

use crate::arch::mmu::PT_ENTRY_COUNT;
use crate::err::{Error, Result};
use crate::mm::pmm::FrameAllocator;
use crate::mm::pt::{GatherInvalidations, PageTable, TranslatePhys};
use crate::mm::types::{PhysAddr, PhysFrameNum, Protection, VirtAddr, VirtPageNum};

/// First top-level index of the kernel's shared upper half.
const KERNEL_HALF_START: usize = PT_ENTRY_COUNT / 2;

/// A request to flush pages from the TLB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbFlush<'a> {
    /// Flush only the specified pages from the TLB.
    Specific(&'a [VirtPageNum]),
    /// Flush the entire TLB.
    All,
}

/// The hardware seam for address spaces: TLB maintenance and the active translation root.
///
/// # Safety
///
/// Implementors must ensure that [`active_root`](AddrSpaceOps::active_root) reflects the root
/// most recently passed to [`load_root`](AddrSpaceOps::load_root), and that `load_root` makes
/// the given tree the one the hardware translates through.
pub unsafe trait AddrSpaceOps {
    /// Requests a TLB flush for translations of `root`.
    ///
    /// This function should block until the request completes.
    fn flush(&self, root: PhysFrameNum, request: TlbFlush<'_>);

    /// Makes `root` the active translation root.
    fn load_root(&self, root: PhysFrameNum);

    /// Returns the currently active translation root.
    fn active_root(&self) -> PhysFrameNum;
}

/// A handle to one address space, identified by the physical frame of its top-level node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrSpace(pub(crate) PhysFrameNum);

impl AddrSpace {
    pub fn root(self) -> PhysFrameNum {
        self.0
    }
}

pub struct AddrSpaceManager<T, O> {
    kernel_root: PhysFrameNum,
    translator: T,
    ops: O,
}

impl<T: TranslatePhys + Clone, O: AddrSpaceOps> AddrSpaceManager<T, O> {
    /// Creates the manager along with the kernel's own (initially empty) address space.
    ///
    /// # Safety
    ///
    /// `translator` must provide correct virtual page numbers for every frame `pfa` can hand
    /// out, for the lifetime of the manager.
    pub unsafe fn new(pfa: &mut FrameAllocator, translator: T, ops: O) -> Result<Self> {
        let kernel_root = pfa.alloc_one().ok_or(Error::OutOfMemory)?;
        let manager = Self {
            kernel_root,
            translator,
            ops,
        };

        unsafe {
            manager.pt(kernel_root).clear();
        }

        debug!("kernel address space root: {kernel_root}");
        Ok(manager)
    }

    pub fn kernel_space(&self) -> AddrSpace {
        AddrSpace(self.kernel_root)
    }

    pub fn ops(&self) -> &O {
        &self.ops
    }

    /// Creates a new address space sharing the kernel's upper-half top-level entries.
    pub fn create_address_space(&mut self, pfa: &mut FrameAllocator) -> Result<AddrSpace> {
        let root = pfa.alloc_one().ok_or(Error::OutOfMemory)?;

        let mut pt = self.pt(root);
        unsafe {
            pt.clear();
            // Structural sharing: the kernel-owned child nodes become reachable from this
            // root as well. The lower half stays empty.
            pt.copy_root_entries(self.kernel_root, KERNEL_HALF_START..PT_ENTRY_COUNT);
        }

        debug!("created address space {root}");
        Ok(AddrSpace(root))
    }

    /// Destroys `space`, freeing every lower-half-reachable node and non-huge leaf frame,
    /// post-order, and finally the top-level node itself.
    ///
    /// # Panics
    ///
    /// Panics if `space` is the kernel's own address space or is currently active; both are
    /// unrecoverable caller bugs.
    pub fn destroy_address_space(&mut self, pfa: &mut FrameAllocator, space: AddrSpace) {
        assert!(
            space != self.kernel_space(),
            "attempted to destroy the kernel address space"
        );
        assert!(
            self.ops.active_root() != space.root(),
            "attempted to destroy the active address space"
        );

        let mut pt = self.pt(space.root());
        for index in 0..KERNEL_HALF_START {
            unsafe {
                pt.free_entry_subtree(pfa, index);
            }
        }

        pfa.free_one(space.root());
        debug!("destroyed address space {}", space.root());
    }

    /// Maps the page containing `virt` to the frame containing `phys` in `space`.
    pub fn map(
        &mut self,
        pfa: &mut FrameAllocator,
        space: AddrSpace,
        virt: VirtAddr,
        phys: PhysAddr,
        prot: Protection,
    ) -> Result<()> {
        let mut gather = PendingInvalidationGather::new();
        unsafe {
            self.pt(space.root()).map(
                pfa,
                &mut gather,
                virt.containing_page(),
                phys.containing_frame(),
                prot,
            )?;
        }
        self.ops.flush(space.root(), gather.as_tlb_flush());
        Ok(())
    }

    /// Maps a page for user-mode access, privatizing any kernel-shared node on the path.
    pub fn map_user(
        &mut self,
        pfa: &mut FrameAllocator,
        space: AddrSpace,
        virt: VirtAddr,
        phys: PhysAddr,
        prot: Protection,
    ) -> Result<()> {
        let mut gather = PendingInvalidationGather::new();
        unsafe {
            self.pt(space.root()).map_user(
                pfa,
                &mut gather,
                virt.containing_page(),
                phys.containing_frame(),
                prot | Protection::USER,
            )?;
        }
        self.ops.flush(space.root(), gather.as_tlb_flush());
        Ok(())
    }

    /// Installs a huge-page leaf at `level` (1 for 2MiB, 2 for 1GiB).
    pub fn map_huge(
        &mut self,
        pfa: &mut FrameAllocator,
        space: AddrSpace,
        virt: VirtAddr,
        phys: PhysAddr,
        level: usize,
        prot: Protection,
    ) -> Result<()> {
        let mut gather = PendingInvalidationGather::new();
        unsafe {
            self.pt(space.root()).map_huge(
                pfa,
                &mut gather,
                virt.containing_page(),
                phys.containing_frame(),
                level,
                prot,
            )?;
        }
        self.ops.flush(space.root(), gather.as_tlb_flush());
        Ok(())
    }

    /// Removes the mapping of the page containing `virt`, if any.
    ///
    /// Returns `false` if no 4KiB mapping exists there, including when the address is covered
    /// by a huge page (which cannot be partially unmapped).
    pub fn unmap(&mut self, space: AddrSpace, virt: VirtAddr) -> bool {
        let mut gather = PendingInvalidationGather::new();
        let unmapped = unsafe {
            self.pt(space.root())
                .unmap(&mut gather, virt.containing_page())
        };
        if unmapped {
            self.ops.flush(space.root(), gather.as_tlb_flush());
        }
        unmapped
    }

    pub fn translate(&self, space: AddrSpace, virt: VirtAddr) -> Option<PhysAddr> {
        self.pt(space.root()).translate(virt)
    }

    /// Maps `page_count` consecutive pages, all or nothing: if any page fails, everything
    /// mapped by this call is unmapped again before the error is returned.
    pub fn map_range(
        &mut self,
        pfa: &mut FrameAllocator,
        space: AddrSpace,
        virt: VirtAddr,
        phys: PhysAddr,
        page_count: usize,
        prot: Protection,
    ) -> Result<()> {
        let base_vpn = virt.containing_page();
        let base_frame = phys.containing_frame();

        let mut gather = PendingInvalidationGather::new();
        let mut pt = self.pt(space.root());

        for i in 0..page_count {
            let res = unsafe { pt.map(pfa, &mut gather, base_vpn + i, base_frame + i, prot) };

            if let Err(err) = res {
                for mapped in 0..i {
                    unsafe {
                        pt.unmap(&mut gather, base_vpn + mapped);
                    }
                }
                self.ops.flush(space.root(), gather.as_tlb_flush());
                return Err(err.into());
            }
        }

        self.ops.flush(space.root(), gather.as_tlb_flush());
        Ok(())
    }

    pub fn unmap_range(&mut self, space: AddrSpace, virt: VirtAddr, page_count: usize) {
        let base_vpn = virt.containing_page();

        let mut gather = PendingInvalidationGather::new();
        let mut pt = self.pt(space.root());
        for i in 0..page_count {
            unsafe {
                pt.unmap(&mut gather, base_vpn + i);
            }
        }
        self.ops.flush(space.root(), gather.as_tlb_flush());
    }

    /// Re-copies the kernel's upper-half top-level entries into `dst`, refreshing it after the
    /// kernel's own top-level layout has changed.
    pub fn clone_kernel_mappings(&mut self, dst: AddrSpace) {
        let mut pt = self.pt(dst.root());
        unsafe {
            pt.copy_root_entries(self.kernel_root, KERNEL_HALF_START..PT_ENTRY_COUNT);
        }
        self.ops.flush(dst.root(), TlbFlush::All);
    }

    /// Makes `space` the active address space, skipping the (TLB-flushing) root load when it
    /// is already active.
    pub fn switch_to(&self, space: AddrSpace) {
        if self.ops.active_root() != space.root() {
            self.ops.load_root(space.root());
        }
    }

    fn pt(&self, root: PhysFrameNum) -> PageTable<T> {
        // Safety: every root handled by the manager was allocated from the PFA and cleared
        // before use, and the translator covers all PFA frames per the `new` contract.
        unsafe { PageTable::new(root, self.translator.clone()) }
    }
}

// TODO: this value was selected at random and needs verification/tuning.
const MAX_PAGE_INVALIDATIONS: usize = 10;

enum PendingInvalidationGather {
    Specific(ArrayVec<VirtPageNum, MAX_PAGE_INVALIDATIONS>),
    All,
}

impl PendingInvalidationGather {
    fn new() -> Self {
        Self::Specific(ArrayVec::new())
    }

    fn as_tlb_flush(&self) -> TlbFlush<'_> {
        match self {
            Self::Specific(pages) => TlbFlush::Specific(pages),
            Self::All => TlbFlush::All,
        }
    }
}

impl GatherInvalidations for PendingInvalidationGather {
    fn add_tlb_flush(&mut self, vpn: VirtPageNum) {
        match self {
            Self::Specific(pages) => {
                if pages.try_push(vpn).is_err() {
                    // We've exceeded the maximum number of single-page invalidations we're
                    // willing to perform, fall back to a full flush.
                    *self = Self::All;
                }
            }
            Self::All => {}
        }
    }

    fn add_full_flush(&mut self) {
        *self = Self::All;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::testutil::{ArenaTranslator, PhysArena};

    use core::cell::Cell;

    struct RecordingOps {
        active: Cell<PhysFrameNum>,
        loads: Cell<usize>,
        flushes: Cell<usize>,
    }

    impl RecordingOps {
        fn new() -> Self {
            Self {
                active: Cell::new(PhysFrameNum::new(usize::MAX >> 12)),
                loads: Cell::new(0),
                flushes: Cell::new(0),
            }
        }
    }

    unsafe impl AddrSpaceOps for RecordingOps {
        fn flush(&self, _root: PhysFrameNum, _request: TlbFlush<'_>) {
            self.flushes.set(self.flushes.get() + 1);
        }

        fn load_root(&self, root: PhysFrameNum) {
            self.loads.set(self.loads.get() + 1);
            self.active.set(root);
        }

        fn active_root(&self) -> PhysFrameNum {
            self.active.get()
        }
    }

    fn manager(
        arena: &PhysArena,
        pfa: &mut FrameAllocator,
    ) -> AddrSpaceManager<ArenaTranslator, RecordingOps> {
        unsafe { AddrSpaceManager::new(pfa, arena.translator(), RecordingOps::new()).unwrap() }
    }

    const RW: Protection = Protection::READ.union(Protection::WRITE);

    /// A virtual address whose top-level index lies in the kernel half (entry 256).
    fn kernel_virt() -> VirtAddr {
        VirtAddr::new(KERNEL_HALF_START << (12 + 9 * 3))
    }

    #[test]
    fn spaces_share_kernel_half_and_isolate_lower() {
        let arena = PhysArena::new(128);
        let mut pfa = arena.allocator();
        let mut mgr = manager(&arena, &mut pfa);
        let kernel = mgr.kernel_space();

        // Map a kernel page before creating the spaces.
        let kframe = pfa.alloc_one().unwrap();
        mgr.map(&mut pfa, kernel, kernel_virt(), kframe.addr(), RW)
            .unwrap();

        let a = mgr.create_address_space(&mut pfa).unwrap();
        let b = mgr.create_address_space(&mut pfa).unwrap();

        // The kernel mapping resolves identically through every space.
        for space in [kernel, a, b] {
            assert_eq!(mgr.translate(space, kernel_virt()), Some(kframe.addr()));
        }

        // A lower-half mapping in one space is invisible from the others.
        let uframe = pfa.alloc_one().unwrap();
        let user_virt = VirtAddr::new(0x40_0000);
        mgr.map_user(&mut pfa, a, user_virt, uframe.addr(), RW)
            .unwrap();

        assert_eq!(mgr.translate(a, user_virt), Some(uframe.addr()));
        assert_eq!(mgr.translate(b, user_virt), None);
        assert_eq!(mgr.translate(kernel, user_virt), None);
    }

    #[test]
    fn kernel_mappings_after_create_need_refresh() {
        let arena = PhysArena::new(128);
        let mut pfa = arena.allocator();
        let mut mgr = manager(&arena, &mut pfa);
        let kernel = mgr.kernel_space();

        let space = mgr.create_address_space(&mut pfa).unwrap();

        // A kernel mapping through a brand-new top-level entry is not yet visible in the
        // already-created space.
        let kframe = pfa.alloc_one().unwrap();
        mgr.map(&mut pfa, kernel, kernel_virt(), kframe.addr(), RW)
            .unwrap();
        assert_eq!(mgr.translate(space, kernel_virt()), None);

        mgr.clone_kernel_mappings(space);
        assert_eq!(mgr.translate(space, kernel_virt()), Some(kframe.addr()));
    }

    #[test]
    fn destroy_returns_all_frames() {
        let arena = PhysArena::new(128);
        let mut pfa = arena.allocator();
        let mut mgr = manager(&arena, &mut pfa);

        let free_before = pfa.stats().free;

        let space = mgr.create_address_space(&mut pfa).unwrap();

        // Populate a few pages backed by allocator-owned frames.
        for i in 0..8 {
            let frame = pfa.alloc_one().unwrap();
            mgr.map_user(
                &mut pfa,
                space,
                VirtAddr::new(0x40_0000 + i * 0x1000),
                frame.addr(),
                RW,
            )
            .unwrap();
        }

        mgr.destroy_address_space(&mut pfa, space);
        assert_eq!(pfa.stats().free, free_before);
    }

    #[test]
    #[should_panic(expected = "kernel address space")]
    fn destroy_refuses_kernel_space() {
        let arena = PhysArena::new(64);
        let mut pfa = arena.allocator();
        let mut mgr = manager(&arena, &mut pfa);

        let kernel = mgr.kernel_space();
        mgr.destroy_address_space(&mut pfa, kernel);
    }

    #[test]
    fn map_range_rolls_back_on_failure() {
        let arena = PhysArena::new(8);
        let mut pfa = arena.allocator();
        let mut mgr = manager(&arena, &mut pfa);
        let kernel = mgr.kernel_space();

        // Each 2MiB-aligned chunk of the range needs its own leaf table, so a long enough
        // range exhausts the arena partway through.
        let virt = VirtAddr::new(0x40_0000 - 0x2000);
        let err = mgr
            .map_range(&mut pfa, kernel, virt, PhysAddr::new(0), 512 * 8, RW)
            .unwrap_err();
        assert_eq!(err, Error::OutOfMemory);

        // Nothing mapped by the failed call survives.
        for i in 0..512 * 8 {
            assert_eq!(mgr.translate(kernel, virt + i * 0x1000), None);
        }
    }

    #[test]
    fn map_range_then_unmap_range() {
        let arena = PhysArena::new(64);
        let mut pfa = arena.allocator();
        let mut mgr = manager(&arena, &mut pfa);
        let kernel = mgr.kernel_space();

        let virt = VirtAddr::new(0x80_0000);
        let phys = PhysAddr::new(0x10_0000);
        mgr.map_range(&mut pfa, kernel, virt, phys, 16, RW).unwrap();

        for i in 0..16 {
            assert_eq!(
                mgr.translate(kernel, virt + i * 0x1000),
                Some(phys + i * 0x1000)
            );
        }

        mgr.unmap_range(kernel, virt, 16);
        for i in 0..16 {
            assert_eq!(mgr.translate(kernel, virt + i * 0x1000), None);
        }

        // Every bulk operation ended in exactly one flush request.
        assert_eq!(mgr.ops().flushes.get(), 2);
    }

    #[test]
    fn unmap_reports_absent_mappings() {
        let arena = PhysArena::new(64);
        let mut pfa = arena.allocator();
        let mut mgr = manager(&arena, &mut pfa);
        let kernel = mgr.kernel_space();

        assert!(!mgr.unmap(kernel, VirtAddr::new(0x1000)));

        mgr.map(&mut pfa, kernel, VirtAddr::new(0x1000), PhysAddr::new(0x2000), RW)
            .unwrap();
        assert!(mgr.unmap(kernel, VirtAddr::new(0x1000)));
        assert!(!mgr.unmap(kernel, VirtAddr::new(0x1000)));
    }

    #[test]
    fn switch_to_elides_redundant_loads() {
        let arena = PhysArena::new(64);
        let mut pfa = arena.allocator();
        let mut mgr = manager(&arena, &mut pfa);

        let a = mgr.create_address_space(&mut pfa).unwrap();
        let b = mgr.create_address_space(&mut pfa).unwrap();

        mgr.switch_to(a);
        mgr.switch_to(a);
        assert_eq!(mgr.ops().loads.get(), 1);

        mgr.switch_to(b);
        mgr.switch_to(a);
        assert_eq!(mgr.ops().loads.get(), 3);
    }
}
