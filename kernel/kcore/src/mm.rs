pub mod aspace;
pub mod pmm;
pub mod pt;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil {
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    use bootinfo::item::{MemoryKind, MemoryRange};

    use crate::arch::mmu::{PAGE_SHIFT, PAGE_SIZE};
    use crate::mm::pmm::FrameAllocator;
    use crate::mm::pt::TranslatePhys;
    use crate::mm::types::{PhysFrameNum, VirtPageNum};

    #[repr(C, align(4096))]
    pub struct PageBuf([u8; PAGE_SIZE]);

    /// A block of real, page-aligned memory standing in for physical frames `0..frames`.
    ///
    /// Page-table nodes built by the tests live directly in this storage; the translator maps
    /// each fake frame number to the page backing it, the same job the kernel's physmap does
    /// on hardware.
    pub struct PhysArena {
        storage: Box<[PageBuf]>,
    }

    impl PhysArena {
        pub fn new(frames: usize) -> Self {
            let mut storage = Vec::with_capacity(frames);
            for _ in 0..frames {
                storage.push(PageBuf([0; PAGE_SIZE]));
            }
            Self {
                storage: storage.into_boxed_slice(),
            }
        }

        pub fn frames(&self) -> usize {
            self.storage.len()
        }

        /// A memory map describing exactly this arena's frames as usable.
        pub fn mem_map(&self) -> [MemoryRange; 1] {
            [MemoryRange {
                start_frame: 0,
                frame_count: self.frames(),
                kind: MemoryKind::Usable,
            }]
        }

        /// Builds a frame allocator covering exactly this arena's frames.
        pub fn allocator(&self) -> FrameAllocator {
            FrameAllocator::new(&self.mem_map(), &[]).unwrap()
        }

        pub fn translator(&self) -> ArenaTranslator {
            let base = self.storage.as_ptr() as usize;
            assert!(base % PAGE_SIZE == 0);
            ArenaTranslator {
                base_page: VirtPageNum::new(base >> PAGE_SHIFT),
            }
        }
    }

    #[derive(Clone)]
    pub struct ArenaTranslator {
        base_page: VirtPageNum,
    }

    impl TranslatePhys for ArenaTranslator {
        fn translate(&self, phys: PhysFrameNum) -> VirtPageNum {
            self.base_page + phys.as_usize()
        }
    }
}
