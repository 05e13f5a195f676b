//! x86_64 page-table entry layout and translation constants.
//!
//! The bit layout here is a hard ABI constraint: entries are consumed directly by the MMU.

use bitflags::bitflags;

use crate::mm::types::{PhysFrameNum, Protection};

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

pub const PT_LEVEL_COUNT: usize = 4;

pub const PT_LEVEL_SHIFT: usize = 9;
pub const PT_ENTRY_COUNT: usize = 1 << PT_LEVEL_SHIFT;
pub const PT_LEVEL_MASK: usize = PT_ENTRY_COUNT - 1;

/// Bits 12-51 of an entry hold the target frame's physical address.
const PADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageTableFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER_MODE = 1 << 2;

        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const LARGE = 1 << 7;

        const NO_EXEC = 1 << 63;
    }
}

impl PageTableFlags {
    /// Returns the flags for a leaf entry mapping a page with protection `prot`.
    pub fn from_protection(prot: Protection) -> Self {
        let mut flags = Self::PRESENT;
        if prot.contains(Protection::WRITE) {
            flags |= Self::WRITABLE;
        }
        if prot.contains(Protection::USER) {
            flags |= Self::USER_MODE;
        }
        if !prot.contains(Protection::EXECUTE) {
            flags |= Self::NO_EXEC;
        }
        flags
    }
}

/// Returns whether a huge-page leaf is architecturally legal at `level`.
///
/// x86_64 supports 2MiB leaves in the page directory (level 1) and 1GiB leaves in the
/// page-directory-pointer table (level 2).
pub const fn supports_large_leaf(level: usize) -> bool {
    level == 1 || level == 2
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn new(page: PhysFrameNum, flags: PageTableFlags) -> Self {
        let paddr = page.addr().as_u64();
        assert!(paddr & !PADDR_MASK == 0, "invalid physical frame address");
        Self(paddr | flags.bits())
    }

    pub const fn flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0)
    }

    pub const fn page(self) -> PhysFrameNum {
        PhysFrameNum::new(((self.0 & PADDR_MASK) >> PAGE_SHIFT) as usize)
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod hw {
    use super::super::x64_cpu;
    use super::PADDR_MASK;
    use crate::mm::aspace::{AddrSpaceOps, TlbFlush};
    use crate::mm::types::{PhysAddr, PhysFrameNum};

    /// [`AddrSpaceOps`] backed by the real MMU: CR3 for the translation root, `invlpg` for
    /// targeted invalidation, a CR3 reload for full flushes.
    pub struct HwAddrSpaceOps;

    unsafe impl AddrSpaceOps for HwAddrSpaceOps {
        fn flush(&self, root: PhysFrameNum, request: TlbFlush<'_>) {
            if self.active_root() != root {
                // The tree is not loaded, so none of its translations are cached.
                return;
            }

            match request {
                TlbFlush::Specific(pages) => {
                    for &vpn in pages {
                        // Safety: invalidating a cached translation never breaks one.
                        unsafe { x64_cpu::invlpg(vpn.addr().as_u64()) };
                    }
                }
                // Reloading CR3 discards every cached translation for this root.
                TlbFlush::All => {
                    // Safety: the active root stays the active root.
                    unsafe { x64_cpu::write_cr3(x64_cpu::read_cr3()) }
                }
            }
        }

        fn load_root(&self, root: PhysFrameNum) {
            // Safety: per the trait contract, `root` keeps the kernel's upper half mapped.
            unsafe { x64_cpu::write_cr3(root.addr().as_u64()) }
        }

        fn active_root(&self) -> PhysFrameNum {
            PhysAddr::new((x64_cpu::read_cr3() & PADDR_MASK) as usize).containing_frame()
        }
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use hw::HwAddrSpaceOps;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_round_trip() {
        let frame = PhysFrameNum::new(0x1234);
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_EXEC;
        let entry = PageTableEntry::new(frame, flags);

        assert_eq!(entry.page(), frame);
        assert_eq!(entry.flags(), flags);
    }

    #[test]
    fn protection_mapping() {
        let flags = PageTableFlags::from_protection(Protection::READ | Protection::EXECUTE);
        assert_eq!(flags, PageTableFlags::PRESENT);

        let flags = PageTableFlags::from_protection(
            Protection::READ | Protection::WRITE | Protection::USER,
        );
        assert_eq!(
            flags,
            PageTableFlags::PRESENT
                | PageTableFlags::WRITABLE
                | PageTableFlags::USER_MODE
                | PageTableFlags::NO_EXEC
        );
    }

    #[test]
    fn large_leaf_levels() {
        assert!(!supports_large_leaf(0));
        assert!(supports_large_leaf(1));
        assert!(supports_large_leaf(2));
        assert!(!supports_large_leaf(3));
    }
}
