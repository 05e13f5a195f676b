//! The physical frame allocator, a bitmap over every frame reported by the platform.
//!
//! This is the only authority on physical frame ownership: a frame handed out here is never
//! handed out again until it is explicitly freed.

use core::fmt;
use core::ops::Range;

use alloc::vec::Vec;

use bitmap::Bitmap;
use bootinfo::item::{MemoryKind, MemoryRange};
use log::{debug, info, warn};

use crate::arch::mmu::PAGE_SIZE;
use crate::err::{Error, Result};
use crate::mm::pt::{PageTableAlloc, PageTableAllocError, PageTableFree};
use crate::mm::types::PhysFrameNum;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    /// Frames the allocator was initialized with.
    pub total: usize,
    /// Frames currently available for allocation.
    pub free: usize,
}

#[derive(Debug)]
pub struct FrameAllocator {
    bitmap: Bitmap<Vec<u64>>,
    frame_count: usize,
    hint: usize,
    total: usize,
    free: usize,
}

impl FrameAllocator {
    /// Builds the allocator from the platform memory map.
    ///
    /// Every frame starts out used; the ranges reported usable are then cleared, with holes
    /// carved out for `reserved` (the low megabyte, the kernel image, early page-table scratch).
    /// Both the usable map and `reserved` must be sorted in ascending order and disjoint.
    pub fn new(mem_map: &[MemoryRange], reserved: &[Range<PhysFrameNum>]) -> Result<Self> {
        let frame_count = usable_ranges(mem_map)
            .map(|range| range.end.as_usize())
            .max()
            .ok_or(Error::NoUsableMemory)?;

        for range in mem_map {
            debug!(
                "memory map: {}-{}: {:?}",
                PhysFrameNum::new(range.start_frame).addr(),
                PhysFrameNum::new(range.start_frame + range.frame_count).addr(),
                range.kind
            );
        }

        let mut storage = Vec::new();
        storage.try_reserve_exact(bitmap::words_required(frame_count))?;
        storage.resize(bitmap::words_required(frame_count), u64::MAX);

        let mut bitmap = Bitmap::new(storage);
        let mut total = 0;

        iter_usable_ranges(mem_map, reserved, |start, end| {
            bitmap.clear_range(start.as_usize(), end.as_usize());
            total += end - start;
        });

        if total == 0 {
            return Err(Error::NoUsableMemory);
        }

        info!(
            "frame allocator: {} frames ({}) allocatable",
            total,
            DisplayByteSize(total * PAGE_SIZE)
        );

        Ok(Self {
            bitmap,
            frame_count,
            hint: 0,
            total,
            free: total,
        })
    }

    /// Allocates a single free frame, scanning forward from the allocation hint and wrapping
    /// once to the start. Returns `None` on exhaustion.
    pub fn alloc_one(&mut self) -> Option<PhysFrameNum> {
        let index = self
            .bitmap
            .next_zero(self.hint, self.frame_count)
            .or_else(|| self.bitmap.next_zero(0, self.frame_count))?;

        self.bitmap.set(index);
        self.free -= 1;
        self.hint = index + 1;
        Some(PhysFrameNum::new(index))
    }

    /// Allocates `count` physically consecutive frames, returning the first.
    ///
    /// The scan and claim happen in one pass with no later allocation interleaved, so there is
    /// never a partially claimed run to roll back.
    pub fn alloc_contiguous(&mut self, count: usize) -> Option<PhysFrameNum> {
        assert!(count > 0);

        let start = self
            .bitmap
            .next_zero_run(self.hint, self.frame_count, count)
            .or_else(|| self.bitmap.next_zero_run(0, self.frame_count, count))?;

        self.bitmap.set_range(start, start + count);
        self.free -= count;
        self.hint = start + count;
        Some(PhysFrameNum::new(start))
    }

    /// Returns `frame` to the free pool.
    ///
    /// A double free is diagnosed and ignored: overlapping release paths are legal and must not
    /// corrupt the free count.
    pub fn free_one(&mut self, frame: PhysFrameNum) {
        let index = frame.as_usize();
        assert!(index < self.frame_count, "frame {frame} outside memory map");

        if !self.bitmap.get(index) {
            warn!("double free of frame {frame}");
            return;
        }

        self.bitmap.clear(index);
        self.free += 1;
        if index < self.hint {
            self.hint = index;
        }
    }

    pub fn free_contiguous(&mut self, frame: PhysFrameNum, count: usize) {
        for i in 0..count {
            self.free_one(frame + i);
        }
    }

    /// Removes `frame` from the allocatable pool without alloc/free accounting.
    ///
    /// Only meaningful at init time, for fixed regions the memory map reports usable but the
    /// kernel must never hand out.
    pub fn reserve(&mut self, frame: PhysFrameNum) {
        let index = frame.as_usize();
        if !self.bitmap.get(index) {
            self.bitmap.set(index);
            self.free -= 1;
        }
    }

    /// Returns a previously [`reserve`](Self::reserve)d frame to the allocatable pool.
    pub fn unreserve(&mut self, frame: PhysFrameNum) {
        let index = frame.as_usize();
        if self.bitmap.get(index) {
            self.bitmap.clear(index);
            self.free += 1;
            if index < self.hint {
                self.hint = index;
            }
        }
    }

    pub fn stats(&self) -> FrameStats {
        FrameStats {
            total: self.total,
            free: self.free,
        }
    }

    pub fn dump_usage(&self) {
        let used = self.total - self.free;
        info!(
            "physical memory usage: {} of {} ({} frames free)",
            DisplayByteSize(used * PAGE_SIZE),
            DisplayByteSize(self.total * PAGE_SIZE),
            self.free
        );
    }
}

impl PageTableAlloc for FrameAllocator {
    fn allocate(&mut self) -> core::result::Result<PhysFrameNum, PageTableAllocError> {
        self.alloc_one().ok_or(PageTableAllocError)
    }
}

impl PageTableFree for FrameAllocator {
    fn free(&mut self, frame: PhysFrameNum) {
        self.free_one(frame);
    }
}

/// Invokes `func` for every usable memory range in `mem_map`, carving out holes for any ranges
/// in `reserved_ranges`.
///
/// Both `mem_map`'s usable ranges and `reserved_ranges` must be sorted in ascending order, and
/// the ranges contained in each must be disjoint.
fn iter_usable_ranges(
    mem_map: &[MemoryRange],
    reserved_ranges: &[Range<PhysFrameNum>],
    mut func: impl FnMut(PhysFrameNum, PhysFrameNum),
) {
    let mut reserved_ranges = reserved_ranges.iter().peekable();

    'outer: for Range { mut start, end } in usable_ranges(mem_map) {
        // Chop up our usable range based on the reserved ranges that intersect it. This loop should
        // always consume all reserved ranges contained in `[0, end)`.
        while let Some(reserved) = reserved_ranges.peek().copied() {
            assert!(reserved.start <= reserved.end);

            if reserved.start >= end || reserved.end < start {
                // The next reserved range doesn't intersect us at all, so we're done here; just
                // make sure to report the remaining usable range below.
                break;
            }

            // Beyond this point: `reserved.start < end && reserved.end >= start`.

            if reserved.start > start {
                // We have a gap before the reserved range, report it.
                func(start, reserved.start);
            }
            start = reserved.end;

            if start <= end {
                // We're done with this reserved range now.
                reserved_ranges.next();
            }

            if start >= end {
                // We've covered all of the original usable range, try the next one.
                continue 'outer;
            }
        }

        // Deal with the tail/non-intersecting portion of the range.
        if start < end {
            func(start, end);
        }
    }
}

fn usable_ranges(mem_map: &[MemoryRange]) -> impl Iterator<Item = Range<PhysFrameNum>> + '_ {
    mem_map
        .iter()
        .filter(|range| range.kind == MemoryKind::Usable)
        .map(|range| {
            let start = PhysFrameNum::new(range.start_frame);
            start..start + range.frame_count
        })
}

struct DisplayByteSize(usize);

impl fmt::Display for DisplayByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 < 1024 {
            write!(f, "{}B", self.0)
        } else if self.0 < 1024 * 1024 {
            write!(f, "{}K", self.0 / 1024)
        } else if self.0 < 1024 * 1024 * 1024 {
            write!(f, "{}M", self.0 / (1024 * 1024))
        } else {
            write!(f, "{}G", self.0 / (1024 * 1024 * 1024))
        }
    }
}
