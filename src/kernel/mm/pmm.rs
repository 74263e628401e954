//! Physical frame allocator.
//!
//! Walks the bootloader's usable-memory regions once at boot, sorts them
//! by address, and tracks their allocation state in a flat bitmap
//! (`used`) rather than a free list: a single-frame allocation is the
//! lowest-indexed clear bit, and `allocateContiguous` is a linear scan
//! for a run of clear bits whose frames are address-contiguous (§4.1).
//! Boot-reserved frames are simply never added to `frames`, so they can
//! never be handed out by either allocation path.

use alloc::vec::Vec;
use bootloader_api::info::{MemoryRegionKind, MemoryRegions};
use x86_64::structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB};
use x86_64::PhysAddr;

use crate::kernel::config::{PMM_CONTIGUOUS_LOW, PMM_LOW_WATERMARK};

/// Snapshot returned by `status()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStatus {
    pub total: usize,
    pub free: usize,
    pub used: usize,
}

pub struct BootInfoFrameAllocator {
    /// Address-sorted usable frames; array position is this allocator's
    /// bitmap index.
    frames: Vec<PhysFrame>,
    used: Vec<bool>,
    free_count: usize,
}

impl BootInfoFrameAllocator {
    /// Build the allocator from the boot-time memory map.
    ///
    /// # Safety
    /// `memory_regions` must describe the machine's actual physical memory
    /// map, and every region marked `Usable` must in fact be free for the
    /// kernel to claim.
    pub unsafe fn init(memory_regions: &MemoryRegions) -> Self {
        let mut frames: Vec<PhysFrame> = memory_regions
            .iter()
            .filter(|r| r.kind == MemoryRegionKind::Usable)
            .flat_map(|r| (r.start..r.end).step_by(4096))
            .map(|addr| PhysFrame::containing_address(PhysAddr::new(addr)))
            .collect();
        frames.sort_by_key(|f| f.start_address().as_u64());

        let used = alloc::vec![false; frames.len()];
        let free_count = frames.len();
        Self { frames, used, free_count }
    }

    pub fn frames_total(&self) -> usize {
        self.frames.len()
    }

    pub fn frames_free(&self) -> usize {
        self.free_count
    }

    /// `status()`: frame accounting for the whole machine (§4.1).
    pub fn status(&self) -> FrameStatus {
        FrameStatus { total: self.frames.len(), free: self.free_count, used: self.frames.len() - self.free_count }
    }

    fn index_of(&self, frame: PhysFrame) -> Option<usize> {
        self.frames.binary_search_by_key(&frame.start_address().as_u64(), |f| f.start_address().as_u64()).ok()
    }

    /// `allocateContiguous(pages, flags)`: find the lowest-addressed run of
    /// `pages` consecutive, currently-free, address-contiguous frames and
    /// mark the whole run used in one step. `PMM_CONTIGUOUS_LOW` in `flags`
    /// restricts the scan to frames below `PMM_LOW_WATERMARK`, for devices
    /// that can only address low physical memory.
    pub fn allocate_contiguous(&mut self, pages: usize, flags: u32) -> Option<PhysFrame<Size4KiB>> {
        if pages == 0 {
            return None;
        }
        let low_only = flags & PMM_CONTIGUOUS_LOW != 0;

        let mut run_start = None;
        let mut run_len = 0usize;

        for i in 0..self.frames.len() {
            let addr = self.frames[i].start_address().as_u64();
            if low_only && addr >= PMM_LOW_WATERMARK {
                break; // frames are address-sorted; nothing further qualifies
            }

            let breaks_run =
                self.used[i] || (run_len > 0 && addr != self.frames[i - 1].start_address().as_u64() + 4096);
            if breaks_run {
                run_start = None;
                run_len = 0;
            }

            if !self.used[i] {
                if run_len == 0 {
                    run_start = Some(i);
                }
                run_len += 1;
            }

            if run_len == pages {
                let start = run_start.expect("run_len > 0 implies run_start is set");
                for slot in &mut self.used[start..start + pages] {
                    *slot = true;
                }
                self.free_count -= pages;
                return Some(self.frames[start]);
            }
        }
        None
    }

    /// `freeContiguous(base, pages)`: release a run previously returned by
    /// `allocate_contiguous`. Frames already free within the range are left
    /// untouched rather than double-counted.
    pub fn free_contiguous(&mut self, base: PhysFrame<Size4KiB>, pages: usize) {
        let Some(start) = self.index_of(base) else { return };
        let end = (start + pages).min(self.used.len());
        for slot in &mut self.used[start..end] {
            if core::mem::replace(slot, false) {
                self.free_count += 1;
            }
        }
    }
}

unsafe impl FrameAllocator<Size4KiB> for BootInfoFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        let i = self.used.iter().position(|used| !used)?;
        self.used[i] = true;
        self.free_count -= 1;
        Some(self.frames[i])
    }
}

impl FrameDeallocator<Size4KiB> for BootInfoFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        if let Some(i) = self.index_of(frame) {
            self.used[i] = false;
            self.free_count += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_at(addr: u64) -> PhysFrame {
        PhysFrame::containing_address(PhysAddr::new(addr))
    }

    fn allocator_with_frames(count: u64) -> BootInfoFrameAllocator {
        let frames: Vec<PhysFrame> = (0..count).map(|i| frame_at(i * 4096)).collect();
        let used = alloc::vec![false; frames.len()];
        BootInfoFrameAllocator { frames, used, free_count: count as usize }
    }

    #[test]
    fn allocate_frame_advances_cursor_in_order() {
        let mut alloc = allocator_with_frames(3);
        assert_eq!(alloc.allocate_frame(), Some(frame_at(0)));
        assert_eq!(alloc.allocate_frame(), Some(frame_at(4096)));
        assert_eq!(alloc.allocate_frame(), Some(frame_at(8192)));
        assert_eq!(alloc.allocate_frame(), None);
    }

    #[test]
    fn deallocated_frame_is_reused_before_advancing_cursor() {
        let mut alloc = allocator_with_frames(2);
        let first = alloc.allocate_frame().unwrap();
        unsafe {
            alloc.deallocate_frame(first);
        }
        assert_eq!(alloc.allocate_frame(), Some(first));
        assert_eq!(alloc.allocate_frame(), Some(frame_at(4096)));
        assert_eq!(alloc.allocate_frame(), None);
    }

    #[test]
    fn frames_total_and_free_track_allocation() {
        let mut alloc = allocator_with_frames(4);
        assert_eq!(alloc.frames_total(), 4);
        assert_eq!(alloc.frames_free(), 4);

        alloc.allocate_frame();
        alloc.allocate_frame();
        assert_eq!(alloc.frames_free(), 2);

        let freed = alloc.allocate_frame().unwrap();
        unsafe {
            alloc.deallocate_frame(freed);
        }
        assert_eq!(alloc.frames_free(), 2);
    }

    #[test]
    fn status_reports_total_free_and_used() {
        let mut alloc = allocator_with_frames(4);
        alloc.allocate_frame();
        let status = alloc.status();
        assert_eq!(status, FrameStatus { total: 4, free: 3, used: 1 });
    }

    #[test]
    fn allocate_contiguous_finds_lowest_address_run() {
        let mut alloc = allocator_with_frames(8);
        alloc.allocate_frame(); // consume frame 0, breaking the first run

        let base = alloc.allocate_contiguous(3, 0).unwrap();
        assert_eq!(base, frame_at(4096));
        assert!(alloc.used[1] && alloc.used[2] && alloc.used[3]);
        assert!(!alloc.used[4]);
    }

    #[test]
    fn allocate_contiguous_skips_used_gap_mid_run() {
        let mut alloc = allocator_with_frames(8);
        // Mark frame 2 used directly to split any run crossing it.
        alloc.used[2] = true;
        alloc.free_count -= 1;

        let base = alloc.allocate_contiguous(3, 0).unwrap();
        assert_eq!(base, frame_at(3 * 4096));
    }

    #[test]
    fn allocate_contiguous_honors_low_watermark() {
        let mut alloc = allocator_with_frames(1);
        // Single frame far above the watermark; PMM_CONTIGUOUS_LOW must reject it.
        alloc.frames[0] = frame_at(PMM_LOW_WATERMARK + 4096);
        assert!(alloc.allocate_contiguous(1, PMM_CONTIGUOUS_LOW).is_none());
        assert!(alloc.allocate_contiguous(1, 0).is_some());
    }

    #[test]
    fn free_contiguous_releases_a_run_allocated_together() {
        let mut alloc = allocator_with_frames(4);
        let base = alloc.allocate_contiguous(4, 0).unwrap();
        assert_eq!(alloc.frames_free(), 0);
        alloc.free_contiguous(base, 4);
        assert_eq!(alloc.frames_free(), 4);
    }
}
