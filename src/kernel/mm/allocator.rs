//! Kernel heap allocator.
//!
//! A first-fit, address-sorted free list with immediate coalescing on
//! free. Not the fastest allocator there is, but simple enough to trust
//! in a `no_std` kernel with no OS underneath to catch its bugs.

use core::alloc::{GlobalAlloc, Layout};
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;
use super::pmm::BootInfoFrameAllocator;
use super::types::{LayoutSize, MemoryError, VirtAddr};

/// Global physical frame allocator, set once during boot.
pub static BOOT_INFO_ALLOCATOR: Mutex<Option<BootInfoFrameAllocator>> = Mutex::new(None);

/// Running counters for the heap, read by `kernel::fs::stat`-adjacent
/// diagnostics and the `#[cfg(test)]` suite below.
#[derive(Debug, Clone, Copy)]
pub struct HeapStats {
    pub heap_capacity: LayoutSize,
    pub total_allocated: LayoutSize,
    pub total_deallocated: LayoutSize,
    pub current_usage: LayoutSize,
    pub peak_usage: LayoutSize,
    pub allocation_count: usize,
    pub deallocation_count: usize,
}

impl HeapStats {
    const fn new() -> Self {
        Self {
            heap_capacity: LayoutSize::zero(),
            total_allocated: LayoutSize::zero(),
            total_deallocated: LayoutSize::zero(),
            current_usage: LayoutSize::zero(),
            peak_usage: LayoutSize::zero(),
            allocation_count: 0,
            deallocation_count: 0,
        }
    }

    pub fn available(&self) -> LayoutSize {
        self.heap_capacity.checked_sub(self.current_usage).unwrap_or(LayoutSize::zero())
    }

    /// Percent of capacity currently in use, 0-100.
    pub fn usage_rate(&self) -> usize {
        let capacity = self.heap_capacity.as_usize();
        if capacity == 0 {
            return 0;
        }
        (self.current_usage.as_usize() * 100) / capacity
    }
}

/// A node in the free list, written in place at the start of the free
/// block it describes. `magic` catches the allocator walking off into
/// memory that was never a valid node - a write through a stray pointer
/// elsewhere in the kernel, say.
struct ListNode {
    size: LayoutSize,
    next: Option<&'static mut ListNode>,
    magic: u32,
}

const HEAP_MAGIC: u32 = 0xDEAD_BEEF;

impl ListNode {
    const fn new(size: LayoutSize) -> Self {
        Self { size, next: None, magic: HEAP_MAGIC }
    }

    fn start_addr(&self) -> VirtAddr {
        unsafe { VirtAddr::new_unchecked(self as *const Self as usize) }
    }

    fn end_addr(&self) -> VirtAddr {
        self.start_addr().checked_add(self.size.as_usize()).expect("list node end address overflow")
    }

    fn verify_magic(&self) -> bool {
        self.magic == HEAP_MAGIC
    }
}

/// First-fit free-list heap. `head` is a dummy zero-size node that is
/// never itself allocatable; the real free list hangs off `head.next`.
pub struct LinkedListAllocator {
    head: ListNode,
    stats: HeapStats,
}

impl Default for LinkedListAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkedListAllocator {
    pub const fn new() -> Self {
        Self { head: ListNode::new(LayoutSize::zero()), stats: HeapStats::new() }
    }

    /// # Safety
    ///
    /// `heap_start..heap_start+heap_size` must be a region the caller
    /// owns exclusively and that stays mapped for the process's
    /// lifetime. Must only be called once.
    pub unsafe fn init(&mut self, heap_start: VirtAddr, heap_size: LayoutSize) {
        let node_align = mem::align_of::<ListNode>();

        let Some(aligned_start) = heap_start.align_up(node_align) else { return };
        let head_shrink = aligned_start.as_usize().saturating_sub(heap_start.as_usize());

        let heap_size_val = heap_size.as_usize();
        if heap_size_val <= head_shrink {
            return;
        }
        let usable_size = LayoutSize::new(heap_size_val - head_shrink);
        if usable_size.as_usize() < mem::size_of::<ListNode>() {
            return;
        }

        self.stats.heap_capacity = usable_size;
        unsafe {
            self.add_free_region(aligned_start, usable_size);
        }
    }

    /// Insert `[addr, addr+size)` into the free list in address order,
    /// merging with the neighbor on either side if it's exactly
    /// adjacent.
    ///
    /// # Safety
    ///
    /// `addr` must be non-null, `addr + size` must not overflow, and the
    /// range must lie entirely within heap memory that is not otherwise
    /// referenced.
    unsafe fn add_free_region(&mut self, addr: VirtAddr, size: LayoutSize) {
        let addr_val = addr.as_usize();
        let size_val = size.as_usize();

        if addr_val == 0 {
            return;
        }
        match addr_val.checked_add(size_val) {
            Some(end) if end > addr_val => {}
            _ => return,
        }

        let node_align = mem::align_of::<ListNode>();
        let node_min_size = mem::size_of::<ListNode>();

        let Some(aligned) = addr.align_up(node_align) else { return };
        let aligned_val = aligned.as_usize();
        if aligned_val < addr_val {
            return;
        }
        let shrink = aligned_val - addr_val;
        if size_val <= shrink || size_val - shrink < node_min_size {
            return;
        }

        let usable_size = LayoutSize::new(size_val - shrink);
        let new_start = aligned;

        // Walk to the node just before where new_start belongs.
        let mut current = &mut self.head;
        while let Some(ref next) = current.next {
            if next.start_addr().as_usize() > new_start.as_usize() {
                break;
            }
            current = match current.next.as_mut() {
                Some(n) => n,
                None => unreachable!("next was Some in while let condition"),
            };
        }

        let merged_with_prev = !current.size.is_zero() && current.end_addr().as_usize() == new_start.as_usize();
        if merged_with_prev {
            current.size = current.size.checked_add(usable_size).expect("list node size overflow during merge");
        } else {
            let mut new_node = ListNode::new(usable_size);
            new_node.next = current.next.take();
            let node_ptr = unsafe { new_start.as_mut_ptr::<ListNode>() };
            unsafe {
                node_ptr.write(new_node);
                current.next = Some(&mut *node_ptr);
            }
        }

        let target_node = if merged_with_prev {
            current
        } else {
            match current.next.as_mut() {
                Some(n) => n,
                None => unreachable!("new_node was just inserted"),
            }
        };

        let target_end = target_node.end_addr();
        if let Some(ref mut next) = target_node.next
            && target_end.as_usize() == next.start_addr().as_usize()
        {
            target_node.size = target_node.size.checked_add(next.size).expect("list node size overflow during merge");
            target_node.next = next.next.take();
        }
    }

    /// First free region that fits `size` bytes at `align`, removed from
    /// the list and returned as `(region_start, region_end, region_size, alloc_start)`.
    fn find_region(&mut self, size: usize, align: usize) -> Option<(VirtAddr, VirtAddr, LayoutSize, usize)> {
        let mut current = &mut self.head;

        while let Some(ref region) = current.next {
            if !region.verify_magic() {
                panic!("heap corruption: invalid free-list node magic");
            }

            if let Ok(alloc_start) = Self::alloc_from_region(region, size, align) {
                let region_start = region.start_addr();
                let region_end = region.end_addr();
                let region_size = region.size;

                let next = current.next.as_mut().and_then(|n| n.next.take());
                current.next = next;

                return Some((region_start, region_end, region_size, alloc_start));
            }
            current = match current.next.as_mut() {
                Some(n) => n,
                None => unreachable!("current.next was Some in while let condition"),
            };
        }

        None
    }

    fn alloc_from_region(region: &ListNode, size: usize, align: usize) -> Result<usize, ()> {
        let region_start = region.start_addr();
        let alloc_start = region_start.align_up(align).ok_or(())?.as_usize();

        let region_start_val = region_start.as_usize();
        let region_end_val = region.end_addr().as_usize();
        if alloc_start < region_start_val || alloc_start > region_end_val {
            return Err(());
        }

        let alloc_end = alloc_start.checked_add(size).ok_or(())?;
        if alloc_end > region_end_val {
            return Err(());
        }

        Ok(alloc_start)
    }

    fn size_align(layout: Layout) -> Result<(usize, usize), ()> {
        let layout = layout.align_to(mem::align_of::<ListNode>()).map_err(|_| ())?.pad_to_align();
        let size = layout.size().max(mem::size_of::<ListNode>());
        Ok((size, layout.align()))
    }

    fn record_allocation(&mut self, size: usize) {
        self.stats.allocation_count += 1;
        let size_layout = LayoutSize::new(size);
        self.stats.total_allocated = self.stats.total_allocated.checked_add(size_layout).expect("total allocated overflow");
        self.stats.current_usage = self.stats.current_usage.checked_add(size_layout).expect("current usage overflow");
        if self.stats.current_usage.as_usize() > self.stats.peak_usage.as_usize() {
            self.stats.peak_usage = self.stats.current_usage;
        }
    }

    fn record_deallocation(&mut self, size: usize) {
        self.stats.deallocation_count += 1;
        let size_layout = LayoutSize::new(size);
        self.stats.total_deallocated = self.stats.total_deallocated.checked_add(size_layout).expect("total deallocated overflow");
        self.stats.current_usage = self.stats.current_usage.checked_sub(size_layout).unwrap_or(LayoutSize::zero());
    }

    pub fn stats(&self) -> HeapStats {
        self.stats
    }
}

/// `GlobalAlloc` wrapper around `LinkedListAllocator`, guarded against
/// double-`init`.
pub struct LockedHeap {
    inner: Mutex<LinkedListAllocator>,
    initialized: AtomicBool,
}

impl Default for LockedHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl LockedHeap {
    pub const fn new() -> Self {
        Self { inner: Mutex::new(LinkedListAllocator::new()), initialized: AtomicBool::new(false) }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// # Safety
    ///
    /// See `LinkedListAllocator::init`.
    ///
    /// # Errors
    ///
    /// `MemoryError::InvalidAddress` if already initialized.
    pub unsafe fn init(&self, heap_start: VirtAddr, heap_size: LayoutSize) -> Result<(), MemoryError> {
        if self.initialized.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Err(MemoryError::InvalidAddress);
        }
        unsafe {
            self.inner.lock().init(heap_start, heap_size);
        }
        Ok(())
    }

    pub fn stats(&self) -> HeapStats {
        self.inner.lock().stats()
    }
}

unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let Ok((size, align)) = LinkedListAllocator::size_align(layout) else { return ptr::null_mut() };

        let mut allocator = self.inner.lock();
        let Some((region_start, region_end, region_size, alloc_start)) = allocator.find_region(size, align) else {
            return ptr::null_mut();
        };

        let region_start_val = region_start.as_usize();
        if alloc_start > region_start_val {
            let prefix_size = LayoutSize::new(alloc_start - region_start_val);
            if prefix_size.as_usize() >= mem::size_of::<ListNode>() {
                unsafe {
                    allocator.add_free_region(region_start, prefix_size);
                }
            }
        }

        let Some(alloc_end) = alloc_start.checked_add(size) else {
            unsafe {
                allocator.add_free_region(region_start, region_size);
            }
            return ptr::null_mut();
        };

        let region_end_val = region_end.as_usize();
        if alloc_end < region_end_val {
            let suffix_size = LayoutSize::new(region_end_val - alloc_end);
            if suffix_size.as_usize() >= mem::size_of::<ListNode>() {
                let suffix_addr = unsafe { VirtAddr::new_unchecked(alloc_end) };
                unsafe {
                    allocator.add_free_region(suffix_addr, suffix_size);
                }
            }
        }

        allocator.record_allocation(size);
        alloc_start as *mut u8
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let Ok((size, _)) = LinkedListAllocator::size_align(layout) else { return };

        let mut allocator = self.inner.lock();
        allocator.record_deallocation(size);

        let addr = unsafe { VirtAddr::new_unchecked(ptr as usize) };
        unsafe {
            allocator.add_free_region(addr, LayoutSize::new(size));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::alloc::Layout;

    fn align_up(addr: usize, align: usize) -> Option<usize> {
        let remainder = addr % align;
        if remainder == 0 { Some(addr) } else { addr.checked_add(align - remainder) }
    }

    #[test]
    fn init_with_unaligned_start_accounts_for_the_shrink() {
        let heap = LockedHeap::new();
        static mut HEAP_MEM: [u8; 4096] = [0; 4096];

        unsafe {
            let start = HEAP_MEM.as_ptr() as usize;
            let unaligned_start = start + 1;
            let size = 4096 - 1;

            let _ = heap.init(VirtAddr::new(unaligned_start), LayoutSize::new(size));

            let stats = heap.stats();
            let align = core::mem::align_of::<ListNode>();
            let aligned_start = align_up(unaligned_start, align).unwrap();
            let expected_capacity = size - (aligned_start - unaligned_start);
            assert_eq!(stats.heap_capacity.as_usize(), expected_capacity);

            let layout = Layout::new::<u64>();
            let ptr = heap.alloc(layout);
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % layout.align(), 0);
            heap.dealloc(ptr, layout);
        }
    }

    #[test]
    fn freeing_adjacent_blocks_coalesces_back_to_full_capacity() {
        let heap = LockedHeap::new();
        static mut HEAP_MEM: [u8; 4096] = [0; 4096];
        unsafe {
            let _ = heap.init(VirtAddr::new(HEAP_MEM.as_ptr() as usize), LayoutSize::new(4096));
        }

        let layout = Layout::from_size_align(64, 16).unwrap();

        unsafe {
            let ptr1 = heap.alloc(layout);
            let ptr2 = heap.alloc(layout);
            let ptr3 = heap.alloc(layout);
            assert!(!ptr1.is_null() && !ptr2.is_null() && !ptr3.is_null());

            heap.dealloc(ptr2, layout);
            heap.dealloc(ptr1, layout);
            heap.dealloc(ptr3, layout);

            let stats = heap.stats();
            assert_eq!(stats.current_usage.as_usize(), 0);

            let cap = stats.heap_capacity.as_usize();
            let full_layout = Layout::from_size_align(cap, 16).unwrap();
            let ptr_full = heap.alloc(full_layout);
            assert!(!ptr_full.is_null());
            heap.dealloc(ptr_full, full_layout);
        }
    }

    #[test]
    fn allocation_with_large_alignment_splits_off_a_prefix() {
        let heap = LockedHeap::new();
        static mut HEAP_MEM: [u8; 4096] = [0; 4096];
        unsafe {
            let _ = heap.init(VirtAddr::new(HEAP_MEM.as_ptr() as usize), LayoutSize::new(4096));
        }

        let align = 256;
        let size = 64;
        let layout = Layout::from_size_align(size, align).unwrap();

        unsafe {
            let ptr = heap.alloc(layout);
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % align, 0);
            assert_eq!(heap.stats().current_usage.as_usize(), size);

            heap.dealloc(ptr, layout);
            assert_eq!(heap.stats().current_usage.as_usize(), 0);

            let cap = heap.stats().heap_capacity.as_usize();
            let full_layout = Layout::from_size_align(cap, mem::align_of::<ListNode>()).unwrap();
            let ptr_full = heap.alloc(full_layout);
            assert!(!ptr_full.is_null());
        }
    }

    #[test]
    fn a_leftover_fragment_too_small_for_a_node_is_lost_to_internal_fragmentation() {
        let heap = LockedHeap::new();
        static mut HEAP_MEM: [u8; 4096] = [0; 4096];
        unsafe {
            let _ = heap.init(VirtAddr::new(HEAP_MEM.as_ptr() as usize), LayoutSize::new(4096));
        }

        let cap = heap.stats().heap_capacity.as_usize();
        let node_size = mem::size_of::<ListNode>();
        let size = cap - node_size + 1;
        let layout = Layout::from_size_align(size, 1).unwrap();

        unsafe {
            let ptr = heap.alloc(layout);
            assert!(!ptr.is_null());
            assert_eq!(heap.stats().current_usage.as_usize(), size);

            heap.dealloc(ptr, layout);

            let full_layout = Layout::from_size_align(cap, mem::align_of::<ListNode>()).unwrap();
            let ptr_full = heap.alloc(full_layout);
            assert!(ptr_full.is_null());
        }
    }
}
