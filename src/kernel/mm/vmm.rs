//! Virtual memory manager: user-space page fault handling, mapping and
//! unmapping on behalf of syscalls (`mmap`-equivalent bump allocation,
//! MMIO windows), and address-space teardown.
//!
//! Fault flags use the bit layout recovered from the original kernel's
//! memory header (`kernel::config::FAULT_*`), not `x86_64`'s
//! `PageFaultErrorCode`, so this module stays the single translation point
//! between CPU-reported fault bits and what the rest of the kernel reasons
//! about.

use crate::kernel::config::{FAULT_FETCH, FAULT_PRESENT, FAULT_USER, FAULT_WRITE};
use crate::kernel::core::result::{ErrorKind, KernelError, KernelResult, MemoryError};
use crate::kernel::mm::allocator::BOOT_INFO_ALLOCATOR;
use crate::kernel::mm::user_paging::{USER_CODE_BASE, USER_STACK_TOP};
use crate::kernel::mm::PHYS_MEM_OFFSET;
use core::sync::atomic::Ordering;
use core::sync::atomic::AtomicU64;
use x86_64::structures::paging::{
    FrameAllocator, Mapper, OffsetPageTable, Page, PageSize, PageTable, PageTableFlags, PhysFrame, Size4KiB,
};
use x86_64::{PhysAddr, VirtAddr};

const USER_STACK_SIZE: u64 = 64 * 1024;
const USER_CODE_MAX_SIZE: u64 = 1024 * 1024;

/// Base of the kernel's MMIO alias window, one bump-allocated page per
/// `mmio_map()` call. Distinct from both the direct physical-memory
/// mapping (`PHYS_MEM_OFFSET`) and any process's own address space.
const MMIO_WINDOW_BASE: u64 = 0xFFFF_9000_0000_0000;
static MMIO_WINDOW_NEXT: AtomicU64 = AtomicU64::new(MMIO_WINDOW_BASE);

bitflags::bitflags! {
    /// Permission bits for an explicit `vmm::map()` request, distinct from
    /// the CPU's fault-code bits above.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u8 {
        const USER  = 0x01;
        const EXEC  = 0x02;
        const WRITE = 0x04;
    }
}

fn active_mapper(phys_mem_offset: VirtAddr) -> OffsetPageTable<'static> {
    let (frame, _) = x86_64::registers::control::Cr3::read();
    let table_ptr = (phys_mem_offset + frame.start_address().as_u64()).as_mut_ptr::<PageTable>();
    let table = unsafe { &mut *table_ptr };
    unsafe { OffsetPageTable::new(table, phys_mem_offset) }
}

fn map_fixed(
    mapper: &mut OffsetPageTable,
    frame_allocator: &mut impl FrameAllocator<Size4KiB>,
    virt: VirtAddr,
    phys: PhysAddr,
    flags: PageTableFlags,
) -> KernelResult<()> {
    let page = Page::<Size4KiB>::containing_address(virt);
    let frame = PhysFrame::<Size4KiB>::containing_address(phys);
    unsafe {
        mapper
            .map_to(page, frame, flags, frame_allocator)
            .map_err(|_| KernelError::new(ErrorKind::Memory(MemoryError::OutOfMemory)))?
            .flush();
    }
    Ok(())
}

/// `mmioMap(phys, writable)`: map one page of physical memory at `phys`
/// into the kernel's own address space (uncached, never executable) and
/// return the resulting virtual address. Used for device register access
/// that doesn't belong in any particular process's mmap region.
pub fn mmio_map(phys: PhysAddr, writable: bool) -> KernelResult<VirtAddr> {
    let phys_mem_offset = VirtAddr::new(PHYS_MEM_OFFSET.load(Ordering::Relaxed));
    let mut allocator_lock = BOOT_INFO_ALLOCATOR.lock();
    let frame_allocator = allocator_lock
        .as_mut()
        .ok_or(KernelError::new(ErrorKind::Memory(MemoryError::OutOfMemory)))?;
    let mut mapper = active_mapper(phys_mem_offset);

    let virt = VirtAddr::new(MMIO_WINDOW_NEXT.fetch_add(Size4KiB::SIZE, Ordering::Relaxed));
    let mut flags = PageTableFlags::PRESENT | PageTableFlags::NO_CACHE;
    if writable {
        flags |= PageTableFlags::WRITABLE;
    }
    map_fixed(&mut mapper, frame_allocator, virt, phys, flags)?;
    Ok(virt)
}

/// Map one physical page at a caller-chosen virtual address in whichever
/// address space is currently active - meant to be called while
/// `process::use_context()` has switched the active page table to a
/// specific process, so the mapping lands in that process rather than
/// the caller's own (§4.6's framebuffer-mapping pattern).
pub fn map_fixed_in_active(user_virt: VirtAddr, phys: PhysAddr) -> KernelResult<()> {
    let phys_mem_offset = VirtAddr::new(PHYS_MEM_OFFSET.load(Ordering::Relaxed));
    let mut allocator_lock = BOOT_INFO_ALLOCATOR.lock();
    let frame_allocator = allocator_lock
        .as_mut()
        .ok_or(KernelError::new(ErrorKind::Memory(MemoryError::OutOfMemory)))?;
    let mut mapper = active_mapper(phys_mem_offset);

    let flags =
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE | PageTableFlags::NO_CACHE;
    map_fixed(&mut mapper, frame_allocator, user_virt, phys, flags)
}

/// Handle a page fault at `fault_addr` with CPU-reported `flags`
/// (`FAULT_PRESENT | FAULT_USER | FAULT_WRITE | FAULT_FETCH`).
///
/// Implements lazy stack growth: a not-present fault inside the current
/// process's stack region allocates and maps the missing page. Anything
/// else - a protection violation, or a fault outside a known region - is
/// unrecoverable and returned as an error for the caller to turn into a
/// `SIGSEGV` (user) or a kernel panic (supervisor).
pub fn page_fault(fault_addr: VirtAddr, flags: u8) -> KernelResult<()> {
    let fault_addr_u64 = fault_addr.as_u64();
    let phys_mem_offset = VirtAddr::new(PHYS_MEM_OFFSET.load(Ordering::Relaxed));

    let stack_bottom = USER_STACK_TOP - USER_STACK_SIZE;
    let in_stack = fault_addr_u64 >= stack_bottom && fault_addr_u64 < USER_STACK_TOP;
    let in_code = fault_addr_u64 >= USER_CODE_BASE && fault_addr_u64 < USER_CODE_BASE + USER_CODE_MAX_SIZE;

    if flags & FAULT_PRESENT != 0 {
        // Protection violation on a page that's already mapped: never
        // recoverable (e.g. a write to the read-only code region).
        return Err(KernelError::with_context(
            ErrorKind::Memory(MemoryError::Unrecoverable),
            "protection violation",
        ));
    }

    if in_stack {
        let mut allocator_lock = BOOT_INFO_ALLOCATOR.lock();
        let frame_allocator = allocator_lock
            .as_mut()
            .ok_or(KernelError::new(ErrorKind::Memory(MemoryError::OutOfMemory)))?;
        let mut mapper = active_mapper(phys_mem_offset);

        let page = Page::<Size4KiB>::containing_address(fault_addr);
        let frame = frame_allocator
            .allocate_frame()
            .ok_or(KernelError::new(ErrorKind::Memory(MemoryError::OutOfMemory)))?;
        let map_flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;
        unsafe {
            mapper
                .map_to(page, frame, map_flags, frame_allocator)
                .map_err(|_| KernelError::new(ErrorKind::Memory(MemoryError::OutOfMemory)))?
                .flush();
        }
        crate::debug_println!("[VMM] lazily mapped stack page at {:#x}", page.start_address().as_u64());
        return Ok(());
    }

    if in_code {
        // Code should already be mapped by the loader; a not-present fault
        // here means the loader never covered this address.
        return Err(KernelError::with_context(
            ErrorKind::Memory(MemoryError::InvalidAddress),
            "unmapped code address",
        ));
    }

    let _ = (flags & FAULT_USER, flags & FAULT_FETCH);
    Err(KernelError::with_context(
        ErrorKind::Memory(MemoryError::InvalidAddress),
        "fault outside known user region",
    ))
}

/// `mmap`-equivalent: grow a process's bump-allocated mmap region by
/// `len` bytes (rounded up to a page), mapping fresh zeroed frames with
/// `flags`. Returns the base address of the new region.
pub fn allocate(mmap_top: VirtAddr, len: u64, flags: MapFlags) -> KernelResult<VirtAddr> {
    let phys_mem_offset = VirtAddr::new(PHYS_MEM_OFFSET.load(Ordering::Relaxed));
    let mut allocator_lock = BOOT_INFO_ALLOCATOR.lock();
    let frame_allocator = allocator_lock
        .as_mut()
        .ok_or(KernelError::new(ErrorKind::Memory(MemoryError::OutOfMemory)))?;
    let mut mapper = active_mapper(phys_mem_offset);

    let mut map_flags = PageTableFlags::PRESENT;
    if flags.contains(MapFlags::WRITE) {
        map_flags |= PageTableFlags::WRITABLE;
    }
    if flags.contains(MapFlags::USER) {
        map_flags |= PageTableFlags::USER_ACCESSIBLE;
    }
    if !flags.contains(MapFlags::EXEC) {
        map_flags |= PageTableFlags::NO_EXECUTE;
    }

    let start_page = Page::<Size4KiB>::containing_address(mmap_top);
    let page_count = len.div_ceil(Size4KiB::SIZE).max(1);
    for i in 0..page_count {
        let page = start_page + i;
        let frame = frame_allocator
            .allocate_frame()
            .ok_or(KernelError::new(ErrorKind::Memory(MemoryError::OutOfMemory)))?;
        unsafe {
            mapper
                .map_to(page, frame, map_flags, frame_allocator)
                .map_err(|_| KernelError::new(ErrorKind::Memory(MemoryError::OutOfMemory)))?
                .flush();
        }
    }

    Ok(mmap_top)
}

/// Unmap `len` bytes starting at `addr` from the current address space.
pub fn free(addr: VirtAddr, len: u64) -> KernelResult<()> {
    let phys_mem_offset = VirtAddr::new(PHYS_MEM_OFFSET.load(Ordering::Relaxed));
    let mut mapper = active_mapper(phys_mem_offset);

    let start_page = Page::<Size4KiB>::containing_address(addr);
    let page_count = len.div_ceil(Size4KiB::SIZE).max(1);
    for i in 0..page_count {
        let page = start_page + i;
        if let Ok((_, flush)) = mapper.unmap(page) {
            flush.flush();
        }
    }
    Ok(())
}
