//! Mapping helpers for a process's user address space.
//!
//! The loader only ever places one flat image (the ramdisk's `lumen`
//! payload, or a forked copy of an existing process's image) at a fixed
//! code base with a fixed-size stack above it. There is no ELF program
//! header walk: the image is mapped as one contiguous, writable-after-load
//! region starting at `USER_CODE_BASE`.

use crate::kernel::mm::PHYS_MEM_OFFSET;
use core::sync::atomic::Ordering;
use x86_64::structures::paging::{
    FrameAllocator, Mapper, OffsetPageTable, Page, PageSize, PageTable, PageTableFlags, PhysFrame,
    Size4KiB,
};
use x86_64::VirtAddr;

/// Base of the user code region: 4 MiB.
pub const USER_CODE_BASE: u64 = 0x0000_0000_0040_0000;

/// Top of the user stack (grows down from here), below the canonical
/// address-space boundary.
pub const USER_STACK_TOP: u64 = 0x0000_7000_0000_0000;

#[derive(Debug)]
pub struct MapError;

fn phys_mem_offset() -> VirtAddr {
    VirtAddr::new(PHYS_MEM_OFFSET.load(Ordering::Relaxed))
}

/// Map `code` at `entry_point`'s containing page and every subsequent page
/// needed to hold it, present + writable + user-accessible.
///
/// # Safety
/// `mapper` must address the target process's own page tables.
pub unsafe fn map_user_code<A>(
    mapper: &mut OffsetPageTable,
    code: &[u8],
    entry_point: VirtAddr,
    frame_allocator: &mut A,
) -> Result<(), MapError>
where
    A: FrameAllocator<Size4KiB>,
{
    let base_page = Page::<Size4KiB>::containing_address(VirtAddr::new(USER_CODE_BASE));
    let page_count = (code.len() as u64).div_ceil(Size4KiB::SIZE) + 1;
    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;

    for i in 0..page_count {
        let page = base_page + i;
        let frame = frame_allocator.allocate_frame().ok_or(MapError)?;
        unsafe {
            mapper
                .map_to(page, frame, flags, frame_allocator)
                .map_err(|_| MapError)?
                .flush();
        }
    }

    // Copy the image in through the physical-memory-offset window rather
    // than through the just-installed (possibly inactive) user mapping.
    let dst = unsafe {
        core::slice::from_raw_parts_mut(
            (phys_mem_offset().as_u64()
                + mapper
                    .translate_page(base_page)
                    .map_err(|_| MapError)?
                    .start_address()
                    .as_u64()) as *mut u8,
            code.len(),
        )
    };
    dst.copy_from_slice(code);

    let _ = entry_point;
    Ok(())
}

/// Allocate and map a fresh `size`-byte user stack; returns its top.
///
/// # Safety
/// `mapper` must address the target process's own page tables.
pub unsafe fn map_user_stack<A>(
    mapper: &mut OffsetPageTable,
    size: u64,
    frame_allocator: &mut A,
) -> Result<VirtAddr, MapError>
where
    A: FrameAllocator<Size4KiB>,
{
    let top = VirtAddr::new(USER_STACK_TOP);
    let bottom = VirtAddr::new(USER_STACK_TOP - size);
    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;

    let start_page = Page::<Size4KiB>::containing_address(bottom);
    let end_page = Page::<Size4KiB>::containing_address(top - 1u64);

    for page in Page::range_inclusive(start_page, end_page) {
        let frame = frame_allocator.allocate_frame().ok_or(MapError)?;
        unsafe {
            mapper
                .map_to(page, frame, flags, frame_allocator)
                .map_err(|_| MapError)?
                .flush();
        }
    }

    Ok(top)
}

/// Build a new PML4 that shares the kernel's upper half and holds a copy of
/// `source`'s user-space (lower half) mappings, frame-for-frame.
///
/// Used by `fork()`: child and parent initially share physical pages
/// (there is no copy-on-write bit tracked here, so writes by either side
/// are visible to both until a real COW scheme replaces this).
///
/// # Safety
/// `source` must be the currently active page table (read via `CR3`).
pub unsafe fn duplicate_user_page_table<A>(
    source: &mut OffsetPageTable,
    frame_allocator: &mut A,
    phys_mem_offset: VirtAddr,
) -> Result<PhysFrame, MapError>
where
    A: FrameAllocator<Size4KiB>,
{
    let new_frame = frame_allocator.allocate_frame().ok_or(MapError)?;
    let new_table_ptr =
        (phys_mem_offset + new_frame.start_address().as_u64()).as_mut_ptr::<PageTable>();
    let new_table = unsafe { &mut *new_table_ptr };
    new_table.zero();

    let (current_frame, _) = x86_64::registers::control::Cr3::read();
    let current_table_ptr =
        (phys_mem_offset + current_frame.start_address().as_u64()).as_ptr::<PageTable>();
    let current_table = unsafe { &*current_table_ptr };

    // Kernel half: share by copying the top-level entries (same frames).
    for i in 256..512 {
        new_table[i] = current_table[i].clone();
    }

    // User half: share the same leaf frames (no COW bookkeeping yet).
    for i in 0..256 {
        if current_table[i].is_unused() {
            continue;
        }
        new_table[i] = current_table[i].clone();
    }

    let _ = source;
    Ok(new_frame)
}
