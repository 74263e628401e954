// src/init.rs
//! Boot sequence.
//!
//! Runs once, with interrupts disabled, before the scheduler's first tick:
//! CPU tables, the kernel heap, the physical frame allocator, the `lumen`
//! ramdisk payload, the syscall mechanism, and the kernel socket all come up
//! here before the first user process is handed the CPU.

use crate::arch;
use crate::arch::x86_64::pic::PICS;
use crate::kernel::driver;
use crate::kernel::mm::allocator::BOOT_INFO_ALLOCATOR;
use crate::kernel::mm::pmm::BootInfoFrameAllocator;
use crate::kernel::mm::types::{LayoutSize, VirtAddr as KernelVirtAddr};
use crate::kernel::mm::PHYS_MEM_OFFSET;
use crate::kernel::{ipc, loader, process};
use crate::{debug_println, init_heap};
use bootloader_api::BootInfo;
use core::sync::atomic::Ordering;
use x86_64::structures::paging::{FrameAllocator, Mapper, OffsetPageTable, Page, PageSize, PageTable, PageTableFlags, PhysFrame, Size4KiB};
use x86_64::{PhysAddr, VirtAddr};

/// Kernel heap region. Fixed and arbitrary, well clear of the user-space
/// regions (`USER_CODE_BASE`, `USER_STACK_TOP`) and the physical memory
/// mapping window.
const HEAP_START: u64 = 0xFFFF_FF80_0000_0000;
const HEAP_SIZE: usize = 4 * 1024 * 1024;

const TIMER_IRQ: u8 = 0;

/// Frame allocator used only to map the kernel heap, before
/// `BOOT_INFO_ALLOCATOR` can exist. `BootInfoFrameAllocator::init` collects
/// its frame list into a `Vec`, which needs a working heap - so the heap's
/// own backing frames have to come from something that doesn't.
struct BootstrapFrameAllocator<'a> {
    regions: &'a bootloader_api::info::MemoryRegions,
    next: usize,
}

impl<'a> BootstrapFrameAllocator<'a> {
    fn new(regions: &'a bootloader_api::info::MemoryRegions) -> Self {
        Self { regions, next: 0 }
    }

    fn usable_frames(&self) -> impl Iterator<Item = PhysFrame> + '_ {
        self.regions
            .iter()
            .filter(|r| r.kind == bootloader_api::info::MemoryRegionKind::Usable)
            .flat_map(|r| (r.start..r.end).step_by(4096))
            .map(|addr| PhysFrame::containing_address(PhysAddr::new(addr)))
    }
}

unsafe impl FrameAllocator<Size4KiB> for BootstrapFrameAllocator<'_> {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        let frame = self.usable_frames().nth(self.next);
        self.next += 1;
        frame
    }
}

fn active_mapper(phys_mem_offset: VirtAddr) -> OffsetPageTable<'static> {
    let (frame, _) = x86_64::registers::control::Cr3::read();
    let table_ptr = (phys_mem_offset + frame.start_address().as_u64()).as_mut_ptr::<PageTable>();
    let table = unsafe { &mut *table_ptr };
    unsafe { OffsetPageTable::new(table, phys_mem_offset) }
}

/// Map `[HEAP_START, HEAP_START + HEAP_SIZE)` into the kernel's own (boot-time)
/// page table.
fn map_kernel_heap(phys_mem_offset: VirtAddr, frame_allocator: &mut BootstrapFrameAllocator) {
    let mut mapper = active_mapper(phys_mem_offset);
    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;

    let start_page = Page::<Size4KiB>::containing_address(VirtAddr::new(HEAP_START));
    let page_count = (HEAP_SIZE as u64).div_ceil(Size4KiB::SIZE);
    for i in 0..page_count {
        let page = start_page + i;
        let frame = frame_allocator
            .allocate_frame()
            .expect("ran out of usable memory mapping the kernel heap");
        unsafe {
            mapper
                .map_to(page, frame, flags, frame_allocator)
                .expect("failed to map kernel heap page")
                .flush();
        }
    }
}

/// Resolve the boot-time ramdisk to a byte slice. The ramdisk's own
/// container format, if any, is a bootloader/build-time concern; by
/// convention this kernel treats the whole ramdisk as the `lumen` payload
/// with no further indexing.
fn resolve_ramdisk(boot_info: &'static BootInfo, phys_mem_offset: u64) -> &'static [u8] {
    let addr = boot_info
        .ramdisk_addr
        .into_option()
        .expect("bootloader did not supply a ramdisk");
    let len = boot_info.ramdisk_len as usize;
    let ptr = (phys_mem_offset + addr) as *const u8;
    unsafe { core::slice::from_raw_parts(ptr, len) }
}

/// Run the full boot sequence and hand off to the first user process.
/// Never returns.
pub fn boot(boot_info: &'static mut BootInfo) -> ! {
    arch::init_gdt();
    arch::init_idt();
    unsafe {
        PICS.lock().initialize();
    }
    debug_println!("[BOOT] GDT, IDT and PIC initialized");

    let phys_mem_offset = boot_info
        .physical_memory_offset
        .into_option()
        .expect("bootloader did not map physical memory");
    PHYS_MEM_OFFSET.store(phys_mem_offset, Ordering::Relaxed);

    let mut bootstrap_allocator = BootstrapFrameAllocator::new(&boot_info.memory_regions);
    map_kernel_heap(VirtAddr::new(phys_mem_offset), &mut bootstrap_allocator);
    unsafe {
        init_heap(KernelVirtAddr::new(HEAP_START as usize), LayoutSize::new(HEAP_SIZE))
            .expect("heap already initialized");
    }
    debug_println!("[BOOT] kernel heap ready ({} KiB)", HEAP_SIZE / 1024);

    {
        let mut allocator = BOOT_INFO_ALLOCATOR.lock();
        let boot_info_allocator = unsafe { BootInfoFrameAllocator::init(&boot_info.memory_regions) };
        debug_println!("[BOOT] {} usable frames", boot_info_allocator.frames_total());
        *allocator = Some(boot_info_allocator);
    }

    let lumen = resolve_ramdisk(boot_info, phys_mem_offset);
    loader::validate_lumen(lumen).expect("ramdisk `lumen` entry missing or undersized");
    unsafe {
        loader::set_lumen_image(lumen);
    }
    debug_println!("[BOOT] lumen image validated ({} bytes)", lumen.len());

    arch::x86_64::syscall::init();
    driver::pit::PIT.lock().init().expect("failed to program PIT");
    unsafe {
        PICS.lock().unmask_irq(TIMER_IRQ);
    }

    ipc::init_kernel_socket().expect("failed to create kernel socket");
    debug_println!("[BOOT] kernel socket listening on /kernel");

    let pid = process::create_user_process().expect("failed to create first process");
    debug_println!("[BOOT] first process created, PID={}", pid.as_u64());

    x86_64::instructions::interrupts::enable();

    // `jump_to_usermode_with_process` takes the process table lock itself
    // (to record the new current pid), so the reference handed to it can't
    // be held through an outstanding guard of our own - take a raw pointer
    // and release the guard first. Safe here: boot is single-threaded and
    // nothing else touches the table between the two lines below.
    let first: *const process::Process = {
        let table = process::PROCESS_TABLE.lock();
        table.get_process(pid).expect("first process vanished from the table") as *const _
    };
    unsafe {
        process::jump_to_usermode_with_process(&*first);
    }
}
