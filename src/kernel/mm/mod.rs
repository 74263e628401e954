//! Memory management: kernel heap, physical frame allocation, paging, and
//! the virtual memory manager.

pub mod allocator;
pub mod paging;
pub mod pmm;
pub mod types;
pub mod user_paging;
pub mod vmm;

pub use allocator::{LinkedListAllocator, LockedHeap};
pub use types::{LayoutSize, MemoryError, PhysAddr, VirtAddr};

use core::sync::atomic::AtomicU64;

/// Offset at which the entire physical address space is mapped into the
/// kernel's virtual address space. Set once in `init::init_memory` from
/// the bootloader's `physical_memory_offset`.
pub static PHYS_MEM_OFFSET: AtomicU64 = AtomicU64::new(0);
