//! Minimal loader: places a flat image at the user code base and maps a
//! stack above it. No ELF program-header walk - the boot-time `lumen`
//! payload and any later `exec()` target are loaded as one contiguous,
//! position-fixed blob, matching the original design's non-goal of an
//! ELF loader beyond the bare minimum needed to run the first process.

use crate::kernel::mm::user_paging::{map_user_code, map_user_stack, USER_CODE_BASE};
use spin::Mutex;
use x86_64::structures::paging::{FrameAllocator, OffsetPageTable, Size4KiB};
use x86_64::VirtAddr;

/// The resolved `lumen` bytes, set once at boot by `init::boot` after
/// `validate_lumen` passes. `exec()` re-loads this same image: there is
/// no second binary source without a real filesystem driver in the
/// kernel, which is explicitly out of scope.
static LUMEN_IMAGE: Mutex<Option<&'static [u8]>> = Mutex::new(None);

/// Record the validated `lumen` image for later `load_user_program` calls.
///
/// # Safety
/// `image` must remain valid and unchanged for the rest of the kernel's
/// lifetime (it points into the bootloader-reserved ramdisk region).
pub unsafe fn set_lumen_image(image: &'static [u8]) {
    *LUMEN_IMAGE.lock() = Some(image);
}

/// The `lumen` image recorded by `set_lumen_image`, or an empty slice if
/// boot never got that far (callers should not reach this case; boot
/// panics first).
pub fn lumen_image() -> &'static [u8] {
    (*LUMEN_IMAGE.lock()).unwrap_or(&[])
}

/// Ramdisk entry name the kernel refuses to boot without.
pub const LUMEN_ENTRY_NAME: &str = "lumen";

/// Minimum acceptable size, in bytes, for the `lumen` payload.
pub const LUMEN_MIN_SIZE: usize = 10;

pub struct LoadedProgram {
    pub entry_point: VirtAddr,
    pub stack_top: VirtAddr,
}

#[derive(Debug)]
pub enum LoadError {
    MappingFailure,
}

/// Validate that the ramdisk actually contains `lumen` and that it meets
/// the minimum size. The ramdisk's own format (how entries are indexed)
/// is the boot loader's concern, not the kernel's; by the time this
/// function runs, `image` is already the resolved `lumen` bytes.
///
/// Returns `Err` if absent or undersized; the caller (`init::boot`) turns
/// that into a boot panic, matching the fatal-boot-prerequisite contract.
pub fn validate_lumen(image: &[u8]) -> Result<(), &'static str> {
    if image.len() < LUMEN_MIN_SIZE {
        return Err("ramdisk `lumen` entry missing or undersized");
    }
    Ok(())
}

/// Map `image` into the given address space as the user program.
pub fn load_user_program<A>(
    mapper: &mut OffsetPageTable,
    frame_allocator: &mut A,
    image: &[u8],
) -> Result<LoadedProgram, LoadError>
where
    A: FrameAllocator<Size4KiB>,
{
    let entry_point = VirtAddr::new(USER_CODE_BASE);

    unsafe {
        map_user_code(mapper, image, entry_point, frame_allocator)
            .map_err(|_| LoadError::MappingFailure)?;
    }

    let stack_top = unsafe {
        map_user_stack(mapper, 64 * 1024, frame_allocator).map_err(|_| LoadError::MappingFailure)?
    };

    Ok(LoadedProgram { entry_point, stack_top })
}
