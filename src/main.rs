#![no_std]
#![no_main]

use bootloader_api::config::Mapping;
use bootloader_api::{entry_point, BootInfo, BootloaderConfig};
use core::panic::PanicInfo;
use lumen_kernel::{debug_println, hlt_loop};

/// Request the physical memory mapping the frame allocator and heap setup
/// depend on; everything else uses the bootloader's defaults.
static BOOTLOADER_CONFIG: BootloaderConfig = {
    let mut config = BootloaderConfig::new_default();
    config.mappings.physical_memory = Some(Mapping::Dynamic);
    config
};

entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    lumen_kernel::init::boot(boot_info)
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    debug_println!("[PANIC] {}", info);
    hlt_loop()
}
