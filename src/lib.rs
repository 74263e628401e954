// src/lib.rs
//! Microkernel core: memory management, process/thread lifecycle,
//! scheduling, syscalls, Unix-domain sockets, and kernel<->server
//! messaging. The filesystem, device drivers, and the Router live in
//! user space behind these surfaces.

#![cfg_attr(not(feature = "std-tests"), no_std)]
#![feature(abi_x86_interrupt)]
#![cfg_attr(all(test, not(feature = "std-tests")), no_main)]
#![cfg_attr(all(test, not(feature = "std-tests")), feature(custom_test_frameworks))]
#![cfg_attr(all(test, not(feature = "std-tests")), test_runner(crate::test_runner))]
#![cfg_attr(all(test, not(feature = "std-tests")), reexport_test_harness_main = "test_main")]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![allow(missing_docs)]

extern crate alloc;

pub mod qemu;
pub mod arch;
pub mod init;
pub mod kernel;
pub mod sync;

use core::panic::PanicInfo;
use crate::arch::{Cpu, ArchCpu};

// グローバルヒープアロケータ
#[global_allocator]
static ALLOCATOR: kernel::mm::LockedHeap = kernel::mm::LockedHeap::new();

/// ヒープ初期化エラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// 既に初期化済み
    AlreadyInitialized,
}

/// ヒープを初期化
///
/// この関数は、ヒープの初期化を一度だけ実行することを保証します。
/// 二回目以降の呼び出しは `Err(HeapError::AlreadyInitialized)` を返します。
///
/// # Safety
///
/// この関数は、カーネルブート時にのみ実行されることが意図されており、
/// 呼び出し元は、提供されるメモリ範囲が有効かつ排他的であることを保証する必要があります。
///
/// # Errors
///
/// - `HeapError::AlreadyInitialized` - 既に初期化済みの場合
pub unsafe fn init_heap(
    heap_start: kernel::mm::VirtAddr, 
    heap_size: kernel::mm::LayoutSize
) -> Result<(), HeapError> {
    // 基本的な妥当性チェック
    debug_assert!(heap_start.as_usize() != 0, "Heap start address must not be null");
    debug_assert!(heap_size.as_usize() > 0, "Heap size must be greater than zero");
    
    // Safety: 呼び出し元がヒープ領域の有効性を保証している
    // ALLOCATOR.init内部でunsafe操作と初期化チェックを行う
    unsafe {
        ALLOCATOR.init(heap_start, heap_size)
            .map_err(|_| HeapError::AlreadyInitialized)
    }
}

pub use qemu::{exit_qemu, QemuExitCode};

/// `debug_print!` - serial-only diagnostic output. There is no console
/// device in the kernel; everything user-visible goes through the
/// Router and its servers.
#[macro_export]
macro_rules! debug_print {
    ($($arg:tt)*) => {{
        $crate::kernel::driver::write_debug(format_args!($($arg)*));
    }};
}

/// `debug_println!` - `debug_print!` plus a trailing newline.
#[macro_export]
macro_rules! debug_println {
    () => ($crate::debug_print!("\n"));
    ($($arg:tt)*) => ($crate::debug_print!("{}\n", format_args!($($arg)*)));
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {{
        $crate::debug_print!($($arg)*);
    }};
}

#[macro_export]
macro_rules! println {
    () => ($crate::debug_print!("\n"));
    ($($arg:tt)*) => ($crate::debug_print!("{}\n", format_args!($($arg)*)));
}

/// Halt loop
#[inline]
pub fn hlt_loop() -> ! {
    loop {
        ArchCpu::halt();
    }
}

/// Test trait
pub trait Testable {
    fn run(&self);
}

impl<T> Testable for T
where
    T: Fn(),
{
    fn run(&self) {
        print!("[TEST] {} ... ", core::any::type_name::<T>());
        self();
        println!("ok");
    }
}

/// Test runner
pub fn test_runner(tests: &[&dyn Testable]) {
    println!("[TEST RUNNER] running {} tests", tests.len());
    for test in tests {
        test.run();
    }
    exit_qemu(QemuExitCode::Success);
}

/// Test panic handler
#[cfg(all(test, not(feature = "std-tests")))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    test_panic_handler(info)
}

#[inline(never)]
pub fn test_panic_handler(info: &PanicInfo) -> ! {
    println!("[TEST PANIC] {}", info);
    exit_qemu(QemuExitCode::Failed);
}
