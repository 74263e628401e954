//! Interrupt Descriptor Table (IDT)
//!
//! Routes the timer tick into the scheduler and page faults into the VMM.
//! Everything else that reaches here is fatal: the kernel never recovers
//! from a breakpoint or double fault it didn't set up itself.

use crate::arch::x86_64::gdt;
use crate::arch::x86_64::pic::PICS;
use crate::arch::{ArchCpu, Cpu};
use crate::debug_println;
use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

const TIMER_VECTOR: u8 = 32;

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt[TIMER_VECTOR].set_handler_fn(timer_interrupt_handler);
        idt
    };
}

/// Load the IDT onto this CPU.
pub fn init_idt() {
    IDT.load();
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    debug_println!("[EXCEPTION] BREAKPOINT at {:#x}", stack_frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) -> ! {
    ArchCpu::disable_interrupts();
    debug_println!(
        "[PANIC] DOUBLE FAULT at {:#x} (error={:#x})",
        stack_frame.instruction_pointer.as_u64(),
        error_code
    );
    loop {
        ArchCpu::halt();
    }
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let fault_addr = x86_64::registers::control::Cr2::read()
        .expect("page fault with non-canonical CR2 address");
    let flags = translate_fault_flags(error_code);

    if crate::kernel::mm::vmm::page_fault(fault_addr, flags).is_err() {
        use crate::kernel::config::FAULT_USER;
        if flags & FAULT_USER != 0 {
            debug_println!(
                "[SIGSEGV] unrecoverable user page fault at {:#x} (ip={:#x})",
                fault_addr.as_u64(),
                stack_frame.instruction_pointer.as_u64()
            );
            crate::kernel::process::lifecycle::terminate_current(crate::kernel::signal::SIGSEGV);
        } else {
            ArchCpu::disable_interrupts();
            debug_println!(
                "[PANIC] unrecoverable kernel page fault at {:#x} (ip={:#x})",
                fault_addr.as_u64(),
                stack_frame.instruction_pointer.as_u64()
            );
            loop {
                ArchCpu::halt();
            }
        }
    }
}

fn translate_fault_flags(error_code: PageFaultErrorCode) -> u8 {
    use crate::kernel::config::{FAULT_FETCH, FAULT_PRESENT, FAULT_USER, FAULT_WRITE};
    let mut flags = 0u8;
    if error_code.contains(PageFaultErrorCode::PROTECTION_VIOLATION) {
        flags |= FAULT_PRESENT;
    }
    if error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE) {
        flags |= FAULT_WRITE;
    }
    if error_code.contains(PageFaultErrorCode::USER_MODE) {
        flags |= FAULT_USER;
    }
    if error_code.contains(PageFaultErrorCode::INSTRUCTION_FETCH) {
        flags |= FAULT_FETCH;
    }
    flags
}

extern "x86-interrupt" fn timer_interrupt_handler(_stack_frame: InterruptStackFrame) {
    crate::kernel::scheduler::timer_tick();
    unsafe {
        PICS.lock().notify_end_of_interrupt(TIMER_VECTOR);
    }
}
