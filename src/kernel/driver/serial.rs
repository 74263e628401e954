//! 16550 UART serial driver.
//!
//! Backs `debug_println!`. This is the kernel's only boot-time diagnostic
//! sink; the TTY/framebuffer console lives in user space behind the Router
//! and is not this kernel's concern.

use crate::arch::x86_64::port::Port;
use core::fmt;
use spin::Mutex;

const COM1_BASE: u16 = 0x3F8;

pub struct SerialPort {
    data: Port<u8>,
    interrupt_enable: Port<u8>,
    fifo_control: Port<u8>,
    line_control: Port<u8>,
    modem_control: Port<u8>,
    line_status: Port<u8>,
}

impl SerialPort {
    const fn new(base: u16) -> Self {
        Self {
            data: Port::new(base),
            interrupt_enable: Port::new(base + 1),
            fifo_control: Port::new(base + 2),
            line_control: Port::new(base + 3),
            modem_control: Port::new(base + 4),
            line_status: Port::new(base + 5),
        }
    }

    /// Initialize the UART. Never panics: if the port is not backed by real
    /// hardware (e.g. under a hypervisor without a serial device), writes
    /// below simply go nowhere and `is_transmit_empty` degrades to always-true.
    pub fn init(&mut self) {
        unsafe {
            self.interrupt_enable.write(0x00); // disable interrupts
            self.line_control.write(0x80); // enable DLAB
            self.data.write(0x03); // divisor low byte: 38400 baud
            self.interrupt_enable.write(0x00); // divisor high byte
            self.line_control.write(0x03); // 8 bits, no parity, one stop bit
            self.fifo_control.write(0xC7); // enable FIFO, clear, 14-byte threshold
            self.modem_control.write(0x0B); // IRQs enabled, RTS/DSR set
        }
    }

    fn is_transmit_empty(&self) -> bool {
        unsafe { self.line_status.read() & 0x20 != 0 }
    }

    fn write_byte(&mut self, byte: u8) {
        while !self.is_transmit_empty() {}
        unsafe {
            self.data.write(byte);
        }
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.write_byte(byte);
        }
        Ok(())
    }
}

pub static SERIAL1: Mutex<SerialPort> = Mutex::new(SerialPort::new(COM1_BASE));

pub fn init() {
    SERIAL1.lock().init();
}

pub fn write_debug(args: fmt::Arguments) {
    use fmt::Write;
    let _ = SERIAL1.lock().write_fmt(args);
}
