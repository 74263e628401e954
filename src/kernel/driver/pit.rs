//! Programmable Interval Timer (PIT)
//!
//! Drives preemption: timer IRQ0 calls into the scheduler's tick handler
//! once per quantum.

use crate::arch::x86_64::port::{Port, PortWriteOnly};
use crate::kernel::core::result::KernelResult;
use spin::Mutex;

const PIT_FREQUENCY: u32 = 1_193_182;
const CHANNEL0_DATA: u16 = 0x40;
const COMMAND_PORT: u16 = 0x43;

/// Timer tick frequency; the scheduler's timeslice is one tick.
pub const TIMER_HZ: u32 = 100;

pub struct ProgrammableIntervalTimer {
    channel0: Port<u8>,
    command: PortWriteOnly<u8>,
}

impl Default for ProgrammableIntervalTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgrammableIntervalTimer {
    pub const fn new() -> Self {
        Self {
            channel0: Port::new(CHANNEL0_DATA),
            command: PortWriteOnly::new(COMMAND_PORT),
        }
    }

    pub fn set_frequency(&mut self, freq: u32) -> KernelResult<()> {
        let divisor = PIT_FREQUENCY / freq;
        let divisor = if divisor > 65535 { 65535 } else { divisor as u16 };

        // SAFETY: standard PC/AT timer programming sequence, mode 3 (square wave).
        unsafe {
            self.command.write(0x36);
            self.channel0.write((divisor & 0xFF) as u8);
            self.channel0.write((divisor >> 8) as u8);
        }

        Ok(())
    }

    pub fn init(&mut self) -> KernelResult<()> {
        self.set_frequency(TIMER_HZ)
    }
}

pub static PIT: Mutex<ProgrammableIntervalTimer> = Mutex::new(ProgrammableIntervalTimer::new());
