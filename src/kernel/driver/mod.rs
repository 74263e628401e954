// src/kernel/driver/mod.rs
//! Boot-time diagnostic drivers.
//!
//! Everything that speaks to a screen or keyboard lives in user space behind
//! the Router; the kernel only needs a debug-output sink and the interval
//! timer that drives preemption.

pub mod pit;
pub mod serial;

pub use serial::{write_debug, SerialPort, SERIAL1};
