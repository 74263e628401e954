//! Compile-time tunables. Values recovered from the original socket and
//! memory headers where the distilled design left them implicit.

/// Maximum number of live sockets system-wide (registry capacity).
pub const MAX_SOCKETS: usize = 1 << 18;

/// Default `listen()` backlog when the caller passes zero.
pub const SOCKET_DEFAULT_BACKLOG: usize = 1024;

/// Depth of each socket's per-direction message queue.
pub const SOCKET_IO_BACKLOG: usize = 64;

/// Maximum open file/socket descriptors per process.
pub const MAX_IO_DESCRIPTORS: usize = 256;

// Socket creation / flag bits, shared between `socket()` and `fcntl()`.
pub const SOCK_NONBLOCK: u32 = 0x100;
pub const SOCK_CLOEXEC: u32 = 0x200;

// `recv`/`send` message flags.
pub const MSG_PEEK: u32 = 0x01;
pub const MSG_OOB: u32 = 0x02;
pub const MSG_WAITALL: u32 = 0x04;

// Page-fault error-code bits, as delivered by the CPU and re-used by the VMM.
pub const FAULT_PRESENT: u8 = 0x01;
pub const FAULT_USER: u8 = 0x02;
pub const FAULT_WRITE: u8 = 0x04;
pub const FAULT_FETCH: u8 = 0x08;

// `open()` flag bits the kernel itself tracks (path resolution and the
// rest of the O_* space belong to the Router). `O_CLOFORK` is this
// kernel's own bit, not a POSIX one: it marks a descriptor to be dropped
// from a forked child's table rather than shared.
pub const O_APPEND: u32 = 0x0400;
pub const O_NONBLOCK: u32 = 0x0800;
pub const O_SYNC: u32 = 0x1000;
pub const O_DSYNC: u32 = 0x2000;
pub const O_CLOEXEC: u32 = 0x8_0000;
pub const O_CLOFORK: u32 = 0x10_0000;

// `fcntl()` commands.
pub const F_GETFD: u32 = 1;
pub const F_SETFD: u32 = 2;
pub const F_GETFL: u32 = 3;
pub const F_SETFL: u32 = 4;

// `lseek()` whence values.
pub const SEEK_SET: u64 = 0;
pub const SEEK_CUR: u64 = 1;

/// Physical frames below this watermark are reserved for
/// `allocateContiguous(.., PMM_CONTIGUOUS_LOW)` callers (DMA-capable
/// devices that can only address 32-bit physical addresses).
pub const PMM_LOW_WATERMARK: u64 = 16 * 1024 * 1024;

pub const PMM_CONTIGUOUS_LOW: u32 = 0x01;
