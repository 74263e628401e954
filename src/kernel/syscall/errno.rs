//! POSIX-style negative errno values returned across the syscall boundary.
//!
//! `KernelError` carries structured, subsystem-scoped information inside
//! the kernel; by the time a result crosses into user space it collapses
//! to one of these.

pub type SyscallResult = i64;

pub const SUCCESS: SyscallResult = 0;

pub const EPERM: SyscallResult = -1;
pub const ENOENT: SyscallResult = -2;
pub const ESRCH: SyscallResult = -3;
pub const EINTR: SyscallResult = -4;
pub const EIO: SyscallResult = -5;
pub const EBADF: SyscallResult = -9;
pub const ECHILD: SyscallResult = -10;
pub const EAGAIN: SyscallResult = -11;
pub const ENOMEM: SyscallResult = -12;
pub const EFAULT: SyscallResult = -14;
pub const EINVAL: SyscallResult = -22;
pub const EPIPE: SyscallResult = -32;
pub const ENOTCONN: SyscallResult = -107;
pub const ECONNREFUSED: SyscallResult = -111;
pub const ENOSYS: SyscallResult = -38;

use crate::kernel::core::result::{ErrorKind, KernelError, MemoryError, ProcessError, SocketError, SyscallError};

impl From<KernelError> for SyscallResult {
    fn from(err: KernelError) -> Self {
        match err.kind() {
            ErrorKind::Memory(MemoryError::OutOfMemory) => ENOMEM,
            ErrorKind::Memory(_) => EFAULT,
            ErrorKind::Process(ProcessError::NotFound | ProcessError::NoSuchThread) => ESRCH,
            ErrorKind::Process(ProcessError::PermissionDenied) => EPERM,
            ErrorKind::Socket(SocketError::InvalidDescriptor) => EBADF,
            ErrorKind::Socket(SocketError::NotConnected) => ENOTCONN,
            ErrorKind::Socket(SocketError::ConnectionRefused) => ECONNREFUSED,
            ErrorKind::Socket(SocketError::WouldBlock) => EAGAIN,
            ErrorKind::Socket(SocketError::BacklogFull) => EAGAIN,
            ErrorKind::Socket(SocketError::AlreadyBound) => EINVAL,
            ErrorKind::Syscall(SyscallError::BadDescriptor) => EBADF,
            ErrorKind::Syscall(SyscallError::InvalidFunction) => ENOSYS,
            ErrorKind::Syscall(SyscallError::WouldBlock) => EAGAIN,
            ErrorKind::InvalidArgument => EINVAL,
            ErrorKind::ResourceUnavailable => EAGAIN,
            ErrorKind::NotImplemented => ENOSYS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_memory_maps_to_enomem_other_memory_errors_to_efault() {
        let oom = KernelError::new(ErrorKind::Memory(MemoryError::OutOfMemory));
        assert_eq!(SyscallResult::from(oom), ENOMEM);

        let other = KernelError::new(ErrorKind::Memory(MemoryError::InvalidAddress));
        assert_eq!(SyscallResult::from(other), EFAULT);
    }

    #[test]
    fn socket_would_block_and_backlog_full_both_map_to_eagain() {
        let would_block = KernelError::new(ErrorKind::Socket(SocketError::WouldBlock));
        let backlog_full = KernelError::new(ErrorKind::Socket(SocketError::BacklogFull));
        assert_eq!(SyscallResult::from(would_block), EAGAIN);
        assert_eq!(SyscallResult::from(backlog_full), EAGAIN);
    }

    #[test]
    fn invalid_argument_maps_to_einval() {
        let err = KernelError::new(ErrorKind::InvalidArgument);
        assert_eq!(SyscallResult::from(err), EINVAL);
    }
}
