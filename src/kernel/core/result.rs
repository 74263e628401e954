// src/kernel/core/result.rs
//! Unified kernel error type, with context, used by every in-kernel
//! subsystem. `ErrorKind` maps onto the POSIX-style negative errno values
//! that actually cross the syscall boundary; see `kernel::syscall::errno`.

use core::fmt;

pub type KernelResult<T> = Result<T, KernelError>;

#[derive(Debug, Clone)]
pub struct KernelError {
    kind: ErrorKind,
    context: Option<&'static str>,
}

impl KernelError {
    #[inline]
    pub const fn new(kind: ErrorKind) -> Self {
        Self { kind, context: None }
    }

    #[inline]
    pub const fn with_context(kind: ErrorKind, ctx: &'static str) -> Self {
        Self { kind, context: Some(ctx) }
    }

    #[inline]
    pub const fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    #[inline]
    pub const fn context(&self) -> Option<&'static str> {
        self.context
    }

    pub const fn is_memory_error(&self) -> bool {
        matches!(self.kind, ErrorKind::Memory(_))
    }
}

/// Error kinds, one variant per owning subsystem from the data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Memory(MemoryError),
    Process(ProcessError),
    Socket(SocketError),
    Syscall(SyscallError),
    InvalidArgument,
    ResourceUnavailable,
    NotImplemented,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    OutOfMemory,
    InvalidAddress,
    MisalignedAccess,
    Unrecoverable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    NotFound,
    NoSuchThread,
    PermissionDenied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketError {
    InvalidDescriptor,
    NotConnected,
    ConnectionRefused,
    WouldBlock,
    BacklogFull,
    AlreadyBound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    BadDescriptor,
    InvalidFunction,
    WouldBlock,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            ErrorKind::Memory(e) => write!(f, "memory error: {:?}", e)?,
            ErrorKind::Process(e) => write!(f, "process error: {:?}", e)?,
            ErrorKind::Socket(e) => write!(f, "socket error: {:?}", e)?,
            ErrorKind::Syscall(e) => write!(f, "syscall error: {:?}", e)?,
            ErrorKind::InvalidArgument => write!(f, "invalid argument")?,
            ErrorKind::ResourceUnavailable => write!(f, "resource unavailable")?,
            ErrorKind::NotImplemented => write!(f, "not implemented")?,
        }
        if let Some(ctx) = self.context {
            write!(f, " ({})", ctx)?;
        }
        Ok(())
    }
}

impl From<MemoryError> for KernelError {
    fn from(e: MemoryError) -> Self {
        KernelError::new(ErrorKind::Memory(e))
    }
}

impl From<ProcessError> for KernelError {
    fn from(e: ProcessError) -> Self {
        KernelError::new(ErrorKind::Process(e))
    }
}

impl From<SocketError> for KernelError {
    fn from(e: SocketError) -> Self {
        KernelError::new(ErrorKind::Socket(e))
    }
}

impl From<SyscallError> for KernelError {
    fn from(e: SyscallError) -> Self {
        KernelError::new(ErrorKind::Syscall(e))
    }
}

impl From<ErrorKind> for KernelError {
    fn from(kind: ErrorKind) -> Self {
        KernelError::new(kind)
    }
}
