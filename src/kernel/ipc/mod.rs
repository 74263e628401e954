//! Kernel<->server messaging over the privileged kernel socket.
//!
//! On boot the kernel creates one listening socket (the "kernel socket").
//! The first process to connect to it is trusted as the Router; every
//! later connection is checked against the Router's process tree and
//! silently dropped if it isn't the Router itself or one of its direct
//! children. `handleGeneralRequest` is the single dispatch entry every
//! accepted connection's traffic goes through.

use crate::kernel::core::result::{ErrorKind, KernelError, KernelResult};
use crate::kernel::process::ProcessId;
use crate::kernel::socket::SocketId;
use alloc::vec::Vec;
use spin::Mutex;

pub const COMMAND_OPEN: u16 = 1;
pub const COMMAND_READ: u16 = 2;
pub const COMMAND_WRITE: u16 = 3;
pub const COMMAND_STAT: u16 = 4;
pub const COMMAND_CLOSE: u16 = 5;
pub const COMMAND_MOUNT: u16 = 6;
pub const COMMAND_CHOWN: u16 = 7;
pub const COMMAND_CHMOD: u16 = 8;

/// Sent by a trusted server (a display driver, typically) asking the
/// kernel to map `page_count` pages of physical memory starting at
/// `phys_base` into the sender's own address space at `user_vaddr`.
/// Payload: `phys_base: u64`, `page_count: u32`, `user_vaddr: u64`.
pub const COMMAND_MAP_FRAMEBUFFER: u16 = 9;

pub const HEADER_LEN: usize = 16;

/// Wire header every kernel<->server message starts with. Fixed-size,
/// little-endian, no alignment padding beyond the trailing byte array
/// needed to round out to 16 bytes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MessageHeader {
    pub command: u16,
    pub length: u16,
    pub id: u64,
    pub requester_pid: u32,
    pub is_response: bool,
}

impl MessageHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..2].copy_from_slice(&self.command.to_le_bytes());
        buf[2..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4..12].copy_from_slice(&self.id.to_le_bytes());
        buf[12..16].copy_from_slice(&self.requester_pid.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> KernelResult<Self> {
        if buf.len() < HEADER_LEN {
            return Err(KernelError::new(ErrorKind::InvalidArgument));
        }
        Ok(Self {
            command: u16::from_le_bytes([buf[0], buf[1]]),
            length: u16::from_le_bytes([buf[2], buf[3]]),
            id: u64::from_le_bytes(buf[4..12].try_into().unwrap()),
            requester_pid: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            is_response: false,
        })
    }
}

#[derive(Debug, PartialEq)]
pub struct Message {
    pub header: MessageHeader,
    pub payload: Vec<u8>,
}

struct RouterIdentity {
    pid: Option<ProcessId>,
    children: Vec<ProcessId>,
}

impl RouterIdentity {
    const fn new() -> Self {
        Self { pid: None, children: Vec::new() }
    }

    fn is_trusted(&self, pid: ProcessId) -> bool {
        self.pid == Some(pid) || self.children.contains(&pid)
    }
}

static ROUTER: Mutex<RouterIdentity> = Mutex::new(RouterIdentity::new());
static KERNEL_SOCKET: Mutex<Option<SocketId>> = Mutex::new(None);
static ROUTER_PEER: Mutex<Option<SocketId>> = Mutex::new(None);

/// Create the kernel socket. Called once during boot, before any
/// user process runs.
pub fn init_kernel_socket() -> KernelResult<SocketId> {
    let id = crate::kernel::socket::create()?;
    crate::kernel::socket::bind(id, "/kernel")?;
    crate::kernel::socket::listen(id, 1)?;
    *KERNEL_SOCKET.lock() = Some(id);
    Ok(id)
}

/// The kernel socket's id (the listener), once `init_kernel_socket` has run.
pub fn kernel_socket_id() -> Option<SocketId> {
    *KERNEL_SOCKET.lock()
}

/// Accept the Router's connection on the kernel socket and record both
/// its process identity and the resulting connected socket, which is
/// what `kernel::fs`'s request marshaling actually writes to.
pub fn accept_router_connection(pid: ProcessId) -> KernelResult<()> {
    let listener = kernel_socket_id()
        .ok_or_else(|| KernelError::new(ErrorKind::Socket(crate::kernel::core::result::SocketError::NotConnected)))?;
    let peer = crate::kernel::socket::accept(listener)?;
    register_connection(pid);
    *ROUTER_PEER.lock() = Some(peer);
    Ok(())
}

/// The kernel's connected endpoint to the Router, used to send requests.
pub fn router_peer_socket() -> Option<SocketId> {
    *ROUTER_PEER.lock()
}

/// The first connector becomes the Router. Everyone else must already be
/// a registered child of the Router to be trusted.
pub fn register_connection(pid: ProcessId) -> bool {
    let mut router = ROUTER.lock();
    if router.pid.is_none() {
        router.pid = Some(pid);
        crate::debug_println!("[IPC] Router registered: PID={}", pid.as_u64());
        return true;
    }
    router.is_trusted(pid)
}

/// Record a process as a direct child of the Router, so its own kernel
/// socket connections are trusted too (servers spawned by the Router).
pub fn register_router_child(pid: ProcessId) {
    ROUTER.lock().children.push(pid);
}

/// Map `page_count` physical pages starting at `phys_base` into
/// `requester`'s own address space starting at `user_vaddr` (§4.6). Goes
/// through `mmio_map` first to establish an uncached kernel-side alias -
/// confirming the physical range is mappable at all before touching the
/// requester's page table - then `use_context`/`release_context` to make
/// the requester's address space briefly active while `map_fixed_in_active`
/// installs the same physical frames there.
fn handle_map_framebuffer(requester: ProcessId, payload: &[u8]) -> KernelResult<Vec<u8>> {
    use crate::kernel::mm::vmm;
    use x86_64::{PhysAddr, VirtAddr};

    if payload.len() < 20 {
        return Err(KernelError::new(ErrorKind::InvalidArgument));
    }
    let phys_base = u64::from_le_bytes(payload[0..8].try_into().unwrap());
    let page_count = u32::from_le_bytes(payload[8..12].try_into().unwrap());
    let user_vaddr = u64::from_le_bytes(payload[12..20].try_into().unwrap());

    for i in 0..u64::from(page_count) {
        let phys = PhysAddr::new(phys_base + i * 4096);
        vmm::mmio_map(phys, true)?;

        let previous = crate::kernel::process::use_context(requester)
            .ok_or_else(|| KernelError::new(ErrorKind::Process(crate::kernel::core::result::ProcessError::NotFound)))?;
        let result = vmm::map_fixed_in_active(VirtAddr::new(user_vaddr + i * 4096), phys);
        crate::kernel::process::release_context(previous);
        result?;
    }

    Ok(Vec::new())
}

/// Dispatch entry for traffic arriving on the kernel socket.
///
/// `requester` is the identity of the process that sent `message`,
/// established out-of-band at connect time. If it is neither the Router
/// nor a direct child of it, the message is silently dropped: the
/// caller's blocked read is left to time out on its own, matching the
/// "impostor rejected" behavior rather than returning an explicit error
/// that would confirm the kernel socket's existence to an untrusted peer.
pub fn handle_general_request(requester: ProcessId, message: &Message) -> KernelResult<Option<Message>> {
    if !ROUTER.lock().is_trusted(requester) {
        crate::debug_println!("[IPC] dropping message from untrusted PID={}", requester.as_u64());
        return Ok(None);
    }

    let response_payload = match message.header.command {
        COMMAND_MAP_FRAMEBUFFER => handle_map_framebuffer(requester, &message.payload)?,
        // The kernel is the client for these against the Router (see
        // `kernel::fs`), never the server; a trusted peer sending one of
        // them to the kernel itself is a protocol error, not routine work.
        COMMAND_OPEN | COMMAND_READ | COMMAND_WRITE | COMMAND_STAT | COMMAND_CLOSE | COMMAND_MOUNT
        | COMMAND_CHOWN | COMMAND_CHMOD => return Err(KernelError::new(ErrorKind::NotImplemented)),
        _ => return Err(KernelError::new(ErrorKind::InvalidArgument)),
    };

    Ok(Some(Message { header: MessageHeader { is_response: true, ..message.header }, payload: response_payload }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrips_through_encode_decode() {
        let header = MessageHeader {
            command: COMMAND_OPEN,
            length: 42,
            id: 0xdead_beef_u64,
            requester_pid: 7,
            is_response: false,
        };
        let decoded = MessageHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded.command, header.command);
        assert_eq!(decoded.length, header.length);
        assert_eq!(decoded.id, header.id);
        assert_eq!(decoded.requester_pid, header.requester_pid);
    }

    #[test]
    fn decode_rejects_short_buffer() {
        assert!(MessageHeader::decode(&[0u8; HEADER_LEN - 1]).is_err());
    }

    #[test]
    fn first_connector_becomes_router_and_is_trusted() {
        let mut router = RouterIdentity::new();
        let first = ProcessId::new(100);
        assert!(router.pid.is_none());
        router.pid = Some(first);
        assert!(router.is_trusted(first));
        assert!(!router.is_trusted(ProcessId::new(101)));
    }

    #[test]
    fn registered_child_is_trusted_but_stranger_is_not() {
        let mut router = RouterIdentity::new();
        router.pid = Some(ProcessId::new(1));
        router.children.push(ProcessId::new(2));
        assert!(router.is_trusted(ProcessId::new(2)));
        assert!(!router.is_trusted(ProcessId::new(3)));
    }

    #[test]
    fn handle_general_request_rejects_unknown_command() {
        let router_pid = ProcessId::new(1);
        ROUTER.lock().pid = Some(router_pid);
        let message = Message {
            header: MessageHeader {
                command: 0xFFFF,
                length: 0,
                id: 1,
                requester_pid: router_pid.as_u64() as u32,
                is_response: false,
            },
            payload: Vec::new(),
        };
        assert!(handle_general_request(router_pid, &message).is_err());
    }

    #[test]
    fn handle_general_request_silently_drops_untrusted_sender() {
        ROUTER.lock().pid = Some(ProcessId::new(1));
        let impostor = ProcessId::new(999);
        let message = Message {
            header: MessageHeader {
                command: COMMAND_OPEN,
                length: 0,
                id: 1,
                requester_pid: impostor.as_u64() as u32,
                is_response: false,
            },
            payload: Vec::new(),
        };
        assert_eq!(handle_general_request(impostor, &message).unwrap(), None);
    }
}
