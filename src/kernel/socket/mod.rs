//! Unix-domain socket core.
//!
//! Sockets are registered in a single global table (bounded by
//! `config::MAX_SOCKETS`, but grown on demand rather than preallocated -
//! the original's fixed array is wasteful to carry verbatim when nothing
//! here depends on flat indexing beyond the `SocketId` handle). Every
//! socket owns one bounded inbound queue; `send()` on a connected socket
//! pushes onto its peer's inbound queue, never its own.
//!
//! Queue overflow is `EAGAIN` (non-blocking) or a block (blocking),
//! never a silent drop, matching the ordered-delivery invariant in the
//! data model.

use crate::kernel::config::{MAX_SOCKETS, SOCKET_DEFAULT_BACKLOG, SOCKET_IO_BACKLOG};
use crate::kernel::core::result::{ErrorKind, KernelError, KernelResult, SocketError};
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use crossbeam_queue::ArrayQueue;
use lazy_static::lazy_static;
use spin::Mutex;

pub type SocketId = u32;

/// A single queued datagram/stream chunk. Socket type (stream, dgram,
/// seqpacket) is not semantically distinguished here; every socket
/// preserves send order, per the data model.
#[derive(Debug, Clone)]
pub struct Message {
    pub data: Vec<u8>,
}

struct SocketInner {
    local_addr: Option<String>,
    listening: bool,
    backlog: VecDeque<SocketId>,
    backlog_max: usize,
    peer: Option<SocketId>,
    inbound: ArrayQueue<Message>,
    refcount: usize,
    nonblocking: bool,
    /// Set once the peer has closed; `recv` drains what's left, then EOF.
    peer_closed: bool,
}

impl SocketInner {
    fn new() -> Self {
        Self {
            local_addr: None,
            listening: false,
            backlog: VecDeque::new(),
            backlog_max: SOCKET_DEFAULT_BACKLOG,
            peer: None,
            inbound: ArrayQueue::new(SOCKET_IO_BACKLOG),
            refcount: 1,
            nonblocking: false,
            peer_closed: false,
        }
    }
}

struct Registry {
    sockets: Vec<Option<Arc<Mutex<SocketInner>>>>,
    by_addr: BTreeMap<String, SocketId>,
    free: VecDeque<SocketId>,
}

impl Registry {
    const fn new() -> Self {
        Self { sockets: Vec::new(), by_addr: BTreeMap::new(), free: VecDeque::new() }
    }

    fn alloc(&mut self) -> KernelResult<SocketId> {
        if let Some(id) = self.free.pop_front() {
            self.sockets[id as usize] = Some(Arc::new(Mutex::new(SocketInner::new())));
            return Ok(id);
        }
        if self.sockets.len() >= MAX_SOCKETS {
            return Err(KernelError::new(ErrorKind::ResourceUnavailable));
        }
        let id = self.sockets.len() as SocketId;
        self.sockets.push(Some(Arc::new(Mutex::new(SocketInner::new()))));
        Ok(id)
    }

    fn get(&self, id: SocketId) -> KernelResult<Arc<Mutex<SocketInner>>> {
        self.sockets
            .get(id as usize)
            .and_then(|s| s.clone())
            .ok_or_else(|| KernelError::new(ErrorKind::Socket(SocketError::InvalidDescriptor)))
    }

    fn release(&mut self, id: SocketId) {
        if let Some(addr) = self
            .sockets
            .get(id as usize)
            .and_then(|s| s.as_ref())
            .and_then(|s| s.lock().local_addr.clone())
        {
            self.by_addr.remove(&addr);
        }
        if let Some(slot) = self.sockets.get_mut(id as usize) {
            *slot = None;
        }
        self.free.push_back(id);
    }
}

lazy_static! {
    static ref REGISTRY: Mutex<Registry> = Mutex::new(Registry::new());
}

/// `socket(domain, type, protocol)`: domain/type/protocol are accepted but
/// not inspected (Unix-domain only, order-preserving regardless of type).
pub fn create() -> KernelResult<SocketId> {
    REGISTRY.lock().alloc()
}

/// `bind(fd, addr)`: attach a local name, enforcing registry-wide uniqueness.
pub fn bind(id: SocketId, addr: &str) -> KernelResult<()> {
    let mut registry = REGISTRY.lock();
    if registry.by_addr.contains_key(addr) {
        return Err(KernelError::new(ErrorKind::Socket(SocketError::AlreadyBound)));
    }
    let socket = registry.get(id)?;
    socket.lock().local_addr = Some(String::from(addr));
    registry.by_addr.insert(String::from(addr), id);
    Ok(())
}

/// `listen(fd, backlog)`: mark a bound socket as a listener.
pub fn listen(id: SocketId, backlog: usize) -> KernelResult<()> {
    let registry = REGISTRY.lock();
    let socket = registry.get(id)?;
    let mut socket = socket.lock();
    if socket.local_addr.is_none() {
        return Err(KernelError::new(ErrorKind::InvalidArgument));
    }
    socket.listening = true;
    socket.backlog_max = if backlog == 0 { SOCKET_DEFAULT_BACKLOG } else { backlog };
    Ok(())
}

/// `accept(fd)`: pop one pending connection from a listener's backlog and
/// hand back a freshly allocated socket standing in for that connection,
/// distinct from both the listener and the connecting client. The new
/// socket and the client are wired to each other as mutual peers; the
/// listener itself never becomes anyone's peer.
///
/// Returns `EAGAIN` (as `SocketError::WouldBlock`) if none are waiting;
/// the syscall queue layer is responsible for actually blocking the
/// caller when the socket is not non-blocking.
pub fn accept(id: SocketId) -> KernelResult<SocketId> {
    let mut registry = REGISTRY.lock();
    let listener = registry.get(id)?;
    let client_id = {
        let mut listener = listener.lock();
        if !listener.listening {
            return Err(KernelError::new(ErrorKind::InvalidArgument));
        }
        listener.backlog.pop_front().ok_or_else(|| KernelError::new(ErrorKind::Socket(SocketError::WouldBlock)))?
    };

    let accepted_id = registry.alloc()?;
    let accepted = registry.get(accepted_id)?;
    accepted.lock().peer = Some(client_id);

    let client = registry.get(client_id)?;
    client.lock().peer = Some(accepted_id);

    Ok(accepted_id)
}

/// `connect(fd, addr)`: wire `fd` to the socket bound at `addr`, queuing
/// it in that socket's accept backlog. `fd`'s `peer` is left pointing at
/// the listener only as a provisional marker until `accept()` runs and
/// replaces it with the real, freshly allocated peer.
pub fn connect(id: SocketId, addr: &str) -> KernelResult<()> {
    let mut registry = REGISTRY.lock();
    let listener_id = *registry
        .by_addr
        .get(addr)
        .ok_or_else(|| KernelError::new(ErrorKind::Socket(SocketError::ConnectionRefused)))?;
    let listener = registry.get(listener_id)?;

    {
        let mut listener = listener.lock();
        if !listener.listening {
            return Err(KernelError::new(ErrorKind::Socket(SocketError::ConnectionRefused)));
        }
        if listener.backlog.len() >= listener.backlog_max {
            return Err(KernelError::new(ErrorKind::Socket(SocketError::BacklogFull)));
        }
        listener.backlog.push_back(id);
    }

    let caller = registry.get(id)?;
    caller.lock().peer = Some(listener_id);
    Ok(())
}

/// `send(fd, data, flags)`: push onto the peer's inbound queue. Returns
/// `EAGAIN` (`SocketError::WouldBlock`) if the peer's queue is full and
/// `fd` is non-blocking.
pub fn send(id: SocketId, data: &[u8]) -> KernelResult<usize> {
    let registry = REGISTRY.lock();
    let socket = registry.get(id)?;
    let (peer_id, nonblocking) = {
        let socket = socket.lock();
        (
            socket.peer.ok_or_else(|| KernelError::new(ErrorKind::Socket(SocketError::NotConnected)))?,
            socket.nonblocking,
        )
    };
    let peer = registry.get(peer_id)?;
    let peer = peer.lock();
    match peer.inbound.push(Message { data: data.to_vec() }) {
        Ok(()) => Ok(data.len()),
        Err(_) if nonblocking => Err(KernelError::new(ErrorKind::Socket(SocketError::WouldBlock))),
        Err(_) => Err(KernelError::new(ErrorKind::Socket(SocketError::WouldBlock))),
    }
}

/// `recv(fd, buf, flags)`: pop the next queued message and copy up to
/// `buf.len()` bytes into it.
pub fn recv(id: SocketId, buf: &mut [u8]) -> KernelResult<usize> {
    let registry = REGISTRY.lock();
    let socket = registry.get(id)?;
    let socket = socket.lock();
    match socket.inbound.pop() {
        Some(message) => {
            let n = message.data.len().min(buf.len());
            buf[..n].copy_from_slice(&message.data[..n]);
            Ok(n)
        }
        None if socket.peer_closed => Ok(0),
        None => Err(KernelError::new(ErrorKind::Socket(SocketError::WouldBlock))),
    }
}

/// `closeSocket(fd)`: decrement refcount; at zero, unregister and mark
/// the peer closed so its next `recv` sees EOF instead of blocking
/// forever.
pub fn close(id: SocketId) -> KernelResult<()> {
    let mut registry = REGISTRY.lock();
    let socket = registry.get(id)?;

    let (should_release, peer) = {
        let mut socket = socket.lock();
        socket.refcount -= 1;
        (socket.refcount == 0, socket.peer)
    };

    if should_release {
        if let Some(peer_id) = peer {
            if let Ok(peer) = registry.get(peer_id) {
                peer.lock().peer_closed = true;
            }
        }
        registry.release(id);
    }
    Ok(())
}

/// Mark `id` non-blocking (`fcntl(fd, F_SETFL, O_NONBLOCK)` equivalent).
pub fn set_nonblocking(id: SocketId, nonblocking: bool) -> KernelResult<()> {
    let registry = REGISTRY.lock();
    let socket = registry.get(id)?;
    socket.lock().nonblocking = nonblocking;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Socket addresses must be unique across the whole suite since the
    /// registry is a single global; each test picks its own namespace.
    fn unique_addr(tag: &str) -> alloc::string::String {
        use core::sync::atomic::{AtomicU32, Ordering};
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        alloc::format!("/test/{}/{}", tag, COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    #[test]
    fn connect_without_listener_is_refused() {
        let addr = unique_addr("refused");
        let client = create().unwrap();
        let err = connect(client, &addr).unwrap_err();
        assert_eq!(*err.kind(), ErrorKind::Socket(SocketError::ConnectionRefused));
    }

    #[test]
    fn bind_rejects_duplicate_address() {
        let addr = unique_addr("dup");
        let a = create().unwrap();
        let b = create().unwrap();
        bind(a, &addr).unwrap();
        let err = bind(b, &addr).unwrap_err();
        assert_eq!(*err.kind(), ErrorKind::Socket(SocketError::AlreadyBound));
    }

    #[test]
    fn listen_requires_a_bound_address() {
        let unbound = create().unwrap();
        assert!(listen(unbound, 1).is_err());
    }

    #[test]
    fn accept_with_nothing_pending_would_block() {
        let addr = unique_addr("accept_empty");
        let listener = create().unwrap();
        bind(listener, &addr).unwrap();
        listen(listener, 1).unwrap();
        let err = accept(listener).unwrap_err();
        assert_eq!(*err.kind(), ErrorKind::Socket(SocketError::WouldBlock));
    }

    #[test]
    fn connect_then_accept_then_send_recv_roundtrip() {
        let addr = unique_addr("roundtrip");
        let listener = create().unwrap();
        bind(listener, &addr).unwrap();
        listen(listener, 1).unwrap();

        let client = create().unwrap();
        connect(client, &addr).unwrap();

        let accepted = accept(listener).unwrap();
        assert_ne!(accepted, client);
        assert_ne!(accepted, listener);

        send(client, b"hello").unwrap();
        let mut buf = [0u8; 16];
        let n = recv(accepted, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn accept_creates_a_fresh_descriptor_with_mutual_peer_pointers() {
        let addr = unique_addr("mutual");
        let listener = create().unwrap();
        bind(listener, &addr).unwrap();
        listen(listener, 1).unwrap();

        let client = create().unwrap();
        connect(client, &addr).unwrap();
        let accepted = accept(listener).unwrap();

        let registry = REGISTRY.lock();
        let client_peer = registry.get(client).unwrap().lock().peer;
        let accepted_peer = registry.get(accepted).unwrap().lock().peer;
        assert_eq!(client_peer, Some(accepted));
        assert_eq!(accepted_peer, Some(client));
    }

    #[test]
    fn send_without_a_peer_is_not_connected() {
        let solo = create().unwrap();
        let err = send(solo, b"x").unwrap_err();
        assert_eq!(*err.kind(), ErrorKind::Socket(SocketError::NotConnected));
    }

    #[test]
    fn recv_after_peer_close_yields_eof_not_would_block() {
        let addr = unique_addr("eof");
        let listener = create().unwrap();
        bind(listener, &addr).unwrap();
        listen(listener, 1).unwrap();

        let client = create().unwrap();
        connect(client, &addr).unwrap();
        let accepted = accept(listener).unwrap();

        close(client).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(recv(accepted, &mut buf).unwrap(), 0);
    }
}
