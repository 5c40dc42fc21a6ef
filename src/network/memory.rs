//! In-process transport driven through a [`MemoryHandle`].
//!
//! Nothing touches a socket: accepted identities and per-connection events
//! are injected by the handle, and sent payloads are recorded for
//! inspection. Useful for tests and for embedding the loop behind another
//! I/O layer.

use super::transport::{BindFailure, ConnectionId, NetEvent, Transport};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct Inbox {
    events: VecDeque<NetEvent>,
    /// A `Disconnect` has been popped
    closed: bool,
}

#[derive(Default)]
struct Shared {
    pending_accepts: Mutex<VecDeque<ConnectionId>>,
    queues: DashMap<ConnectionId, Inbox>,
    sent: DashMap<ConnectionId, Vec<Bytes>>,
    fail_bind: AtomicBool,
    listening: AtomicBool,
    updates: AtomicUsize,
}

pub struct MemoryTransport {
    shared: Arc<Shared>,
    local_addr: Option<SocketAddr>,
}

/// Cloneable control side of a [`MemoryTransport`]
#[derive(Clone)]
pub struct MemoryHandle {
    shared: Arc<Shared>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            local_addr: None,
        }
    }

    pub fn handle(&self) -> MemoryHandle {
        MemoryHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn bind(&mut self, addr: SocketAddr) -> Result<(), BindFailure> {
        if self.shared.fail_bind.load(Ordering::Acquire) {
            return Err(BindFailure::new(
                addr,
                io::Error::new(io::ErrorKind::AddrInUse, "address in use"),
            ));
        }
        self.local_addr = Some(addr);
        Ok(())
    }

    fn listen(&mut self) -> Result<(), BindFailure> {
        match self.local_addr {
            Some(_) => {
                self.shared.listening.store(true, Ordering::Release);
                Ok(())
            }
            None => Err(BindFailure::new(
                SocketAddr::from(([0, 0, 0, 0], 0)),
                io::Error::new(io::ErrorKind::NotConnected, "listen before bind"),
            )),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn update(&mut self) -> io::Result<()> {
        self.shared.updates.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn poll_new_connection(&mut self) -> Option<ConnectionId> {
        self.shared.pending_accepts.lock().pop_front()
    }

    fn poll_event(&self, conn: ConnectionId) -> Option<NetEvent> {
        let mut inbox = self.shared.queues.get_mut(&conn)?;
        let event = inbox.events.pop_front();
        if matches!(event, Some(NetEvent::Disconnect)) {
            inbox.closed = true;
        }
        // Events injected after the disconnect are still handed out
        if inbox.closed && inbox.events.is_empty() {
            drop(inbox);
            self.shared.queues.remove(&conn);
        }
        event
    }

    fn send(&self, conn: ConnectionId, payload: &[u8]) -> io::Result<()> {
        let open = self
            .shared
            .queues
            .get(&conn)
            .is_some_and(|inbox| !inbox.closed);
        if !open {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("connection {} is not open", conn),
            ));
        }
        self.shared
            .sent
            .entry(conn)
            .or_default()
            .push(Bytes::copy_from_slice(payload));
        Ok(())
    }

    fn disconnect(&self, conn: ConnectionId) {
        if let Some(mut inbox) = self.shared.queues.get_mut(&conn) {
            if !inbox.closed {
                inbox.events.push_back(NetEvent::Disconnect);
            }
        }
    }

    fn shutdown(&mut self) {
        self.shared.listening.store(false, Ordering::Release);
        self.shared.pending_accepts.lock().clear();
        self.shared.queues.clear();
        self.local_addr = None;
    }
}

impl MemoryHandle {
    /// Queue a connection for the next accept poll
    pub fn accept(&self, conn: ConnectionId) {
        self.shared.queues.entry(conn).or_default().closed = false;
        self.shared.pending_accepts.lock().push_back(conn);
    }

    pub fn push_data(&self, conn: ConnectionId, payload: impl Into<Bytes>) {
        self.push(conn, NetEvent::Data(payload.into()));
    }

    pub fn push_disconnect(&self, conn: ConnectionId) {
        self.push(conn, NetEvent::Disconnect);
    }

    fn push(&self, conn: ConnectionId, event: NetEvent) {
        self.shared
            .queues
            .entry(conn)
            .or_default()
            .events
            .push_back(event);
    }

    /// Make every following `bind` fail
    pub fn fail_bind(&self, fail: bool) {
        self.shared.fail_bind.store(fail, Ordering::Release);
    }

    pub fn pending_events(&self, conn: ConnectionId) -> usize {
        self.shared
            .queues
            .get(&conn)
            .map(|inbox| inbox.events.len())
            .unwrap_or(0)
    }

    pub fn sent(&self, conn: ConnectionId) -> Vec<Bytes> {
        self.shared
            .sent
            .get(&conn)
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn is_listening(&self) -> bool {
        self.shared.listening.load(Ordering::Acquire)
    }

    /// Readiness polls performed so far
    pub fn updates(&self) -> usize {
        self.shared.updates.load(Ordering::Relaxed)
    }
}
