//! TCP transport over mio.
//!
//! Messages are framed as a little-endian `u16` payload length followed by
//! the payload. Readiness is polled without blocking once per tick; reads
//! are split into frames and queued per connection until the dispatcher
//! pops them.

use super::transport::{BindFailure, ConnectionId, NetEvent, Transport};
use crate::config::Config;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const LISTENER: Token = Token(0);
const FRAME_HEADER_LEN: usize = 2;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },
}

/// Prefix `payload` with its length
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, FrameError> {
    let len = u16::try_from(payload.len()).map_err(|_| FrameError::TooLarge {
        len: payload.len(),
        max: u16::MAX as usize,
    })?;
    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.put_u16_le(len);
    frame.extend_from_slice(payload);
    Ok(frame.freeze())
}

/// Move every complete frame out of `buf` into `out`
///
/// Partial frames stay in `buf` for the next read.
pub fn split_frames(
    buf: &mut BytesMut,
    max: usize,
    out: &mut Vec<Bytes>,
) -> Result<(), FrameError> {
    while buf.len() >= FRAME_HEADER_LEN {
        let len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        if len > max {
            return Err(FrameError::TooLarge { len, max });
        }
        if buf.len() < FRAME_HEADER_LEN + len {
            break;
        }
        buf.advance(FRAME_HEADER_LEN);
        out.push(buf.split_to(len).freeze());
    }
    Ok(())
}

struct Peer {
    stream: TcpStream,
    addr: SocketAddr,
    inbound: BytesMut,
    outbound: BytesMut,
    events: VecDeque<NetEvent>,
    /// `Disconnect` queued; no more reads or sends
    closing: bool,
    /// `Disconnect` popped by the dispatcher
    reported: bool,
}

impl Peer {
    fn new(stream: TcpStream, addr: SocketAddr) -> Self {
        Self {
            stream,
            addr,
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            events: VecDeque::new(),
            closing: false,
            reported: false,
        }
    }

    /// Stop reading and queue the final `Disconnect`
    ///
    /// Buffered output keeps draining on writable readiness; the socket is
    /// released once it is empty.
    fn close(&mut self, conn: ConnectionId, registry: &Registry) {
        if self.closing {
            return;
        }
        self.closing = true;
        self.events.push_back(NetEvent::Disconnect);
        let _ = self.stream.shutdown(Shutdown::Read);

        self.drain(conn);
        if self.outbound.is_empty() {
            self.release(registry);
        } else if let Err(e) = registry.reregister(
            &mut self.stream,
            Token(conn.0 as usize),
            Interest::WRITABLE,
        ) {
            warn!(connection = %conn, "Failed to keep socket for draining: {}", e);
            self.outbound.clear();
            self.release(registry);
        } else {
            debug!(
                connection = %conn,
                pending = self.outbound.len(),
                "Draining output before close"
            );
        }
    }

    /// Flush what the socket takes; a write error drops the rest
    fn drain(&mut self, conn: ConnectionId) {
        if let Err(e) = self.flush() {
            if !self.outbound.is_empty() {
                warn!(
                    connection = %conn,
                    dropped = self.outbound.len(),
                    "Error writing while closing: {}", e
                );
            }
            self.outbound.clear();
        }
    }

    fn release(&mut self, registry: &Registry) {
        let _ = registry.deregister(&mut self.stream);
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    /// Closed, reported and nothing left to write
    fn finished(&self) -> bool {
        self.reported && self.outbound.is_empty()
    }

    /// Read until the socket would block. Returns `false` on EOF or error.
    fn fill(&mut self, scratch: &mut [u8]) -> bool {
        loop {
            match self.stream.read(scratch) {
                Ok(0) => return false,
                Ok(n) => self.inbound.extend_from_slice(&scratch[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    if e.kind() != ErrorKind::ConnectionReset {
                        warn!(peer = %self.addr, "Error reading: {}", e);
                    }
                    return false;
                }
            }
        }
    }

    /// Write buffered output until done or the socket would block
    fn flush(&mut self) -> io::Result<()> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero)),
                Ok(n) => self.outbound.advance(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Non-blocking TCP transport
///
/// Per-connection state lives in a `DashMap` so dispatch workers can pop
/// events and send replies for their own connections concurrently.
pub struct TcpTransport {
    poll: Poll,
    events: Events,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    peers: DashMap<ConnectionId, Peer>,
    accepted: VecDeque<ConnectionId>,
    next_id: u64,
    scratch: Vec<u8>,
    max_frame_size: usize,
    max_outbound_bytes: usize,
    tcp_nodelay: bool,
}

impl TcpTransport {
    pub fn new(config: &Config) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
            listener: None,
            local_addr: None,
            peers: DashMap::new(),
            accepted: VecDeque::new(),
            next_id: 1,
            scratch: vec![0u8; config.read_buffer_size],
            max_frame_size: config.max_frame_size,
            max_outbound_bytes: config.max_outbound_bytes,
            tcp_nodelay: config.tcp_nodelay,
        })
    }

    /// Number of sockets still held, including ones awaiting their final event
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn accept_pending(&mut self) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };

        loop {
            match listener.accept() {
                Ok((mut stream, addr)) => {
                    if let Err(e) = stream.set_nodelay(self.tcp_nodelay) {
                        warn!(peer = %addr, "Failed to set TCP_NODELAY: {}", e);
                    }

                    let conn = ConnectionId(self.next_id);
                    self.next_id += 1;

                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        Token(conn.0 as usize),
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        // Dropping the stream closes it; other sockets are unaffected
                        error!(peer = %addr, "Failed to register connection: {}", e);
                        continue;
                    }

                    debug!(connection = %conn, peer = %addr, "New TCP connection");
                    self.peers.insert(conn, Peer::new(stream, addr));
                    self.accepted.push_back(conn);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    break;
                }
            }
        }
    }

    fn service(&mut self, conn: ConnectionId, readable: bool, writable: bool) {
        let Some(mut peer) = self.peers.get_mut(&conn) else {
            return;
        };
        if peer.closing {
            if writable && !peer.outbound.is_empty() {
                peer.drain(conn);
                if peer.outbound.is_empty() {
                    debug!(connection = %conn, "Output drained, releasing socket");
                    peer.release(self.poll.registry());
                }
            }
            if peer.finished() {
                drop(peer);
                self.peers.remove(&conn);
            }
            return;
        }

        let mut open = true;

        if readable {
            open = peer.fill(&mut self.scratch);

            let mut frames = Vec::new();
            let result = split_frames(&mut peer.inbound, self.max_frame_size, &mut frames);
            peer.events.extend(frames.into_iter().map(NetEvent::Data));
            if let Err(e) = result {
                warn!(connection = %conn, "Protocol violation: {}", e);
                open = false;
            }
        }

        if writable && open {
            if let Err(e) = peer.flush() {
                warn!(connection = %conn, "Error writing: {}", e);
                open = false;
            }
        }

        if !open {
            peer.close(conn, self.poll.registry());
        }
    }
}

impl Transport for TcpTransport {
    fn bind(&mut self, addr: SocketAddr) -> Result<(), BindFailure> {
        let listener = TcpListener::bind(addr).map_err(|e| BindFailure::new(addr, e))?;
        self.local_addr = Some(listener.local_addr().map_err(|e| BindFailure::new(addr, e))?);
        self.listener = Some(listener);
        Ok(())
    }

    fn listen(&mut self) -> Result<(), BindFailure> {
        let addr = self
            .local_addr
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
        let listener = self.listener.as_mut().ok_or_else(|| {
            BindFailure::new(addr, io::Error::new(ErrorKind::NotConnected, "listen before bind"))
        })?;
        self.poll
            .registry()
            .register(listener, LISTENER, Interest::READABLE)
            .map_err(|e| BindFailure::new(addr, e))?;
        info!("Listening for connections on {}", addr);
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn update(&mut self) -> io::Result<()> {
        match self.poll.poll(&mut self.events, Some(Duration::ZERO)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        let mut accept = false;
        let mut ready = Vec::new();
        for event in self.events.iter() {
            match event.token() {
                LISTENER => accept = true,
                Token(t) => ready.push((
                    ConnectionId(t as u64),
                    event.is_readable() || event.is_read_closed(),
                    event.is_writable(),
                )),
            }
        }

        if accept {
            self.accept_pending();
        }
        for (conn, readable, writable) in ready {
            self.service(conn, readable, writable);
        }
        Ok(())
    }

    fn poll_new_connection(&mut self) -> Option<ConnectionId> {
        self.accepted.pop_front()
    }

    fn poll_event(&self, conn: ConnectionId) -> Option<NetEvent> {
        let mut peer = self.peers.get_mut(&conn)?;
        let event = peer.events.pop_front();
        if matches!(event, Some(NetEvent::Disconnect)) {
            peer.reported = true;
            // Last event for this connection; a socket still draining
            // output is removed by `update` once it is done
            if peer.finished() {
                drop(peer);
                self.peers.remove(&conn);
            }
        }
        event
    }

    fn send(&self, conn: ConnectionId, payload: &[u8]) -> io::Result<()> {
        if payload.len() > self.max_frame_size {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                FrameError::TooLarge {
                    len: payload.len(),
                    max: self.max_frame_size,
                },
            ));
        }
        let frame =
            encode_frame(payload).map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;

        let mut peer = self
            .peers
            .get_mut(&conn)
            .ok_or_else(|| io::Error::from(ErrorKind::NotConnected))?;
        if peer.closing {
            return Err(io::Error::from(ErrorKind::NotConnected));
        }

        let mut result = Ok(());
        if peer.outbound.len() + frame.len() > self.max_outbound_bytes {
            // Make room if the socket has drained since the last write
            result = peer.flush();
            if result.is_ok() && peer.outbound.len() + frame.len() > self.max_outbound_bytes {
                return Err(io::Error::new(
                    ErrorKind::WouldBlock,
                    format!(
                        "outbound buffer for {} holds {} of {} bytes",
                        conn,
                        peer.outbound.len(),
                        self.max_outbound_bytes
                    ),
                ));
            }
        }

        if result.is_ok() {
            peer.outbound.extend_from_slice(&frame);
            result = peer.flush();
        }
        if result.is_err() {
            peer.outbound.clear();
            peer.close(conn, self.poll.registry());
        }
        result
    }

    fn disconnect(&self, conn: ConnectionId) {
        if let Some(mut peer) = self.peers.get_mut(&conn) {
            peer.close(conn, self.poll.registry());
        }
    }

    fn shutdown(&mut self) {
        for mut entry in self.peers.iter_mut() {
            let peer = entry.value_mut();
            let _ = self.poll.registry().deregister(&mut peer.stream);
            let _ = peer.stream.shutdown(Shutdown::Both);
        }
        self.peers.clear();
        self.accepted.clear();

        if let Some(mut listener) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
        }
        self.local_addr = None;
    }
}
