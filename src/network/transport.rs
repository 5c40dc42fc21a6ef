use bytes::Bytes;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Transport-assigned identity of a connection
///
/// Identities are the only durable way to refer to a connection across
/// ticks. Table positions are not stable and must never be cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Inbound network event for a single connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetEvent {
    /// One framed payload, delivered as-is to the handler
    Data(Bytes),
    /// The peer went away or the transport closed the connection
    Disconnect,
}

/// The transport could not bind or listen on the requested address
#[derive(Error, Debug)]
#[error("failed to bind {addr}: {source}")]
pub struct BindFailure {
    pub addr: SocketAddr,
    #[source]
    pub source: io::Error,
}

impl BindFailure {
    pub fn new(addr: SocketAddr, source: io::Error) -> Self {
        Self { addr, source }
    }
}

/// Boundary between the server loop and the socket layer
///
/// Methods taking `&mut self` are only called from the single-threaded
/// stages of a tick (readiness poll and reaping). `poll_event` and `send`
/// are called concurrently from dispatch workers, at most one caller per
/// connection identity at a time.
pub trait Transport: Send + Sync {
    /// Bind the listening endpoint
    fn bind(&mut self, addr: SocketAddr) -> Result<(), BindFailure>;

    /// Start accepting connections on the bound endpoint
    fn listen(&mut self) -> Result<(), BindFailure>;

    /// Address actually bound, once `bind` succeeded
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Poll for I/O readiness and buffer whatever arrived since the last call
    fn update(&mut self) -> io::Result<()>;

    /// Next connection accepted since the last call, if any
    fn poll_new_connection(&mut self) -> Option<ConnectionId>;

    /// Next pending event for `conn` in delivery order, if any
    fn poll_event(&self, conn: ConnectionId) -> Option<NetEvent>;

    /// Queue one message for `conn`
    fn send(&self, conn: ConnectionId, payload: &[u8]) -> io::Result<()>;

    /// Close `conn` from the server side; a `Disconnect` event follows
    fn disconnect(&self, conn: ConnectionId);

    /// Release every socket and pending event
    fn shutdown(&mut self);
}
