mod memory;
mod tcp;
mod transport;

pub use memory::{MemoryHandle, MemoryTransport};
pub use tcp::{encode_frame, split_frames, FrameError, TcpTransport};
pub use transport::{BindFailure, ConnectionId, NetEvent, Transport};
