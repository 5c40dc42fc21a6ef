use crate::network::{BindFailure, ConnectionId};
use crate::server::LoopState;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Bind(#[from] BindFailure),

    #[error("Duplicate connection {0}")]
    DuplicateConnection(ConnectionId),

    #[error("Cannot {operation} while server is {state}")]
    InvalidState {
        operation: &'static str,
        state: LoopState,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_state_names_operation_and_state() {
        let err = Error::InvalidState {
            operation: "disconnect",
            state: LoopState::Stopped,
        };
        assert_eq!(err.to_string(), "Cannot disconnect while server is stopped");
    }

    #[test]
    fn io_errors_convert_with_their_kind() {
        let err: Error = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert!(matches!(err, Error::Io(ref e) if e.kind() == io::ErrorKind::WouldBlock));
    }
}
