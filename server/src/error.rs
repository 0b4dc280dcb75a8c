use overworld_shared::{CodecError, ConnectionId, ProtocolError};
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    /// The listener could not be bound. Fatal at startup.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("no connection {0}")]
    UnknownId(ConnectionId),
    #[error("invalid input: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("send to {id} failed: {source}")]
    Send {
        id: ConnectionId,
        #[source]
        source: SendError,
    },
}

/// Why a frame could not be queued for one recipient.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    #[error("outbound queue full")]
    QueueFull,
    #[error("connection closed")]
    Disconnected,
}
