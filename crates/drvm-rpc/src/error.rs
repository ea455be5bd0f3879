use crate::protocol::MessageType;

/// Framing and decoding failures.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("truncated frame: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("invalid magic bytes {0:?}")]
    BadMagic([u8; 4]),

    #[error("unsupported protocol version {0}")]
    BadVersion(u8),

    #[error("unknown message type {0}")]
    UnknownType(u8),

    #[error("unexpected {0:?} frame")]
    UnexpectedType(MessageType),

    #[error("payload of {0} bytes exceeds the frame limit")]
    PayloadTooLarge(u64),

    #[error("invalid JSON payload: {0}")]
    InvalidPayload(serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// The frame did not carry our magic or version. Its payload has been
    /// consumed, so the connection can keep reading.
    pub fn is_foreign_frame(&self) -> bool {
        matches!(self, ProtocolError::BadMagic(_) | ProtocolError::BadVersion(_))
    }
}

/// Errors surfaced by [`RpcClient`](crate::RpcClient) calls.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The guest is not running, not reachable, or closed the connection.
    #[error("guest unavailable: {0}")]
    VmUnavailable(String),

    #[error("operation timed out")]
    Timeout,

    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    /// The guest answered with `success: false`.
    #[error("{0}")]
    Remote(String),
}

pub type Result<T> = std::result::Result<T, Error>;
