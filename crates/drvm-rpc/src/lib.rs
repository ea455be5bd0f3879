#![forbid(unsafe_code)]

pub mod api;
mod client;
mod error;
pub mod protocol;
mod server;

pub use client::RpcClient;
pub use error::{Error, ProtocolError, Result};
pub use protocol::{Message, MessageType};
pub use server::{HandlerError, HandlerResult, RpcServer, ServerHandle};

/// Port the guest service listens on, and the host port forwarded to it.
pub const DEFAULT_RPC_PORT: u16 = 9999;
