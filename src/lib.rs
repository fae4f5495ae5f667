//! Courier - binary RPC transport
//!
//! Arsitektur:
//! - Binary Codec: value self-describing dengan signature, raw data zero-copy
//! - Framed Transport: message utuh di atas TCP non-blocking (mio)
//! - Strand: eksekusi serial dan terurut di atas thread pool

pub mod config;
pub mod core;
pub mod error;
pub mod network;
pub mod protocol;

pub use crate::config::{StrandConfig, TransportConfig};
pub use crate::core::{
    CancelOption, Cancellation, ExecutionContext, ExecutionOptions, Future, Promise, Strand,
    ThreadPool,
};
pub use crate::error::{
    CallError, CodecError, DisconnectReason, ProtocolError, StrandError, TransportError,
};
pub use crate::network::{
    ConnectionId, MessageHandler, PendingCalls, TransportHandle, TransportServer,
};
pub use crate::protocol::{Buffer, Message, MessageType, Signature, Type, Value};
