//! Network Layer: framed message transport
//!
//! Menggunakan mio untuk cross-platform non-blocking I/O.
//!
//! Fitur:
//! - Reassembly message dari potongan bytes sembarang
//! - Write per message tanpa interleaving, vectored I/O untuk sub-buffer
//! - Satu reactor thread per `TransportServer`

mod calls;
mod connection;
mod framing;
mod server;

pub use calls::PendingCalls;
pub use connection::{ByteStream, ConnectionId, FramedSocket, MessageHandler, SocketState};
pub use framing::{FrameDecoder, OutgoingFrame};
pub use server::{TransportHandle, TransportServer};
