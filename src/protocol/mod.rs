//! Protocol Layer: binary codec + message envelope
//!
//! Prinsip desain:
//! - Setiap value membawa signature, jadi payload bisa self-describing
//! - Fixed-width little-endian untuk semua integer
//! - Raw data besar dibawa sebagai sub-buffer (zero-copy)

pub mod buffer;
pub mod decoder;
pub mod encoder;
pub mod message;
pub mod signature;
pub mod value;

pub use buffer::Buffer;
pub use decoder::{decode_value, decode_values, Decoder};
pub use encoder::{encode_value, Encoder, Status};
pub use message::{
    Message, MessageAddress, MessageHeader, MessageType, HEADER_SIZE, MAGIC, PROTOCOL_VERSION,
};
pub use signature::{IntKind, Signature, Type, MAX_SIGNATURE_DEPTH};
pub use value::Value;
