//! Error types untuk codec, protocol, transport dan strand.
//!
//! Pembagian sesuai dampaknya:
//! - `CodecError`: lokal ke satu encode/decode, cukup buang message-nya
//! - `ProtocolError` / `TransportError`: fatal untuk connection
//! - `StrandError`: lokal ke satu task, dikirim lewat future task tersebut

use std::io;

use thiserror::Error;

use crate::core::Cancellation;

/// Error saat encode/decode `Value`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Input habis sebelum value selesai dibaca.
    #[error("read past end: needed {needed} bytes, {available} available")]
    TruncatedInput { needed: usize, available: usize },

    /// Sink menolak write. Semua bytes yang sudah ditulis harus dibuang.
    #[error("write rejected: buffer limit of {limit} bytes exceeded")]
    WriteError { limit: usize },

    /// Signature tidak bisa di-parse.
    #[error("unknown signature: {0:?}")]
    UnknownSignature(String),

    /// Value tidak cocok dengan type yang diminta.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },
}

/// Pelanggaran protokol. Connection langsung ditutup, tidak ada resync.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Payload yang dideklarasikan melebihi batas.
    #[error("payload too large: {size} bytes (max {max})")]
    OversizedPayload { size: usize, max: usize },

    /// Header rusak (magic salah, message type tidak dikenal).
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// Versi protokol tidak didukung.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),
}

/// Error I/O pada level connection.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("connection timed out")]
    Timeout,

    #[error("connection closed by peer")]
    PeerClosed,

    /// Socket sudah (atau sedang) ditutup.
    #[error("not connected")]
    NotConnected,
}

/// Alasan connection berakhir, dikirim ke `MessageHandler::on_disconnected`.
#[derive(Error, Debug)]
pub enum DisconnectReason {
    /// Ditutup secara lokal lewat `close()`.
    #[error("closed locally")]
    Closed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Hasil gagal dari satu task strand.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StrandError {
    #[error("the strand is dying")]
    Dying,

    #[error("task canceled")]
    Canceled,

    /// Callback panic atau mengembalikan error.
    #[error("callback failed: {0}")]
    CallbackFailed(String),
}

impl Cancellation for StrandError {
    fn canceled() -> Self {
        StrandError::Canceled
    }

    fn is_canceled(&self) -> bool {
        matches!(self, StrandError::Canceled)
    }
}

/// Hasil gagal dari satu RPC call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Remote membalas dengan message `Error`.
    #[error("remote error: {0}")]
    Remote(String),

    /// Connection mati sebelum reply datang.
    #[error("disconnected")]
    Disconnected,

    #[error("call canceled")]
    Canceled,

    /// Transport menolak call sebelum dikirim.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Payload reply tidak bisa di-decode.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl Cancellation for CallError {
    fn canceled() -> Self {
        CallError::Canceled
    }

    fn is_canceled(&self) -> bool {
        matches!(self, CallError::Canceled)
    }
}
