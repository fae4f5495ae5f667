//! Message envelope
//!
//! Layout wire (little-endian):
//! ┌─────────────────────────────────────────────────────┐
//! │ MessageHeader (30 bytes, fixed)                     │
//! │   u32 magic | u32 id | u16 version | u32 type       │
//! │   u32 service | u32 object | u32 action | u32 len   │
//! ├─────────────────────────────────────────────────────┤
//! │ Payload (len bytes, termasuk isi sub-buffer)        │
//! └─────────────────────────────────────────────────────┘
//!
//! Header di-encode field per field, tidak di-cast dari memory, jadi
//! tidak ada asumsi alignment atau endianness host.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use super::buffer::Buffer;
use super::decoder::Decoder;
use super::encoder::Encoder;
use super::signature::{IntKind, Type};
use super::value::Value;
use crate::error::{CodecError, ProtocolError};

pub const HEADER_SIZE: usize = 30;
pub const MAGIC: u32 = 0x42DE_AD42;
/// Versi protokol saat ini. Header dengan versi lebih tinggi ditolak.
pub const PROTOCOL_VERSION: u16 = 0;

/// Id message berikutnya, unik per proses
static NEXT_MESSAGE_ID: AtomicU32 = AtomicU32::new(1);

/// Tipe pesan
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Request yang menunggu `Reply` atau `Error`
    Call = 0,
    Reply = 1,
    Error = 2,
    /// Notifikasi signal, tanpa balasan
    Event = 3,
    /// Minta pembatalan call yang masih berjalan
    Cancel = 4,
    /// Pertukaran capability saat handshake
    Capability = 5,
    /// Call fire-and-forget
    Post = 6,
    /// Balasan untuk call yang berhasil dibatalkan
    Canceled = 7,
}

impl MessageType {
    #[inline(always)]
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Call),
            1 => Some(Self::Reply),
            2 => Some(Self::Error),
            3 => Some(Self::Event),
            4 => Some(Self::Cancel),
            5 => Some(Self::Capability),
            6 => Some(Self::Post),
            7 => Some(Self::Canceled),
            _ => None,
        }
    }

    /// Apakah message ini mengakhiri sebuah call
    pub fn is_response(self) -> bool {
        matches!(self, Self::Reply | Self::Error | Self::Canceled)
    }
}

/// Alamat routing: id message + service/object/action tujuan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MessageAddress {
    pub id: u32,
    pub service: u32,
    pub object: u32,
    pub action: u32,
}

impl MessageAddress {
    /// Alamat tujuan dengan id baru dari counter global
    pub fn new(service: u32, object: u32, action: u32) -> Self {
        Self {
            id: NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed),
            service,
            object,
            action,
        }
    }
}

impl fmt::Display for MessageAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{id={}, service={}, object={}, action={}}}",
            self.id, self.service, self.object, self.action
        )
    }
}

/// Message Header - fixed 30 bytes di wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub id: u32,
    pub version: u16,
    pub msg_type: MessageType,
    pub service: u32,
    pub object: u32,
    pub action: u32,
    pub payload_len: u32,
}

impl MessageHeader {
    /// Serialize ke 30 bytes
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&self.id.to_le_bytes());
        out[8..10].copy_from_slice(&self.version.to_le_bytes());
        out[10..14].copy_from_slice(&(self.msg_type as u32).to_le_bytes());
        out[14..18].copy_from_slice(&self.service.to_le_bytes());
        out[18..22].copy_from_slice(&self.object.to_le_bytes());
        out[22..26].copy_from_slice(&self.action.to_le_bytes());
        out[26..30].copy_from_slice(&self.payload_len.to_le_bytes());
        out
    }

    /// Parse dan validasi header.
    ///
    /// Returns error jika magic salah, tipe tidak dikenal, versi lebih
    /// baru dari `PROTOCOL_VERSION`, atau payload melebihi `max_payload`.
    pub fn decode(buf: &[u8; HEADER_SIZE], max_payload: usize) -> Result<Self, ProtocolError> {
        let u32_at = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);

        let magic = u32_at(0);
        if magic != MAGIC {
            return Err(ProtocolError::MalformedHeader(format!(
                "bad magic {:#010x}",
                magic
            )));
        }

        let version = u16::from_le_bytes([buf[8], buf[9]]);
        if version > PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let raw_type = u32_at(10);
        let msg_type = MessageType::from_u32(raw_type).ok_or_else(|| {
            ProtocolError::MalformedHeader(format!("unknown message type {}", raw_type))
        })?;

        let payload_len = u32_at(26);
        if payload_len as usize > max_payload {
            return Err(ProtocolError::OversizedPayload {
                size: payload_len as usize,
                max: max_payload,
            });
        }

        Ok(Self {
            id: u32_at(4),
            version,
            msg_type,
            service: u32_at(14),
            object: u32_at(18),
            action: u32_at(22),
            payload_len,
        })
    }

    pub fn address(&self) -> MessageAddress {
        MessageAddress {
            id: self.id,
            service: self.service,
            object: self.object,
            action: self.action,
        }
    }

    /// Total message size (header + payload)
    #[inline(always)]
    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.payload_len as usize
    }
}

/// Complete message: header fields + payload milik sendiri
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    address: MessageAddress,
    version: u16,
    msg_type: MessageType,
    payload: Buffer,
}

impl Message {
    /// Message baru dengan payload kosong
    pub fn new(msg_type: MessageType, address: MessageAddress) -> Self {
        Self {
            address,
            version: PROTOCOL_VERSION,
            msg_type,
            payload: Buffer::new(),
        }
    }

    /// Call ke service/object/action dengan id baru
    pub fn call(service: u32, object: u32, action: u32) -> Self {
        Self::new(MessageType::Call, MessageAddress::new(service, object, action))
    }

    /// Rakit kembali dari header + payload yang diterima dari wire
    pub fn from_parts(header: MessageHeader, payload: Buffer) -> Self {
        Self {
            address: header.address(),
            version: header.version,
            msg_type: header.msg_type,
            payload,
        }
    }

    /// Message balasan (id dan alamat sama) dengan tipe `msg_type`
    pub fn response(&self, msg_type: MessageType) -> Self {
        Self::new(msg_type, self.address)
    }

    /// `Cancel` untuk call ini. Payload berisi id call sebagai `I`.
    pub fn cancel_request(&self) -> Self {
        let mut cancel = Self::new(
            MessageType::Cancel,
            MessageAddress::new(self.address.service, self.address.object, self.address.action),
        );
        let mut encoder = Encoder::new(&mut cancel.payload);
        // Buffer tanpa limit tidak pernah menolak write
        let _ = encoder.write_int(IntKind::U32, i128::from(self.address.id));
        cancel
    }

    /// Id call yang diminta dibatalkan oleh message `Cancel`
    pub fn canceled_id(&self) -> Result<u32, CodecError> {
        let n = Decoder::new(&self.payload).read_int(IntKind::U32)?;
        // read_int(U32) selalu dalam range u32
        u32::try_from(n).map_err(|_| CodecError::TypeMismatch {
            expected: "I".to_string(),
            found: n.to_string(),
        })
    }

    #[inline(always)]
    pub fn id(&self) -> u32 {
        self.address.id
    }

    #[inline(always)]
    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn service(&self) -> u32 {
        self.address.service
    }

    pub fn object(&self) -> u32 {
        self.address.object
    }

    pub fn action(&self) -> u32 {
        self.address.action
    }

    pub fn address(&self) -> MessageAddress {
        self.address
    }

    pub fn payload(&self) -> &Buffer {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut Buffer {
        &mut self.payload
    }

    pub fn set_payload(&mut self, payload: Buffer) {
        self.payload = payload;
    }

    pub fn into_payload(self) -> Buffer {
        self.payload
    }

    /// Ganti payload dengan `value` sebagai dynamic (signature + data),
    /// sehingga penerima bisa decode tanpa tahu signature-nya.
    pub fn set_value(&mut self, value: &Value) -> Result<(), CodecError> {
        let mut payload = Buffer::new();
        Encoder::new(&mut payload).write_dynamic(value)?;
        self.payload = payload;
        Ok(())
    }

    /// Decode payload yang ditulis oleh `set_value`
    pub fn value(&self) -> Result<Value, CodecError> {
        match Decoder::new(&self.payload).read_value(&Type::Dynamic)? {
            Value::Dynamic(inner) => Ok(*inner),
            other => Ok(other),
        }
    }

    /// Payload berupa pesan error (dipakai untuk `MessageType::Error`)
    pub fn set_error(&mut self, message: &str) -> Result<(), CodecError> {
        self.set_value(&Value::from(message))
    }

    /// Pesan error dari payload, `None` jika payload bukan string
    pub fn error_message(&self) -> Option<String> {
        self.value().ok()?.as_str().map(str::to_string)
    }

    /// Header sesuai isi message saat ini.
    ///
    /// Transport tidak pernah mengirim payload di atas
    /// `MAX_WIRE_PAYLOAD_SIZE`, jadi `payload_len` selalu exact untuk
    /// message yang sampai ke wire.
    pub fn header(&self) -> MessageHeader {
        MessageHeader {
            id: self.address.id,
            version: self.version,
            msg_type: self.msg_type,
            service: self.address.service,
            object: self.address.object,
            action: self.address.action,
            payload_len: u32::try_from(self.payload.total_size()).unwrap_or(u32::MAX),
        }
    }

    /// Wire form lengkap dalam satu Vec (header ++ payload flattened)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.total_size());
        out.extend_from_slice(&self.header().encode());
        for chunk in self.payload.chunks() {
            out.extend_from_slice(chunk);
        }
        out
    }
}
