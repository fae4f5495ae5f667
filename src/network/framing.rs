//! Framing: reassembly message dari stream bytes dan unit write atomik
//!
//! Bytes dari socket bisa datang dalam potongan sembarang: setengah
//! header, header + setengah payload, atau beberapa message sekaligus.
//! `FrameDecoder` menyimpan sisa yang belum lengkap di antara read.

use std::io::{self, IoSlice, Write};

use tracing::trace;

use crate::error::ProtocolError;
use crate::protocol::{Buffer, Message, MessageHeader, HEADER_SIZE};

/// Reassembler message dari bytes yang masuk
pub struct FrameDecoder {
    max_payload: usize,
    buffer: Vec<u8>,
    read_pos: usize,
    /// Header yang sudah lengkap, payload-nya belum
    pending: Option<MessageHeader>,
    /// Sekali gagal, decoder berhenti (tidak ada resync)
    failed: Option<ProtocolError>,
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload,
            buffer: Vec::new(),
            read_pos: 0,
            pending: None,
            failed: None,
        }
    }

    /// Tambahkan bytes yang baru dibaca dari socket
    pub fn feed(&mut self, bytes: &[u8]) {
        if self.failed.is_some() {
            return;
        }
        // Compact buffer jika perlu
        if self.read_pos > 0 {
            let remaining = self.buffer.len() - self.read_pos;
            if remaining > 0 {
                self.buffer.copy_within(self.read_pos.., 0);
            }
            self.buffer.truncate(remaining);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes yang sudah diterima tapi belum menjadi message
    #[inline(always)]
    pub fn buffered(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Ada message yang setengah jalan
    pub fn has_partial(&self) -> bool {
        self.pending.is_some() || self.buffered() > 0
    }

    /// Message lengkap berikutnya.
    ///
    /// Returns `Ok(None)` jika data belum cukup. Error header bersifat
    /// permanen: panggilan berikutnya mengembalikan error yang sama.
    pub fn next_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }

        let header = match self.pending {
            Some(header) => header,
            None => {
                if self.buffered() < HEADER_SIZE {
                    return Ok(None);
                }
                let mut raw = [0u8; HEADER_SIZE];
                raw.copy_from_slice(&self.buffer[self.read_pos..self.read_pos + HEADER_SIZE]);
                let header = match MessageHeader::decode(&raw, self.max_payload) {
                    Ok(header) => header,
                    Err(err) => {
                        self.failed = Some(err.clone());
                        return Err(err);
                    }
                };
                self.read_pos += HEADER_SIZE;
                self.pending = Some(header);
                trace!(id = header.id, len = header.payload_len, "header complete");
                header
            }
        };

        let len = header.payload_len as usize;
        if self.buffered() < len {
            self.buffer.reserve(len - self.buffered());
            return Ok(None);
        }

        let payload = self.buffer[self.read_pos..self.read_pos + len].to_vec();
        self.read_pos += len;
        self.pending = None;
        Ok(Some(Message::from_parts(header, Buffer::from_vec(payload))))
    }

    /// Buang state reassembly (connection ditutup)
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
        self.pending = None;
    }
}

/// Satu message yang sedang ditulis: `header ++ payload`.
///
/// Menyimpan posisi write sehingga partial write bisa dilanjutkan
/// tanpa pernah menyisipkan bytes message lain di tengahnya.
pub struct OutgoingFrame {
    id: u32,
    header: [u8; HEADER_SIZE],
    payload: Buffer,
    written: usize,
}

impl OutgoingFrame {
    pub fn new(message: Message) -> Self {
        let header = message.header().encode();
        let id = message.id();
        Self {
            id,
            header,
            payload: message.into_payload(),
            written: 0,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline(always)]
    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.payload.total_size()
    }

    #[inline(always)]
    pub fn remaining(&self) -> usize {
        self.total_size() - self.written
    }

    #[inline(always)]
    pub fn is_complete(&self) -> bool {
        self.written >= self.total_size()
    }

    /// Satu panggilan vectored write dari posisi terakhir.
    ///
    /// Returns jumlah bytes yang ditulis (bisa sebagian).
    pub fn write_to<W: Write + ?Sized>(&mut self, writer: &mut W) -> io::Result<usize> {
        let n = {
            let payload_chunks = self.payload.chunks();
            let mut slices = Vec::with_capacity(payload_chunks.len() + 1);
            let mut skip = self.written;
            for chunk in std::iter::once(&self.header[..]).chain(payload_chunks) {
                if skip >= chunk.len() {
                    skip -= chunk.len();
                    continue;
                }
                slices.push(IoSlice::new(&chunk[skip..]));
                skip = 0;
            }
            if slices.is_empty() {
                return Ok(0);
            }
            writer.write_vectored(&slices)?
        };
        self.written += n;
        Ok(n)
    }
}
