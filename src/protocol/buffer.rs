//! Byte buffer dengan sub-buffer out-of-band
//!
//! Layout wire (flattened):
//! ┌──────────┬──────────┬────────────┬──────────┐
//! │ main ... │ u32 len  │ sub bytes  │ main ... │
//! └──────────┴──────────┴────────────┴──────────┘
//!
//! Sub-buffer tidak di-copy ke main stream. Di main stream hanya ada
//! length prefix 4 byte; isi sub-buffer disisipkan saat write ke socket
//! (vectored I/O), jadi raw data besar tetap zero-copy.

use bytes::Bytes;

use crate::error::CodecError;

/// Ukuran length prefix untuk sub-buffer
const LEN_PREFIX: usize = 4;

/// Owned, growable byte buffer + daftar sub-buffer
#[derive(Debug, Clone, Default)]
pub struct Buffer {
    data: Vec<u8>,
    /// (offset length prefix di `data`, isi sub-buffer), urut sesuai offset
    sub_buffers: Vec<(usize, Bytes)>,
    sub_total: usize,
    /// Batas total size. Write yang melewati batas ditolak.
    limit: Option<usize>,
}

impl Buffer {
    /// Membuat buffer kosong
    pub fn new() -> Self {
        Self::default()
    }

    /// Membuat buffer dengan kapasitas awal
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// Buffer yang menolak write setelah `limit` bytes (total size)
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Bungkus bytes flat (tanpa sub-buffer), misalnya payload dari wire
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    /// Append bytes ke main stream
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        self.check_limit(bytes.len())?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Attach sub-buffer. Menulis length prefix di main stream dan
    /// mengembalikan offset prefix tersebut.
    pub fn add_sub_buffer(&mut self, bytes: Bytes) -> Result<usize, CodecError> {
        if bytes.len() > u32::MAX as usize {
            return Err(CodecError::TypeMismatch {
                expected: "raw buffer below 4GB".to_string(),
                found: format!("{} bytes", bytes.len()),
            });
        }
        self.check_limit(LEN_PREFIX + bytes.len())?;

        let offset = self.data.len();
        self.data
            .extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        self.sub_total += bytes.len();
        self.sub_buffers.push((offset, bytes));
        Ok(offset)
    }

    fn check_limit(&self, extra: usize) -> Result<(), CodecError> {
        match self.limit {
            Some(limit) if self.total_size() + extra > limit => {
                Err(CodecError::WriteError { limit })
            }
            _ => Ok(()),
        }
    }

    /// Jumlah bytes di main stream
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Ukuran flattened (main stream + semua sub-buffer)
    #[inline(always)]
    pub fn total_size(&self) -> usize {
        self.data.len() + self.sub_total
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.total_size() == 0
    }

    /// Main stream saja (tanpa isi sub-buffer)
    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn sub_buffers(&self) -> &[(usize, Bytes)] {
        &self.sub_buffers
    }

    /// Sub-buffer yang length prefix-nya ada di `offset`
    pub fn sub_buffer_at(&self, offset: usize) -> Option<&Bytes> {
        self.sub_buffers
            .binary_search_by_key(&offset, |(off, _)| *off)
            .ok()
            .map(|index| &self.sub_buffers[index].1)
    }

    /// Potongan-potongan wire form secara berurutan, tanpa copy
    pub fn chunks(&self) -> Vec<&[u8]> {
        let mut chunks = Vec::with_capacity(self.sub_buffers.len() * 2 + 1);
        let mut start = 0;
        for (offset, sub) in &self.sub_buffers {
            let end = offset + LEN_PREFIX;
            chunks.push(&self.data[start..end]);
            if !sub.is_empty() {
                chunks.push(&sub[..]);
            }
            start = end;
        }
        if start < self.data.len() || chunks.is_empty() {
            chunks.push(&self.data[start..]);
        }
        chunks
    }

    /// Copy wire form ke satu Vec
    pub fn to_flat_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_size());
        for chunk in self.chunks() {
            out.extend_from_slice(chunk);
        }
        out
    }

    /// Reset untuk reuse (limit tetap)
    pub fn clear(&mut self) {
        self.data.clear();
        self.sub_buffers.clear();
        self.sub_total = 0;
    }
}

/// Dua buffer sama jika wire form-nya sama
impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        if self.total_size() != other.total_size() {
            return false;
        }
        if self.sub_buffers.is_empty() && other.sub_buffers.is_empty() {
            return self.data == other.data;
        }
        self.to_flat_vec() == other.to_flat_vec()
    }
}

impl Eq for Buffer {}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        Self::from_vec(data)
    }
}
