//! Binary encoder
//!
//! Encode `Value` langsung ke `Buffer` sambil mengakumulasi signature.
//! Semua integer little-endian dengan lebar tetap.
//!
//! Hanya write top-level yang menambah signature; isi container tidak.
//! Jadi encode `a` lalu `b` menghasilkan signature `sig(a) ++ sig(b)`.

use bytes::Bytes;

use super::buffer::Buffer;
use super::signature::{IntKind, Signature, Type};
use super::value::Value;
use crate::error::CodecError;

/// Status encoder. Sekali `WriteError`, semua write berikutnya gagal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    WriteError,
}

/// Encoder ke `Buffer`
pub struct Encoder<'a> {
    buffer: &'a mut Buffer,
    signature: Signature,
    status: Status,
    /// Raw data dikirim sebagai sub-buffer (zero-copy) atau inline
    sub_buffers: bool,
}

impl<'a> Encoder<'a> {
    /// Encoder dengan channel sub-buffer untuk raw data
    pub fn new(buffer: &'a mut Buffer) -> Self {
        Self {
            buffer,
            signature: Signature::default(),
            status: Status::Ok,
            sub_buffers: true,
        }
    }

    /// Encoder yang menulis raw data inline (length + bytes)
    pub fn inline(buffer: &'a mut Buffer) -> Self {
        Self {
            sub_buffers: false,
            ..Self::new(buffer)
        }
    }

    #[inline(always)]
    pub fn status(&self) -> Status {
        self.status
    }

    /// Signature dari semua write top-level sejauh ini
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn into_signature(self) -> Signature {
        self.signature
    }

    pub fn write_bool(&mut self, value: bool) -> Result<(), CodecError> {
        self.top_level(&Type::Bool, |enc| enc.put(&[u8::from(value)]))
    }

    /// Integer dengan lebar & signedness eksplisit
    pub fn write_int(&mut self, kind: IntKind, value: i128) -> Result<(), CodecError> {
        self.top_level(&Type::Int(kind), |enc| enc.put_int(kind, value))
    }

    /// Float dengan lebar 4 atau 8 bytes.
    ///
    /// Lebar 4 mempersempit `f64` dengan semantik `as f32`.
    pub fn write_float(&mut self, value: f64, size: u8) -> Result<(), CodecError> {
        let ty = match size {
            4 => Type::Float32,
            8 => Type::Float64,
            other => {
                return Err(CodecError::TypeMismatch {
                    expected: "float of 4 or 8 bytes".to_string(),
                    found: format!("{} bytes", other),
                })
            }
        };
        self.top_level(&ty, |enc| enc.put_float(value, size))
    }

    pub fn write_string(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        self.top_level(&Type::String, |enc| enc.put_string(bytes))
    }

    pub fn write_raw(&mut self, bytes: &Bytes) -> Result<(), CodecError> {
        self.top_level(&Type::Raw, |enc| enc.put_raw(bytes))
    }

    pub fn write_list(&mut self, items: &[Value], element: &Type) -> Result<(), CodecError> {
        let ty = Type::list(element.clone());
        self.top_level(&ty, |enc| enc.put_list(items, element))
    }

    pub fn write_map(
        &mut self,
        entries: &[(Value, Value)],
        key: &Type,
        value: &Type,
    ) -> Result<(), CodecError> {
        let ty = Type::map(key.clone(), value.clone());
        self.top_level(&ty, |enc| enc.put_map(entries, key, value))
    }

    pub fn write_tuple(&mut self, members: &[Value]) -> Result<(), CodecError> {
        let ty = Type::Tuple(members.iter().map(Value::type_of).collect());
        self.top_level(&ty, |enc| {
            for member in members {
                enc.encode(member, &member.type_of())?;
            }
            Ok(())
        })
    }

    /// Signature value dulu, lalu value-nya. Token `m`.
    pub fn write_dynamic(&mut self, value: &Value) -> Result<(), CodecError> {
        self.top_level(&Type::Dynamic, |enc| enc.put_dynamic(value))
    }

    /// Encode value sesuai type-nya sendiri
    pub fn write_value(&mut self, value: &Value) -> Result<(), CodecError> {
        let ty = value.type_of();
        self.top_level(&ty, |enc| enc.encode(value, &ty))
    }

    /// Encode value ke slot dengan type `ty`
    pub fn write_as(&mut self, value: &Value, ty: &Type) -> Result<(), CodecError> {
        self.top_level(ty, |enc| enc.encode(value, ty))
    }

    fn top_level<F>(&mut self, ty: &Type, write: F) -> Result<(), CodecError>
    where
        F: FnOnce(&mut Self) -> Result<(), CodecError>,
    {
        if self.status == Status::WriteError {
            let limit = self.buffer.limit().unwrap_or(self.buffer.total_size());
            return Err(CodecError::WriteError { limit });
        }
        write(self)?;
        self.signature.push(ty);
        Ok(())
    }

    fn encode(&mut self, value: &Value, ty: &Type) -> Result<(), CodecError> {
        match (ty, value) {
            (Type::Dynamic, v) => self.put_dynamic(v),
            (Type::Void, Value::Void) => Ok(()),
            (Type::Bool, Value::Bool(b)) => self.put(&[u8::from(*b)]),
            (Type::Int(kind), v) if v.type_of() == *ty => match v.as_int() {
                Some(n) => self.put_int(*kind, n),
                None => Err(mismatch(ty, v)),
            },
            (Type::Float32, Value::Float32(f)) => self.put(&f.to_le_bytes()),
            (Type::Float64, Value::Float64(f)) => self.put(&f.to_le_bytes()),
            (Type::String, Value::Str(s)) => self.put_string(s.as_bytes()),
            (Type::Raw, Value::Raw(b)) => self.put_raw(b),
            (Type::List(element), Value::List { element: actual, items }) if **element == *actual => {
                self.put_list(items, element)
            }
            (Type::Map(k, v), Value::Map { key, value, entries }) if **k == *key && **v == *value => {
                self.put_map(entries, k, v)
            }
            (Type::Tuple(members), Value::Tuple(values)) if members.len() == values.len() => {
                for (member, value) in members.iter().zip(values) {
                    self.encode(value, member)?;
                }
                Ok(())
            }
            (ty, v) => Err(mismatch(ty, v)),
        }
    }

    fn put_dynamic(&mut self, value: &Value) -> Result<(), CodecError> {
        let inner = match value {
            Value::Dynamic(inner) => inner.as_ref(),
            other => other,
        };
        let ty = inner.type_of();
        self.put_string(ty.to_string().as_bytes())?;
        self.encode(inner, &ty)
    }

    fn put_int(&mut self, kind: IntKind, value: i128) -> Result<(), CodecError> {
        if !kind.contains(value) {
            return Err(CodecError::TypeMismatch {
                expected: format!("integer fitting '{}'", kind.token()),
                found: value.to_string(),
            });
        }
        // Two's complement LE: ambil `size` byte terbawah
        let bytes = value.to_le_bytes();
        self.put(&bytes[..usize::from(kind.size)])
    }

    fn put_float(&mut self, value: f64, size: u8) -> Result<(), CodecError> {
        if size == 4 {
            self.put(&(value as f32).to_le_bytes())
        } else {
            self.put(&value.to_le_bytes())
        }
    }

    fn put_string(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        self.put_len(bytes.len())?;
        self.put(bytes)
    }

    fn put_raw(&mut self, bytes: &Bytes) -> Result<(), CodecError> {
        if self.sub_buffers {
            self.buffer
                .add_sub_buffer(bytes.clone())
                .map(|_| ())
                .map_err(|e| self.fail(e))
        } else {
            self.put_string(bytes)
        }
    }

    fn put_list(&mut self, items: &[Value], element: &Type) -> Result<(), CodecError> {
        self.put_len(items.len())?;
        for item in items {
            self.encode(item, element)?;
        }
        Ok(())
    }

    fn put_map(
        &mut self,
        entries: &[(Value, Value)],
        key: &Type,
        value: &Type,
    ) -> Result<(), CodecError> {
        self.put_len(entries.len())?;
        for (k, v) in entries {
            self.encode(k, key)?;
            self.encode(v, value)?;
        }
        Ok(())
    }

    fn put_len(&mut self, len: usize) -> Result<(), CodecError> {
        let len = u32::try_from(len).map_err(|_| CodecError::TypeMismatch {
            expected: "length below 2^32".to_string(),
            found: len.to_string(),
        })?;
        self.put(&len.to_le_bytes())
    }

    #[inline(always)]
    fn put(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        self.buffer.write(bytes).map_err(|e| self.fail(e))
    }

    fn fail(&mut self, err: CodecError) -> CodecError {
        if matches!(err, CodecError::WriteError { .. }) {
            self.status = Status::WriteError;
        }
        err
    }
}

fn mismatch(expected: &Type, found: &Value) -> CodecError {
    CodecError::TypeMismatch {
        expected: expected.to_string(),
        found: found.type_of().to_string(),
    }
}

/// Encode satu value ke buffer baru
pub fn encode_value(value: &Value) -> Result<(Buffer, Signature), CodecError> {
    let mut buffer = Buffer::new();
    let mut encoder = Encoder::new(&mut buffer);
    encoder.write_value(value)?;
    let signature = encoder.into_signature();
    Ok((buffer, signature))
}
