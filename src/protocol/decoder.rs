//! Binary decoder
//!
//! Kebalikan persis dari `Encoder`. Input yang terpotong menghasilkan
//! `TruncatedInput`, tidak pernah panic dan tidak pernah membaca di luar
//! buffer. Count container dicek terhadap sisa input sebelum elemen
//! dibaca, jadi count yang bohong tidak bisa memicu alokasi besar.
//! Elemen yang tidak memakan bytes (`v`, `()`) dibatasi oleh
//! `MAX_ZERO_SIZED_ELEMENTS` per decode.

use bytes::Bytes;

use super::buffer::Buffer;
use super::signature::{IntKind, Signature, Type, MAX_SIGNATURE_DEPTH};
use super::value::Value;
use crate::error::CodecError;

/// Total elemen tanpa bytes (misalnya isi `[v]`) yang boleh di-decode
/// oleh satu `Decoder`
pub const MAX_ZERO_SIZED_ELEMENTS: usize = 64 * 1024;

/// Decoder dari `Buffer`
pub struct Decoder<'a> {
    buffer: &'a Buffer,
    read_pos: usize,
    /// Sisa jatah elemen zero-sized
    zero_sized_budget: usize,
}

impl<'a> Decoder<'a> {
    #[inline(always)]
    pub fn new(buffer: &'a Buffer) -> Self {
        Self {
            buffer,
            read_pos: 0,
            zero_sized_budget: MAX_ZERO_SIZED_ELEMENTS,
        }
    }

    /// Sisa bytes di main stream
    #[inline(always)]
    pub fn remaining(&self) -> usize {
        self.buffer.size().saturating_sub(self.read_pos)
    }

    #[inline(always)]
    pub fn is_at_end(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.take(1)?[0] != 0)
    }

    pub fn read_int(&mut self, kind: IntKind) -> Result<i128, CodecError> {
        let size = usize::from(kind.size);
        let bytes = self.take(size)?;
        let mut raw = [0u8; 8];
        raw[..size].copy_from_slice(bytes);
        let unsigned = u64::from_le_bytes(raw);
        let value = if kind.signed {
            // Sign-extend dari lebar `size`
            let shift = 64 - size * 8;
            i128::from(((unsigned << shift) as i64) >> shift)
        } else {
            i128::from(unsigned)
        };
        Ok(value)
    }

    pub fn read_float(&mut self, size: u8) -> Result<f64, CodecError> {
        match size {
            4 => {
                let bytes = self.take_array::<4>()?;
                Ok(f64::from(f32::from_le_bytes(bytes)))
            }
            8 => Ok(f64::from_le_bytes(self.take_array::<8>()?)),
            other => Err(CodecError::TypeMismatch {
                expected: "float of 4 or 8 bytes".to_string(),
                found: format!("{} bytes", other),
            }),
        }
    }

    /// String sebagai bytes mentah (tanpa validasi UTF-8)
    pub fn read_string_bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.read_len()?;
        self.take(len)
    }

    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let bytes = self.read_string_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::TypeMismatch {
            expected: "utf-8 string".to_string(),
            found: "invalid byte sequence".to_string(),
        })
    }

    /// Raw data. Jika buffer masih membawa sub-buffer di posisi ini,
    /// sub-buffer diambil tanpa copy.
    pub fn read_raw(&mut self) -> Result<Bytes, CodecError> {
        if let Some(sub) = self.buffer.sub_buffer_at(self.read_pos) {
            self.take(4)?;
            return Ok(sub.clone());
        }
        Ok(Bytes::copy_from_slice(self.read_string_bytes()?))
    }

    pub fn read_list(&mut self, element: &Type) -> Result<Vec<Value>, CodecError> {
        self.read_list_at(element, 0)
    }

    pub fn read_map(&mut self, key: &Type, value: &Type) -> Result<Vec<(Value, Value)>, CodecError> {
        self.read_map_at(key, value, 0)
    }

    pub fn read_tuple(&mut self, members: &[Type]) -> Result<Vec<Value>, CodecError> {
        members.iter().map(|ty| self.decode(ty, 1)).collect()
    }

    /// Signature embedded lalu value-nya
    pub fn read_dynamic(&mut self) -> Result<Value, CodecError> {
        self.read_dynamic_at(0)
    }

    /// Decode satu value dengan type `ty`
    pub fn read_value(&mut self, ty: &Type) -> Result<Value, CodecError> {
        self.decode(ty, 0)
    }

    fn decode(&mut self, ty: &Type, depth: usize) -> Result<Value, CodecError> {
        if depth >= MAX_SIGNATURE_DEPTH {
            return Err(CodecError::UnknownSignature(ty.to_string()));
        }
        let value = match ty {
            Type::Void => Value::Void,
            Type::Bool => Value::Bool(self.read_bool()?),
            Type::Int(kind) => {
                let n = self.read_int(*kind)?;
                // read_int selalu dalam range kind
                Value::from_int(*kind, n).ok_or_else(|| CodecError::TypeMismatch {
                    expected: ty.to_string(),
                    found: n.to_string(),
                })?
            }
            Type::Float32 => Value::Float32(f32::from_le_bytes(self.take_array::<4>()?)),
            Type::Float64 => Value::Float64(f64::from_le_bytes(self.take_array::<8>()?)),
            Type::String => Value::Str(self.read_string()?),
            Type::Raw => Value::Raw(self.read_raw()?),
            Type::List(element) => Value::List {
                element: (**element).clone(),
                items: self.read_list_at(element, depth + 1)?,
            },
            Type::Map(key, value) => Value::Map {
                key: (**key).clone(),
                value: (**value).clone(),
                entries: self.read_map_at(key, value, depth + 1)?,
            },
            Type::Tuple(members) => Value::Tuple(
                members
                    .iter()
                    .map(|member| self.decode(member, depth + 1))
                    .collect::<Result<_, _>>()?,
            ),
            Type::Dynamic => self.read_dynamic_at(depth + 1)?,
        };
        Ok(value)
    }

    fn read_list_at(&mut self, element: &Type, depth: usize) -> Result<Vec<Value>, CodecError> {
        let count = self.read_len()?;
        self.check_count(count, element.min_encoded_size())?;
        let mut items = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            items.push(self.decode(element, depth)?);
        }
        Ok(items)
    }

    fn read_map_at(
        &mut self,
        key: &Type,
        value: &Type,
        depth: usize,
    ) -> Result<Vec<(Value, Value)>, CodecError> {
        let count = self.read_len()?;
        let entry_size = key.min_encoded_size().saturating_add(value.min_encoded_size());
        self.check_count(count, entry_size)?;
        let mut entries = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            let k = self.decode(key, depth)?;
            let v = self.decode(value, depth)?;
            entries.push((k, v));
        }
        Ok(entries)
    }

    fn read_dynamic_at(&mut self, depth: usize) -> Result<Value, CodecError> {
        let raw = self.read_string_bytes()?;
        let signature = std::str::from_utf8(raw)
            .map_err(|_| CodecError::UnknownSignature(String::from_utf8_lossy(raw).into_owned()))?;
        let ty = Type::parse(signature)?;
        let inner = self.decode(&ty, depth)?;
        Ok(Value::Dynamic(Box::new(inner)))
    }

    /// Tolak `count` elemen yang tidak mungkin muat di sisa input
    fn check_count(&mut self, count: usize, element_size: usize) -> Result<(), CodecError> {
        if element_size == 0 {
            if count > self.zero_sized_budget {
                return Err(CodecError::TypeMismatch {
                    expected: format!("at most {} zero-sized elements", MAX_ZERO_SIZED_ELEMENTS),
                    found: format!("{} elements", count),
                });
            }
            self.zero_sized_budget -= count;
            return Ok(());
        }
        let needed = count.saturating_mul(element_size);
        let available = self.remaining();
        if needed > available {
            return Err(CodecError::TruncatedInput { needed, available });
        }
        Ok(())
    }

    fn read_len(&mut self) -> Result<usize, CodecError> {
        Ok(u32::from_le_bytes(self.take_array::<4>()?) as usize)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    #[inline(always)]
    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let available = self.remaining();
        if n > available {
            return Err(CodecError::TruncatedInput {
                needed: n,
                available,
            });
        }
        let buffer: &'a Buffer = self.buffer;
        let bytes = &buffer.as_bytes()[self.read_pos..self.read_pos + n];
        self.read_pos += n;
        Ok(bytes)
    }
}

/// Decode satu value dengan type `ty` dari awal buffer
pub fn decode_value(buffer: &Buffer, ty: &Type) -> Result<Value, CodecError> {
    Decoder::new(buffer).read_value(ty)
}

/// Decode urutan value sesuai signature (misalnya `is`)
pub fn decode_values(buffer: &Buffer, signature: &Signature) -> Result<Vec<Value>, CodecError> {
    let mut decoder = Decoder::new(buffer);
    signature
        .types()?
        .iter()
        .map(|ty| decoder.read_value(ty))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encoder::{encode_value, Encoder};

    fn roundtrip(value: Value) {
        let (buffer, signature) = encode_value(&value).unwrap();
        assert_eq!(signature.as_str(), value.type_of().to_string());

        let decoded = decode_value(&buffer, &value.type_of()).unwrap();
        assert_eq!(decoded, value);

        // Sama juga setelah di-flatten (seperti yang diterima dari wire)
        let flat = Buffer::from_vec(buffer.to_flat_vec());
        assert_eq!(decode_value(&flat, &value.type_of()).unwrap(), value);
    }

    #[test]
    fn test_scalar_roundtrip() {
        roundtrip(Value::Void);
        roundtrip(Value::Bool(true));
        roundtrip(Value::Int8(i8::MIN));
        roundtrip(Value::UInt8(u8::MAX));
        roundtrip(Value::Int16(-300));
        roundtrip(Value::UInt16(60000));
        roundtrip(Value::Int32(i32::MIN));
        roundtrip(Value::UInt32(u32::MAX));
        roundtrip(Value::Int64(i64::MIN));
        roundtrip(Value::UInt64(u64::MAX));
        roundtrip(Value::Float32(-0.5));
        roundtrip(Value::Float64(std::f64::consts::PI));
        roundtrip(Value::from(""));
        roundtrip(Value::from("héllo"));
        roundtrip(Value::Raw(Bytes::new()));
    }

    #[test]
    fn test_nested_roundtrip() {
        let inner_map = Value::map(vec![
            (Value::from("x"), Value::Tuple(vec![Value::Int32(1), Value::Float64(2.5)])),
            (Value::from("y"), Value::Tuple(vec![Value::Int32(-1), Value::Float64(0.0)])),
        ]);
        roundtrip(Value::list(vec![inner_map.clone(), inner_map]));
        roundtrip(Value::list_of(Type::list(Type::String), vec![]));
        roundtrip(Value::Tuple(vec![]));
        roundtrip(Value::Tuple(vec![
            Value::Raw(Bytes::from_static(b"\x00\x01")),
            Value::Int64(9),
            Value::Raw(Bytes::from_static(b"second")),
        ]));
    }

    #[test]
    fn test_dynamic_roundtrip() {
        roundtrip(Value::Int32(7).boxed());
        roundtrip(Value::Dynamic(Box::new(Value::Int32(7).boxed())));
        roundtrip(Value::Void.boxed());
        roundtrip(Value::map(vec![
            (Value::Int32(1), Value::from("one")),
            (Value::from("two"), Value::Int32(2)),
        ]));
    }

    #[test]
    fn test_heterogeneous_list_scenario() {
        let value = Value::list(vec![
            Value::Int32(12),
            Value::Raw(Bytes::from_static(b"canard\0")),
            Value::from("foo"),
        ]);
        let (buffer, signature) = encode_value(&value).unwrap();
        assert_eq!(signature.as_str(), "[m]");

        let decoded = decode_value(&buffer, &Type::parse("[m]").unwrap()).unwrap();
        assert_eq!(decoded, value);

        let items = decoded.as_list().unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_i64(), Some(12));
        assert_eq!(items[1].as_raw().unwrap().len(), 7);
        assert_eq!(items[1].as_raw().unwrap().as_ref(), b"canard\0");
        assert_eq!(items[2].as_str(), Some("foo"));
    }

    #[test]
    fn test_signature_concatenation() {
        let a = Value::list(vec![Value::Int32(1)]);
        let b = Value::map(vec![(Value::from("k"), Value::Bool(false))]);

        let mut buffer = Buffer::new();
        let mut encoder = Encoder::new(&mut buffer);
        encoder.write_value(&a).unwrap();
        encoder.write_value(&b).unwrap();
        let signature = encoder.into_signature();

        let expected = format!("{}{}", a.type_of(), b.type_of());
        assert_eq!(signature.as_str(), expected);

        let values = decode_values(&buffer, &signature).unwrap();
        assert_eq!(values, vec![a, b]);
    }

    #[test]
    fn test_truncated_input() {
        let (buffer, _) = encode_value(&Value::from("truncate me")).unwrap();
        let bytes = buffer.to_flat_vec();
        for cut in 0..bytes.len() {
            let partial = Buffer::from_vec(bytes[..cut].to_vec());
            assert!(matches!(
                decode_value(&partial, &Type::String),
                Err(CodecError::TruncatedInput { .. })
            ));
        }
    }

    #[test]
    fn test_lying_count_does_not_allocate() {
        // count = u32::MAX tanpa elemen
        let buffer = Buffer::from_vec(u32::MAX.to_le_bytes().to_vec());
        assert!(matches!(
            decode_value(&buffer, &Type::list(Type::Int(IntKind::I64))),
            Err(CodecError::TruncatedInput { .. })
        ));
    }

    /// Dynamic payload: signature lalu count, tanpa elemen
    fn zero_sized_container(signature: &[u8], count: u32) -> Buffer {
        let mut buffer = Buffer::new();
        let mut encoder = Encoder::new(&mut buffer);
        encoder.write_string(signature).unwrap();
        encoder.write_int(IntKind::U32, i128::from(count)).unwrap();
        drop(encoder);
        buffer
    }

    #[test]
    fn test_zero_sized_elements_are_bounded() {
        for signature in [&b"[v]"[..], b"[()]", b"{v()}"] {
            for count in [50_000_000, u32::MAX] {
                let buffer = zero_sized_container(signature, count);
                assert!(
                    matches!(
                        decode_value(&buffer, &Type::Dynamic),
                        Err(CodecError::TypeMismatch { .. })
                    ),
                    "{:?} x {}",
                    std::str::from_utf8(signature),
                    count
                );
            }
        }

        // Count kecil tetap valid
        let buffer = zero_sized_container(b"[v]", 3);
        let value = decode_value(&buffer, &Type::Dynamic).unwrap();
        assert_eq!(
            value,
            Value::Dynamic(Box::new(Value::list_of(Type::Void, vec![Value::Void; 3])))
        );
    }

    #[test]
    fn test_zero_sized_budget_spans_nested_lists() {
        // 1000 list `[v]` masing-masing 100 elemen: tiap count valid,
        // totalnya melebihi jatah
        let mut buffer = Buffer::new();
        let mut encoder = Encoder::new(&mut buffer);
        encoder.write_int(IntKind::U32, 1000).unwrap();
        for _ in 0..1000 {
            encoder.write_int(IntKind::U32, 100).unwrap();
        }
        drop(encoder);
        assert!(matches!(
            decode_value(&buffer, &Type::list(Type::list(Type::Void))),
            Err(CodecError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_count_checked_against_remaining_input() {
        // Tiap `(iv)` minimal 4 bytes, input hanya punya 8
        let mut buffer = Buffer::new();
        let mut encoder = Encoder::new(&mut buffer);
        encoder.write_int(IntKind::U32, 1000).unwrap();
        encoder.write_int(IntKind::I32, 1).unwrap();
        encoder.write_int(IntKind::I32, 2).unwrap();
        drop(encoder);
        let ty = Type::list(Type::Tuple(vec![Type::Int(IntKind::I32), Type::Void]));
        assert_eq!(
            decode_value(&buffer, &ty),
            Err(CodecError::TruncatedInput {
                needed: 4000,
                available: 8
            })
        );
    }

    #[test]
    fn test_bad_dynamic_signature() {
        let mut buffer = Buffer::new();
        Encoder::new(&mut buffer).write_string(b"[x]").unwrap();
        assert!(matches!(
            decode_value(&buffer, &Type::Dynamic),
            Err(CodecError::UnknownSignature(_))
        ));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut buffer = Buffer::new();
        Encoder::new(&mut buffer).write_string(&[0xff, 0xfe]).unwrap();
        assert!(matches!(
            decode_value(&buffer, &Type::String),
            Err(CodecError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_sign_extension() {
        let mut buffer = Buffer::new();
        let mut encoder = Encoder::new(&mut buffer);
        encoder.write_int(IntKind::I16, -2).unwrap();
        encoder.write_int(IntKind::U16, 0xfffe).unwrap();
        drop(encoder);

        let mut decoder = Decoder::new(&buffer);
        assert_eq!(decoder.read_int(IntKind::I16).unwrap(), -2);
        assert_eq!(decoder.read_int(IntKind::U16).unwrap(), 0xfffe);
        assert!(decoder.is_at_end());
    }
}
