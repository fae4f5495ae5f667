//! Signature: grammar ASCII yang mendeskripsikan bentuk sebuah `Value`
//!
//! ```text
//! v            void
//! b            bool
//! c C          int8 / uint8
//! w W          int16 / uint16
//! i I          int32 / uint32
//! l L          int64 / uint64
//! f d          float32 / float64
//! s            string
//! r            raw
//! [<elem>]     list
//! {<key><val>} map
//! (<sig>*)     tuple
//! m            dynamic
//! ```

use std::fmt;

use crate::error::CodecError;

/// Batas nesting, melindungi decoder dari signature dynamic yang jahat
pub const MAX_SIGNATURE_DEPTH: usize = 32;

/// Lebar dan signedness integer, dipilih eksplisit (bukan dari native type)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IntKind {
    pub signed: bool,
    /// Lebar dalam bytes: 1, 2, 4 atau 8
    pub size: u8,
}

impl IntKind {
    pub const I8: Self = Self::new_unchecked(true, 1);
    pub const U8: Self = Self::new_unchecked(false, 1);
    pub const I16: Self = Self::new_unchecked(true, 2);
    pub const U16: Self = Self::new_unchecked(false, 2);
    pub const I32: Self = Self::new_unchecked(true, 4);
    pub const U32: Self = Self::new_unchecked(false, 4);
    pub const I64: Self = Self::new_unchecked(true, 8);
    pub const U64: Self = Self::new_unchecked(false, 8);

    const fn new_unchecked(signed: bool, size: u8) -> Self {
        Self { signed, size }
    }

    /// `None` jika size bukan 1/2/4/8
    pub fn new(signed: bool, size: u8) -> Option<Self> {
        matches!(size, 1 | 2 | 4 | 8).then_some(Self { signed, size })
    }

    /// Token signature satu karakter
    pub fn token(self) -> char {
        match (self.size, self.signed) {
            (1, true) => 'c',
            (1, false) => 'C',
            (2, true) => 'w',
            (2, false) => 'W',
            (4, true) => 'i',
            (4, false) => 'I',
            (8, true) => 'l',
            _ => 'L',
        }
    }

    pub fn from_token(token: u8) -> Option<Self> {
        match token {
            b'c' => Some(Self::I8),
            b'C' => Some(Self::U8),
            b'w' => Some(Self::I16),
            b'W' => Some(Self::U16),
            b'i' => Some(Self::I32),
            b'I' => Some(Self::U32),
            b'l' => Some(Self::I64),
            b'L' => Some(Self::U64),
            _ => None,
        }
    }

    /// Range nilai yang bisa direpresentasikan
    pub fn range(self) -> (i128, i128) {
        let bits = u32::from(self.size) * 8;
        if self.signed {
            (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
        } else {
            (0, (1i128 << bits) - 1)
        }
    }

    #[inline(always)]
    pub fn contains(self, value: i128) -> bool {
        let (min, max) = self.range();
        (min..=max).contains(&value)
    }
}

/// Bentuk sebuah value (hasil parse signature)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Void,
    Bool,
    Int(IntKind),
    Float32,
    Float64,
    String,
    Raw,
    List(Box<Type>),
    Map(Box<Type>, Box<Type>),
    Tuple(Vec<Type>),
    Dynamic,
}

impl Type {
    pub fn list(element: Type) -> Self {
        Type::List(Box::new(element))
    }

    pub fn map(key: Type, value: Type) -> Self {
        Type::Map(Box::new(key), Box::new(value))
    }

    /// Parse signature yang berisi tepat satu type
    pub fn parse(signature: &str) -> Result<Self, CodecError> {
        let mut types = Signature::new(signature).types()?;
        if types.len() != 1 {
            return Err(CodecError::UnknownSignature(signature.to_string()));
        }
        Ok(types.remove(0))
    }

    /// Signature dalam bentuk string
    pub fn signature(&self) -> Signature {
        Signature(self.to_string())
    }

    /// Jumlah bytes minimum satu value type ini di main stream.
    ///
    /// `0` untuk `v`, `()` dan tuple yang hanya berisi keduanya.
    pub fn min_encoded_size(&self) -> usize {
        match self {
            Type::Void => 0,
            Type::Bool => 1,
            Type::Int(kind) => usize::from(kind.size),
            Type::Float32 => 4,
            Type::Float64 => 8,
            // Length/count prefix, atau signature string untuk dynamic
            Type::String | Type::Raw | Type::List(_) | Type::Map(..) | Type::Dynamic => 4,
            Type::Tuple(members) => members
                .iter()
                .fold(0usize, |sum, member| sum.saturating_add(member.min_encoded_size())),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => f.write_str("v"),
            Type::Bool => f.write_str("b"),
            Type::Int(kind) => write!(f, "{}", kind.token()),
            Type::Float32 => f.write_str("f"),
            Type::Float64 => f.write_str("d"),
            Type::String => f.write_str("s"),
            Type::Raw => f.write_str("r"),
            Type::List(element) => write!(f, "[{}]", element),
            Type::Map(key, value) => write!(f, "{{{}{}}}", key, value),
            Type::Tuple(members) => {
                f.write_str("(")?;
                for member in members {
                    write!(f, "{}", member)?;
                }
                f.write_str(")")
            }
            Type::Dynamic => f.write_str("m"),
        }
    }
}

/// Signature string, bisa berisi beberapa type berurutan (misalnya `is`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Signature(String);

impl Signature {
    pub fn new(signature: impl Into<String>) -> Self {
        Self(signature.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append type di akhir signature
    pub fn push(&mut self, ty: &Type) {
        use std::fmt::Write;
        // Menulis ke String tidak pernah gagal
        let _ = write!(self.0, "{}", ty);
    }

    /// Parse seluruh signature menjadi urutan type
    pub fn types(&self) -> Result<Vec<Type>, CodecError> {
        let mut parser = Parser {
            input: self.0.as_bytes(),
            pos: 0,
        };
        let mut types = Vec::new();
        while parser.pos < parser.input.len() {
            types.push(parser.parse_type(0).map_err(|_| self.unknown())?);
        }
        Ok(types)
    }

    fn unknown(&self) -> CodecError {
        CodecError::UnknownSignature(self.0.clone())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Signature {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Signature {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Recursive descent parser, error detail di-handle oleh caller
struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn next(&mut self) -> Result<u8, ()> {
        let token = *self.input.get(self.pos).ok_or(())?;
        self.pos += 1;
        Ok(token)
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn parse_type(&mut self, depth: usize) -> Result<Type, ()> {
        if depth >= MAX_SIGNATURE_DEPTH {
            return Err(());
        }
        let token = self.next()?;
        let ty = match token {
            b'v' => Type::Void,
            b'b' => Type::Bool,
            b'f' => Type::Float32,
            b'd' => Type::Float64,
            b's' => Type::String,
            b'r' => Type::Raw,
            b'm' => Type::Dynamic,
            b'[' => {
                let element = self.parse_type(depth + 1)?;
                self.expect(b']')?;
                Type::list(element)
            }
            b'{' => {
                let key = self.parse_type(depth + 1)?;
                let value = self.parse_type(depth + 1)?;
                self.expect(b'}')?;
                Type::map(key, value)
            }
            b'(' => {
                let mut members = Vec::new();
                while self.peek() != Some(b')') {
                    members.push(self.parse_type(depth + 1)?);
                }
                self.expect(b')')?;
                Type::Tuple(members)
            }
            other => Type::Int(IntKind::from_token(other).ok_or(())?),
        };
        Ok(ty)
    }

    fn expect(&mut self, token: u8) -> Result<(), ()> {
        (self.next()? == token).then_some(()).ok_or(())
    }
}
