//! Value: unit dynamically-typed yang dibawa oleh codec
//!
//! Setiap `Value` punya tepat satu `Type` (signature). List dan map
//! menyimpan type elemennya sendiri supaya container kosong tetap
//! punya signature.

use bytes::Bytes;

use super::signature::{IntKind, Type};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Void,
    Bool(bool),
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    Str(String),
    Raw(Bytes),
    List { element: Type, items: Vec<Value> },
    Map { key: Type, value: Type, entries: Vec<(Value, Value)> },
    Tuple(Vec<Value>),
    Dynamic(Box<Value>),
}

impl Value {
    /// List dengan type elemen yang di-infer.
    ///
    /// Jika semua item punya type yang sama, itu type elemennya.
    /// Jika tidak (atau list kosong), type elemennya `m` dan setiap item
    /// dibungkus `Dynamic`.
    pub fn list(items: Vec<Value>) -> Self {
        match common_type(items.iter()) {
            Some(element) => Value::List { element, items },
            None => Value::List {
                element: Type::Dynamic,
                items: items.into_iter().map(Value::boxed).collect(),
            },
        }
    }

    /// List dengan type elemen eksplisit
    pub fn list_of(element: Type, items: Vec<Value>) -> Self {
        Value::List { element, items }
    }

    /// Map dengan type key/value yang di-infer, aturannya sama dengan `list`
    pub fn map(entries: Vec<(Value, Value)>) -> Self {
        let key = common_type(entries.iter().map(|(k, _)| k));
        let value = common_type(entries.iter().map(|(_, v)| v));
        let entries = entries
            .into_iter()
            .map(|(k, v)| {
                let k = if key.is_some() { k } else { k.boxed() };
                let v = if value.is_some() { v } else { v.boxed() };
                (k, v)
            })
            .collect();
        Value::Map {
            key: key.unwrap_or(Type::Dynamic),
            value: value.unwrap_or(Type::Dynamic),
            entries,
        }
    }

    /// Map dengan type eksplisit
    pub fn map_of(key: Type, value: Type, entries: Vec<(Value, Value)>) -> Self {
        Value::Map {
            key,
            value,
            entries,
        }
    }

    /// Bungkus menjadi `Dynamic` (no-op jika sudah dynamic)
    pub fn boxed(self) -> Self {
        match self {
            Value::Dynamic(_) => self,
            other => Value::Dynamic(Box::new(other)),
        }
    }

    /// Type (signature) dari value ini
    pub fn type_of(&self) -> Type {
        match self {
            Value::Void => Type::Void,
            Value::Bool(_) => Type::Bool,
            Value::Int8(_) => Type::Int(IntKind::I8),
            Value::UInt8(_) => Type::Int(IntKind::U8),
            Value::Int16(_) => Type::Int(IntKind::I16),
            Value::UInt16(_) => Type::Int(IntKind::U16),
            Value::Int32(_) => Type::Int(IntKind::I32),
            Value::UInt32(_) => Type::Int(IntKind::U32),
            Value::Int64(_) => Type::Int(IntKind::I64),
            Value::UInt64(_) => Type::Int(IntKind::U64),
            Value::Float32(_) => Type::Float32,
            Value::Float64(_) => Type::Float64,
            Value::Str(_) => Type::String,
            Value::Raw(_) => Type::Raw,
            Value::List { element, .. } => Type::list(element.clone()),
            Value::Map { key, value, .. } => Type::map(key.clone(), value.clone()),
            Value::Tuple(members) => Type::Tuple(members.iter().map(Value::type_of).collect()),
            Value::Dynamic(_) => Type::Dynamic,
        }
    }

    /// Integer dengan kind tertentu. `None` jika di luar range.
    pub fn from_int(kind: IntKind, value: i128) -> Option<Self> {
        if !kind.contains(value) {
            return None;
        }
        let v = match (kind.size, kind.signed) {
            (1, true) => Value::Int8(value as i8),
            (1, false) => Value::UInt8(value as u8),
            (2, true) => Value::Int16(value as i16),
            (2, false) => Value::UInt16(value as u16),
            (4, true) => Value::Int32(value as i32),
            (4, false) => Value::UInt32(value as u32),
            (8, true) => Value::Int64(value as i64),
            _ => Value::UInt64(value as u64),
        };
        Some(v)
    }

    /// Nilai integer (semua lebar), menembus `Dynamic`
    pub fn as_int(&self) -> Option<i128> {
        match self.unboxed() {
            Value::Int8(v) => Some(i128::from(*v)),
            Value::UInt8(v) => Some(i128::from(*v)),
            Value::Int16(v) => Some(i128::from(*v)),
            Value::UInt16(v) => Some(i128::from(*v)),
            Value::Int32(v) => Some(i128::from(*v)),
            Value::UInt32(v) => Some(i128::from(*v)),
            Value::Int64(v) => Some(i128::from(*v)),
            Value::UInt64(v) => Some(i128::from(*v)),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_int().and_then(|v| i64::try_from(v).ok())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self.unboxed() {
            Value::Float32(v) => Some(f64::from(*v)),
            Value::Float64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.unboxed() {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self.unboxed() {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_raw(&self) -> Option<&Bytes> {
        match self.unboxed() {
            Value::Raw(b) => Some(b),
            _ => None,
        }
    }

    /// Item list, menembus `Dynamic`
    pub fn as_list(&self) -> Option<&[Value]> {
        match self.unboxed() {
            Value::List { items, .. } => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(Value, Value)]> {
        match self.unboxed() {
            Value::Map { entries, .. } => Some(entries),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Value]> {
        match self.unboxed() {
            Value::Tuple(members) => Some(members),
            _ => None,
        }
    }

    /// Value di dalam semua lapisan `Dynamic`
    pub fn unboxed(&self) -> &Value {
        let mut current = self;
        while let Value::Dynamic(inner) = current {
            current = inner;
        }
        current
    }
}

/// Type bersama dari semua item, `None` jika kosong atau berbeda-beda
fn common_type<'a>(mut items: impl Iterator<Item = &'a Value>) -> Option<Type> {
    let first = items.next()?.type_of();
    items.all(|item| item.type_of() == first).then_some(first)
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

impl_from! {
    bool => Bool,
    i8 => Int8,
    u8 => UInt8,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f32 => Float32,
    f64 => Float64,
    String => Str,
    Bytes => Raw,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Void
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_homogeneous_list() {
        let list = Value::list(vec![Value::Int32(1), Value::Int32(2)]);
        assert_eq!(list.type_of().to_string(), "[i]");
        assert_eq!(list.as_list().unwrap()[1], Value::Int32(2));
    }

    #[test]
    fn test_heterogeneous_list_is_dynamic() {
        let list = Value::list(vec![Value::Int32(12), Value::from("foo")]);
        assert_eq!(list.type_of().to_string(), "[m]");

        let items = list.as_list().unwrap();
        assert!(matches!(items[0], Value::Dynamic(_)));
        assert_eq!(items[0].as_i64(), Some(12));
        assert_eq!(items[1].as_str(), Some("foo"));
    }

    #[test]
    fn test_empty_list_and_map() {
        assert_eq!(Value::list(vec![]).type_of().to_string(), "[m]");
        assert_eq!(
            Value::list_of(Type::String, vec![]).type_of().to_string(),
            "[s]"
        );
        assert_eq!(Value::map(vec![]).type_of().to_string(), "{mm}");
    }

    #[test]
    fn test_map_inference() {
        let map = Value::map(vec![
            (Value::from("a"), Value::Int32(1)),
            (Value::from("b"), Value::from(true)),
        ]);
        assert_eq!(map.type_of().to_string(), "{sm}");
        let entries = map.as_map().unwrap();
        assert_eq!(entries[0].0, Value::from("a"));
        assert_eq!(entries[1].1.as_bool(), Some(true));
    }

    #[test]
    fn test_tuple_type() {
        let tuple = Value::Tuple(vec![Value::Int32(1), Value::Float64(2.0), Value::Void]);
        assert_eq!(tuple.type_of().to_string(), "(idv)");
    }

    #[test]
    fn test_from_int() {
        assert_eq!(Value::from_int(IntKind::U8, 255), Some(Value::UInt8(255)));
        assert_eq!(Value::from_int(IntKind::U8, 256), None);
        assert_eq!(Value::from_int(IntKind::I64, -1), Some(Value::Int64(-1)));
    }

    #[test]
    fn test_boxed_is_idempotent() {
        let v = Value::Int8(3).boxed().boxed();
        assert_eq!(v, Value::Dynamic(Box::new(Value::Int8(3))));
        assert_eq!(v.unboxed(), &Value::Int8(3));
    }
}
