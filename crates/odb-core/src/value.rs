//! Typed key values, coercion and the little-endian arena encoding.

use serde::{Deserialize, Serialize};

use crate::error::{OdbError, Result};
use crate::types::TypeId;

/// The value of a key: one homogeneous array per type.
///
/// A scalar is an array of length one. Strings carry no size; the item size
/// of a string key is decided by the key (or by [`Value::natural_item_size`]
/// when the key is created).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    UInt8(Vec<u8>),
    Int8(Vec<i8>),
    Char(Vec<u8>),
    UInt16(Vec<u16>),
    Int16(Vec<i16>),
    UInt32(Vec<u32>),
    Int32(Vec<i32>),
    Bool(Vec<bool>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    Str(Vec<String>),
    Blob(Vec<u8>),
    Int64(Vec<i64>),
    UInt64(Vec<u64>),
}

/// Intermediate numeric form used for coercion
#[derive(Debug, Clone, Copy)]
enum Num {
    I(i128),
    F(f64),
}

impl Num {
    fn to_int(self, min: i128, max: i128) -> i128 {
        match self {
            Num::I(v) => v.clamp(min, max),
            Num::F(f) if f.is_nan() => 0,
            Num::F(f) => {
                let r = f.round();
                if r <= min as f64 {
                    min
                } else if r >= max as f64 {
                    max
                } else {
                    r as i128
                }
            }
        }
    }

    fn to_f64(self) -> f64 {
        match self {
            Num::I(v) => v as f64,
            Num::F(f) => f,
        }
    }

    fn is_nonzero(self) -> bool {
        match self {
            Num::I(v) => v != 0,
            Num::F(f) => f != 0.0,
        }
    }
}

macro_rules! int_from_nums {
    ($nums:expr, $t:ty) => {
        $nums
            .iter()
            .map(|n| n.to_int(<$t>::MIN as i128, <$t>::MAX as i128) as $t)
            .collect()
    };
}

impl Value {
    pub fn type_id(&self) -> TypeId {
        match self {
            Value::UInt8(_) => TypeId::UInt8,
            Value::Int8(_) => TypeId::Int8,
            Value::Char(_) => TypeId::Char,
            Value::UInt16(_) => TypeId::UInt16,
            Value::Int16(_) => TypeId::Int16,
            Value::UInt32(_) => TypeId::UInt32,
            Value::Int32(_) => TypeId::Int32,
            Value::Bool(_) => TypeId::Bool,
            Value::Float(_) => TypeId::Float,
            Value::Double(_) => TypeId::Double,
            Value::Str(_) => TypeId::String,
            Value::Blob(_) => TypeId::Blob,
            Value::Int64(_) => TypeId::Int64,
            Value::UInt64(_) => TypeId::UInt64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Value::UInt8(v) | Value::Char(v) | Value::Blob(v) => v.len(),
            Value::Int8(v) => v.len(),
            Value::UInt16(v) => v.len(),
            Value::Int16(v) => v.len(),
            Value::UInt32(v) => v.len(),
            Value::Int32(v) => v.len(),
            Value::Bool(v) => v.len(),
            Value::Float(v) => v.len(),
            Value::Double(v) => v.len(),
            Value::Str(v) => v.len(),
            Value::Int64(v) => v.len(),
            Value::UInt64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `count` zero / empty items of type `ty`
    pub fn zeroed(ty: TypeId, count: usize) -> Result<Value> {
        let v = match ty {
            TypeId::UInt8 => Value::UInt8(vec![0; count]),
            TypeId::Int8 => Value::Int8(vec![0; count]),
            TypeId::Char => Value::Char(vec![0; count]),
            TypeId::UInt16 => Value::UInt16(vec![0; count]),
            TypeId::Int16 => Value::Int16(vec![0; count]),
            TypeId::UInt32 => Value::UInt32(vec![0; count]),
            TypeId::Int32 => Value::Int32(vec![0; count]),
            TypeId::Bool => Value::Bool(vec![false; count]),
            TypeId::Float => Value::Float(vec![0.0; count]),
            TypeId::Double => Value::Double(vec![0.0; count]),
            TypeId::String => Value::Str(vec![String::new(); count]),
            TypeId::Blob => Value::Blob(vec![0; count]),
            TypeId::Int64 => Value::Int64(vec![0; count]),
            TypeId::UInt64 => Value::UInt64(vec![0; count]),
            TypeId::Key | TypeId::Link => {
                return Err(OdbError::TypeMismatch {
                    expected: TypeId::Int32,
                    actual: ty,
                })
            }
        };
        Ok(v)
    }

    /// Item size a new key holding this value gets
    pub fn natural_item_size(&self) -> usize {
        match self {
            Value::Str(items) => items.iter().map(|s| s.len() + 1).max().unwrap_or(1),
            other => other.type_id().fixed_size().unwrap_or(1),
        }
    }

    fn nums(&self) -> Option<Vec<Num>> {
        let nums = match self {
            Value::UInt8(v) | Value::Char(v) => v.iter().map(|x| Num::I(*x as i128)).collect(),
            Value::Int8(v) => v.iter().map(|x| Num::I(*x as i128)).collect(),
            Value::UInt16(v) => v.iter().map(|x| Num::I(*x as i128)).collect(),
            Value::Int16(v) => v.iter().map(|x| Num::I(*x as i128)).collect(),
            Value::UInt32(v) => v.iter().map(|x| Num::I(*x as i128)).collect(),
            Value::Int32(v) => v.iter().map(|x| Num::I(*x as i128)).collect(),
            Value::Int64(v) => v.iter().map(|x| Num::I(*x as i128)).collect(),
            Value::UInt64(v) => v.iter().map(|x| Num::I(*x as i128)).collect(),
            Value::Bool(v) => v.iter().map(|x| Num::I(*x as i128)).collect(),
            Value::Float(v) => v.iter().map(|x| Num::F(*x as f64)).collect(),
            Value::Double(v) => v.iter().map(|x| Num::F(*x)).collect(),
            Value::Str(_) | Value::Blob(_) => return None,
        };
        Some(nums)
    }

    fn from_nums(nums: &[Num], to: TypeId) -> Option<Value> {
        let v = match to {
            TypeId::UInt8 => Value::UInt8(int_from_nums!(nums, u8)),
            TypeId::Char => Value::Char(int_from_nums!(nums, u8)),
            TypeId::Int8 => Value::Int8(int_from_nums!(nums, i8)),
            TypeId::UInt16 => Value::UInt16(int_from_nums!(nums, u16)),
            TypeId::Int16 => Value::Int16(int_from_nums!(nums, i16)),
            TypeId::UInt32 => Value::UInt32(int_from_nums!(nums, u32)),
            TypeId::Int32 => Value::Int32(int_from_nums!(nums, i32)),
            TypeId::Int64 => Value::Int64(int_from_nums!(nums, i64)),
            TypeId::UInt64 => Value::UInt64(int_from_nums!(nums, u64)),
            TypeId::Bool => Value::Bool(nums.iter().map(|n| n.is_nonzero()).collect()),
            TypeId::Float => Value::Float(nums.iter().map(|n| n.to_f64() as f32).collect()),
            TypeId::Double => Value::Double(nums.iter().map(|n| n.to_f64()).collect()),
            _ => return None,
        };
        Some(v)
    }

    /// Coerce to another type.
    ///
    /// Numeric types (including bool) inter-convert; floats round to the
    /// nearest integer and saturate at the target range. Strings convert only
    /// to strings, blobs only to blobs or bytes.
    pub fn convert(&self, to: TypeId) -> Result<Value> {
        let from = self.type_id();
        if from == to {
            return Ok(self.clone());
        }
        match (self, to) {
            (Value::Blob(b), TypeId::UInt8) => return Ok(Value::UInt8(b.clone())),
            (Value::UInt8(b), TypeId::Blob) => return Ok(Value::Blob(b.clone())),
            _ => {}
        }
        self.nums()
            .and_then(|nums| Value::from_nums(&nums, to))
            .ok_or(OdbError::TypeMismatch {
                expected: to,
                actual: from,
            })
    }

    /// Single element `index` as a one-element value
    pub fn item(&self, index: usize) -> Option<Value> {
        if index >= self.len() {
            return None;
        }
        let i = index;
        let v = match self {
            Value::UInt8(v) => Value::UInt8(vec![v[i]]),
            Value::Int8(v) => Value::Int8(vec![v[i]]),
            Value::Char(v) => Value::Char(vec![v[i]]),
            Value::UInt16(v) => Value::UInt16(vec![v[i]]),
            Value::Int16(v) => Value::Int16(vec![v[i]]),
            Value::UInt32(v) => Value::UInt32(vec![v[i]]),
            Value::Int32(v) => Value::Int32(vec![v[i]]),
            Value::Bool(v) => Value::Bool(vec![v[i]]),
            Value::Float(v) => Value::Float(vec![v[i]]),
            Value::Double(v) => Value::Double(vec![v[i]]),
            Value::Str(v) => Value::Str(vec![v[i].clone()]),
            Value::Blob(v) => Value::Blob(vec![v[i]]),
            Value::Int64(v) => Value::Int64(vec![v[i]]),
            Value::UInt64(v) => Value::UInt64(vec![v[i]]),
        };
        Some(v)
    }

    /// Overwrite element `index` with the first element of `item`, growing
    /// the array with zero / empty items when `index >= len`.
    ///
    /// `item` must already have this value's type.
    pub fn set_item(&mut self, index: usize, item: &Value) -> Result<()> {
        fn put<T: Clone + Default>(dst: &mut Vec<T>, src: &[T], index: usize) -> Result<()> {
            let x = src.first().cloned().ok_or(OdbError::OutOfRange { index: 0, count: 0 })?;
            if index >= dst.len() {
                let count = index.checked_add(1).ok_or(OdbError::OutOfRange {
                    index,
                    count: dst.len(),
                })?;
                dst.resize(count, T::default());
            }
            dst[index] = x;
            Ok(())
        }
        match (self, item) {
            (Value::UInt8(d), Value::UInt8(s)) => put(d, s, index),
            (Value::Int8(d), Value::Int8(s)) => put(d, s, index),
            (Value::Char(d), Value::Char(s)) => put(d, s, index),
            (Value::UInt16(d), Value::UInt16(s)) => put(d, s, index),
            (Value::Int16(d), Value::Int16(s)) => put(d, s, index),
            (Value::UInt32(d), Value::UInt32(s)) => put(d, s, index),
            (Value::Int32(d), Value::Int32(s)) => put(d, s, index),
            (Value::Bool(d), Value::Bool(s)) => put(d, s, index),
            (Value::Float(d), Value::Float(s)) => put(d, s, index),
            (Value::Double(d), Value::Double(s)) => put(d, s, index),
            (Value::Str(d), Value::Str(s)) => put(d, s, index),
            (Value::Blob(d), Value::Blob(s)) => put(d, s, index),
            (Value::Int64(d), Value::Int64(s)) => put(d, s, index),
            (Value::UInt64(d), Value::UInt64(s)) => put(d, s, index),
            (d, s) => Err(OdbError::TypeMismatch {
                expected: d.type_id(),
                actual: s.type_id(),
            }),
        }
    }

    /// Truncate or extend (with zero / empty items) to `count` elements
    pub fn resized(&self, count: usize) -> Result<Value> {
        let mut out = Value::zeroed(self.type_id(), count)?;
        for i in 0..count.min(self.len()) {
            if let Some(item) = self.item(i) {
                out.set_item(i, &item)?;
            }
        }
        Ok(out)
    }

    /// Little-endian encoding with `item_size` bytes per element.
    ///
    /// Strings are NUL padded and cut at `item_size - 1` bytes on a UTF-8
    /// boundary. Returns whether any string was cut.
    pub fn encode(&self, item_size: usize) -> (Vec<u8>, bool) {
        let mut out = Vec::with_capacity(self.len() * item_size);
        let mut truncated = false;
        match self {
            Value::UInt8(v) | Value::Char(v) | Value::Blob(v) => out.extend_from_slice(v),
            Value::Int8(v) => out.extend(v.iter().map(|x| *x as u8)),
            Value::UInt16(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            Value::Int16(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            Value::UInt32(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            Value::Int32(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            Value::Int64(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            Value::UInt64(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            Value::Float(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            Value::Double(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            Value::Bool(v) => v
                .iter()
                .for_each(|x| out.extend_from_slice(&(*x as u32).to_le_bytes())),
            Value::Str(v) => {
                for s in v {
                    let (text, cut) = truncate_utf8(s, item_size.saturating_sub(1));
                    truncated |= cut;
                    let start = out.len();
                    out.extend_from_slice(text.as_bytes());
                    out.resize(start + item_size, 0);
                }
            }
        }
        (out, truncated)
    }

    /// Decode `count` items of `ty` from `bytes`
    pub fn decode(ty: TypeId, bytes: &[u8], count: usize, item_size: usize) -> Result<Value> {
        let needed = count * item_size;
        if bytes.len() < needed {
            return Err(OdbError::corrupted(format!(
                "value of {count} x {item_size} bytes exceeds its {} byte block",
                bytes.len()
            )));
        }
        let bytes = &bytes[..needed];
        let chunks = |n: usize| bytes.chunks_exact(n);
        macro_rules! le {
            ($t:ty, $n:expr) => {
                chunks($n)
                    .map(|c| {
                        let mut a = [0u8; $n];
                        a.copy_from_slice(c);
                        <$t>::from_le_bytes(a)
                    })
                    .collect()
            };
        }
        let v = match ty {
            TypeId::UInt8 => Value::UInt8(bytes.to_vec()),
            TypeId::Char => Value::Char(bytes.to_vec()),
            TypeId::Blob => Value::Blob(bytes.to_vec()),
            TypeId::Int8 => Value::Int8(bytes.iter().map(|b| *b as i8).collect()),
            TypeId::UInt16 => Value::UInt16(le!(u16, 2)),
            TypeId::Int16 => Value::Int16(le!(i16, 2)),
            TypeId::UInt32 => Value::UInt32(le!(u32, 4)),
            TypeId::Int32 => Value::Int32(le!(i32, 4)),
            TypeId::Int64 => Value::Int64(le!(i64, 8)),
            TypeId::UInt64 => Value::UInt64(le!(u64, 8)),
            TypeId::Float => Value::Float(le!(f32, 4)),
            TypeId::Double => Value::Double(le!(f64, 8)),
            TypeId::Bool => {
                let raw: Vec<u32> = le!(u32, 4);
                Value::Bool(raw.into_iter().map(|x| x != 0).collect())
            }
            TypeId::String => {
                if item_size == 0 {
                    Value::Str(vec![String::new(); count])
                } else {
                    Value::Str(chunks(item_size).map(decode_cstr).collect())
                }
            }
            TypeId::Key | TypeId::Link => {
                return Err(OdbError::TypeMismatch {
                    expected: TypeId::Int32,
                    actual: ty,
                })
            }
        };
        Ok(v)
    }

    /// Text form of element `index`, as used by the schema format
    pub fn format_item(&self, index: usize) -> String {
        match self {
            Value::UInt8(v) | Value::Char(v) | Value::Blob(v) => v[index].to_string(),
            Value::Int8(v) => v[index].to_string(),
            Value::UInt16(v) => v[index].to_string(),
            Value::Int16(v) => v[index].to_string(),
            Value::UInt32(v) => v[index].to_string(),
            Value::Int32(v) => v[index].to_string(),
            Value::Int64(v) => v[index].to_string(),
            Value::UInt64(v) => v[index].to_string(),
            Value::Bool(v) => (if v[index] { "y" } else { "n" }).to_string(),
            Value::Float(v) => v[index].to_string(),
            Value::Double(v) => v[index].to_string(),
            Value::Str(v) => v[index].clone(),
        }
    }

    pub fn as_i64(&self, index: usize) -> Option<i64> {
        match self.item(index)?.convert(TypeId::Int64).ok()? {
            Value::Int64(v) => v.first().copied(),
            _ => None,
        }
    }

    pub fn as_f64(&self, index: usize) -> Option<f64> {
        match self.item(index)?.convert(TypeId::Double).ok()? {
            Value::Double(v) => v.first().copied(),
            _ => None,
        }
    }

    pub fn as_str(&self, index: usize) -> Option<&str> {
        match self {
            Value::Str(v) => v.get(index).map(String::as_str),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(v) | Value::UInt8(v) => Some(v),
            _ => None,
        }
    }
}

fn decode_cstr(raw: &[u8]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn truncate_utf8(s: &str, max: usize) -> (&str, bool) {
    if s.len() <= max {
        return (s, false);
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    (&s[..end], true)
}

macro_rules! impl_from {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Self {
                    Value::$variant(vec![v])
                }
            }

            impl From<Vec<$t>> for Value {
                fn from(v: Vec<$t>) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

impl_from! {
    u8 => UInt8,
    i8 => Int8,
    u16 => UInt16,
    i16 => Int16,
    u32 => UInt32,
    i32 => Int32,
    u64 => UInt64,
    i64 => Int64,
    bool => Bool,
    f32 => Float,
    f64 => Double,
    String => Str,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(vec![v.to_string()])
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Blob(v.to_vec())
    }
}
