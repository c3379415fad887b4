use std::fmt::{Display, Formatter};

use crate::base::decimal::Decimal;
use crate::utils::bytes::{bytes_delta, bytes_tail, bytes_to_string, string_to_bytes};
use crate::{DynamicError, Error, Result};

/// Represents the type of a field instruction.
///
/// Covers scalar field types, integer vectors, and the aggregate kinds
/// (sequence, group, template reference).
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum ValueType {
    UInt32,
    Int32,
    UInt64,
    Int64,
    Length,
    Exponent,
    Mantissa,
    Decimal,
    ASCIIString,
    UnicodeString,
    Bytes,
    Int32Vector,
    UInt32Vector,
    Int64Vector,
    UInt64Vector,
    Sequence,
    Group,
    TemplateReference,
}

impl ValueType {
    pub fn new_from_tag(tag: &str, unicode: bool) -> Result<Self> {
        match tag {
            "uInt32" => Ok(Self::UInt32),
            "int32" => Ok(Self::Int32),
            "uInt64" => Ok(Self::UInt64),
            "int64" => Ok(Self::Int64),
            "length" => Ok(Self::Length),
            "exponent" => Ok(Self::Exponent),
            "mantissa" => Ok(Self::Mantissa),
            "decimal" => Ok(Self::Decimal),
            "string" => {
                if unicode {
                    Ok(Self::UnicodeString)
                } else {
                    Ok(Self::ASCIIString)
                }
            }
            "byteVector" => Ok(Self::Bytes),
            "int32Vector" => Ok(Self::Int32Vector),
            "uInt32Vector" => Ok(Self::UInt32Vector),
            "int64Vector" => Ok(Self::Int64Vector),
            "uInt64Vector" => Ok(Self::UInt64Vector),
            "sequence" => Ok(Self::Sequence),
            "group" => Ok(Self::Group),
            "templateRef" => Ok(Self::TemplateReference),
            _ => Err(Error::Static(format!("Unknown type: {tag}"))),
        }
    }

    pub fn type_str(&self) -> &'static str {
        match self {
            ValueType::UInt32 => "uInt32",
            ValueType::Int32 => "int32",
            ValueType::UInt64 => "uInt64",
            ValueType::Int64 => "int64",
            ValueType::Length => "length",
            ValueType::Exponent => "exponent",
            ValueType::Mantissa => "mantissa",
            ValueType::Decimal => "decimal",
            ValueType::ASCIIString => "string",
            ValueType::UnicodeString => "string",
            ValueType::Bytes => "byteVector",
            ValueType::Int32Vector => "int32Vector",
            ValueType::UInt32Vector => "uInt32Vector",
            ValueType::Int64Vector => "int64Vector",
            ValueType::UInt64Vector => "uInt64Vector",
            ValueType::Sequence => "sequence",
            ValueType::Group => "group",
            ValueType::TemplateReference => "templateRef",
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            ValueType::UInt32
                | ValueType::Int32
                | ValueType::UInt64
                | ValueType::Int64
                | ValueType::Length
                | ValueType::Exponent
                | ValueType::Mantissa
        )
    }

    pub fn is_vector(&self) -> bool {
        matches!(
            self,
            ValueType::Int32Vector
                | ValueType::UInt32Vector
                | ValueType::Int64Vector
                | ValueType::UInt64Vector
        )
    }

    /// The base value used by the delta and tail operators when neither a previous
    /// nor an initial value exists.
    pub fn to_default_value(&self) -> Result<Value> {
        match self {
            ValueType::UInt32 => Ok(Value::UInt32(0)),
            ValueType::Int32 => Ok(Value::Int32(0)),
            ValueType::UInt64 => Ok(Value::UInt64(0)),
            ValueType::Int64 => Ok(Value::Int64(0)),
            ValueType::Length => Ok(Value::UInt32(0)),
            ValueType::Exponent => Ok(Value::Int32(0)),
            ValueType::Mantissa => Ok(Value::Int64(0)),
            ValueType::Decimal => Ok(Value::Decimal(Decimal::default())),
            ValueType::ASCIIString => Ok(Value::ASCIIString(String::new())),
            ValueType::UnicodeString => Ok(Value::UnicodeString(String::new())),
            ValueType::Bytes => Ok(Value::Bytes(Vec::new())),
            ValueType::Int32Vector | ValueType::Int64Vector => Ok(Value::IntVector(Vec::new())),
            ValueType::UInt32Vector | ValueType::UInt64Vector => Ok(Value::UIntVector(Vec::new())),
            _ => Err(Error::Runtime(format!(
                "{} cannot be converted to value",
                self.type_str()
            ))),
        }
    }

    /// Convert an initial value literal to a typed value.
    pub fn str_to_value(&self, s: &str) -> Result<Value> {
        match self {
            ValueType::UInt32 | ValueType::Length => Ok(Value::UInt32(s.parse()?)),
            ValueType::Int32 | ValueType::Exponent => Ok(Value::Int32(s.parse()?)),
            ValueType::UInt64 => Ok(Value::UInt64(s.parse()?)),
            ValueType::Int64 | ValueType::Mantissa => Ok(Value::Int64(s.parse()?)),
            ValueType::Decimal => Ok(Value::Decimal(Decimal::from_string(s)?)),
            ValueType::ASCIIString => Ok(Value::ASCIIString(s.to_string())),
            ValueType::UnicodeString => Ok(Value::UnicodeString(s.to_string())),
            // The string is interpreted as an even number of hexadecimal digits [0-9A-Fa-f]
            // possibly interleaved with whitespace.
            ValueType::Bytes => Ok(Value::Bytes(string_to_bytes(s)?)),
            _ => Err(Error::Static(format!(
                "cannot set initial value for {}",
                self.type_str()
            ))),
        }
    }

}


/// Represents the current value of a field.
#[derive(Debug, PartialEq, Clone)]
pub enum Value {
    UInt32(u32),
    Int32(i32),
    UInt64(u64),
    Int64(i64),
    Decimal(Decimal),
    ASCIIString(String),
    UnicodeString(String),
    Bytes(Vec<u8>),
    IntVector(Vec<i64>),
    UIntVector(Vec<u64>),
}

impl Value {
    /// The previous value plus one, used by the increment operator.
    /// `None` when the increment would overflow the declared width.
    pub fn checked_increment(&self) -> Option<Value> {
        match self {
            Value::UInt32(v) => v.checked_add(1).map(Value::UInt32),
            Value::Int32(v) => v.checked_add(1).map(Value::Int32),
            Value::UInt64(v) => v.checked_add(1).map(Value::UInt64),
            Value::Int64(v) => v.checked_add(1).map(Value::Int64),
            _ => None,
        }
    }

    /// Find the delta turning `base` into `self`.
    ///
    /// Integers yield a signed difference and a zero subtraction length; strings and byte
    /// vectors yield the shortest difference plus the subtraction length framing it.
    pub fn find_delta(&self, base: &Value) -> Result<(Value, i32)> {
        fn int_delta(v: i128, b: i128) -> Result<(Value, i32)> {
            let d = i64::try_from(v - b).map_err(|_| {
                Error::Dynamic(DynamicError::OutOfRange {
                    detail: format!("delta of {v} against base {b} does not fit int64"),
                })
            })?;
            Ok((Value::Int64(d), 0))
        }

        match (self, base) {
            (Value::UInt32(v), Value::UInt32(b)) => int_delta(*v as i128, *b as i128),
            (Value::Int32(v), Value::Int32(b)) => int_delta(*v as i128, *b as i128),
            (Value::UInt64(v), Value::UInt64(b)) => int_delta(*v as i128, *b as i128),
            (Value::Int64(v), Value::Int64(b)) => int_delta(*v as i128, *b as i128),
            (Value::ASCIIString(v), Value::ASCIIString(b)) => {
                let (sub, diff) = bytes_delta(b.as_bytes(), v.as_bytes());
                // the difference of two ASCII strings is itself ASCII
                Ok((Value::ASCIIString(String::from_utf8(diff.to_vec())?), sub))
            }
            (Value::UnicodeString(v), Value::UnicodeString(b)) => {
                let (sub, diff) = bytes_delta(b.as_bytes(), v.as_bytes());
                Ok((Value::Bytes(diff.to_vec()), sub))
            }
            (Value::Bytes(v), Value::Bytes(b)) => {
                let (sub, diff) = bytes_delta(b, v);
                Ok((Value::Bytes(diff.to_vec()), sub))
            }
            _ => Err(Error::Runtime(format!(
                "Cannot find delta of {self:?} against {base:?}"
            ))),
        }
    }

    /// Find the shortest tail turning `base` into `self`, for the tail operator.
    pub fn find_tail(&self, base: &Value) -> Result<Value> {
        fn tail<'a>(b: &[u8], v: &'a [u8]) -> Result<&'a [u8]> {
            bytes_tail(b, v).ok_or_else(|| {
                Error::Runtime(format!(
                    "tail operator cannot shorten a value from {} to {} code units",
                    b.len(),
                    v.len()
                ))
            })
        }

        match (self, base) {
            (Value::ASCIIString(v), Value::ASCIIString(b)) => {
                let t = tail(b.as_bytes(), v.as_bytes())?;
                Ok(Value::ASCIIString(String::from_utf8(t.to_vec())?))
            }
            (Value::UnicodeString(v), Value::UnicodeString(b)) => {
                Ok(Value::Bytes(tail(b.as_bytes(), v.as_bytes())?.to_vec()))
            }
            (Value::Bytes(v), Value::Bytes(b)) => Ok(Value::Bytes(tail(b, v)?.to_vec())),
            _ => Err(Error::Runtime(format!(
                "Cannot find tail of {self:?} against {base:?}"
            ))),
        }
    }

    /// Combine a delta read from the stream with `self` as the base value.
    pub fn apply_delta(&self, delta: &Value, sub: i32) -> Result<Value> {
        fn checked<T>(v: i128, what: &str) -> Result<T>
        where
            T: TryFrom<i128>,
        {
            T::try_from(v).map_err(|_| {
                Error::Dynamic(DynamicError::OutOfRange {
                    detail: format!("{v} does not fit {what}"),
                })
            })
        }

        fn spliced(base: &[u8], diff: &[u8], sub: i32) -> Result<Vec<u8>> {
            // A negative subtraction length removes values from the front of the base;
            // negative zero (-1 on the wire before biasing) prepends without removing.
            let front = sub < 0;
            let n = if front { (-(sub as i64) - 1) as usize } else { sub as usize };
            if n > base.len() {
                return Err(Error::Dynamic(DynamicError::SubtractionLength {
                    length: sub as i64,
                    base_length: base.len(),
                })); // [ERR D7]
            }
            let mut b = Vec::with_capacity(base.len() - n + diff.len());
            if front {
                b.extend_from_slice(diff);
                b.extend_from_slice(&base[n..]);
            } else {
                b.extend_from_slice(&base[..base.len() - n]);
                b.extend_from_slice(diff);
            }
            Ok(b)
        }

        match (self, delta) {
            (Value::UInt32(v), Value::Int64(d)) => {
                Ok(Value::UInt32(checked(*v as i128 + *d as i128, "uInt32")?))
            }
            (Value::Int32(v), Value::Int64(d)) => {
                Ok(Value::Int32(checked(*v as i128 + *d as i128, "int32")?))
            }
            (Value::UInt64(v), Value::Int64(d)) => {
                Ok(Value::UInt64(checked(*v as i128 + *d as i128, "uInt64")?))
            }
            (Value::Int64(v), Value::Int64(d)) => {
                Ok(Value::Int64(checked(*v as i128 + *d as i128, "int64")?))
            }
            (Value::ASCIIString(v), Value::ASCIIString(d)) => {
                let b = spliced(v.as_bytes(), d.as_bytes(), sub)?;
                Ok(Value::ASCIIString(String::from_utf8(b)?))
            }
            (Value::UnicodeString(v), Value::Bytes(d)) => {
                let b = spliced(v.as_bytes(), d, sub)?;
                Ok(Value::UnicodeString(String::from_utf8(b)?)) // [ERR R2]
            }
            (Value::Bytes(v), Value::Bytes(d)) => Ok(Value::Bytes(spliced(v, d, sub)?)),
            _ => Err(Error::Runtime(format!(
                "Cannot apply delta {delta:?} to {self:?}"
            ))),
        }
    }

    /// Combine a tail read from the stream with `self` as the base value.
    pub fn apply_tail(&self, tail: &Value) -> Result<Value> {
        let len = match (self, tail) {
            (Value::ASCIIString(v), Value::ASCIIString(t)) => t.len().min(v.len()),
            (Value::UnicodeString(v), Value::Bytes(t)) => t.len().min(v.len()),
            (Value::Bytes(v), Value::Bytes(t)) => t.len().min(v.len()),
            _ => {
                return Err(Error::Runtime(format!(
                    "Cannot apply tail {tail:?} to {self:?}"
                )));
            }
        };
        self.apply_delta(tail, len as i32)
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::UInt32(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::UInt64(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Decimal(v) => write!(f, "{v}"),
            Value::ASCIIString(s) => f.write_str(s),
            Value::UnicodeString(s) => f.write_str(s),
            Value::Bytes(b) => f.write_str(&bytes_to_string(b)),
            Value::IntVector(v) => write!(f, "{v:?}"),
            Value::UIntVector(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt32(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt64(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Value::Decimal(v)
    }
}
