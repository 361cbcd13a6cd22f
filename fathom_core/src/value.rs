use crate::bits::BitBuf;
use std::fmt;

/// The logical value carried by a scalar element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    UInt(u64),
    Str(String),
    Bits(BitBuf),
}

impl Value {
    /// Integer view of the value. Numeric strings parse as decimal; bit strings have none.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            Value::Str(s) => s.trim().trim_end_matches('\0').parse().ok(),
            Value::Bits(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bits(&self) -> Option<&BitBuf> {
        match self {
            Value::Bits(b) => Some(b),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) | Value::UInt(_) => "integer",
            Value::Str(_) => "string",
            Value::Bits(_) => "bytes",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::UInt(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Bits(b) => write!(f, "0x{}", b.to_hex()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<BitBuf> for Value {
    fn from(b: BitBuf) -> Self {
        Value::Bits(b)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Bits(BitBuf::from_bytes(b))
    }
}
