use serde::{Deserialize, Serialize};
use std::fmt;

/// SQL value as carried between the planner, vindexes, and backends.
///
/// Mirrors the MySQL type lattice only as far as the proxy core needs:
/// numeric values render to their decimal text form when byte-mapped, string
/// and binary values map to their raw bytes, and NULL maps to nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// Signed 64-bit integer.
    Int64(i64),
    /// Unsigned 64-bit integer.
    Uint64(u64),
    /// 64-bit float.
    Float64(f64),
    /// Character string.
    VarChar(String),
    /// Binary string.
    VarBinary(Vec<u8>),
}

impl Value {
    /// Raw byte representation; `None` for NULL.
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Value::Null => None,
            Value::Int64(v) => Some(v.to_string().into_bytes()),
            Value::Uint64(v) => Some(v.to_string().into_bytes()),
            Value::Float64(v) => Some(v.to_string().into_bytes()),
            Value::VarChar(s) => Some(s.as_bytes().to_vec()),
            Value::VarBinary(b) => Some(b.clone()),
        }
    }

    /// Whether this is SQL NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Uint64(v) => write!(f, "{v}"),
            Value::Float64(v) => write!(f, "{v}"),
            Value::VarChar(s) => write!(f, "{s}"),
            Value::VarBinary(b) => write!(f, "{}", String::from_utf8_lossy(b)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Value;

    #[test]
    fn null_has_no_bytes() {
        assert_eq!(Value::Null.to_bytes(), None);
        assert!(Value::Null.is_null());
    }

    #[test]
    fn binary_bytes_are_raw() {
        let v = Value::VarBinary(vec![0x00, 0xff, 0x01]);
        assert_eq!(v.to_bytes().as_deref(), Some(&[0x00, 0xff, 0x01][..]));
    }

    #[test]
    fn numbers_render_decimal_text() {
        assert_eq!(Value::Int64(-7).to_bytes().as_deref(), Some(b"-7".as_ref()));
        assert_eq!(Value::Uint64(42).to_bytes().as_deref(), Some(b"42".as_ref()));
    }
}
