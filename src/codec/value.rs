//! Dynamic argument and field values.
//!
//! Command parameters are typed by metadata at runtime, so arguments and
//! decoded fields travel as [`Value`]s keyed by parameter name.
//!
//! # Example
//!
//! ```
//! use unpi_client::codec::{Args, Value};
//!
//! let args = Args::from([("id", Value::from(0x0003u16)), ("offset", Value::from(0u8))]);
//! assert!(matches!(args, Args::Named(_)));
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// One argument or decoded field.
///
/// Serializes untagged: numbers as JSON numbers, addresses as strings,
/// byte buffers or u16 lists as arrays and records as arrays of objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(i64),
    /// 64-bit IEEE address as 16 hex characters.
    Address(String),
    Bytes(Vec<u8>),
    List(Vec<u16>),
    /// Table entries such as neighbors, routes or beacons.
    Records(Vec<Fields>),
}

/// Decoded fields keyed by parameter name.
pub type Fields = BTreeMap<String, Value>;

impl Value {
    #[inline]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    #[inline]
    pub fn as_u32(&self) -> Option<u32> {
        self.as_i64().and_then(|n| u32::try_from(n).ok())
    }

    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Address(s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    #[inline]
    pub fn as_list(&self) -> Option<&[u16]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    #[inline]
    pub fn as_records(&self) -> Option<&[Fields]> {
        match self {
            Value::Records(r) => Some(r),
            _ => None,
        }
    }

    /// Element count of a buffer, list or record table; `None` for scalars.
    pub fn element_count(&self) -> Option<usize> {
        match self {
            Value::Bytes(b) => Some(b.len()),
            Value::List(l) => Some(l.len()),
            Value::Records(r) => Some(r.len()),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", n),
            Value::Address(s) => write!(f, "0x{}", s),
            Value::Bytes(b) => {
                f.write_str("<")?;
                for byte in b {
                    write!(f, "{:02x}", byte)?;
                }
                f.write_str(">")
            }
            Value::List(l) => write!(f, "{:?}", l),
            Value::Records(records) => {
                f.write_str("[")?;
                for (i, record) in records.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    f.write_str("{")?;
                    for (j, (name, value)) in record.iter().enumerate() {
                        if j > 0 {
                            f.write_str(" ")?;
                        }
                        write!(f, "{}={}", name, value)?;
                    }
                    f.write_str("}")?;
                }
                f.write_str("]")
            }
        }
    }
}

macro_rules! impl_from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Value {
                fn from(n: $t) -> Self {
                    Value::Number(i64::from(n))
                }
            }
        )*
    };
}

impl_from_int!(u8, u16, u32, i8, i16, i32, i64);

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Bytes(b.to_vec())
    }
}

impl<const N: usize> From<[u8; N]> for Value {
    fn from(b: [u8; N]) -> Self {
        Value::Bytes(b.to_vec())
    }
}

impl From<Vec<u16>> for Value {
    fn from(l: Vec<u16>) -> Self {
        Value::List(l)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Address(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Address(s)
    }
}

/// Request arguments, by position or by parameter name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Args {
    /// Values in declaration order. Missing trailing length prefixes are
    /// derived from the field they describe.
    Positional(Vec<Value>),
    /// Values keyed by parameter name. Every declared name must be present.
    Named(Fields),
}

impl Args {
    /// No arguments.
    pub fn empty() -> Self {
        Args::Positional(Vec::new())
    }
}

impl Default for Args {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Vec<Value>> for Args {
    fn from(values: Vec<Value>) -> Self {
        Args::Positional(values)
    }
}

impl From<Fields> for Args {
    fn from(fields: Fields) -> Self {
        Args::Named(fields)
    }
}

impl<K, V, const N: usize> From<[(K, V); N]> for Args
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from(pairs: [(K, V); N]) -> Self {
        Args::Named(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions() {
        assert_eq!(Value::from(7u8), Value::Number(7));
        assert_eq!(Value::from(-2i16), Value::Number(-2));
        assert_eq!(Value::from(vec![1u8, 2]), Value::Bytes(vec![1, 2]));
        assert_eq!(Value::from(vec![0x1234u16]), Value::List(vec![0x1234]));
        assert_eq!(
            Value::from("00124b00019c2ee9"),
            Value::Address("00124b00019c2ee9".into())
        );
    }

    #[test]
    fn test_accessors() {
        assert_eq!(Value::Number(5).as_u32(), Some(5));
        assert_eq!(Value::Number(-1).as_u32(), None);
        assert_eq!(Value::Bytes(vec![1, 2, 3]).element_count(), Some(3));
        assert_eq!(Value::List(vec![1]).element_count(), Some(1));
        assert_eq!(Value::Number(1).element_count(), None);
        assert_eq!(Value::Records(vec![Fields::new()]).element_count(), Some(1));
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Bytes(vec![0xab, 0x01]).to_string(), "<ab01>");
        assert_eq!(Value::Address("00124b0001020304".into()).to_string(), "0x00124b0001020304");

        let mut record = Fields::new();
        record.insert("lqi".into(), Value::Number(200));
        record.insert("depth".into(), Value::Number(1));
        assert_eq!(Value::Records(vec![record]).to_string(), "[{depth=1 lqi=200}]");
    }

    #[test]
    fn test_json_shape() {
        let mut fields = Fields::new();
        fields.insert("status".into(), Value::Number(0));
        fields.insert("value".into(), Value::Bytes(vec![1, 2]));
        let json = serde_json::to_string(&fields).unwrap();
        assert_eq!(json, r#"{"status":0,"value":[1,2]}"#);

        let back: Fields = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fields);

        let mut entry = Fields::new();
        entry.insert("nwkaddr".into(), Value::Number(0x1234));
        let table = Value::Records(vec![entry]);
        let json = serde_json::to_string(&table).unwrap();
        assert_eq!(json, r#"[{"nwkaddr":4660}]"#);
        assert_eq!(serde_json::from_str::<Value>(&json).unwrap(), table);
    }

    #[test]
    fn test_args_from_pairs() {
        let args = Args::from([("value", 42u32)]);
        match args {
            Args::Named(fields) => assert_eq!(fields["value"], Value::Number(42)),
            Args::Positional(_) => panic!("expected named args"),
        }
        assert_eq!(Args::default(), Args::Positional(vec![]));
    }
}
