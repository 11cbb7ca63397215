//! CBOR map helpers shared by the packet codecs.
//!
//! Packets encode as CBOR maps with text keys. Decoding looks fields up by
//! name, so unknown keys added by newer protocol versions are ignored rather
//! than rejected.

use crate::error::{CodecError, CodecResult};
use ciborium::value::Value;

/// Encodes a CBOR value to bytes.
pub fn to_bytes(value: &Value) -> CodecResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Decodes a CBOR value from bytes.
pub fn from_bytes(bytes: &[u8]) -> CodecResult<Value> {
    ciborium::de::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

/// Builds an unsigned integer value.
pub fn uint(v: u64) -> Value {
    Value::Integer(v.into())
}

/// Builds a signed integer value.
pub fn int(v: i64) -> Value {
    Value::Integer(v.into())
}

/// Field lookup over a decoded CBOR map.
pub struct MapReader<'a> {
    entries: &'a [(Value, Value)],
}

impl<'a> MapReader<'a> {
    /// Wraps a decoded value, failing unless it is a map.
    pub fn new(value: &'a Value) -> CodecResult<Self> {
        match value {
            Value::Map(entries) => Ok(Self { entries }),
            _ => Err(CodecError::invalid_structure("expected map")),
        }
    }

    /// Returns the raw value for a key, if present.
    pub fn get(&self, name: &str) -> Option<&'a Value> {
        self.entries
            .iter()
            .find(|(k, _)| matches!(k, Value::Text(t) if t == name))
            .map(|(_, v)| v)
    }

    /// Reads an unsigned integer field, defaulting when absent.
    pub fn u64_or(&self, name: &str, default: u64) -> u64 {
        self.get(name).and_then(as_u64).unwrap_or(default)
    }

    /// Reads a required unsigned integer field.
    pub fn u64(&self, name: &str) -> CodecResult<u64> {
        self.get(name)
            .and_then(as_u64)
            .ok_or_else(|| CodecError::invalid_structure(format!("missing {name}")))
    }

    /// Reads a signed integer field, defaulting when absent.
    pub fn i64_or(&self, name: &str, default: i64) -> i64 {
        self.get(name).and_then(as_i64).unwrap_or(default)
    }

    /// Reads a boolean field, defaulting when absent.
    pub fn bool_or(&self, name: &str, default: bool) -> bool {
        self.get(name)
            .and_then(|v| match v {
                Value::Bool(b) => Some(*b),
                _ => None,
            })
            .unwrap_or(default)
    }

    /// Reads a required byte-string field.
    pub fn bytes(&self, name: &str) -> CodecResult<Vec<u8>> {
        self.get(name)
            .and_then(|v| match v {
                Value::Bytes(b) => Some(b.clone()),
                _ => None,
            })
            .ok_or_else(|| CodecError::invalid_structure(format!("missing {name}")))
    }

    /// Reads a byte-string field, empty when absent.
    pub fn bytes_or_default(&self, name: &str) -> Vec<u8> {
        self.get(name)
            .and_then(|v| match v {
                Value::Bytes(b) => Some(b.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Reads a text field, empty when absent.
    pub fn text_or_default(&self, name: &str) -> String {
        self.get(name)
            .and_then(|v| match v {
                Value::Text(t) => Some(t.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Reads an array field, empty when absent.
    pub fn array(&self, name: &str) -> &'a [Value] {
        self.get(name)
            .and_then(|v| match v {
                Value::Array(a) => Some(a.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }
}

fn as_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Integer(i) => u64::try_from(i128::from(*i)).ok(),
        _ => None,
    }
}

fn as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Integer(i) => i64::try_from(i128::from(*i)).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Value {
        Value::Map(vec![
            (Value::Text("n".into()), uint(7)),
            (Value::Text("s".into()), int(-3)),
            (Value::Text("b".into()), Value::Bytes(vec![1, 2])),
            (Value::Text("t".into()), Value::Text("hi".into())),
            (Value::Text("f".into()), Value::Bool(true)),
        ])
    }

    #[test]
    fn lookup_present_fields() {
        let value = sample();
        let map = MapReader::new(&value).unwrap();

        assert_eq!(map.u64("n").unwrap(), 7);
        assert_eq!(map.i64_or("s", 0), -3);
        assert_eq!(map.bytes("b").unwrap(), vec![1, 2]);
        assert_eq!(map.text_or_default("t"), "hi");
        assert!(map.bool_or("f", false));
    }

    #[test]
    fn missing_fields_default() {
        let value = sample();
        let map = MapReader::new(&value).unwrap();

        assert_eq!(map.u64_or("absent", 42), 42);
        assert!(map.bytes("absent").is_err());
        assert!(map.array("absent").is_empty());
    }

    #[test]
    fn non_map_rejected() {
        let value = uint(1);
        assert!(MapReader::new(&value).is_err());
    }

    #[test]
    fn bytes_roundtrip() {
        let value = sample();
        let bytes = to_bytes(&value).unwrap();
        let decoded = from_bytes(&bytes).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn garbage_input_is_decode_error() {
        assert!(matches!(
            from_bytes(&[0xff, 0x00, 0x13]),
            Err(CodecError::Decode(_))
        ));
    }
}
