//! Synchronizable row representation.

use crate::error::{CodecError, CodecResult};
use crate::wire::{from_bytes, to_bytes, uint, MapReader};
use ciborium::value::Value;
use sha2::{Digest, Sha256};

/// Logical clock value assigned to every mutation.
///
/// Within one device timestamps strictly increase, even across wall-clock
/// rollback (the storage engine ratchets a persisted "last local time").
pub type Timestamp = u64;

/// Identity of a peer device.
pub type DeviceId = String;

/// Bit flags carried on a [`DataItem`].
pub mod flags {
    /// The item is a tombstone, not an upsert.
    pub const DELETE: u64 = 0x01;
    /// The item was written locally rather than received from a peer.
    pub const LOCAL: u64 = 0x02;
    /// The remote row no longer matches the subscribed query; it carries no
    /// fresh data and always loses timestamp ties.
    pub const MISS_QUERY: u64 = 0x04;
}

/// One row's synchronizable representation.
///
/// Created when read from storage for sending or deserialized from a
/// received packet; consumed once written to local storage or dropped as a
/// conflict loser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataItem {
    /// Row key.
    pub key: Vec<u8>,
    /// Row value. Empty for tombstones.
    pub value: Vec<u8>,
    /// Logical timestamp of the mutation; the sole ordering key for sync.
    pub timestamp: Timestamp,
    /// Timestamp of the most recent write that produced this version.
    pub write_timestamp: Timestamp,
    /// Bit flags, see [`flags`].
    pub flags: u64,
    /// Device that originated the mutation.
    pub orig_device: DeviceId,
    /// Content-derived row identity, stable across primary-key churn.
    pub hash_key: Vec<u8>,
}

impl DataItem {
    /// Creates an upsert item, deriving the hash key from the row key.
    pub fn put(key: Vec<u8>, value: Vec<u8>, timestamp: Timestamp) -> Self {
        let hash_key = hash_key_for(&key);
        Self {
            key,
            value,
            timestamp,
            write_timestamp: timestamp,
            flags: flags::LOCAL,
            orig_device: String::new(),
            hash_key,
        }
    }

    /// Creates a tombstone item.
    pub fn tombstone(key: Vec<u8>, timestamp: Timestamp) -> Self {
        let hash_key = hash_key_for(&key);
        Self {
            key,
            value: Vec::new(),
            timestamp,
            write_timestamp: timestamp,
            flags: flags::DELETE | flags::LOCAL,
            orig_device: String::new(),
            hash_key,
        }
    }

    /// Sets the originating device.
    pub fn with_orig_device(mut self, device: impl Into<DeviceId>) -> Self {
        self.orig_device = device.into();
        self
    }

    /// Replaces the flag bits.
    pub fn with_flags(mut self, flags: u64) -> Self {
        self.flags = flags;
        self
    }

    /// Returns true if this item is a tombstone.
    pub fn is_delete(&self) -> bool {
        self.flags & flags::DELETE != 0
    }

    /// Returns true if this item was written locally.
    pub fn is_local(&self) -> bool {
        self.flags & flags::LOCAL != 0
    }

    /// Returns true if this item marks a query mismatch rather than data.
    pub fn is_miss_query(&self) -> bool {
        self.flags & flags::MISS_QUERY != 0
    }

    /// Approximate serialized size, used for the packet byte budget.
    pub fn byte_size(&self) -> usize {
        // key + value + hash_key + fixed header fields
        self.key.len() + self.value.len() + self.hash_key.len() + self.orig_device.len() + 40
    }

    pub(crate) fn to_value(&self) -> Value {
        Value::Map(vec![
            (Value::Text("key".into()), Value::Bytes(self.key.clone())),
            (Value::Text("value".into()), Value::Bytes(self.value.clone())),
            (Value::Text("timestamp".into()), uint(self.timestamp)),
            (Value::Text("write_timestamp".into()), uint(self.write_timestamp)),
            (Value::Text("flags".into()), uint(self.flags)),
            (
                Value::Text("orig_device".into()),
                Value::Text(self.orig_device.clone()),
            ),
            (
                Value::Text("hash_key".into()),
                Value::Bytes(self.hash_key.clone()),
            ),
        ])
    }

    pub(crate) fn from_value(value: &Value) -> CodecResult<Self> {
        let map = MapReader::new(value)?;
        let key = map.bytes("key")?;
        let timestamp = map.u64("timestamp")?;
        let hash_key = map.bytes_or_default("hash_key");
        let hash_key = if hash_key.is_empty() {
            hash_key_for(&key)
        } else {
            hash_key
        };
        Ok(Self {
            key,
            value: map.bytes_or_default("value"),
            timestamp,
            write_timestamp: map.u64_or("write_timestamp", timestamp),
            flags: map.u64_or("flags", 0),
            orig_device: map.text_or_default("orig_device"),
            hash_key,
        })
    }

    /// Encodes to CBOR bytes.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        to_bytes(&self.to_value())
    }

    /// Decodes from CBOR bytes.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let value = from_bytes(bytes)?;
        Self::from_value(&value).map_err(|e| match e {
            CodecError::InvalidStructure { message } => CodecError::InvalidStructure {
                message: format!("DataItem: {message}"),
            },
            other => other,
        })
    }
}

/// Derives the content-stable hash key for a row key.
pub fn hash_key_for(key: &[u8]) -> Vec<u8> {
    Sha256::digest(key).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_item_has_hash_key() {
        let item = DataItem::put(b"k1".to_vec(), b"v1".to_vec(), 10);
        assert_eq!(item.hash_key, hash_key_for(b"k1"));
        assert!(item.is_local());
        assert!(!item.is_delete());
    }

    #[test]
    fn tombstone_flags() {
        let item = DataItem::tombstone(b"k1".to_vec(), 10);
        assert!(item.is_delete());
        assert!(item.value.is_empty());
    }

    #[test]
    fn same_key_same_hash() {
        let a = DataItem::put(b"row".to_vec(), b"v1".to_vec(), 1);
        let b = DataItem::tombstone(b"row".to_vec(), 2);
        assert_eq!(a.hash_key, b.hash_key);
    }

    #[test]
    fn item_codec_roundtrip() {
        let item = DataItem::put(b"k".to_vec(), b"value".to_vec(), 99)
            .with_orig_device("dev-a")
            .with_flags(flags::MISS_QUERY);
        let bytes = item.encode().unwrap();
        let decoded = DataItem::decode(&bytes).unwrap();
        assert_eq!(decoded, item);
        assert!(decoded.is_miss_query());
    }

    #[test]
    fn decode_missing_key_rejected() {
        let value = Value::Map(vec![(Value::Text("timestamp".into()), uint(1))]);
        let bytes = to_bytes(&value).unwrap();
        assert!(DataItem::decode(&bytes).is_err());
    }

    #[test]
    fn decode_without_hash_key_rederives() {
        let value = Value::Map(vec![
            (Value::Text("key".into()), Value::Bytes(b"k".to_vec())),
            (Value::Text("timestamp".into()), uint(5)),
        ]);
        let bytes = to_bytes(&value).unwrap();
        let item = DataItem::decode(&bytes).unwrap();
        assert_eq!(item.hash_key, hash_key_for(b"k"));
        assert_eq!(item.write_timestamp, 5);
    }
}
