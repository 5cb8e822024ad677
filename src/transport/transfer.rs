//! Transfer hints: byte buffers that may be handed off instead of copied

use std::fmt;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Shared, immutable byte buffer embedded in payloads.
///
/// Serializes as base64 so a payload stays self-contained when the transport
/// copies instead of transferring.
#[derive(Clone, PartialEq, Eq)]
pub struct Buffer(Arc<[u8]>);

impl Buffer {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True if both handles point at the same allocation
    pub fn shares_allocation(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes.into())
    }
}

impl From<&[u8]> for Buffer {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.into())
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Buffer({} bytes)", self.0.len())
    }
}

impl Serialize for Buffer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Buffer {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Buffer::from)
            .map_err(D::Error::custom)
    }
}

/// Buffers referenced by a payload that the transport may move rather than copy
#[derive(Debug, Clone, Default)]
pub struct TransferList(Vec<Buffer>);

impl TransferList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, buffer: Buffer) {
        self.0.push(buffer);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Buffer> {
        self.0.iter()
    }

    /// Sum of all buffer sizes
    pub fn total_bytes(&self) -> usize {
        self.0.iter().map(Buffer::len).sum()
    }
}

impl From<Vec<Buffer>> for TransferList {
    fn from(buffers: Vec<Buffer>) -> Self {
        Self(buffers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_base64_encoding() {
        let buf = Buffer::from(vec![1u8, 2, 3, 4]);
        let json = serde_json::to_string(&buf).unwrap();
        assert_eq!(json, "\"AQIDBA==\"");
        let back: Buffer = serde_json::from_str(&json).unwrap();
        assert_eq!(back.as_bytes(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_buffer_rejects_bad_base64() {
        assert!(serde_json::from_str::<Buffer>("\"not base64!\"").is_err());
    }

    #[test]
    fn test_transfer_list_total() {
        let mut list = TransferList::new();
        list.push(Buffer::from(vec![0u8; 10]));
        list.push(Buffer::from(vec![0u8; 5]));
        assert_eq!(list.len(), 2);
        assert_eq!(list.total_bytes(), 15);
    }

    #[test]
    fn test_clone_shares_allocation() {
        let a = Buffer::from(vec![9u8; 4]);
        let b = a.clone();
        assert!(a.shares_allocation(&b));
        assert!(!a.shares_allocation(&Buffer::from(vec![9u8; 4])));
    }
}
