//! Transaction identifier
//!
//! Transaction ids are generated by the caller, never by the coordinator or a
//! participant, and are never reused. They join the coordinator's log, every
//! participant's log and the live-context maps.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Globally unique, caller-generated transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Convert to bytes (16 bytes, big-endian). Used as the log key prefix.
    pub fn to_bytes(&self) -> [u8; 16] {
        *self.0.as_bytes()
    }

    /// Parse from bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Parse from string representation.
    pub fn parse(s: &str) -> Result<Self, String> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| format!("Invalid transaction ID: {}", e))
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let id = TransactionId::new();
        let s = id.to_string();
        let parsed = TransactionId::parse(&s).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_bytes_roundtrip() {
        let id = TransactionId::new();
        let bytes = id.to_bytes();
        assert_eq!(id, TransactionId::from_bytes(bytes));
    }

    #[test]
    fn test_hash_eq_consistency() {
        use std::collections::HashMap;

        let id1 = TransactionId::new();
        let id2 = id1;

        let mut map = HashMap::new();
        map.insert(id1, "value");
        assert_eq!(map.get(&id2), Some(&"value"));
    }
}
