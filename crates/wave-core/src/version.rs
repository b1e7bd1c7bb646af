//! Hashed versions: points in a wavelet's history.
//!
//! Each version carries a hash chained from its predecessor and the delta
//! that produced it, so two replicas agree on a version only when they agree
//! on the entire history leading up to it.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A `(version, hash)` pair identifying a point in a wavelet's history.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HashedVersion {
    pub version: u64,
    #[serde(with = "hex_bytes")]
    pub hash: Vec<u8>,
}

impl HashedVersion {
    pub fn new(version: u64, hash: impl Into<Vec<u8>>) -> Self {
        Self {
            version,
            hash: hash.into(),
        }
    }

    /// Hex form of the hash.
    pub fn hash_hex(&self) -> String {
        to_hex(&self.hash)
    }

    /// Truncated display (first 8 hex chars).
    pub fn short(&self) -> String {
        let hex = self.hash_hex();
        format!("{}:{}", self.version, &hex[..hex.len().min(8)])
    }
}

impl fmt::Debug for HashedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashedVersion({})", self.short())
    }
}

impl fmt::Display for HashedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.version, self.hash_hex())
    }
}

/// Lowercase hex encoding.
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Parse lowercase or uppercase hex.
pub fn from_hex(s: &str) -> Result<Vec<u8>, CoreError> {
    if s.len() % 2 != 0 {
        return Err(CoreError::InvalidHex(s.to_string()));
    }
    s.as_bytes()
        .chunks(2)
        .map(|chunk| {
            std::str::from_utf8(chunk)
                .ok()
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| CoreError::InvalidHex(s.to_string()))
        })
        .collect()
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::to_hex(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
