//! WireGuard public key handling.
//!
//! Keys are treated as opaque 32-byte identifiers. They travel as standard
//! base64, the same encoding `wg(8)` prints.

use crate::error::{LeaseError, LeaseResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Length of a WireGuard key in bytes.
pub const KEY_LEN: usize = 32;

/// A WireGuard public key, the identity a lease is bound to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WgPublicKey(pub [u8; KEY_LEN]);

impl WgPublicKey {
    /// Parse a public key from base64.
    pub fn from_base64(base64: &str) -> LeaseResult<Self> {
        let bytes = STANDARD
            .decode(base64.trim())
            .map_err(|e| LeaseError::Key(format!("Invalid base64: {}", e)))?;

        if bytes.len() != KEY_LEN {
            return Err(LeaseError::Key(format!(
                "Invalid key length: expected {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            )));
        }

        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes);
        Ok(Self(key))
    }

    /// Encode as base64.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// First few characters of the base64 form, for log lines.
    pub fn short(&self) -> String {
        self.to_base64().chars().take(8).collect()
    }
}

impl From<[u8; KEY_LEN]> for WgPublicKey {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl FromStr for WgPublicKey {
    type Err = LeaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base64(s)
    }
}

impl fmt::Display for WgPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for WgPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WgPublicKey({})", self.to_base64())
    }
}

impl Serialize for WgPublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for WgPublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        Self::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = "NkEtSA6GosX40iZFNe9+byAkXweYKvQe3utnFYkQ+00=";

    #[test]
    fn test_parse_valid_key() {
        let key = WgPublicKey::from_base64(VALID).unwrap();
        assert_eq!(key.to_base64(), VALID);
        assert_eq!(key.to_string(), VALID);
    }

    #[test]
    fn test_parse_rejects_wrong_length() {
        assert!(WgPublicKey::from_base64("AAAA").is_err());
        assert!(WgPublicKey::from_base64("not base64!").is_err());
    }

    #[test]
    fn test_public_key_serialization() {
        let key: WgPublicKey = VALID.parse().unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", VALID));
        let restored: WgPublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(key, restored);
    }
}
