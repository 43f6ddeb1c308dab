//! Fixed-length, hex-serializable byte strings used throughout the crate.
//!
//! The engine never interprets a public key or signing root beyond equality
//! and length, so both are modelled as plain byte arrays rather than as the
//! BLS/SSZ types a full consensus client would use.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A BLS public key, 48 bytes, compared and stored only for equality.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicKeyBytes(pub [u8; 48]);

/// A 32-byte signing root, or any other opaque 32-byte hash value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub fn zero() -> Self {
        Self([0; 32])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, FixedBytesError> {
        if bytes.len() != 32 {
            return Err(FixedBytesError::WrongLength {
                expected: 32,
                found: bytes.len(),
            });
        }
        let mut array = [0; 32];
        array.copy_from_slice(bytes);
        Ok(Self(array))
    }
}

impl PublicKeyBytes {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, FixedBytesError> {
        if bytes.len() != 48 {
            return Err(FixedBytesError::WrongLength {
                expected: 48,
                found: bytes.len(),
            });
        }
        let mut array = [0; 48];
        array.copy_from_slice(bytes);
        Ok(Self(array))
    }

    /// Lowercase `0x`-prefixed hex representation, used as the storage key
    /// for the `validators.public_key` column.
    pub fn to_hex_string(&self) -> String {
        format!("0x{}", hex::encode(&self.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixedBytesError {
    MissingPrefix,
    InvalidHex(String),
    WrongLength { expected: usize, found: usize },
}

impl fmt::Display for FixedBytesError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FixedBytesError::MissingPrefix => write!(f, "hex string is missing the 0x prefix"),
            FixedBytesError::InvalidHex(e) => write!(f, "invalid hex: {}", e),
            FixedBytesError::WrongLength { expected, found } => {
                write!(f, "expected {} bytes, found {}", expected, found)
            }
        }
    }
}

impl std::error::Error for FixedBytesError {}

fn decode_prefixed_hex(s: &str) -> Result<Vec<u8>, FixedBytesError> {
    let stripped = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .ok_or(FixedBytesError::MissingPrefix)?;
    hex::decode(stripped).map_err(|e| FixedBytesError::InvalidHex(e.to_string()))
}

macro_rules! impl_fixed_bytes {
    ($ty:ident, $len:expr) => {
        impl std::str::FromStr for $ty {
            type Err = FixedBytesError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = decode_prefixed_hex(s)?;
                Self::from_slice(&bytes)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "0x{}", hex::encode(&self.0[..]))
            }
        }

        impl Serialize for $ty {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                struct HexVisitor;

                impl<'de> Visitor<'de> for HexVisitor {
                    type Value = $ty;

                    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                        formatter.write_str("a 0x-prefixed hex string")
                    }

                    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
                    where
                        E: de::Error,
                    {
                        value.parse().map_err(de::Error::custom)
                    }
                }

                deserializer.deserialize_str(HexVisitor)
            }
        }
    };
}

impl_fixed_bytes!(PublicKeyBytes, 48);
impl_fixed_bytes!(Hash256, 32);

/// Render an optional root for error messages: `None` is the interchange
/// wildcard, not a zero root.
pub(crate) fn display_root(root: &Option<Hash256>) -> String {
    match root {
        Some(root) => root.to_string(),
        None => "wildcard".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash256_round_trips_through_hex() {
        let h = Hash256([7; 32]);
        let s = h.to_string();
        assert_eq!(s.parse::<Hash256>().unwrap(), h);
    }

    #[test]
    fn hash256_read_is_case_insensitive() {
        let lower = "0x".to_string() + &"ab".repeat(32);
        let upper = "0X".to_string() + &"AB".repeat(32);
        assert_eq!(
            lower.parse::<Hash256>().unwrap(),
            upper.parse::<Hash256>().unwrap()
        );
    }

    #[test]
    fn write_is_always_lowercase() {
        let h: Hash256 = ("0x".to_string() + &"AB".repeat(32)).parse().unwrap();
        assert_eq!(h.to_string(), "0x".to_string() + &"ab".repeat(32));
    }

    #[test]
    fn rejects_missing_prefix() {
        assert!("ab".repeat(32).parse::<Hash256>().is_err());
    }

    #[test]
    fn rejects_wrong_length() {
        assert!("0xabcd".parse::<Hash256>().is_err());
    }
}
