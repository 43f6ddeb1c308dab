//! Wire types for the EIP-3076 v5 interchange JSON document.
//!
//! All numeric fields are decimal strings on the wire (see `quoted_u64`
//! below); `signing_root` is optional and, when absent, is a wildcard that
//! matches no concrete root (see `slashing_database::import_interchange`).

use crate::bytes::{Hash256, PublicKeyBytes};
use crate::{Epoch, Slot};
use serde::{Deserialize, Serialize};

/// The only interchange format version this crate understands.
pub const SUPPORTED_INTERCHANGE_FORMAT_VERSION: &str = "5";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterchangeMetadata {
    pub interchange_format_version: String,
    pub genesis_validators_root: Hash256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterchangeBlock {
    #[serde(with = "quoted_u64")]
    pub slot: Slot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_root: Option<Hash256>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterchangeAttestation {
    #[serde(with = "quoted_u64")]
    pub source_epoch: Epoch,
    #[serde(with = "quoted_u64")]
    pub target_epoch: Epoch,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_root: Option<Hash256>,
}

/// One validator's records, as they appear in the `data` array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterchangeRecord {
    pub pubkey: PublicKeyBytes,
    #[serde(default)]
    pub signed_blocks: Vec<InterchangeBlock>,
    #[serde(default)]
    pub signed_attestations: Vec<InterchangeAttestation>,
}

/// A fully materialized interchange document.
///
/// Only used in tests and for small fixtures; `import`/`export` in
/// [`crate::interchange_codec`] operate on a reader/writer directly and
/// never build one of these for a full-sized validator set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interchange {
    pub metadata: InterchangeMetadata,
    pub data: Vec<InterchangeRecord>,
}

/// (De)serialize a `u64` as a decimal JSON string, per EIP-3076.
mod quoted_u64 {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S>(value: &u64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct QuotedU64Visitor;

        impl<'de> Visitor<'de> for QuotedU64Visitor {
            type Value = u64;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a decimal string of an unsigned 64-bit integer")
            }

            fn visit_str<E>(self, value: &str) -> Result<u64, E>
            where
                E: de::Error,
            {
                value.parse().map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_str(QuotedU64Visitor)
    }
}
