//! Streaming import and export of the EIP-3076 v5 interchange document.
//!
//! Neither direction ever materializes the full `data` array in memory:
//! import walks the JSON array element-by-element via a `DeserializeSeed`
//! and commits each validator's records as it goes, and export drives
//! `serde_json::Serializer` directly so only one validator's records are
//! resident at a time. A fleet's whole slashing-protection history can run
//! into the tens of thousands of keys; collecting it into a `Vec` first
//! would make that the default cost of every import and export.

use crate::bytes::{Hash256, PublicKeyBytes};
use crate::interchange::{
    InterchangeAttestation, InterchangeBlock, InterchangeMetadata, SUPPORTED_INTERCHANGE_FORMAT_VERSION,
};
use crate::registry::ValidatorRegistry;
use crate::slashing_database::SlashingDatabase;
use crate::{NotSafe, ValidatorId};
use serde::de::{DeserializeSeed, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq, SerializeStruct, Serializer};
use std::fmt;
use std::io::{Read, Write};

#[derive(Debug)]
pub enum InterchangeError {
    /// `metadata.interchange_format_version` was not `"5"`.
    UnsupportedVersion(String),
    /// The document carries a `genesis_validators_root` but the store has
    /// none recorded yet, and the import was not told to adopt it.
    MissingGenesisRoot,
    /// The document's `genesis_validators_root` conflicts with the one
    /// already recorded in the store.
    GenesisRootMismatch { expected: Hash256, found: Hash256 },
    /// A record in the document conflicts with an already-stored record.
    Conflict(NotSafe),
    /// The JSON did not have the shape this codec expects.
    Malformed(String),
    Io(std::io::Error),
    Json(serde_json::Error),
}

impl fmt::Display for InterchangeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InterchangeError::UnsupportedVersion(v) => {
                write!(f, "unsupported interchange format version {:?}", v)
            }
            InterchangeError::MissingGenesisRoot => {
                write!(f, "document has a genesis validators root but the store has none")
            }
            InterchangeError::GenesisRootMismatch { expected, found } => write!(
                f,
                "genesis validators root mismatch: store has {}, document has {}",
                expected, found
            ),
            InterchangeError::Conflict(e) => write!(f, "interchange conflict: {}", e),
            InterchangeError::Malformed(reason) => write!(f, "malformed interchange document: {}", reason),
            InterchangeError::Io(e) => write!(f, "I/O error: {}", e),
            InterchangeError::Json(e) => write!(f, "JSON error: {}", e),
        }
    }
}

impl std::error::Error for InterchangeError {}

impl From<NotSafe> for InterchangeError {
    fn from(e: NotSafe) -> Self {
        InterchangeError::Conflict(e)
    }
}

impl From<std::io::Error> for InterchangeError {
    fn from(e: std::io::Error) -> Self {
        InterchangeError::Io(e)
    }
}

impl From<serde_json::Error> for InterchangeError {
    fn from(e: serde_json::Error) -> Self {
        InterchangeError::Json(e)
    }
}

/// Import an interchange document from `reader`, checking and inserting
/// every record inside a single exclusive store transaction.
///
/// A single malformed or conflicting record aborts the whole import; no
/// partial write is left behind (I6).
pub fn import(
    db: &SlashingDatabase,
    registry: &ValidatorRegistry,
    reader: impl Read,
) -> Result<(), InterchangeError> {
    let mut conn = db.pooled_connection()?;
    let txn = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Exclusive)?;

    let seed = DocumentSeed { db, txn: &txn };
    let mut de = serde_json::Deserializer::from_reader(reader);
    seed.deserialize(&mut de)?;
    de.end()?;

    txn.commit()?;
    registry.load(db)?;
    Ok(())
}

struct DocumentSeed<'a> {
    db: &'a SlashingDatabase,
    txn: &'a rusqlite::Transaction<'a>,
}

impl<'de, 'a> DeserializeSeed<'de> for DocumentSeed<'a> {
    type Value = ();

    fn deserialize<D>(self, deserializer: D) -> Result<(), D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(DocumentVisitor(self))
    }
}

struct DocumentVisitor<'a>(DocumentSeed<'a>);

impl<'de, 'a> Visitor<'de> for DocumentVisitor<'a> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an interchange document with `metadata` and `data` fields")
    }

    fn visit_map<A>(self, mut map: A) -> Result<(), A::Error>
    where
        A: MapAccess<'de>,
    {
        let DocumentSeed { db, txn } = self.0;
        let mut metadata: Option<InterchangeMetadata> = None;

        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                "metadata" => {
                    let meta: InterchangeMetadata = map.next_value()?;
                    if meta.interchange_format_version != SUPPORTED_INTERCHANGE_FORMAT_VERSION {
                        return Err(serde::de::Error::custom(format!(
                            "unsupported interchange format version {:?}",
                            meta.interchange_format_version
                        )));
                    }
                    apply_genesis_root(db, txn, meta.genesis_validators_root)
                        .map_err(serde::de::Error::custom)?;
                    metadata = Some(meta);
                }
                "data" => {
                    if metadata.is_none() {
                        return Err(serde::de::Error::custom(
                            "`data` appeared before `metadata` in the document",
                        ));
                    }
                    map.next_value_seed(RecordSeqSeed { db, txn })?;
                }
                _ => {
                    let _: serde::de::IgnoredAny = map.next_value()?;
                }
            }
        }

        if metadata.is_none() {
            return Err(serde::de::Error::custom("document is missing `metadata`"));
        }
        Ok(())
    }
}

fn apply_genesis_root(
    db: &SlashingDatabase,
    txn: &rusqlite::Transaction,
    root: Hash256,
) -> Result<(), InterchangeError> {
    match db.genesis_validators_root_in_txn(txn)? {
        Some(existing) if existing != root => {
            Err(InterchangeError::GenesisRootMismatch { expected: existing, found: root })
        }
        Some(_) => Ok(()),
        None => {
            db.set_genesis_validators_root_in_txn(txn, root)?;
            Ok(())
        }
    }
}

struct RecordSeqSeed<'a> {
    db: &'a SlashingDatabase,
    txn: &'a rusqlite::Transaction<'a>,
}

impl<'de, 'a> DeserializeSeed<'de> for RecordSeqSeed<'a> {
    type Value = ();

    fn deserialize<D>(self, deserializer: D) -> Result<(), D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_seq(self)
    }
}

impl<'de, 'a> Visitor<'de> for RecordSeqSeed<'a> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a sequence of per-validator interchange records")
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<(), A::Error>
    where
        A: SeqAccess<'de>,
    {
        while seq
            .next_element_seed(RecordSeed { db: self.db, txn: self.txn })?
            .is_some()
        {}
        Ok(())
    }
}

struct RecordSeed<'a> {
    db: &'a SlashingDatabase,
    txn: &'a rusqlite::Transaction<'a>,
}

impl<'de, 'a> DeserializeSeed<'de> for RecordSeed<'a> {
    type Value = ();

    fn deserialize<D>(self, deserializer: D) -> Result<(), D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(serde::Deserialize)]
        struct Record {
            pubkey: PublicKeyBytes,
            #[serde(default)]
            signed_blocks: Vec<InterchangeBlock>,
            #[serde(default)]
            signed_attestations: Vec<InterchangeAttestation>,
        }

        let record = Record::deserialize(deserializer)?;
        self.import_one(record.pubkey, record.signed_blocks, record.signed_attestations)
            .map_err(serde::de::Error::custom)
    }
}

impl<'a> RecordSeed<'a> {
    fn import_one(
        &self,
        pubkey: PublicKeyBytes,
        blocks: Vec<InterchangeBlock>,
        attestations: Vec<InterchangeAttestation>,
    ) -> Result<(), InterchangeError> {
        let validator_id: ValidatorId = self.db.register_validator_in_txn(self.txn, &pubkey)?;

        let mut bound = crate::lower_bound::LowerBound::default();

        for block in blocks {
            self.db.insert_block_for_import(
                self.txn,
                validator_id,
                block.slot,
                block.signing_root,
            )?;
            bound.block_proposal_slot =
                Some(bound.block_proposal_slot.map_or(block.slot, |s| s.max(block.slot)));
        }
        for attestation in attestations {
            self.db.insert_attestation_for_import(
                self.txn,
                validator_id,
                attestation.source_epoch,
                attestation.target_epoch,
                attestation.signing_root,
            )?;
            bound.attestation_source_epoch = Some(
                bound
                    .attestation_source_epoch
                    .map_or(attestation.source_epoch, |s| s.max(attestation.source_epoch)),
            );
            bound.attestation_target_epoch = Some(
                bound
                    .attestation_target_epoch
                    .map_or(attestation.target_epoch, |t| t.max(attestation.target_epoch)),
            );
        }

        self.db.raise_low_watermark(self.txn, validator_id, bound)?;
        Ok(())
    }
}

/// Export the store's full contents as an interchange document, one
/// validator record at a time, driven straight off `serde_json::Serializer`.
pub fn export(
    db: &SlashingDatabase,
    genesis_validators_root: Hash256,
    writer: impl Write,
) -> Result<(), InterchangeError> {
    let mut ser = serde_json::Serializer::new(writer);
    let mut doc = ser.serialize_map(Some(2))?;

    doc.serialize_entry(
        "metadata",
        &InterchangeMetadata {
            interchange_format_version: SUPPORTED_INTERCHANGE_FORMAT_VERSION.to_string(),
            genesis_validators_root,
        },
    )?;

    let conn = db.pooled_connection()?;
    let validators = db.validators_by_id()?;
    doc.serialize_entry("data", &Records { db, conn: &conn, validators: &validators })?;

    doc.end()?;
    Ok(())
}

struct Records<'a> {
    db: &'a SlashingDatabase,
    conn: &'a rusqlite::Connection,
    validators: &'a [(ValidatorId, PublicKeyBytes)],
}

impl<'a> serde::Serialize for Records<'a> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(self.validators.len()))?;
        for (id, pubkey) in self.validators {
            let blocks = self
                .db
                .blocks_for_validator(self.conn, *id)
                .map_err(serde::ser::Error::custom)?;
            let attestations = self
                .db
                .attestations_for_validator(self.conn, *id)
                .map_err(serde::ser::Error::custom)?;

            seq.serialize_element(&RecordRef { pubkey, blocks: &blocks, attestations: &attestations })?;
        }
        seq.end()
    }
}

struct RecordRef<'a> {
    pubkey: &'a PublicKeyBytes,
    blocks: &'a [crate::signed_block::SignedBlock],
    attestations: &'a [crate::signed_attestation::SignedAttestation],
}

impl<'a> serde::Serialize for RecordRef<'a> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut record = serializer.serialize_struct("InterchangeRecord", 3)?;
        record.serialize_field("pubkey", self.pubkey)?;
        record.serialize_field(
            "signed_blocks",
            &self
                .blocks
                .iter()
                .map(|b| InterchangeBlock { slot: b.slot, signing_root: b.signing_root })
                .collect::<Vec<_>>(),
        )?;
        record.serialize_field(
            "signed_attestations",
            &self
                .attestations
                .iter()
                .map(|a| InterchangeAttestation {
                    source_epoch: a.source_epoch,
                    target_epoch: a.target_epoch,
                    signing_root: a.signing_root,
                })
                .collect::<Vec<_>>(),
        )?;
        record.end()
    }
}
