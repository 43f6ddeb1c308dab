//! Slashing protection for a remote signer's validator keys.
//!
//! This crate decides, for every block-proposal or attestation signing
//! request, whether granting the signature could expose the validator to a
//! slashing penalty, and persists every permitted signature so the decision
//! can never be contradicted later — even across process restarts. It does
//! not verify signatures, sign anything itself, or talk to peers at
//! runtime; it only consults and extends a durable journal, and exchanges
//! that journal with other signers through the EIP-3076 interchange format.

mod bytes;
mod config;
mod facade;
mod interchange;
mod interchange_codec;
mod lower_bound;
mod registry;
mod signed_attestation;
mod signed_block;
mod slashing_database;

pub use bytes::{FixedBytesError, Hash256, PublicKeyBytes};
pub use config::Config;
pub use facade::SlashingProtection;
pub use interchange::{Interchange, InterchangeMetadata};
pub use interchange_codec::InterchangeError;
pub use registry::ValidatorRegistry;
pub use signed_attestation::{InvalidAttestation, SignedAttestation};
pub use signed_block::{InvalidBlock, SignedBlock};
pub use slashing_database::SlashingDatabase;

use rusqlite::Row;

/// A protocol slot number.
pub type Slot = u64;
/// A protocol epoch number.
pub type Epoch = u64;
/// The store-internal, dense, monotonically assigned validator identifier.
pub type ValidatorId = i64;

/// Outcome of a safety check that did not refuse the request.
///
/// `may_sign_block` / `may_sign_attestation` collapse both variants to
/// `true`; the distinction is kept for logging and for the idempotence
/// tests in `P3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Safe {
    /// No prior record existed; a new one was inserted.
    Valid,
    /// An identical record already existed; nothing was inserted.
    SameData,
}

/// Every way a signing decision, or a lower-level store operation, can fail.
#[derive(Debug)]
pub enum NotSafe {
    /// The public key has not been registered with this store.
    UnregisteredValidator(PublicKeyBytes),
    /// The request is malformed independently of any stored state.
    MalformedRequest(String),
    /// A block proposal would be unsafe to sign.
    InvalidBlock(InvalidBlock),
    /// An attestation would be unsafe to sign.
    InvalidAttestation(InvalidAttestation),
    /// The store could not be reached or did not commit after retrying.
    StorageUnavailable(String),
}

impl std::fmt::Display for NotSafe {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            NotSafe::UnregisteredValidator(pk) => {
                write!(f, "validator {} is not registered", pk)
            }
            NotSafe::MalformedRequest(reason) => write!(f, "malformed request: {}", reason),
            NotSafe::InvalidBlock(e) => write!(f, "{}", e),
            NotSafe::InvalidAttestation(e) => write!(f, "{}", e),
            NotSafe::StorageUnavailable(reason) => write!(f, "storage unavailable: {}", reason),
        }
    }
}

impl std::error::Error for NotSafe {}

impl From<rusqlite::Error> for NotSafe {
    fn from(error: rusqlite::Error) -> Self {
        NotSafe::StorageUnavailable(error.to_string())
    }
}

impl From<r2d2::Error> for NotSafe {
    fn from(error: r2d2::Error) -> Self {
        NotSafe::StorageUnavailable(error.to_string())
    }
}

impl From<std::io::Error> for NotSafe {
    fn from(error: std::io::Error) -> Self {
        NotSafe::StorageUnavailable(error.to_string())
    }
}

/// Read a `Hash256` out of a `BLOB` column, failing the row conversion if
/// the stored value is not exactly 32 bytes.
pub(crate) fn hash256_from_row(index: usize, row: &Row) -> rusqlite::Result<Hash256> {
    let bytes: Vec<u8> = row.get(index)?;
    Hash256::from_slice(&bytes).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            bytes.len(),
            rusqlite::types::Type::Blob,
            Box::new(e),
        )
    })
}

/// Read an optional `Hash256` out of a nullable `BLOB` column. `NULL` is the
/// interchange wildcard root: a placeholder recorded in place of a concrete
/// signing root, which can never compare equal to one.
pub(crate) fn opt_hash256_from_row(index: usize, row: &Row) -> rusqlite::Result<Option<Hash256>> {
    let bytes: Option<Vec<u8>> = row.get(index)?;
    bytes
        .map(|bytes| {
            Hash256::from_slice(&bytes).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    bytes.len(),
                    rusqlite::types::Type::Blob,
                    Box::new(e),
                )
            })
        })
        .transpose()
}
