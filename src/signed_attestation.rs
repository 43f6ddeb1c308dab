use crate::bytes::{display_root, Hash256};
use crate::{Epoch, ValidatorId};
use rusqlite::Row;

/// An attestation previously permitted and recorded for a validator.
///
/// `signing_root` is `None` for a wildcard entry imported without a
/// concrete root (spec: a placeholder that matches no concrete root, ever).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedAttestation {
    pub validator_id: ValidatorId,
    pub source_epoch: Epoch,
    pub target_epoch: Epoch,
    pub signing_root: Option<Hash256>,
}

impl SignedAttestation {
    pub fn from_row(validator_id: ValidatorId, row: &Row) -> rusqlite::Result<Self> {
        let source_epoch: Epoch = row.get(0)?;
        let target_epoch: Epoch = row.get(1)?;
        let signing_root = crate::opt_hash256_from_row(2, row)?;
        Ok(SignedAttestation {
            validator_id,
            source_epoch,
            target_epoch,
            signing_root,
        })
    }
}

/// Reasons an attestation is refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidAttestation {
    /// `source_epoch > target_epoch`.
    SourceExceedsTarget { source: Epoch, target: Epoch },
    /// An attestation with the same target epoch and a different root already exists.
    DoubleVote(SignedAttestation),
    /// A previously signed attestation surrounds the new one.
    PrevSurroundsNew { prev: SignedAttestation },
    /// The new attestation would surround a previously signed one.
    NewSurroundsPrev { prev: SignedAttestation },
    /// The source epoch does not meet the validator's low-watermark.
    SourceLessThanLowerBound { source_epoch: Epoch, bound_epoch: Epoch },
    /// The target epoch does not exceed the validator's low-watermark.
    TargetLessThanOrEqLowerBound { target_epoch: Epoch, bound_epoch: Epoch },
}

impl std::fmt::Display for InvalidAttestation {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            InvalidAttestation::SourceExceedsTarget { source, target } => {
                write!(f, "source epoch {} exceeds target epoch {}", source, target)
            }
            InvalidAttestation::DoubleVote(existing) => write!(
                f,
                "double vote for target epoch {} (existing root {})",
                existing.target_epoch,
                display_root(&existing.signing_root)
            ),
            InvalidAttestation::PrevSurroundsNew { prev } => write!(
                f,
                "attestation surrounded by previously signed ({}, {})",
                prev.source_epoch, prev.target_epoch
            ),
            InvalidAttestation::NewSurroundsPrev { prev } => write!(
                f,
                "attestation surrounds previously signed ({}, {})",
                prev.source_epoch, prev.target_epoch
            ),
            InvalidAttestation::SourceLessThanLowerBound {
                source_epoch,
                bound_epoch,
            } => write!(
                f,
                "source epoch {} is less than low watermark {}",
                source_epoch, bound_epoch
            ),
            InvalidAttestation::TargetLessThanOrEqLowerBound {
                target_epoch,
                bound_epoch,
            } => write!(
                f,
                "target epoch {} does not exceed low watermark {}",
                target_epoch, bound_epoch
            ),
        }
    }
}
