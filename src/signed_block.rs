use crate::bytes::{display_root, Hash256};
use crate::{Slot, ValidatorId};
use rusqlite::Row;

/// A block proposal previously permitted and recorded for a validator.
///
/// `signing_root` is `None` for a wildcard entry imported without a
/// concrete root (spec: a placeholder that matches no concrete root, ever).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedBlock {
    pub validator_id: ValidatorId,
    pub slot: Slot,
    pub signing_root: Option<Hash256>,
}

impl SignedBlock {
    pub fn from_row(validator_id: ValidatorId, row: &Row) -> rusqlite::Result<Self> {
        let slot: Slot = row.get(0)?;
        let signing_root = crate::opt_hash256_from_row(1, row)?;
        Ok(SignedBlock {
            validator_id,
            slot,
            signing_root,
        })
    }
}

/// Reasons a block proposal is refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidBlock {
    /// A block for the same slot with a different signing root already exists.
    DoubleBlockProposal(SignedBlock),
    /// The slot does not exceed the validator's recorded low-watermark.
    SlotViolatesLowerBound { block_slot: Slot, bound_slot: Slot },
}

impl std::fmt::Display for InvalidBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            InvalidBlock::DoubleBlockProposal(existing) => write!(
                f,
                "double block proposal for slot {} (existing root {})",
                existing.slot,
                display_root(&existing.signing_root)
            ),
            InvalidBlock::SlotViolatesLowerBound {
                block_slot,
                bound_slot,
            } => write!(
                f,
                "slot {} does not exceed low watermark {}",
                block_slot, bound_slot
            ),
        }
    }
}
