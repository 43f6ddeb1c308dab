//! Per-validator low-watermarks.
//!
//! A watermark records the highest slot/epoch the store has ever committed
//! for a validator, even after the underlying record has been superseded by
//! an interchange import. Sign requests below the watermark are refused even
//! when no exact colliding record exists, which is what protects a signer
//! that resumes from a stale copy of its own database.

use crate::{Epoch, Slot};
use rusqlite::Row;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LowerBound {
    pub block_proposal_slot: Option<Slot>,
    pub attestation_source_epoch: Option<Epoch>,
    pub attestation_target_epoch: Option<Epoch>,
}

impl LowerBound {
    /// Merge `self` with `other`, keeping the higher bound of each field.
    pub fn merge(self, other: LowerBound) -> LowerBound {
        LowerBound {
            block_proposal_slot: max_opt(self.block_proposal_slot, other.block_proposal_slot),
            attestation_source_epoch: max_opt(
                self.attestation_source_epoch,
                other.attestation_source_epoch,
            ),
            attestation_target_epoch: max_opt(
                self.attestation_target_epoch,
                other.attestation_target_epoch,
            ),
        }
    }

    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(LowerBound {
            block_proposal_slot: row.get(0)?,
            attestation_source_epoch: row.get(1)?,
            attestation_target_epoch: row.get(2)?,
        })
    }
}

fn max_opt<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_the_higher_bound() {
        let a = LowerBound {
            block_proposal_slot: Some(10),
            attestation_source_epoch: Some(3),
            attestation_target_epoch: None,
        };
        let b = LowerBound {
            block_proposal_slot: Some(4),
            attestation_source_epoch: None,
            attestation_target_epoch: Some(9),
        };
        let merged = a.merge(b);
        assert_eq!(merged.block_proposal_slot, Some(10));
        assert_eq!(merged.attestation_source_epoch, Some(3));
        assert_eq!(merged.attestation_target_epoch, Some(9));
    }
}
