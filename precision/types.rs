// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// Types shared between the precision core, the block pool and its consumers.

use crate::error::PrecisionError;
use crate::variants::{NumericColumn, VariantRecord};
use serde::{Deserialize, Serialize};

/// A half-open genomic interval `[start, end)` on one chromosome, the span of a
/// single LD block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenomicRegion {
    pub chromosome: u8,
    pub start: u64,
    pub end: u64,
}

impl GenomicRegion {
    #[inline]
    pub fn contains(&self, chromosome: u8, position: u64) -> bool {
        chromosome == self.chromosome && position >= self.start && position < self.end
    }
}

/// A choice of rows, expressed in the active space of the operator it is applied to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowSelection {
    /// Explicit positions; their order becomes the order of the new active space.
    Indices(Vec<usize>),
    /// One flag per active row; selected rows keep their relative order.
    Mask(Vec<bool>),
}

impl RowSelection {
    /// Resolves the selection to unique positions in `0..active_len`.
    pub fn resolve(&self, active_len: usize) -> Result<Vec<usize>, PrecisionError> {
        match self {
            Self::Mask(mask) => {
                if mask.len() != active_len {
                    return Err(PrecisionError::InvalidSelection(format!(
                        "boolean mask has length {} but the active space has {} rows",
                        mask.len(),
                        active_len
                    )));
                }
                Ok(mask
                    .iter()
                    .enumerate()
                    .filter_map(|(position, &keep)| keep.then_some(position))
                    .collect())
            }
            Self::Indices(indices) => {
                let mut seen = vec![false; active_len];
                for &position in indices {
                    if position >= active_len {
                        return Err(PrecisionError::InvalidSelection(format!(
                            "index {position} is out of range for an active space of {active_len} rows"
                        )));
                    }
                    if seen[position] {
                        return Err(PrecisionError::InvalidSelection(format!(
                            "index {position} is selected more than once"
                        )));
                    }
                    seen[position] = true;
                }
                Ok(indices.clone())
            }
        }
    }
}

/// One stored entry of a block's precision matrix. Each unordered pair appears once.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub row: usize,
    pub col: usize,
    pub value: f64,
}

/// The serializable description of one LD block, from which every worker builds
/// its own operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDescriptor {
    pub id: String,
    /// Required only when input rows are assigned to blocks by position.
    #[serde(default)]
    pub region: Option<GenomicRegion>,
    /// Row count of the edge list's index space, before empty rows are dropped.
    pub dimension: usize,
    pub edges: Vec<Edge>,
    /// One record per row of the edge list's index space.
    pub variants: Vec<VariantRecord>,
    #[serde(default)]
    pub columns: Vec<NumericColumn>,
}
