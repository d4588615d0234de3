// ========================================================================================
//
//                  Best linear unbiased predictor of per-variant effects
//
// ========================================================================================

// For one LD block with precision matrix `P` restricted to the matched variants and
// z-scores `z`, the posterior mean effect under an infinitesimal prior is
//
//     β = √n · σ² · (P + n σ² I)⁻¹ P z
//
// where `n` is the GWAS sample size and `σ²` the per-variant heritability.

use crate::error::PrecisionError;
use crate::operator::PrecisionOperator;
use crate::parallel::{
    BlockJob, BlockOutput, BlockPartition, BlockProcessor, BlockTask, BlockWorkerPool,
    InputAlignment, PoolConfig, PoolError,
};
use crate::types::{BlockDescriptor, RowSelection};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Output field holding the effect sizes.
pub const BETA_FIELD: &str = "beta";

#[derive(Error, Debug)]
pub enum BlupError {
    #[error(transparent)]
    Precision(#[from] PrecisionError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Invalid BLUP parameter: {0}")]
    InvalidParameter(String),

    #[error("Block '{block}' has {dimension} rows but an input row matched row {row}.")]
    RowOutOfRange {
        block: String,
        row: usize,
        dimension: usize,
    },
}

/// Parameters shared by every block.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlupParams {
    /// Per-variant heritability.
    pub sigmasq: f64,
    pub sample_size: f64,
}

impl BlupParams {
    pub fn validate(&self) -> Result<(), BlupError> {
        if !(self.sigmasq.is_finite() && self.sigmasq > 0.0) {
            return Err(BlupError::InvalidParameter(format!(
                "sigmasq must be positive and finite, got {}",
                self.sigmasq
            )));
        }
        if !(self.sample_size.is_finite() && self.sample_size > 0.0) {
            return Err(BlupError::InvalidParameter(format!(
                "sample_size must be positive and finite, got {}",
                self.sample_size
            )));
        }
        Ok(())
    }
}

/// One summary-statistic row assigned to a block.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlupRow {
    /// Position of the row in the full summary-statistics input.
    pub input_row: usize,
    pub z: f64,
    /// Row of the block's loaded operator this input matched, if any.
    pub matrix_row: Option<usize>,
}

/// The summary-statistic rows of one block, in output order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlupBlock {
    pub rows: Vec<BlupRow>,
}

/// Per-block BLUP as a [`BlockProcessor`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Blup;

impl BlockProcessor for Blup {
    type Block = BlupBlock;
    type Params = BlupParams;
    type Error = BlupError;

    fn output_fields(&self) -> Vec<String> {
        vec![BETA_FIELD.to_string()]
    }

    fn process_block(
        &self,
        operator: &mut PrecisionOperator,
        task: &BlockTask<'_, BlupBlock>,
        output: &mut BlockOutput<'_>,
        params: &BlupParams,
    ) -> Result<(), BlupError> {
        let rows = &task.data.rows;
        let dimension = operator.full_dimension();

        // Only the first input row matched to a matrix row contributes.
        let mut seen = vec![false; dimension];
        let mut positions = Vec::new();
        let mut matrix_rows = Vec::new();
        let mut z = Vec::new();
        for (position, row) in rows.iter().enumerate() {
            let Some(matrix_row) = row.matrix_row else {
                continue;
            };
            if matrix_row >= dimension {
                return Err(BlupError::RowOutOfRange {
                    block: task.descriptor.id.clone(),
                    row: matrix_row,
                    dimension,
                });
            }
            if seen[matrix_row] {
                continue;
            }
            seen[matrix_row] = true;
            positions.push(position);
            matrix_rows.push(matrix_row);
            z.push(row.z);
        }

        let mut beta = vec![0.0; rows.len()];
        if !matrix_rows.is_empty() {
            let matched = matrix_rows.len();
            operator.set_selection(&RowSelection::Indices(matrix_rows))?;
            let pz = operator.multiply(Array1::from(z).view())?;
            operator.update_active_diagonal(
                Array1::from_elem(matched, params.sample_size * params.sigmasq).view(),
            )?;
            let solved = operator.solve(pz.view())?;
            operator.release_factorization();

            let scale = params.sample_size.sqrt() * params.sigmasq;
            for (&position, &value) in positions.iter().zip(solved.iter()) {
                beta[position] = scale * value;
            }
            log::debug!(
                "Block '{}': {} of {} input rows matched.",
                task.descriptor.id,
                matched,
                rows.len()
            );
        }

        output.write(BETA_FIELD, &beta)?;
        Ok(())
    }
}

/// Runs BLUP over every block and returns β aligned to the full input, with zeros for
/// rows that fell in no block or matched no variant.
pub fn compute_blup(
    descriptors: &[BlockDescriptor],
    inputs: &[BlupBlock],
    input_len: usize,
    params: BlupParams,
    config: PoolConfig,
) -> Result<Array1<f64>, BlupError> {
    params.validate()?;
    let block_rows: Vec<Vec<usize>> = inputs
        .iter()
        .map(|block| block.rows.iter().map(|row| row.input_row).collect())
        .collect();
    let alignment = InputAlignment::new(&block_rows, input_len)?;
    let sizes: Vec<usize> = inputs.iter().map(|block| block.rows.len()).collect();
    let partition = BlockPartition::from_sizes(&sizes);
    let total_len = alignment.buffer_len();

    let job = BlockJob::new(descriptors, inputs, partition, total_len, &params)?;
    let processor = Blup;
    let pool = BlockWorkerPool::new(&processor, config);
    let mut buffer = pool.run(job)?;
    let beta = buffer.field(BETA_FIELD)?.to_owned();
    Ok(alignment.align(&beta)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameters_must_be_positive() {
        assert!(BlupParams { sigmasq: 0.1, sample_size: 1000.0 }.validate().is_ok());
        assert!(BlupParams { sigmasq: 0.0, sample_size: 1000.0 }.validate().is_err());
        assert!(BlupParams { sigmasq: 0.1, sample_size: f64::NAN }.validate().is_err());
    }
}
