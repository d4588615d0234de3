use thiserror::Error;

/// Failures raised by the precision-matrix core.
///
/// None of these are retried internally. A failed factorization is surfaced as-is;
/// the matrix is never regularized.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PrecisionError {
    #[error("{operation}: expected length {expected}, found {found}.")]
    Shape {
        operation: &'static str,
        expected: usize,
        found: usize,
    },

    #[error(
        "The effective precision matrix is not positive definite: pivot for row {row} was {value:e}."
    )]
    NotPositiveDefinite { row: usize, value: f64 },

    #[error("Invalid precision matrix: {0}")]
    InvalidMatrix(String),

    #[error("Invalid row selection: {0}")]
    InvalidSelection(String),

    #[error("Invalid variant table: {0}")]
    InvalidVariantTable(String),
}

/// Returns a `Shape` error unless `found == expected`.
#[inline]
pub(crate) fn check_len(
    operation: &'static str,
    expected: usize,
    found: usize,
) -> Result<(), PrecisionError> {
    if expected == found {
        Ok(())
    } else {
        Err(PrecisionError::Shape {
            operation,
            expected,
            found,
        })
    }
}
