// ========================================================================================
//
//                    Sparse LDLᵀ factorization of a precision matrix
//
// ========================================================================================
//
// Symbolic analysis, ordering and the numeric pass are delegated to faer's simplicial
// LDLᵀ. The factor keeps its own copy of the strictly lower pattern of L so the selected
// inversion can walk it; within every column of a simplicial factor the row indices are
// strictly increasing, which the binary searches below rely on.

use crate::error::PrecisionError;
use faer::dyn_stack::{MemBuffer, MemStack};
use faer::linalg::cholesky::ldlt::factor::{LdltError, LdltParams, LdltRegularization};
use faer::sparse::linalg::SupernodalThreshold;
use faer::sparse::linalg::cholesky::{
    CholeskySymbolicParams, LdltRef, SymbolicCholesky, SymbolicCholeskyRaw, SymmetricOrdering,
    factorize_symbolic_cholesky,
};
use faer::sparse::{SparseColMat, SparseColMatRef, SymbolicSparseColMatRef};
use faer::{Conj, MatMut, Par, Side, Spec};
use serde::{Deserialize, Serialize};

/// The symmetric permutation applied before elimination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillOrdering {
    /// Eliminate rows in their stored order.
    Natural,
    /// Approximate minimum degree.
    #[default]
    ApproximateMinimumDegree,
}

impl FillOrdering {
    fn symmetric(self) -> SymmetricOrdering<'static, usize> {
        match self {
            Self::Natural => SymmetricOrdering::Identity,
            Self::ApproximateMinimumDegree => SymmetricOrdering::Amd,
        }
    }
}

/// The part of the factor the triangular solves run on.
#[derive(Debug)]
struct FaerLdlt {
    symbolic: SymbolicCholesky<usize>,
    values: Vec<f64>,
}

/// `P A Pᵀ = L D Lᵀ` for a symmetric positive definite `A`.
///
/// All public methods take and return vectors in the ORIGINAL row numbering.
#[derive(Debug)]
pub struct LdlFactor {
    n: usize,
    /// `None` only for the empty matrix.
    ldlt: Option<FaerLdlt>,
    /// `perm[k]` is the original row eliminated at step `k`.
    perm: Vec<usize>,
    l_p: Vec<usize>,
    l_i: Vec<usize>,
    l_x: Vec<f64>,
    d: Vec<f64>,
    d_inv: Vec<f64>,
}

impl LdlFactor {
    /// Factorizes `matrix + diag(diagonal)`.
    ///
    /// `matrix` must store both triangles. Only entries on or above the diagonal are
    /// read, so a tiny asymmetry never changes the result. A pivot that is not strictly
    /// positive fails the factorization with the original row it belongs to; a pivot that
    /// vanished exactly is reported with value `0.0`.
    pub fn factorize(
        matrix: &SparseColMat<usize, f64>,
        diagonal: Option<&[f64]>,
        ordering: FillOrdering,
    ) -> Result<Self, PrecisionError> {
        let n = matrix.nrows();
        if matrix.ncols() != n {
            return Err(PrecisionError::InvalidMatrix(format!(
                "cannot factorize a {}x{} matrix",
                n,
                matrix.ncols()
            )));
        }
        if let Some(diagonal) = diagonal {
            crate::error::check_len("factorize (diagonal)", n, diagonal.len())?;
        }
        if n == 0 {
            return Ok(Self {
                n,
                ldlt: None,
                perm: Vec::new(),
                l_p: vec![0],
                l_i: Vec::new(),
                l_x: Vec::new(),
                d: Vec::new(),
                d_inv: Vec::new(),
            });
        }

        let (col_ptr, row_idx, values) = upper_triangle(matrix, diagonal);
        let pattern = SymbolicSparseColMatRef::new_checked(n, n, &col_ptr, None, &row_idx);

        let params = CholeskySymbolicParams {
            supernodal_flop_ratio_threshold: SupernodalThreshold::FORCE_SIMPLICIAL,
            ..Default::default()
        };
        let symbolic =
            factorize_symbolic_cholesky(pattern, Side::Upper, ordering.symmetric(), params)
                .map_err(|err| {
                    PrecisionError::InvalidMatrix(format!("symbolic analysis failed: {err:?}"))
                })?;

        let ldlt_params: Spec<LdltParams, f64> = Spec::default();
        let mut ld_values = vec![0.0f64; symbolic.len_val()];
        let mut work =
            MemBuffer::new(symbolic.factorize_numeric_ldlt_scratch::<f64>(Par::Seq, ldlt_params));
        let outcome = symbolic
            .factorize_numeric_ldlt(
                &mut ld_values,
                SparseColMatRef::new(pattern, &values),
                Side::Upper,
                LdltRegularization::default(),
                Par::Seq,
                MemStack::new(&mut work),
                ldlt_params,
            )
            .map(|_| ());
        // Steps before `completed` hold valid pivots.
        let completed = match outcome {
            Ok(()) => n,
            Err(LdltError::ZeroPivot { index }) => index.saturating_sub(1),
        };

        let perm: Vec<usize> = match symbolic.perm() {
            Some(perm) => perm.arrays().0.to_vec(),
            None => (0..n).collect(),
        };

        let SymbolicCholeskyRaw::Simplicial(simplicial) = symbolic.raw() else {
            return Err(PrecisionError::InvalidMatrix(
                "symbolic analysis did not produce a simplicial factor".to_string(),
            ));
        };
        let factor_col_ptr = simplicial.col_ptr();
        let factor_row_idx = simplicial.row_idx();

        // The first entry of every simplicial column is its pivot.
        let d: Vec<f64> = (0..n).map(|step| ld_values[factor_col_ptr[step]]).collect();
        if let Some(step) = (0..completed).find(|&step| !(d[step].is_finite() && d[step] > 0.0)) {
            return Err(PrecisionError::NotPositiveDefinite {
                row: perm[step],
                value: d[step],
            });
        }
        if completed < n {
            return Err(PrecisionError::NotPositiveDefinite {
                row: perm[completed],
                value: 0.0,
            });
        }

        let mut l_p = Vec::with_capacity(n + 1);
        let mut l_i = Vec::with_capacity(ld_values.len() - n);
        let mut l_x = Vec::with_capacity(ld_values.len() - n);
        l_p.push(0);
        for col in 0..n {
            for idx in factor_col_ptr[col]..factor_col_ptr[col + 1] {
                if factor_row_idx[idx] > col {
                    l_i.push(factor_row_idx[idx]);
                    l_x.push(ld_values[idx]);
                }
            }
            l_p.push(l_i.len());
        }
        let d_inv = d.iter().map(|pivot| pivot.recip()).collect();

        log::debug!(
            "LDL factorization of order {} ({:?}): nnz(A) = {}, nnz(L) = {}",
            n,
            ordering,
            values.len(),
            l_x.len()
        );
        Ok(Self {
            n,
            ldlt: Some(FaerLdlt {
                symbolic,
                values: ld_values,
            }),
            perm,
            l_p,
            l_i,
            l_x,
            d,
            d_inv,
        })
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.n
    }

    /// Stored off-diagonal entries of `L`, fill included.
    #[inline]
    pub fn factor_nnz(&self) -> usize {
        self.l_x.len()
    }

    /// `log det A = Σ log d_k`.
    pub fn log_determinant(&self) -> f64 {
        self.d.iter().map(|pivot| pivot.ln()).sum()
    }

    /// Solves `A x = rhs`.
    pub fn solve(&self, rhs: &[f64]) -> Vec<f64> {
        debug_assert_eq!(rhs.len(), self.n);
        let mut x = rhs.to_vec();
        if let Some(ldlt) = &self.ldlt {
            let mut work =
                MemBuffer::new(ldlt.symbolic.solve_in_place_scratch::<f64>(1, Par::Seq));
            LdltRef::new(&ldlt.symbolic, &ldlt.values).solve_in_place_with_conj(
                Conj::No,
                MatMut::from_column_major_slice_mut(&mut x, self.n, 1),
                Par::Seq,
                MemStack::new(&mut work),
            );
        }
        x
    }

    /// The diagonal of `A⁻¹` by selected inversion.
    ///
    /// With `Z = A⁻¹` (in elimination order) the Takahashi recurrences
    /// `Z_ij = -Σ_{k ∈ S_i} L_ki Z_kj` for `j ∈ S_i` and
    /// `Z_ii = 1/d_i - Σ_{k ∈ S_i} L_ki Z_ki`, where `S_i` is the pattern of column `i`
    /// of `L`, only touch entries inside the pattern of `L`. They are evaluated from the
    /// last column backwards, so no dense inverse is ever formed.
    pub fn inverse_diagonal(&self) -> Vec<f64> {
        let n = self.n;
        let mut z_offdiag = vec![0.0f64; self.l_x.len()];
        let mut z_diag = vec![0.0f64; n];

        for i in (0..n).rev() {
            let column = self.l_p[i]..self.l_p[i + 1];
            for a in column.clone() {
                let j = self.l_i[a];
                let mut acc = 0.0;
                for b in column.clone() {
                    let k = self.l_i[b];
                    let z_kj = if k == j {
                        z_diag[j]
                    } else {
                        self.lookup(&z_offdiag, k.max(j), k.min(j))
                    };
                    acc += self.l_x[b] * z_kj;
                }
                z_offdiag[a] = -acc;
            }
            let correction: f64 = column.map(|a| self.l_x[a] * z_offdiag[a]).sum();
            z_diag[i] = self.d_inv[i] - correction;
        }

        let mut out = vec![0.0; n];
        for (step, &row) in self.perm.iter().enumerate() {
            out[row] = z_diag[step];
        }
        out
    }

    /// Reads `values` at position `(row, col)` of the pattern of `L`, `row > col`.
    #[inline]
    fn lookup(&self, values: &[f64], row: usize, col: usize) -> f64 {
        let start = self.l_p[col];
        let end = self.l_p[col + 1];
        match self.l_i[start..end].binary_search(&row) {
            Ok(offset) => values[start + offset],
            // The pattern of L is closed under the recurrences; a miss means the
            // entry is structurally zero.
            Err(_) => 0.0,
        }
    }
}

/// Upper triangle of `A + diag` with sorted, merged columns.
fn upper_triangle(
    matrix: &SparseColMat<usize, f64>,
    diagonal: Option<&[f64]>,
) -> (Vec<usize>, Vec<usize>, Vec<f64>) {
    let n = matrix.ncols();
    let (symbolic, values) = matrix.parts();
    let col_ptr = symbolic.col_ptr();
    let row_idx = symbolic.row_idx();

    let mut a_p = Vec::with_capacity(n + 1);
    let mut a_i = Vec::new();
    let mut a_x = Vec::new();
    let mut column: Vec<(usize, f64)> = Vec::new();
    a_p.push(0);
    for col in 0..n {
        column.clear();
        column.extend(
            (col_ptr[col]..col_ptr[col + 1])
                .filter(|&idx| row_idx[idx] <= col)
                .map(|idx| (row_idx[idx], values[idx])),
        );
        if let Some(diagonal) = diagonal {
            column.push((col, diagonal[col]));
        }
        column.sort_unstable_by_key(|&(row, _)| row);

        let mut last_row = None;
        for &(row, value) in &column {
            if last_row == Some(row) {
                if let Some(slot) = a_x.last_mut() {
                    *slot += value;
                }
            } else {
                a_i.push(row);
                a_x.push(value);
                last_row = Some(row);
            }
        }
        a_p.push(a_i.len());
    }
    (a_p, a_i, a_x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use faer::sparse::Triplet;
    use ndarray::Array2;
    use ndarray_linalg::{Determinant, Inverse, Solve};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn symmetric(n: usize, entries: &[(usize, usize, f64)]) -> SparseColMat<usize, f64> {
        let mut triplets = Vec::new();
        for &(row, col, value) in entries {
            triplets.push(Triplet::new(row, col, value));
            if row != col {
                triplets.push(Triplet::new(col, row, value));
            }
        }
        SparseColMat::try_new_from_triplets(n, n, &triplets).unwrap()
    }

    fn dense(n: usize, entries: &[(usize, usize, f64)]) -> Array2<f64> {
        let mut out = Array2::zeros((n, n));
        for &(row, col, value) in entries {
            out[[row, col]] = value;
            out[[col, row]] = value;
        }
        out
    }

    // An arrow matrix plus a long-range coupling, so both orderings produce fill.
    fn arrow_entries() -> Vec<(usize, usize, f64)> {
        vec![
            (0, 0, 6.0),
            (1, 1, 5.0),
            (2, 2, 4.5),
            (3, 3, 5.5),
            (4, 4, 7.0),
            (5, 5, 4.0),
            (0, 1, -1.0),
            (0, 2, 0.5),
            (0, 3, -0.7),
            (0, 4, 1.1),
            (0, 5, -0.4),
            (2, 5, 0.9),
            (1, 4, -0.3),
        ]
    }

    // Sparse and diagonally dominant, hence positive definite.
    fn random_spd_entries(rng: &mut StdRng, n: usize) -> Vec<(usize, usize, f64)> {
        let mut entries = Vec::new();
        let mut row_sums = vec![0.0f64; n];
        for col in 0..n {
            for row in 0..col {
                if rng.gen_bool(0.3) {
                    let value: f64 = rng.gen_range(-1.0..1.0);
                    row_sums[row] += value.abs();
                    row_sums[col] += value.abs();
                    entries.push((row, col, value));
                }
            }
        }
        for (row, sum) in row_sums.iter().enumerate() {
            entries.push((row, row, sum + rng.gen_range(0.1..2.0)));
        }
        entries
    }

    #[test]
    fn two_by_two_pivots_and_log_determinant() {
        let matrix = symmetric(2, &[(0, 0, 2.0), (1, 1, 2.0), (0, 1, -1.0)]);
        let factor = LdlFactor::factorize(&matrix, None, FillOrdering::Natural).unwrap();
        assert_eq!(factor.factor_nnz(), 1);
        assert_relative_eq!(factor.log_determinant(), 3.0_f64.ln(), max_relative = 1e-14);
        let x = factor.solve(&[1.0, 1.0]);
        assert_relative_eq!(x[0], 1.0, max_relative = 1e-14);
        assert_relative_eq!(x[1], 1.0, max_relative = 1e-14);
    }

    #[test]
    fn solve_and_inverse_diagonal_match_dense_reference() {
        let entries = arrow_entries();
        let matrix = symmetric(6, &entries);
        let reference = dense(6, &entries);
        let inverse = reference.inv().unwrap();
        let rhs = ndarray::array![1.0, -2.0, 0.5, 3.0, 0.0, -1.5];
        let expected = reference.solve(&rhs).unwrap();

        for ordering in [FillOrdering::Natural, FillOrdering::ApproximateMinimumDegree] {
            let factor = LdlFactor::factorize(&matrix, None, ordering).unwrap();
            let solved = factor.solve(rhs.as_slice().unwrap());
            let diagonal = factor.inverse_diagonal();
            for row in 0..6 {
                assert_relative_eq!(solved[row], expected[row], max_relative = 1e-10);
                assert_relative_eq!(diagonal[row], inverse[[row, row]], max_relative = 1e-10);
            }
        }
    }

    #[test]
    fn random_sparse_matrices_match_dense_reference() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut worst = 0.0f64;
        for trial in 0..200 {
            let n = 1 + trial % 12;
            let entries = random_spd_entries(&mut rng, n);
            let matrix = symmetric(n, &entries);
            let reference = dense(n, &entries);
            let inverse = reference.inv().unwrap();
            let (_, expected_log_det) = reference.sln_det().unwrap();
            let rhs: Vec<f64> = (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect();
            let expected = reference.solve(&ndarray::Array1::from(rhs.clone())).unwrap();

            for ordering in [FillOrdering::Natural, FillOrdering::ApproximateMinimumDegree] {
                let factor = LdlFactor::factorize(&matrix, None, ordering).unwrap();
                let solved = factor.solve(&rhs);
                let diagonal = factor.inverse_diagonal();
                worst = worst.max((factor.log_determinant() - expected_log_det).abs());
                for row in 0..n {
                    worst = worst.max((solved[row] - expected[row]).abs());
                    worst = worst.max((diagonal[row] - inverse[[row, row]]).abs());
                }
            }
        }
        assert!(worst < 1e-10, "worst deviation from dense reference: {worst:e}");
    }

    #[test]
    fn diagonal_update_is_folded_into_the_factor() {
        let entries = arrow_entries();
        let matrix = symmetric(6, &entries);
        let update = [0.5, 0.1, 0.0, 2.0, 0.3, 1.0];
        let mut reference = dense(6, &entries);
        for (row, value) in update.iter().enumerate() {
            reference[[row, row]] += value;
        }
        let inverse = reference.inv().unwrap();

        let factor = LdlFactor::factorize(&matrix, Some(&update), FillOrdering::default()).unwrap();
        let diagonal = factor.inverse_diagonal();
        for row in 0..6 {
            assert_relative_eq!(diagonal[row], inverse[[row, row]], max_relative = 1e-10);
        }
    }

    #[test]
    fn indefinite_matrix_reports_the_failing_row() {
        let matrix = symmetric(3, &[(0, 0, 1.0), (1, 1, 1.0), (2, 2, 1.0), (0, 1, 2.0)]);
        let err = LdlFactor::factorize(&matrix, None, FillOrdering::Natural).unwrap_err();
        match err {
            PrecisionError::NotPositiveDefinite { row, value } => {
                assert_eq!(row, 1);
                assert!(value < 0.0);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn missing_diagonal_is_a_zero_pivot() {
        let matrix = symmetric(2, &[(0, 0, 1.0), (0, 1, 0.5)]);
        assert!(matches!(
            LdlFactor::factorize(&matrix, None, FillOrdering::Natural),
            Err(PrecisionError::NotPositiveDefinite { .. })
        ));
        let isolated = symmetric(2, &[(0, 0, 1.0)]);
        assert!(matches!(
            LdlFactor::factorize(&isolated, None, FillOrdering::Natural),
            Err(PrecisionError::NotPositiveDefinite { row: 1, value }) if value == 0.0
        ));
    }

    #[test]
    fn empty_matrix_factorizes_trivially() {
        let matrix = SparseColMat::<usize, f64>::try_new_from_triplets(0, 0, &[]).unwrap();
        let factor = LdlFactor::factorize(&matrix, None, FillOrdering::default()).unwrap();
        assert_eq!(factor.dimension(), 0);
        assert_eq!(factor.log_determinant(), 0.0);
        assert!(factor.solve(&[]).is_empty());
        assert!(factor.inverse_diagonal().is_empty());
    }

    #[test]
    fn minimum_degree_ordering_is_a_permutation() {
        let matrix = symmetric(6, &arrow_entries());
        let factor =
            LdlFactor::factorize(&matrix, None, FillOrdering::ApproximateMinimumDegree).unwrap();
        let mut steps = factor.perm.clone();
        steps.sort_unstable();
        assert_eq!(steps, (0..6).collect::<Vec<_>>());
        // Eliminating the hub first fills L completely.
        let natural = LdlFactor::factorize(&matrix, None, FillOrdering::Natural).unwrap();
        assert!(factor.factor_nnz() <= natural.factor_nnz());
    }
}
