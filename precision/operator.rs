// ========================================================================================
//
//                          The sparse precision-matrix operator
//
// ========================================================================================
//
// A `PrecisionOperator` owns one LD block's precision matrix, its variant table, an
// optional active-row selection and an optional additive diagonal. Every public linear
// algebra method works in the active space. The full-space factorization never depends
// on the selection; the factorization of the inactive block (`M_BB`) does, and lives in
// a per-view cache.

use crate::error::{PrecisionError, check_len};
use crate::factor::{FillOrdering, LdlFactor};
use crate::types::{BlockDescriptor, RowSelection};
use crate::variants::{VariantRecord, VariantTable};
use ahash::AHashMap;
use faer::sparse::{SparseColMat, Triplet};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rayon::prelude::*;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const SYMMETRY_TOLERANCE: f64 = 1e-12;

/// The cached decomposition of the effective matrix, tagged with the exact diagonal
/// update it was computed from.
#[derive(Debug, Clone, Default)]
pub enum FactorState {
    #[default]
    Unfactored,
    Factored {
        diagonal: Option<Arc<[f64]>>,
        factor: Arc<LdlFactor>,
    },
}

impl FactorState {
    fn matching(&self, diagonal: &Option<Arc<[f64]>>) -> Option<Arc<LdlFactor>> {
        match self {
            Self::Factored {
                diagonal: snapshot,
                factor,
            } if same_diagonal(snapshot, diagonal) => Some(Arc::clone(factor)),
            _ => None,
        }
    }
}

fn same_diagonal(a: &Option<Arc<[f64]>>, b: &Option<Arc<[f64]>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b) || a[..] == b[..],
        _ => false,
    }
}

fn lock(state: &Mutex<FactorState>) -> MutexGuard<'_, FactorState> {
    // A panic while holding the lock can only happen before the state is
    // overwritten, so the stored value is still consistent.
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
struct ActiveRows {
    rows: Arc<[usize]>,
    inactive: Arc<[usize]>,
}

impl ActiveRows {
    fn new(rows: Vec<usize>, full_dimension: usize) -> Self {
        let mut selected = vec![false; full_dimension];
        for &row in &rows {
            selected[row] = true;
        }
        let inactive: Vec<usize> = (0..full_dimension).filter(|&row| !selected[row]).collect();
        Self {
            rows: rows.into(),
            inactive: inactive.into(),
        }
    }
}

/// A sparse symmetric precision matrix with per-row variant metadata, supporting masked
/// views, diagonal updates and cached factorization.
#[derive(Debug)]
pub struct PrecisionOperator {
    matrix: Arc<SparseColMat<usize, f64>>,
    variants: Arc<VariantTable>,
    active: Option<ActiveRows>,
    diagonal: Option<Arc<[f64]>>,
    ordering: FillOrdering,
    /// Factorization of the full effective matrix, shared by every view of the matrix.
    cache: Arc<Mutex<FactorState>>,
    /// Factorization of the inactive block, owned by this view.
    complement: Mutex<FactorState>,
}

impl Clone for PrecisionOperator {
    fn clone(&self) -> Self {
        Self {
            matrix: Arc::clone(&self.matrix),
            variants: Arc::clone(&self.variants),
            active: self.active.clone(),
            diagonal: self.diagonal.clone(),
            ordering: self.ordering,
            cache: Arc::clone(&self.cache),
            complement: Mutex::new(lock(&self.complement).clone()),
        }
    }
}

impl PrecisionOperator {
    /// Wraps a matrix that stores both triangles.
    pub fn new(
        matrix: SparseColMat<usize, f64>,
        variants: VariantTable,
    ) -> Result<Self, PrecisionError> {
        let n = matrix.nrows();
        if matrix.ncols() != n {
            return Err(PrecisionError::InvalidMatrix(format!(
                "precision matrix must be square, got {}x{}",
                n,
                matrix.ncols()
            )));
        }
        if variants.len() != n {
            return Err(PrecisionError::InvalidMatrix(format!(
                "precision matrix has {} rows but the variant table has {}",
                n,
                variants.len()
            )));
        }
        check_symmetric(&matrix)?;
        Ok(Self::assemble(matrix, variants))
    }

    /// Builds the operator from an edge list in which each unordered pair appears at
    /// most once. Rows without a nonzero diagonal entry are dropped, together with
    /// their variant records, and the remaining rows are renumbered in order.
    ///
    /// Diagonal values are used as given. LDGM edge-list files that store the diagonal
    /// doubled, as produced by symmetrizing `A + Aᵀ`, must be halved by the caller.
    pub fn from_edges<T, I>(n: usize, edges: I, variants: VariantTable) -> Result<Self, PrecisionError>
    where
        T: Copy + Into<f64>,
        I: IntoIterator<Item = (usize, usize, T)>,
    {
        if variants.len() != n {
            return Err(PrecisionError::InvalidMatrix(format!(
                "edge list spans {} rows but the variant table has {}",
                n,
                variants.len()
            )));
        }

        let mut canonical: Vec<(usize, usize, f64)> = Vec::new();
        for (row, col, value) in edges {
            if row >= n || col >= n {
                return Err(PrecisionError::InvalidMatrix(format!(
                    "edge ({row}, {col}) is outside a {n}x{n} matrix"
                )));
            }
            canonical.push((row.min(col), row.max(col), value.into()));
        }
        canonical.sort_unstable_by_key(|&(row, col, _)| (row, col));
        if let Some(pair) = canonical
            .windows(2)
            .find(|pair| (pair[0].0, pair[0].1) == (pair[1].0, pair[1].1))
        {
            return Err(PrecisionError::InvalidMatrix(format!(
                "edge ({}, {}) appears more than once",
                pair[0].0, pair[0].1
            )));
        }

        let mut has_diagonal = vec![false; n];
        for &(row, col, value) in &canonical {
            if row == col && value != 0.0 {
                has_diagonal[row] = true;
            }
        }
        let kept: Vec<usize> = (0..n).filter(|&row| has_diagonal[row]).collect();
        let mut new_index = vec![None; n];
        for (position, &row) in kept.iter().enumerate() {
            new_index[row] = Some(position);
        }
        if kept.len() < n {
            log::debug!(
                "Dropping {} of {} rows with an empty diagonal.",
                n - kept.len(),
                n
            );
        }

        let mut triplets = Vec::with_capacity(2 * canonical.len());
        for &(row, col, value) in &canonical {
            let (Some(r), Some(c)) = (new_index[row], new_index[col]) else {
                continue;
            };
            triplets.push(Triplet::new(r, c, value));
            if r != c {
                triplets.push(Triplet::new(c, r, value));
            }
        }
        let dimension = kept.len();
        let matrix = SparseColMat::try_new_from_triplets(dimension, dimension, &triplets)
            .map_err(|e| PrecisionError::InvalidMatrix(format!("{e:?}")))?;
        let variants = if kept.len() == n {
            variants
        } else {
            variants.select(&kept)?
        };
        Ok(Self::assemble(matrix, variants))
    }

    /// Loads the operator a worker needs for one block.
    pub fn from_descriptor(descriptor: &BlockDescriptor) -> Result<Self, PrecisionError> {
        let mut variants = VariantTable::new(descriptor.variants.clone());
        for column in &descriptor.columns {
            variants = variants.with_column(column.name.clone(), column.values.clone())?;
        }
        Self::from_edges(
            descriptor.dimension,
            descriptor
                .edges
                .iter()
                .map(|edge| (edge.row, edge.col, edge.value)),
            variants,
        )
    }

    fn assemble(matrix: SparseColMat<usize, f64>, variants: VariantTable) -> Self {
        Self {
            matrix: Arc::new(matrix),
            variants: Arc::new(variants),
            active: None,
            diagonal: None,
            ordering: FillOrdering::default(),
            cache: Arc::new(Mutex::new(FactorState::Unfactored)),
            complement: Mutex::new(FactorState::Unfactored),
        }
    }

    /// Uses `ordering` for every factorization of this operator.
    pub fn with_ordering(mut self, ordering: FillOrdering) -> Self {
        if ordering != self.ordering {
            self.ordering = ordering;
            self.cache = Arc::new(Mutex::new(FactorState::Unfactored));
            self.complement = Mutex::new(FactorState::Unfactored);
        }
        self
    }

    // ------------------------------------------------------------------------------------
    // Dimensions and metadata
    // ------------------------------------------------------------------------------------

    #[inline]
    pub fn full_dimension(&self) -> usize {
        self.matrix.nrows()
    }

    #[inline]
    pub fn active_dimension(&self) -> usize {
        match &self.active {
            Some(active) => active.rows.len(),
            None => self.full_dimension(),
        }
    }

    #[inline]
    pub fn shape(&self) -> (usize, usize) {
        let m = self.active_dimension();
        (m, m)
    }

    pub fn ordering(&self) -> FillOrdering {
        self.ordering
    }

    /// The variant table of the full row space.
    pub fn variants(&self) -> &VariantTable {
        &self.variants
    }

    /// Variant records of the active rows, in active order.
    pub fn active_variants(&self) -> impl Iterator<Item = &VariantRecord> + '_ {
        let records = self.variants.records();
        (0..self.active_dimension()).map(move |position| &records[self.full_row(position)])
    }

    /// The full-space row of every active row.
    pub fn active_indices(&self) -> Vec<usize> {
        match &self.active {
            Some(active) => active.rows.to_vec(),
            None => (0..self.full_dimension()).collect(),
        }
    }

    #[inline]
    fn full_row(&self, position: usize) -> usize {
        match &self.active {
            Some(active) => active.rows[position],
            None => position,
        }
    }

    fn inactive_rows(&self) -> Option<&[usize]> {
        self.active
            .as_ref()
            .map(|active| &active.inactive[..])
            .filter(|inactive| !inactive.is_empty())
    }

    // ------------------------------------------------------------------------------------
    // Selections
    // ------------------------------------------------------------------------------------

    /// A view of this operator restricted to `selection`, interpreted in the current
    /// active space. The matrix, the variant table and the full-space factorization
    /// are shared with `self`.
    pub fn restrict(&self, selection: &RowSelection) -> Result<Self, PrecisionError> {
        let positions = selection.resolve(self.active_dimension())?;
        let rows = positions
            .into_iter()
            .map(|position| self.full_row(position))
            .collect();
        Ok(Self {
            matrix: Arc::clone(&self.matrix),
            variants: Arc::clone(&self.variants),
            active: Some(ActiveRows::new(rows, self.full_dimension())),
            diagonal: self.diagonal.clone(),
            ordering: self.ordering,
            cache: Arc::clone(&self.cache),
            complement: Mutex::new(FactorState::Unfactored),
        })
    }

    /// Replaces the active rows with `selection`, interpreted in the full row space.
    pub fn set_selection(&mut self, selection: &RowSelection) -> Result<(), PrecisionError> {
        let rows = selection.resolve(self.full_dimension())?;
        self.active = Some(ActiveRows::new(rows, self.full_dimension()));
        *lock(&self.complement) = FactorState::Unfactored;
        Ok(())
    }

    pub fn clear_selection(&mut self) {
        self.active = None;
        *lock(&self.complement) = FactorState::Unfactored;
    }

    // ------------------------------------------------------------------------------------
    // Diagonal updates
    // ------------------------------------------------------------------------------------

    /// Sets the additive diagonal over the full row space.
    pub fn update_diagonal(&mut self, values: ArrayView1<'_, f64>) -> Result<(), PrecisionError> {
        check_len("update_diagonal", self.full_dimension(), values.len())?;
        self.replace_diagonal(Some(values.iter().copied().collect()));
        Ok(())
    }

    /// Sets the additive diagonal on the active rows, keeping the current values on
    /// inactive rows.
    pub fn update_active_diagonal(
        &mut self,
        values: ArrayView1<'_, f64>,
    ) -> Result<(), PrecisionError> {
        check_len("update_active_diagonal", self.active_dimension(), values.len())?;
        let mut diagonal = match &self.diagonal {
            Some(current) => current.to_vec(),
            None => vec![0.0; self.full_dimension()],
        };
        for (position, &value) in values.iter().enumerate() {
            diagonal[self.full_row(position)] = value;
        }
        self.replace_diagonal(Some(diagonal.into()));
        Ok(())
    }

    pub fn clear_diagonal(&mut self) {
        self.replace_diagonal(None);
    }

    /// The additive diagonal currently folded into the effective matrix.
    pub fn diagonal_update(&self) -> Option<&[f64]> {
        self.diagonal.as_deref()
    }

    fn replace_diagonal(&mut self, diagonal: Option<Arc<[f64]>>) {
        self.diagonal = diagonal;
        *lock(&self.cache) = FactorState::Unfactored;
        *lock(&self.complement) = FactorState::Unfactored;
    }

    // ------------------------------------------------------------------------------------
    // Factorization
    // ------------------------------------------------------------------------------------

    /// Factorizes the full effective matrix unless a matching factorization is cached.
    pub fn factorize(&self) -> Result<(), PrecisionError> {
        self.full_factor().map(|_| ())
    }

    /// Whether the shared cache holds a factorization of this view's effective matrix.
    pub fn is_factorized(&self) -> bool {
        lock(&self.cache).matching(&self.diagonal).is_some()
    }

    /// A snapshot of the shared cache.
    pub fn factor_state(&self) -> FactorState {
        lock(&self.cache).clone()
    }

    /// Drops both cached factorizations. They are recomputed on the next solve.
    pub fn release_factorization(&self) {
        *lock(&self.cache) = FactorState::Unfactored;
        *lock(&self.complement) = FactorState::Unfactored;
    }

    fn full_factor(&self) -> Result<Arc<LdlFactor>, PrecisionError> {
        let mut state = lock(&self.cache);
        if let Some(factor) = state.matching(&self.diagonal) {
            return Ok(factor);
        }
        let factor = Arc::new(LdlFactor::factorize(
            &self.matrix,
            self.diagonal.as_deref(),
            self.ordering,
        )?);
        *state = FactorState::Factored {
            diagonal: self.diagonal.clone(),
            factor: Arc::clone(&factor),
        };
        Ok(factor)
    }

    /// Factorization of `M_BB`, the effective matrix on the inactive rows.
    fn complement_factor(&self, inactive: &[usize]) -> Result<Arc<LdlFactor>, PrecisionError> {
        let mut state = lock(&self.complement);
        if let Some(factor) = state.matching(&self.diagonal) {
            return Ok(factor);
        }

        let mut local = vec![None; self.full_dimension()];
        for (position, &row) in inactive.iter().enumerate() {
            local[row] = Some(position);
        }
        let (symbolic, values) = self.matrix.parts();
        let col_ptr = symbolic.col_ptr();
        let row_idx = symbolic.row_idx();
        let mut triplets = Vec::new();
        for (position, &col) in inactive.iter().enumerate() {
            for idx in col_ptr[col]..col_ptr[col + 1] {
                if let Some(row) = local[row_idx[idx]] {
                    triplets.push(Triplet::new(row, position, values[idx]));
                }
            }
        }
        let size = inactive.len();
        let block = SparseColMat::try_new_from_triplets(size, size, &triplets)
            .map_err(|e| PrecisionError::InvalidMatrix(format!("{e:?}")))?;
        let block_diagonal: Option<Vec<f64>> = self
            .diagonal
            .as_ref()
            .map(|diagonal| inactive.iter().map(|&row| diagonal[row]).collect());

        let factor = LdlFactor::factorize(&block, block_diagonal.as_deref(), self.ordering)
            .map_err(|err| match err {
                PrecisionError::NotPositiveDefinite { row, value } => {
                    PrecisionError::NotPositiveDefinite {
                        row: inactive[row],
                        value,
                    }
                }
                other => other,
            })?;
        let factor = Arc::new(factor);
        *state = FactorState::Factored {
            diagonal: self.diagonal.clone(),
            factor: Arc::clone(&factor),
        };
        Ok(factor)
    }

    // ------------------------------------------------------------------------------------
    // Linear algebra on the active space
    // ------------------------------------------------------------------------------------

    /// `(M + D) x` over the full row space.
    fn full_product(&self, x: &[f64]) -> Vec<f64> {
        let (symbolic, values) = self.matrix.parts();
        let col_ptr = symbolic.col_ptr();
        let row_idx = symbolic.row_idx();
        let mut out = vec![0.0; x.len()];
        for (col, &x_col) in x.iter().enumerate() {
            if x_col == 0.0 {
                continue;
            }
            for idx in col_ptr[col]..col_ptr[col + 1] {
                out[row_idx[idx]] += values[idx] * x_col;
            }
        }
        if let Some(diagonal) = &self.diagonal {
            for ((slot, &d), &x_row) in out.iter_mut().zip(diagonal.iter()).zip(x.iter()) {
                *slot += d * x_row;
            }
        }
        out
    }

    fn embed(&self, vector: ArrayView1<'_, f64>) -> Vec<f64> {
        let mut full = vec![0.0; self.full_dimension()];
        for (position, &value) in vector.iter().enumerate() {
            full[self.full_row(position)] = value;
        }
        full
    }

    fn gather(&self, full: &[f64]) -> Array1<f64> {
        Array1::from_shape_fn(self.active_dimension(), |position| {
            full[self.full_row(position)]
        })
    }

    /// `S v`, where `S = M_AA - M_AB M_BB⁻¹ M_BA` is the precision of the active rows
    /// with the inactive rows marginalized out.
    pub fn multiply(&self, vector: ArrayView1<'_, f64>) -> Result<Array1<f64>, PrecisionError> {
        check_len("multiply", self.active_dimension(), vector.len())?;
        let embedded = self.embed(vector);
        let product = self.full_product(&embedded);
        let Some(inactive) = self.inactive_rows() else {
            return Ok(self.gather(&product));
        };

        // `embedded` is zero on B, so the product restricted to B is `M_BA v`.
        let coupling: Vec<f64> = inactive.iter().map(|&row| product[row]).collect();
        let eliminated = self.complement_factor(inactive)?.solve(&coupling);
        let mut lifted = vec![0.0; self.full_dimension()];
        for (&row, &value) in inactive.iter().zip(eliminated.iter()) {
            lifted[row] = value;
        }
        let correction = self.full_product(&lifted);
        Ok(Array1::from_shape_fn(self.active_dimension(), |position| {
            let row = self.full_row(position);
            product[row] - correction[row]
        }))
    }

    /// `S⁻¹ v`, read off the full solve of the zero-embedded right-hand side.
    pub fn solve(&self, vector: ArrayView1<'_, f64>) -> Result<Array1<f64>, PrecisionError> {
        check_len("solve", self.active_dimension(), vector.len())?;
        let factor = self.full_factor()?;
        Ok(self.gather(&factor.solve(&self.embed(vector))))
    }

    /// Solves every column of `rhs` against one factorization.
    pub fn solve_many(&self, rhs: ArrayView2<'_, f64>) -> Result<Array2<f64>, PrecisionError> {
        check_len("solve_many", self.active_dimension(), rhs.nrows())?;
        let factor = self.full_factor()?;
        let columns: Vec<Array1<f64>> = (0..rhs.ncols())
            .into_par_iter()
            .map(|col| self.gather(&factor.solve(&self.embed(rhs.column(col)))))
            .collect();
        Ok(Array2::from_shape_fn(rhs.raw_dim(), |(row, col)| {
            columns[col][row]
        }))
    }

    /// `log det S = log det M - log det M_BB`.
    pub fn log_determinant(&self) -> Result<f64, PrecisionError> {
        let full = self.full_factor()?.log_determinant();
        match self.inactive_rows() {
            Some(inactive) => Ok(full - self.complement_factor(inactive)?.log_determinant()),
            None => Ok(full),
        }
    }

    /// `diag(S⁻¹)`, the active entries of the diagonal of `M⁻¹`.
    pub fn inverse_diagonal(&self) -> Result<Array1<f64>, PrecisionError> {
        let factor = self.full_factor()?;
        Ok(self.gather(&factor.inverse_diagonal()))
    }

    /// The full effective matrix `M + D` as a dense array.
    pub fn to_dense(&self) -> Array2<f64> {
        let n = self.full_dimension();
        let mut dense = Array2::zeros((n, n));
        let (symbolic, values) = self.matrix.parts();
        let col_ptr = symbolic.col_ptr();
        let row_idx = symbolic.row_idx();
        for col in 0..n {
            for idx in col_ptr[col]..col_ptr[col + 1] {
                dense[[row_idx[idx], col]] += values[idx];
            }
        }
        if let Some(diagonal) = &self.diagonal {
            for (row, &value) in diagonal.iter().enumerate() {
                dense[[row, row]] += value;
            }
        }
        dense
    }
}

fn check_symmetric(matrix: &SparseColMat<usize, f64>) -> Result<(), PrecisionError> {
    let (symbolic, values) = matrix.parts();
    let col_ptr = symbolic.col_ptr();
    let row_idx = symbolic.row_idx();
    let mut entries: AHashMap<(usize, usize), f64> = AHashMap::with_capacity(values.len());
    for col in 0..matrix.ncols() {
        for idx in col_ptr[col]..col_ptr[col + 1] {
            *entries.entry((row_idx[idx], col)).or_insert(0.0) += values[idx];
        }
    }
    for (&(row, col), &value) in &entries {
        if row >= col {
            continue;
        }
        let mirror = entries.get(&(col, row)).copied().unwrap_or(0.0);
        if (value - mirror).abs() > SYMMETRY_TOLERANCE * value.abs().max(1.0) {
            return Err(PrecisionError::InvalidMatrix(format!(
                "entry ({row}, {col}) = {value} does not match its mirror {mirror}"
            )));
        }
    }
    for (&(row, col), &value) in &entries {
        if row > col && !entries.contains_key(&(col, row)) && value != 0.0 {
            return Err(PrecisionError::InvalidMatrix(format!(
                "entry ({row}, {col}) = {value} has no mirror entry"
            )));
        }
    }
    Ok(())
}
