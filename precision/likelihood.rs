// ========================================================================================
//                    Gaussian likelihood of precision-premultiplied z-scores
// ========================================================================================

// For `pz = M z` the model is `pz ~ N(0, M)`, where `M` is the effective active-space
// matrix of a `PrecisionOperator`. Every kernel reads `M⁻¹` through the operator's
// cached factorization and never forms it densely.

use crate::error::{PrecisionError, check_len};
use crate::operator::PrecisionOperator;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use std::f64::consts::PI;

/// `-½ (pzᵀ M⁻¹ pz + log det M + m log 2π)`.
pub fn log_likelihood(
    pz: ArrayView1<'_, f64>,
    operator: &PrecisionOperator,
) -> Result<f64, PrecisionError> {
    let m = operator.active_dimension();
    check_len("log_likelihood", m, pz.len())?;
    let b = operator.solve(pz)?;
    let quadratic = pz.dot(&b);
    let log_det = operator.log_determinant()?;
    Ok(-0.5 * (quadratic + log_det + m as f64 * (2.0 * PI).ln()))
}

/// Derivative of [`log_likelihood`] with respect to each active diagonal entry of `M`:
/// `½ [(M⁻¹pz)² - diag(M⁻¹)]`.
pub fn log_likelihood_gradient(
    pz: ArrayView1<'_, f64>,
    operator: &PrecisionOperator,
) -> Result<Array1<f64>, PrecisionError> {
    check_len(
        "log_likelihood_gradient",
        operator.active_dimension(),
        pz.len(),
    )?;
    let b = operator.solve(pz)?;
    let inverse_diagonal = operator.inverse_diagonal()?;
    Ok(0.5 * (&b * &b - &inverse_diagonal))
}

/// Average-information Hessian with respect to parameters `a`, where
/// `jacobian[[i, k]] = ∂ M_ii / ∂ a_k`.
///
/// With `b = M⁻¹ pz` and `W = diag(b) J` this is `-½ Wᵀ M⁻¹ W`: the mean of the
/// observed and expected information. It is negative semi-definite for every `pz`.
pub fn log_likelihood_hessian(
    pz: ArrayView1<'_, f64>,
    operator: &PrecisionOperator,
    jacobian: ArrayView2<'_, f64>,
) -> Result<Array2<f64>, PrecisionError> {
    let m = operator.active_dimension();
    check_len("log_likelihood_hessian", m, pz.len())?;
    check_len("log_likelihood_hessian (jacobian rows)", m, jacobian.nrows())?;

    let b = operator.solve(pz)?;
    let weighted = &jacobian * &b.view().insert_axis(Axis(1));
    let solved = operator.solve_many(weighted.view())?;
    let hessian = -0.5 * weighted.t().dot(&solved);
    Ok(0.5 * (&hessian + &hessian.t()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variants::{VariantRecord, VariantTable};
    use approx::assert_relative_eq;
    use ndarray::array;

    // M = diag(2, 4), so every kernel has a closed form.
    fn diagonal_operator() -> PrecisionOperator {
        let records = (0..2)
            .map(|row| VariantRecord {
                site_id: format!("rs{row}"),
                chromosome: 1,
                position: row as u64 + 1,
                ref_allele: "C".to_string(),
                alt_allele: "T".to_string(),
            })
            .collect();
        PrecisionOperator::from_edges(2, vec![(0, 0, 2.0), (1, 1, 4.0)], VariantTable::new(records))
            .unwrap()
    }

    #[test]
    fn diagonal_precision_has_closed_form_kernels() {
        let op = diagonal_operator();
        let pz = array![1.0, 2.0];

        let expected = -0.5 * (1.5 + 8.0_f64.ln() + 2.0 * (2.0 * PI).ln());
        assert_relative_eq!(log_likelihood(pz.view(), &op).unwrap(), expected, max_relative = 1e-12);

        let gradient = log_likelihood_gradient(pz.view(), &op).unwrap();
        assert_relative_eq!(gradient[0], -0.125, max_relative = 1e-12);
        assert_relative_eq!(gradient[1], 0.0, epsilon = 1e-14);

        let hessian = log_likelihood_hessian(pz.view(), &op, Array2::eye(2).view()).unwrap();
        assert_relative_eq!(hessian[[0, 0]], -0.0625, max_relative = 1e-12);
        assert_relative_eq!(hessian[[1, 1]], -0.03125, max_relative = 1e-12);
        assert_relative_eq!(hessian[[0, 1]], 0.0, epsilon = 1e-14);
    }

    #[test]
    fn mismatched_lengths_are_shape_errors() {
        let op = diagonal_operator();
        assert!(matches!(
            log_likelihood(array![1.0].view(), &op),
            Err(PrecisionError::Shape { operation: "log_likelihood", .. })
        ));
        assert!(matches!(
            log_likelihood_hessian(array![1.0, 2.0].view(), &op, Array2::zeros((3, 1)).view()),
            Err(PrecisionError::Shape {
                operation: "log_likelihood_hessian (jacobian rows)",
                expected: 2,
                found: 3,
            })
        ));
    }
}
