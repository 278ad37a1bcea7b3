use faer::{Mat, MatRef};
use statrs::statistics::Statistics;

use crate::core::data::sparse_structures::CompressedSparseData;
use crate::core::error::NmfError;
use crate::ensure_nrows;

/// Mean over all entries of a dense matrix
fn entry_mean(mat: MatRef<f64>) -> f64 {
    let values: Vec<f64> = (0..mat.ncols())
        .flat_map(|j| (0..mat.nrows()).map(move |i| mat[(i, j)]))
        .collect();
    values.iter().mean()
}

/// Estimate the balance parameter of the joint objective
///
/// Computes `beta * mean(D1 * W1) / mean(D2 * W2)` with `D` the
/// observations x features domain matrices and `W` the normalised
/// single-domain bases. This equalises the typical magnitude of both
/// reconstruction losses.
///
/// ### Params
///
/// * `matrix_1` - First domain matrix (CSR, observations x features_1)
/// * `basis_1` - Normalised basis of the first domain (features_1 x K)
/// * `matrix_2` - Second domain matrix (CSR, observations x features_2)
/// * `basis_2` - Normalised basis of the second domain (features_2 x K)
/// * `beta` - Scaling of the ratio
///
/// ### Returns
///
/// `lambda1`, or `DegenerateBasis` if the ratio is undefined or zero.
pub fn estimate_lambda(
    matrix_1: &CompressedSparseData<f64>,
    basis_1: &Mat<f64>,
    matrix_2: &CompressedSparseData<f64>,
    basis_2: &Mat<f64>,
    beta: f64,
) -> Result<f64, NmfError> {
    ensure_nrows!("balance estimator observations", matrix_1, matrix_2);
    if basis_1.nrows() != matrix_1.ncols() || basis_2.nrows() != matrix_2.ncols() {
        let (expected, actual) = if basis_1.nrows() != matrix_1.ncols() {
            (matrix_1.ncols(), basis_1.nrows())
        } else {
            (matrix_2.ncols(), basis_2.nrows())
        };
        return Err(NmfError::ShapeMismatch {
            context: "balance estimator basis rows".to_string(),
            expected,
            actual,
        });
    }

    let numerator = entry_mean(matrix_1.matmul_dense(basis_1.as_ref()).as_ref());
    let denominator = entry_mean(matrix_2.matmul_dense(basis_2.as_ref()).as_ref());

    if !numerator.is_finite() || !denominator.is_finite() || numerator == 0.0 || denominator == 0.0
    {
        return Err(NmfError::DegenerateBasis {
            numerator,
            denominator,
        });
    }

    let lambda1 = beta * numerator / denominator;
    if !lambda1.is_finite() {
        return Err(NmfError::DegenerateBasis {
            numerator,
            denominator,
        });
    }

    Ok(lambda1)
}

///////////
// Tests //
///////////
