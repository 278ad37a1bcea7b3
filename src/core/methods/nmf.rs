use faer::Mat;
use rand::{rngs::StdRng, SeedableRng};
use tracing::debug;

use crate::core::base::utils::{multiplicative_update, row_norms};
use crate::core::data::sparse_structures::CompressedSparseData;
use crate::core::error::NmfError;
use crate::core::methods::initialisation::random_uniform_matrix;

/// Spacing of the loss checks of the early exit
const NMF_CHECK_EVERY: usize = 10;

////////////////
// Structures //
////////////////

/// Result of a single-domain NMF
///
/// The factorised matrix is the transposed domain matrix, i.e.
/// `features x observations ≈ basis * coefficients`.
///
/// ### Fields
///
/// * `basis` - Basis matrix of shape features x K.
/// * `coefficients` - Coefficient matrix of shape K x observations.
/// * `loss` - Final squared Frobenius reconstruction error.
/// * `iterations` - Number of update rounds performed.
#[derive(Debug, Clone)]
pub struct SingleDomainNmf {
    pub basis: Mat<f64>,
    pub coefficients: Mat<f64>,
    pub loss: f64,
    pub iterations: usize,
}

/////////////
// Helpers //
/////////////

/// Squared reconstruction error of a sparse matrix without densifying it
///
/// Uses `||A - WH||² = ||A||² - 2<WᵗA, H> + <WᵗW, HHᵗ>`.
///
/// ### Params
///
/// * `frob_a` - `||A||²`
/// * `wt_a` - `WᵗA` (K x observations)
/// * `wt_w` - `WᵗW` (K x K)
/// * `h` - Coefficients (K x observations)
fn sparse_reconstruction_loss(frob_a: f64, wt_a: &Mat<f64>, wt_w: &Mat<f64>, h: &Mat<f64>) -> f64 {
    let hh_t = h * h.transpose();

    let mut cross = 0.0;
    for j in 0..h.ncols() {
        for i in 0..h.nrows() {
            cross += wt_a[(i, j)] * h[(i, j)];
        }
    }

    let mut quad = 0.0;
    for j in 0..hh_t.ncols() {
        for i in 0..hh_t.nrows() {
            quad += wt_w[(i, j)] * hh_t[(i, j)];
        }
    }

    (frob_a - 2.0 * cross + quad).max(0.0)
}

/// Divide every basis column by the norm of the paired coefficient row
///
/// Puts the bases of both domains on comparable scales. Components with a
/// zero coefficient row are left unchanged.
///
/// ### Params
///
/// * `basis` - Basis matrix (features x K), modified in place
/// * `coefficients` - Coefficient matrix (K x observations)
pub fn normalise_basis(basis: &mut Mat<f64>, coefficients: &Mat<f64>) {
    let norms = row_norms(coefficients.as_ref());
    for (k, &norm) in norms.iter().enumerate() {
        if norm > 0.0 {
            for i in 0..basis.nrows() {
                basis[(i, k)] /= norm;
            }
        }
    }
}

////////////////////
// Main functions //
////////////////////

/// Standard multiplicative-update NMF on one domain
///
/// Lee-Seung updates minimising `||Dᵗ - basis * coefficients||²` where `D`
/// is the observations x features domain matrix. All products are computed
/// from the sparse representation.
///
/// ### Params
///
/// * `matrix` - Domain matrix (observations x features) in CSR layout.
/// * `k` - Rank of the factorisation; `1 <= k <= min(features, observations)`.
/// * `max_iter` - Maximum number of update rounds.
/// * `tol` - Optional relative improvement threshold; checked every 10 rounds.
/// * `seed` - Seed for the random initialisation.
///
/// ### Returns
///
/// The `SingleDomainNmf` with non-negative factors.
pub fn nmf_single_domain(
    matrix: &CompressedSparseData<f64>,
    k: usize,
    max_iter: usize,
    tol: Option<f64>,
    seed: u64,
) -> Result<SingleDomainNmf, NmfError> {
    let (n_obs, n_features) = matrix.shape();
    if k == 0 || k > n_obs.min(n_features) {
        return Err(NmfError::invalid_param(
            "k",
            format!(
                "must be in 1..={} for a {} x {} matrix, got {}",
                n_obs.min(n_features),
                n_obs,
                n_features,
                k
            ),
        ));
    }

    let mut rng = StdRng::seed_from_u64(seed);

    let total: f64 = matrix.data.iter().sum();
    let avg = total / (n_obs * n_features) as f64;
    let scale = if avg > 0.0 { (avg / k as f64).sqrt() } else { 1.0 };

    let mut basis = random_uniform_matrix(n_features, k, scale, &mut rng)?;
    let mut coefficients = random_uniform_matrix(k, n_obs, scale, &mut rng)?;

    let frob_a = matrix.frobenius_sq();
    let mut prev_loss = f64::INFINITY;
    let mut iterations = 0;

    for iter in 0..max_iter {
        // coefficients
        let wt_a = matrix.matmul_dense(basis.as_ref()).transpose().to_owned();
        let wt_w = basis.transpose() * &basis;
        let denom = &wt_w * &coefficients;
        multiplicative_update(&mut coefficients, wt_a.as_ref(), denom.as_ref());

        // basis
        let a_ht = matrix.t_matmul_dense(coefficients.transpose());
        let hh_t = &coefficients * coefficients.transpose();
        let denom = &basis * &hh_t;
        multiplicative_update(&mut basis, a_ht.as_ref(), denom.as_ref());

        iterations = iter + 1;

        if let Some(tol) = tol {
            if iterations % NMF_CHECK_EVERY == 0 {
                let wt_a = matrix.matmul_dense(basis.as_ref()).transpose().to_owned();
                let wt_w = basis.transpose() * &basis;
                let loss = sparse_reconstruction_loss(frob_a, &wt_a, &wt_w, &coefficients);
                debug!(iteration = iterations, loss, "single-domain NMF checkpoint");
                if prev_loss.is_finite() && (prev_loss - loss) < tol * prev_loss {
                    break;
                }
                prev_loss = loss;
            }
        }
    }

    let wt_a = matrix.matmul_dense(basis.as_ref()).transpose().to_owned();
    let wt_w = basis.transpose() * &basis;
    let loss = sparse_reconstruction_loss(frob_a, &wt_a, &wt_w, &coefficients);

    Ok(SingleDomainNmf {
        basis,
        coefficients,
        loss,
        iterations,
    })
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::base::utils::residual_sq;
    use faer::mat;

    /// Observations x features matrix of exact rank 2
    fn rank_two_data() -> CompressedSparseData<f64> {
        let left = mat![
            [1.0, 0.0],
            [2.0, 0.5],
            [0.0, 1.0],
            [1.5, 1.5],
            [0.5, 3.0],
            [2.5, 0.0],
        ];
        let right = mat![[1.0, 2.0, 0.0, 1.0, 3.0], [0.0, 1.0, 2.0, 2.0, 0.5]];
        let dense = &left * &right;
        CompressedSparseData::from_dense_csr(dense.as_ref())
    }

    #[test]
    fn test_nmf_reconstruction() {
        let data = rank_two_data();
        let res = nmf_single_domain(&data, 2, 1000, None, 42).unwrap();

        assert_eq!(res.basis.shape(), (5, 2));
        assert_eq!(res.coefficients.shape(), (2, 6));
        assert_eq!(res.iterations, 1000);

        let a = data.to_dense().transpose().to_owned();
        let err = residual_sq(a.as_ref(), res.basis.as_ref(), res.coefficients.as_ref());
        let rel_err = (err / data.frobenius_sq()).sqrt();
        assert!(rel_err < 0.05, "Poor reconstruction: {}", rel_err);
        assert!((err - res.loss).abs() < 1e-6 * data.frobenius_sq().max(1.0));

        for j in 0..2 {
            for i in 0..5 {
                assert!(res.basis[(i, j)] >= 0.0);
            }
            for i in 0..6 {
                assert!(res.coefficients[(j, i)] >= 0.0);
            }
        }
    }

    #[test]
    fn test_nmf_early_exit() {
        // rank 1 on rank 2 data keeps the loss bounded away from zero
        let data = rank_two_data();
        let res = nmf_single_domain(&data, 1, 10_000, Some(1e-3), 1).unwrap();
        assert!(res.iterations < 10_000);
        assert_eq!(res.iterations % NMF_CHECK_EVERY, 0);
    }

    #[test]
    fn test_nmf_seed_reproducible() {
        let data = rank_two_data();
        let a = nmf_single_domain(&data, 2, 20, None, 7).unwrap();
        let b = nmf_single_domain(&data, 2, 20, None, 7).unwrap();
        assert_eq!(a.basis, b.basis);
        assert_eq!(a.coefficients, b.coefficients);
    }

    #[test]
    fn test_nmf_rank_validation() {
        let data = rank_two_data();
        assert!(matches!(
            nmf_single_domain(&data, 6, 10, None, 42),
            Err(NmfError::InvalidParameter { .. })
        ));
        assert!(matches!(
            nmf_single_domain(&data, 0, 10, None, 42),
            Err(NmfError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_normalise_basis() {
        let mut basis = mat![[3.0, 1.0], [6.0, 2.0]];
        let coefficients = mat![[3.0, 4.0], [0.0, 0.0]];

        normalise_basis(&mut basis, &coefficients);

        assert_eq!(basis, mat![[0.6, 1.0], [1.2, 2.0]]);
    }
}
