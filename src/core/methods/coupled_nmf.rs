use faer::Mat;
use rand::{rngs::StdRng, SeedableRng};
use std::hash::Hash;
use std::time::Instant;
use tracing::{info, instrument};

use crate::core::base::utils::{first_columns, first_rows, normalise_embedding, EmbeddingNorm};
use crate::core::data::domain::{prepare_domain, validate_pair, DomainMatrix};
use crate::core::data::sparse_structures::CompressedSparseData;
use crate::core::error::NmfError;
use crate::core::methods::balance::estimate_lambda;
use crate::core::methods::initialisation::{
    batch_aware_random_init, validate_factors, warm_start_init, BatchAssignment,
};
use crate::core::methods::joint_nmf::{JointNmfSolver, SolverReport};
use crate::core::methods::nmf::{nmf_single_domain, normalise_basis, SingleDomainNmf};
use crate::core::params::{CoupledNmfParams, InitStrategy};

////////////
// Result //
////////////

/// Output of a coupled NMF run
///
/// ### Fields
///
/// * `w1` - Basis of domain 1 (kept features_1 x K)
/// * `w2` - Basis of domain 2 (kept features_2 x K)
/// * `h` - Shared coefficients (K x observations)
/// * `lambda1` - Balance parameter used by the solver
/// * `kept_features_1` - Column indices of domain 1 that passed the filter
/// * `kept_features_2` - Column indices of domain 2 that passed the filter
/// * `batch_labels` - Distinct batch labels in order of first appearance;
///   empty if none were supplied
/// * `report` - The solver report
#[derive(Debug, Clone)]
pub struct CoupledNmfResult<T> {
    pub w1: Mat<f64>,
    pub w2: Mat<f64>,
    pub h: Mat<f64>,
    pub lambda1: f64,
    pub kept_features_1: Vec<usize>,
    pub kept_features_2: Vec<usize>,
    pub batch_labels: Vec<T>,
    pub report: SolverReport,
}

impl<T> CoupledNmfResult<T> {
    /// The joint embedding (observations x K), i.e. `Hᵗ`
    pub fn embedding(&self) -> Mat<f64> {
        self.h.transpose().to_owned()
    }

    /// The joint embedding after L2 or z-score normalisation
    ///
    /// ### Params
    ///
    /// * `norm` - `EmbeddingNorm::L2` scales every observation to unit
    ///   length, `EmbeddingNorm::ZScore` scales every component to zero mean
    ///   and unit variance.
    pub fn normalised_embedding(&self, norm: EmbeddingNorm) -> Mat<f64> {
        normalise_embedding(self.embedding().as_ref(), norm)
    }
}

/////////////
// Helpers //
/////////////

/// Run the single-domain NMF on both domains
fn single_domain_factorisations(
    domain_1: &DomainMatrix,
    domain_2: &DomainMatrix,
    params: &CoupledNmfParams,
) -> Result<(SingleDomainNmf, SingleDomainNmf), NmfError> {
    let nmf_1 = nmf_single_domain(
        &domain_1.data,
        params.k,
        params.init_max_iter,
        params.init_tol,
        params.seed,
    )?;
    let nmf_2 = nmf_single_domain(
        &domain_2.data,
        params.k,
        params.init_max_iter,
        params.init_tol,
        params.seed.wrapping_add(1),
    )?;

    Ok((nmf_1, nmf_2))
}

/// Balance parameter from the normalised single-domain bases
fn balance_parameter(
    domain_1: &DomainMatrix,
    nmf_1: &SingleDomainNmf,
    domain_2: &DomainMatrix,
    nmf_2: &SingleDomainNmf,
    beta: f64,
) -> Result<f64, NmfError> {
    let mut basis_1 = nmf_1.basis.clone();
    let mut basis_2 = nmf_2.basis.clone();
    normalise_basis(&mut basis_1, &nmf_1.coefficients);
    normalise_basis(&mut basis_2, &nmf_2.coefficients);

    estimate_lambda(&domain_1.data, &basis_1, &domain_2.data, &basis_2, beta)
}

//////////
// Main //
//////////

/// Coupled NMF of two domains that share their observations
///
/// Filters low-support features, runs single-domain NMFs to estimate the
/// balance parameter (and optionally to warm start), builds the initial joint
/// factors, runs the joint solver and truncates the factors to rank K.
///
/// ### Params
///
/// * `matrix_1` - First domain, observations x features_1 (CSR or CSC)
/// * `matrix_2` - Second domain, observations x features_2 (CSR or CSC)
/// * `batch_labels` - Optional batch label per observation; only used by
///   `InitStrategy::BatchAwareRandom`
/// * `params` - The run parameters
///
/// ### Returns
///
/// The `CoupledNmfResult` with `h` of shape K x observations.
#[instrument(skip_all, fields(k = params.k))]
pub fn coupled_nmf<T>(
    matrix_1: &CompressedSparseData<f64>,
    matrix_2: &CompressedSparseData<f64>,
    batch_labels: Option<&[T]>,
    params: &CoupledNmfParams,
) -> Result<CoupledNmfResult<T>, NmfError>
where
    T: Eq + Hash + Clone,
{
    let start_total = Instant::now();

    params.validate()?;
    validate_pair(matrix_1, matrix_2)?;
    let n_obs = matrix_1.nrows();

    // filtering
    let start_filter = Instant::now();
    let domain_1 = prepare_domain("domain_1", matrix_1, params.feature_cutperc)?;
    let domain_2 = prepare_domain("domain_2", matrix_2, params.feature_cutperc)?;
    info!(
        "Kept {} and {} features in {:.2?}",
        domain_1.n_features(),
        domain_2.n_features(),
        start_filter.elapsed()
    );

    let batches = match batch_labels {
        Some(labels) => {
            if labels.len() != n_obs {
                return Err(NmfError::ShapeMismatch {
                    context: "batch labels".to_string(),
                    expected: n_obs,
                    actual: labels.len(),
                });
            }
            Some(BatchAssignment::from_labels(labels))
        }
        None => None,
    };

    // warm start
    let needs_warm_start =
        params.lambda1.is_none() || matches!(params.init, InitStrategy::WarmStart);
    let warm_start = if needs_warm_start {
        let start_warm = Instant::now();
        let res = single_domain_factorisations(&domain_1, &domain_2, params)?;
        info!(
            "Single-domain NMFs finished in {:.2?} (losses: {:.4e}, {:.4e})",
            start_warm.elapsed(),
            res.0.loss,
            res.1.loss
        );
        Some(res)
    } else {
        None
    };

    // balance
    let lambda1 = match (params.lambda1, warm_start.as_ref()) {
        (Some(lambda1), _) => lambda1,
        (None, Some((nmf_1, nmf_2))) => {
            let start_balance = Instant::now();
            let lambda1 = balance_parameter(&domain_1, nmf_1, &domain_2, nmf_2, params.beta)?;
            info!(
                "Estimated lambda1 = {:.4} in {:.2?}",
                lambda1,
                start_balance.elapsed()
            );
            lambda1
        }
        (None, None) => {
            return Err(NmfError::invalid_param(
                "lambda1",
                "neither supplied nor estimable without single-domain factorisations",
            ))
        }
    };

    // initial factors
    let start_init = Instant::now();
    let init = match (&params.init, warm_start.as_ref()) {
        (InitStrategy::WarmStart, Some((nmf_1, nmf_2))) => warm_start_init(nmf_1, nmf_2)?,
        (InitStrategy::Custom(factors), _) => {
            validate_factors(
                factors,
                domain_1.n_features(),
                domain_2.n_features(),
                n_obs,
                params.k,
            )?;
            factors.clone()
        }
        _ => {
            let mut rng = StdRng::seed_from_u64(params.seed);
            batch_aware_random_init(&domain_1, &domain_2, params.k, batches.as_ref(), &mut rng)?
        }
    };
    info!(
        "Initial factors of rank {} in {:.2?}",
        init.rank(),
        start_init.elapsed()
    );

    // solver
    let start_solver = Instant::now();
    let mut solver = JointNmfSolver::new(
        &domain_1.data,
        &domain_2.data,
        init,
        lambda1,
        params.solver_params(),
    )?;
    let report = solver.fit()?;
    let factors = solver.into_factors();
    info!(
        "Joint solver ran {} iterations over {} observations in {:.2?}",
        report.iterations,
        n_obs,
        start_solver.elapsed()
    );

    let k = params.k;
    let result = CoupledNmfResult {
        w1: first_columns(factors.w1.as_ref(), k),
        w2: first_columns(factors.w2.as_ref(), k),
        h: first_rows(factors.h.as_ref(), k),
        lambda1,
        kept_features_1: domain_1.kept_features,
        kept_features_2: domain_2.kept_features,
        batch_labels: batches.map(|b| b.levels).unwrap_or_default(),
        report,
    };

    info!("Coupled NMF finished in {:.2?}", start_total.elapsed());

    Ok(result)
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::base::utils::all_non_negative;
    use crate::core::methods::joint_nmf::JointFactors;
    use crate::core::params::BatchSize;
    use faer::mat;

    /// Observations x features count-like data without empty rows
    fn synthetic_domain(n_obs: usize, n_features: usize, offset: usize) -> CompressedSparseData<f64> {
        let dense = Mat::from_fn(n_obs, n_features, |i, j| {
            let v = (i * 5 + j * 3 + offset) % 7;
            if j == i % n_features || v > 2 {
                1.0 + v as f64
            } else {
                0.0
            }
        });
        CompressedSparseData::from_dense_csr(dense.as_ref())
    }

    fn small_params() -> CoupledNmfParams {
        CoupledNmfParams {
            k: 3,
            feature_cutperc: 0.0,
            max_iter: 20,
            init_max_iter: 50,
            ..CoupledNmfParams::default()
        }
    }

    #[test]
    fn test_shape_contract() {
        let d1 = synthetic_domain(30, 8, 0);
        let d2 = synthetic_domain(30, 6, 2);
        let labels: Vec<String> = (0..30)
            .map(|i| if i < 12 { "s1".to_string() } else { "s2".to_string() })
            .collect();
        let params = CoupledNmfParams {
            batch_size: BatchSize::Fixed(10),
            ..small_params()
        };

        let res = coupled_nmf(&d1, &d2, Some(labels.as_slice()), &params).unwrap();

        assert_eq!(res.h.shape(), (3, 30));
        assert_eq!(res.w1.shape(), (res.kept_features_1.len(), 3));
        assert_eq!(res.w2.shape(), (res.kept_features_2.len(), 3));
        assert_eq!(res.batch_labels, vec!["s1".to_string(), "s2".to_string()]);
        assert_eq!(res.report.total_iterations, 20);
        assert!(res.lambda1.is_finite() && res.lambda1 > 0.0);

        assert!(all_non_negative(res.w1.as_ref()));
        assert!(all_non_negative(res.w2.as_ref()));
        assert!(all_non_negative(res.h.as_ref()));

        assert_eq!(res.embedding().shape(), (30, 3));
        let l2 = res.normalised_embedding(EmbeddingNorm::L2);
        for i in 0..30 {
            let norm: f64 = (0..3).map(|j| l2[(i, j)] * l2[(i, j)]).sum::<f64>().sqrt();
            assert!(norm == 0.0 || (norm - 1.0).abs() < 1e-10);
        }
    }

    #[test]
    fn test_shape_contract_with_filtering() {
        let d1 = synthetic_domain(20, 10, 1);
        let d2 = synthetic_domain(20, 5, 4);
        let params = CoupledNmfParams {
            k: 2,
            feature_cutperc: 0.6,
            ..small_params()
        };

        let res = coupled_nmf::<usize>(&d1, &d2, None, &params).unwrap();

        assert_eq!(res.h.shape(), (2, 20));
        // feature 3 of the first domain is present in 11 of 20 observations
        assert_eq!(res.kept_features_1, vec![0, 1, 2, 4, 5, 6, 7, 8, 9]);
        assert_eq!(res.kept_features_2, vec![0, 1, 2, 3, 4]);
        assert_eq!(res.w1.nrows(), 9);
        assert!(res.batch_labels.is_empty());
    }

    #[test]
    fn test_zero_feature_basis_row() {
        let dense = mat![
            [1.0, 0.0, 2.0, 1.0],
            [3.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 2.0, 2.0],
            [2.0, 0.0, 2.0, 1.0],
            [1.0, 0.0, 0.0, 3.0],
        ];
        let d1 = CompressedSparseData::from_dense_csr(dense.as_ref());
        let d2 = synthetic_domain(5, 3, 0);
        let params = CoupledNmfParams {
            k: 2,
            feature_cutperc: 0.0,
            ..small_params()
        };

        let res = coupled_nmf::<usize>(&d1, &d2, None, &params).unwrap();

        assert_eq!(res.kept_features_1, vec![0, 1, 2, 3]);
        for k in 0..2 {
            assert!(res.w1[(1, k)].abs() < 1e-12);
        }
    }

    #[test]
    fn test_empty_feature_set() {
        let d1 = synthetic_domain(10, 4, 0);
        let d2 = synthetic_domain(10, 4, 1);
        let params = CoupledNmfParams {
            feature_cutperc: 1.5,
            ..small_params()
        };

        let res = coupled_nmf::<usize>(&d1, &d2, None, &params);
        assert!(matches!(
            res,
            Err(NmfError::EmptyFeatureSet { domain }) if domain == "domain_1"
        ));
    }

    #[test]
    fn test_observation_mismatch() {
        let d1 = synthetic_domain(10, 4, 0);
        let d2 = synthetic_domain(9, 4, 1);

        assert!(matches!(
            coupled_nmf::<usize>(&d1, &d2, None, &small_params()),
            Err(NmfError::ShapeMismatch { expected: 10, actual: 9, .. })
        ));

        let d2 = synthetic_domain(10, 4, 1);
        let labels = vec![0_usize; 7];
        assert!(matches!(
            coupled_nmf(&d1, &d2, Some(labels.as_slice()), &small_params()),
            Err(NmfError::ShapeMismatch { expected: 10, actual: 7, .. })
        ));
    }

    #[test]
    fn test_warm_start_path() {
        let d1 = synthetic_domain(15, 6, 0);
        let d2 = synthetic_domain(15, 5, 3);
        let params = CoupledNmfParams {
            init: InitStrategy::WarmStart,
            batch_size: BatchSize::Full,
            ..small_params()
        };

        let res = coupled_nmf::<usize>(&d1, &d2, None, &params).unwrap();
        assert_eq!(res.h.shape(), (3, 15));
        assert!(res.lambda1.is_finite() && res.lambda1 > 0.0);
    }

    #[test]
    fn test_fixed_lambda_and_custom_init() {
        let d1 = synthetic_domain(6, 3, 0);
        let d2 = synthetic_domain(6, 2, 1);
        let init = JointFactors {
            w1: Mat::from_fn(3, 2, |i, j| 1.0 + (i + j) as f64),
            w2: Mat::from_fn(2, 2, |i, j| 0.5 + (i * j) as f64),
            h: Mat::from_fn(2, 6, |i, j| 0.2 + ((i + 2 * j) % 3) as f64),
        };
        let params = CoupledNmfParams {
            k: 2,
            lambda1: Some(0.3),
            init: InitStrategy::Custom(init.clone()),
            max_iter: 5,
            ..small_params()
        };

        let res = coupled_nmf::<usize>(&d1, &d2, None, &params).unwrap();
        assert_eq!(res.lambda1, 0.3);
        assert_eq!(res.report.total_iterations, 5);

        let wrong = JointFactors {
            h: Mat::from_fn(2, 5, |_, _| 1.0),
            ..init
        };
        let params = CoupledNmfParams {
            init: InitStrategy::Custom(wrong),
            ..params
        };
        assert!(matches!(
            coupled_nmf::<usize>(&d1, &d2, None, &params),
            Err(NmfError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_reproducible_with_seed() {
        let d1 = synthetic_domain(25, 6, 0);
        let d2 = synthetic_domain(25, 4, 5);
        let params = CoupledNmfParams {
            batch_size: BatchSize::Fixed(8),
            ..small_params()
        };

        let a = coupled_nmf::<usize>(&d1, &d2, None, &params).unwrap();
        let b = coupled_nmf::<usize>(&d1, &d2, None, &params).unwrap();
        assert_eq!(a.h, b.h);
        assert_eq!(a.w1, b.w1);
        assert_eq!(a.lambda1, b.lambda1);
    }

    #[test]
    fn test_params_from_json_drive_run() {
        let d1 = synthetic_domain(12, 5, 0);
        let d2 = synthetic_domain(12, 4, 2);
        let params = CoupledNmfParams::from_json(
            r#"{"k": 2, "feature_cutperc": 0.0, "max_iter": 40, "batch_size": "full",
                "tol": 1e-4, "loss_every": 10, "init_max_iter": 30}"#,
        )
        .unwrap();

        let res = coupled_nmf::<usize>(&d1, &d2, None, &params).unwrap();
        assert_eq!(res.h.shape(), (2, 12));
        assert!(!res.report.loss_history.is_empty());
        assert!(res.report.total_iterations <= 40);
    }
}
