use faer::Mat;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Uniform};
use rustc_hash::FxHashMap;
use std::hash::Hash;

use crate::core::base::utils::{all_non_negative, row_norms};
use crate::core::data::domain::DomainMatrix;
use crate::core::error::NmfError;
use crate::core::methods::nmf::SingleDomainNmf;
use crate::core::methods::joint_nmf::JointFactors;
use crate::ensure_dims;

////////////////
// Structures //
////////////////

/// Batch labels mapped onto consecutive integers
///
/// ### Fields
///
/// * `codes` - Batch index of every observation.
/// * `levels` - The distinct labels in order of first appearance.
#[derive(Debug, Clone)]
pub struct BatchAssignment<T> {
    pub codes: Vec<usize>,
    pub levels: Vec<T>,
}

impl<T> BatchAssignment<T>
where
    T: Eq + Hash + Clone,
{
    /// Intern the batch labels of all observations
    ///
    /// ### Params
    ///
    /// * `labels` - One label per observation
    ///
    /// ### Returns
    ///
    /// The `BatchAssignment` with labels numbered by first appearance.
    pub fn from_labels(labels: &[T]) -> Self {
        let mut lookup: FxHashMap<&T, usize> = FxHashMap::default();
        let mut levels = Vec::new();
        let codes = labels
            .iter()
            .map(|label| {
                *lookup.entry(label).or_insert_with(|| {
                    levels.push(label.clone());
                    levels.len() - 1
                })
            })
            .collect();

        Self { codes, levels }
    }

    /// Number of distinct batches
    pub fn n_batches(&self) -> usize {
        self.levels.len()
    }

    /// Observation indices per batch
    pub fn members(&self) -> Vec<Vec<usize>> {
        let mut members = vec![Vec::new(); self.n_batches()];
        for (obs, &code) in self.codes.iter().enumerate() {
            members[code].push(obs);
        }
        members
    }
}

/////////////
// Helpers //
/////////////

/// Generate a matrix with uniform random entries in `[0, scale)`
///
/// ### Params
///
/// * `nrow` - Number of rows
/// * `ncol` - Number of columns
/// * `scale` - Upper bound of the values
/// * `rng` - The random number generator
///
/// ### Returns
///
/// The random matrix.
pub fn random_uniform_matrix(
    nrow: usize,
    ncol: usize,
    scale: f64,
    rng: &mut StdRng,
) -> Result<Mat<f64>, NmfError> {
    let uniform =
        Uniform::new(0.0, 1.0).map_err(|e| NmfError::invalid_param("uniform", e.to_string()))?;
    let data: Vec<f64> = (0..nrow * ncol)
        .map(|_| scale * uniform.sample(&mut *rng))
        .collect();

    Ok(Mat::from_fn(nrow, ncol, |i, j| data[i + j * nrow]))
}

/////////////////////
// Init strategies //
/////////////////////

/// Random joint initialisation with optional batch augmentation
///
/// With `B` batches the working rank becomes `K + B`. Rows `K..K+B` of `H`
/// are one-hot batch indicators and columns `K..K+B` of each basis hold the
/// mean feature profile of the batch in that domain. The first `K`
/// components are uniform random in `[0, 1)`.
///
/// ### Params
///
/// * `domain_1` - First domain (observations x features_1)
/// * `domain_2` - Second domain (observations x features_2)
/// * `k` - Target rank
/// * `batches` - Optional batch codes of the observations
/// * `rng` - The random number generator
///
/// ### Returns
///
/// The `JointFactors` of rank `K + B`.
pub fn batch_aware_random_init<T>(
    domain_1: &DomainMatrix,
    domain_2: &DomainMatrix,
    k: usize,
    batches: Option<&BatchAssignment<T>>,
    rng: &mut StdRng,
) -> Result<JointFactors, NmfError>
where
    T: Eq + Hash + Clone,
{
    let n_obs = domain_1.n_obs();
    let n_batches = batches.map(|b| b.n_batches()).unwrap_or(0);
    let rank = k + n_batches;

    let mut w1 = random_uniform_matrix(domain_1.n_features(), rank, 1.0, rng)?;
    let mut w2 = random_uniform_matrix(domain_2.n_features(), rank, 1.0, rng)?;
    let mut h = random_uniform_matrix(rank, n_obs, 1.0, rng)?;

    if let Some(batches) = batches {
        if batches.codes.len() != n_obs {
            return Err(NmfError::ShapeMismatch {
                context: "batch labels".to_string(),
                expected: n_obs,
                actual: batches.codes.len(),
            });
        }

        for (b, members) in batches.members().iter().enumerate() {
            let mean_1 = domain_1.data.mean_of_rows(members);
            let mean_2 = domain_2.data.mean_of_rows(members);
            for (i, v) in mean_1.iter().enumerate() {
                w1[(i, k + b)] = *v;
            }
            for (i, v) in mean_2.iter().enumerate() {
                w2[(i, k + b)] = *v;
            }
        }

        for j in 0..n_obs {
            for b in 0..n_batches {
                h[(k + b, j)] = if batches.codes[j] == b { 1.0 } else { 0.0 };
            }
        }
    }

    Ok(JointFactors { w1, w2, h })
}

/// Joint initialisation from the two single-domain factorisations
///
/// The shared `H` is the average of both row-normalised coefficient
/// matrices. Each basis column is rescaled by the norm of its coefficient
/// row so that `W_d * H_d` is preserved per domain.
///
/// ### Params
///
/// * `nmf_1` - Single-domain NMF of the first domain
/// * `nmf_2` - Single-domain NMF of the second domain
///
/// ### Returns
///
/// The `JointFactors` of rank K.
pub fn warm_start_init(
    nmf_1: &SingleDomainNmf,
    nmf_2: &SingleDomainNmf,
) -> Result<JointFactors, NmfError> {
    ensure_dims!(
        "warm start coefficients",
        nmf_2.coefficients,
        nmf_1.coefficients.nrows(),
        nmf_1.coefficients.ncols()
    );

    let norms_1 = row_norms(nmf_1.coefficients.as_ref());
    let norms_2 = row_norms(nmf_2.coefficients.as_ref());

    let rescale = |basis: &Mat<f64>, norms: &[f64]| {
        Mat::from_fn(basis.nrows(), basis.ncols(), |i, j| {
            if norms[j] > 0.0 {
                basis[(i, j)] * norms[j]
            } else {
                basis[(i, j)]
            }
        })
    };
    let unit = |v: f64, norm: f64| if norm > 0.0 { v / norm } else { 0.0 };

    let h = Mat::from_fn(
        nmf_1.coefficients.nrows(),
        nmf_1.coefficients.ncols(),
        |i, j| {
            0.5 * (unit(nmf_1.coefficients[(i, j)], norms_1[i])
                + unit(nmf_2.coefficients[(i, j)], norms_2[i]))
        },
    );

    Ok(JointFactors {
        w1: rescale(&nmf_1.basis, &norms_1),
        w2: rescale(&nmf_2.basis, &norms_2),
        h,
    })
}

/// Validate caller-supplied initial factors
///
/// ### Params
///
/// * `factors` - The supplied factors
/// * `n_features_1` - Features of the first (filtered) domain
/// * `n_features_2` - Features of the second (filtered) domain
/// * `n_obs` - Number of observations
/// * `rank` - Expected rank
pub fn validate_factors(
    factors: &JointFactors,
    n_features_1: usize,
    n_features_2: usize,
    n_obs: usize,
    rank: usize,
) -> Result<(), NmfError> {
    ensure_dims!("initial W1", factors.w1, n_features_1, rank);
    ensure_dims!("initial W2", factors.w2, n_features_2, rank);
    ensure_dims!("initial H", factors.h, rank, n_obs);

    for (name, mat) in [("W1", &factors.w1), ("W2", &factors.w2), ("H", &factors.h)] {
        if !all_non_negative(mat.as_ref()) {
            return Err(NmfError::invalid_input(
                &format!("initial {}", name),
                "factor contains negative or non-finite values",
            ));
        }
    }

    Ok(())
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::sparse_structures::CompressedSparseData;
    use faer::mat;
    use rand::SeedableRng;

    fn domain(name: &str, dense: Mat<f64>) -> DomainMatrix {
        let n_features = dense.ncols();
        DomainMatrix {
            name: name.to_string(),
            data: CompressedSparseData::from_dense_csr(dense.as_ref()),
            kept_features: (0..n_features).collect(),
        }
    }

    #[test]
    fn test_batch_assignment() {
        let labels = vec!["b", "a", "b", "c", "a"];
        let batches = BatchAssignment::from_labels(&labels);

        assert_eq!(batches.levels, vec!["b", "a", "c"]);
        assert_eq!(batches.codes, vec![0, 1, 0, 2, 1]);
        assert_eq!(batches.members(), vec![vec![0, 2], vec![1, 4], vec![3]]);
    }

    #[test]
    fn test_random_uniform_matrix() {
        let mut rng = StdRng::seed_from_u64(42);
        let m = random_uniform_matrix(4, 3, 2.0, &mut rng).unwrap();
        assert_eq!(m.shape(), (4, 3));
        for j in 0..3 {
            for i in 0..4 {
                assert!(m[(i, j)] >= 0.0 && m[(i, j)] < 2.0);
            }
        }
    }

    #[test]
    fn test_batch_aware_init() {
        let d1 = domain("atac", mat![[1.0, 0.0], [3.0, 2.0], [5.0, 4.0]]);
        let d2 = domain("rna", mat![[2.0], [0.0], [4.0]]);
        let batches = BatchAssignment::from_labels(&["x", "y", "x"][..]);
        let mut rng = StdRng::seed_from_u64(1);

        let init = batch_aware_random_init(&d1, &d2, 2, Some(&batches), &mut rng).unwrap();

        assert_eq!(init.w1.shape(), (2, 4));
        assert_eq!(init.w2.shape(), (1, 4));
        assert_eq!(init.h.shape(), (4, 3));

        // per-batch means
        assert_eq!(init.w1[(0, 2)], 3.0);
        assert_eq!(init.w1[(1, 2)], 2.0);
        assert_eq!(init.w1[(0, 3)], 3.0);
        assert_eq!(init.w2[(0, 2)], 3.0);
        assert_eq!(init.w2[(0, 3)], 0.0);

        // one-hot indicators
        assert_eq!(init.h[(2, 0)], 1.0);
        assert_eq!(init.h[(3, 0)], 0.0);
        assert_eq!(init.h[(2, 1)], 0.0);
        assert_eq!(init.h[(3, 1)], 1.0);
    }

    #[test]
    fn test_batch_aware_init_without_labels() {
        let d1 = domain("atac", mat![[1.0, 0.0], [3.0, 2.0], [5.0, 4.0]]);
        let d2 = domain("rna", mat![[2.0], [0.0], [4.0]]);
        let mut rng = StdRng::seed_from_u64(1);

        let init =
            batch_aware_random_init::<usize>(&d1, &d2, 2, None, &mut rng).unwrap();
        assert_eq!(init.h.shape(), (2, 3));
        assert!(validate_factors(&init, 2, 1, 3, 2).is_ok());
    }

    #[test]
    fn test_batch_label_length_mismatch() {
        let d1 = domain("atac", mat![[1.0], [3.0], [5.0]]);
        let d2 = domain("rna", mat![[2.0], [0.0], [4.0]]);
        let batches = BatchAssignment::from_labels(&[0_usize, 1][..]);
        let mut rng = StdRng::seed_from_u64(1);

        assert!(matches!(
            batch_aware_random_init(&d1, &d2, 1, Some(&batches), &mut rng),
            Err(NmfError::ShapeMismatch { expected: 3, actual: 2, .. })
        ));
    }

    #[test]
    fn test_warm_start_preserves_reconstruction() {
        let nmf_1 = SingleDomainNmf {
            basis: mat![[1.0, 2.0], [0.5, 0.0]],
            coefficients: mat![[3.0, 4.0, 0.0], [0.0, 1.0, 0.0]],
            loss: 0.0,
            iterations: 1,
        };
        let nmf_2 = SingleDomainNmf {
            basis: mat![[2.0, 1.0]],
            coefficients: mat![[0.0, 0.0, 2.0], [1.0, 0.0, 0.0]],
            loss: 0.0,
            iterations: 1,
        };

        let init = warm_start_init(&nmf_1, &nmf_2).unwrap();

        // W1 column 0 scaled by ||(3, 4, 0)|| = 5
        assert_eq!(init.w1[(0, 0)], 5.0);
        assert_eq!(init.w1[(1, 0)], 2.5);
        assert_eq!(init.w2[(0, 0)], 4.0);

        // H row 0 = 0.5 * ((0.6, 0.8, 0) + (0, 0, 1))
        assert!((init.h[(0, 0)] - 0.3).abs() < 1e-12);
        assert!((init.h[(0, 1)] - 0.4).abs() < 1e-12);
        assert!((init.h[(0, 2)] - 0.5).abs() < 1e-12);
        assert!((init.h[(1, 0)] - 0.5).abs() < 1e-12);
        assert!((init.h[(1, 1)] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_validate_factors() {
        let good = JointFactors {
            w1: mat![[1.0], [1.0]],
            w2: mat![[1.0]],
            h: mat![[1.0, 2.0, 3.0]],
        };
        assert!(validate_factors(&good, 2, 1, 3, 1).is_ok());
        assert!(matches!(
            validate_factors(&good, 3, 1, 3, 1),
            Err(NmfError::ShapeMismatch { .. })
        ));

        let negative = JointFactors {
            h: mat![[1.0, -2.0, 3.0]],
            ..good
        };
        assert!(matches!(
            validate_factors(&negative, 2, 1, 3, 1),
            Err(NmfError::InvalidInput { .. })
        ));
    }
}
