use tracing::{debug, warn};

use crate::core::data::sparse_structures::CompressedSparseData;
use crate::core::error::NmfError;

////////////////
// Structures //
////////////////

/// One data domain of the coupled factorisation
///
/// ### Fields
///
/// * `name` - Name of the domain (used in errors and logs).
/// * `data` - Filtered observations x features matrix in CSR layout.
/// * `kept_features` - Strictly increasing indices of the retained features
///   with respect to the unfiltered input.
#[derive(Debug, Clone)]
pub struct DomainMatrix {
    pub name: String,
    pub data: CompressedSparseData<f64>,
    pub kept_features: Vec<usize>,
}

impl DomainMatrix {
    /// Number of observations
    pub fn n_obs(&self) -> usize {
        self.data.nrows()
    }

    /// Number of retained features
    pub fn n_features(&self) -> usize {
        self.data.ncols()
    }
}

/////////////
// Helpers //
/////////////

/// Validate a single domain matrix
///
/// ### Params
///
/// * `name` - Name of the domain
/// * `matrix` - Observations x features matrix (CSR or CSC)
///
/// ### Returns
///
/// `Ok(())` if the compressed structure is sound and all values are finite
/// and non-negative.
pub fn validate_domain(name: &str, matrix: &CompressedSparseData<f64>) -> Result<(), NmfError> {
    matrix.validate()?;
    if matrix.nrows() == 0 {
        return Err(NmfError::ShapeMismatch {
            context: format!("observations of domain '{}'", name),
            expected: 1,
            actual: 0,
        });
    }
    if !matrix.is_non_negative() {
        return Err(NmfError::invalid_input(
            name,
            "matrix contains negative or non-finite values",
        ));
    }
    Ok(())
}

/// Check that both domains share the observation axis
pub fn validate_pair(
    matrix_1: &CompressedSparseData<f64>,
    matrix_2: &CompressedSparseData<f64>,
) -> Result<(), NmfError> {
    if matrix_1.nrows() == 0 || matrix_2.nrows() == 0 {
        return Err(NmfError::ShapeMismatch {
            context: "observations".to_string(),
            expected: matrix_1.nrows().max(matrix_2.nrows()).max(1),
            actual: 0,
        });
    }
    if matrix_1.nrows() != matrix_2.nrows() {
        return Err(NmfError::ShapeMismatch {
            context: "observations shared by both domains".to_string(),
            expected: matrix_1.nrows(),
            actual: matrix_2.nrows(),
        });
    }
    Ok(())
}

//////////////////////
// Support filtering //
//////////////////////

/// Drop features with low support
///
/// A feature is kept if it is non-zero in at least
/// `cutoff * n_observations` observations.
///
/// ### Params
///
/// * `matrix` - Observations x features matrix in CSR layout
/// * `cutoff` - Minimum fraction of observations a feature needs to be
///   present in
///
/// ### Returns
///
/// Tuple of the filtered matrix and the strictly increasing indices of the
/// kept features.
pub fn filter_features(
    matrix: &CompressedSparseData<f64>,
    cutoff: f64,
) -> (CompressedSparseData<f64>, Vec<usize>) {
    let min_support = cutoff * matrix.nrows() as f64;

    let kept: Vec<usize> = matrix
        .column_support()
        .iter()
        .enumerate()
        .filter_map(|(i, &support)| {
            if support as f64 >= min_support {
                Some(i)
            } else {
                None
            }
        })
        .collect();

    (matrix.select_columns(&kept), kept)
}

/// Validate, filter and wrap one domain
///
/// ### Params
///
/// * `name` - Name of the domain
/// * `matrix` - Observations x features matrix (CSR or CSC)
/// * `feature_cutperc` - Support filter fraction
///
/// ### Returns
///
/// The filtered `DomainMatrix` or `EmptyFeatureSet` if nothing survives.
pub fn prepare_domain(
    name: &str,
    matrix: &CompressedSparseData<f64>,
    feature_cutperc: f64,
) -> Result<DomainMatrix, NmfError> {
    if !feature_cutperc.is_finite() || feature_cutperc < 0.0 {
        return Err(NmfError::invalid_param(
            "feature_cutperc",
            format!("must be finite and >= 0, got {}", feature_cutperc),
        ));
    }
    validate_domain(name, matrix)?;

    let csr = matrix.clone().into_csr();
    let n_before = csr.ncols();
    let (data, kept_features) = filter_features(&csr, feature_cutperc);

    if kept_features.is_empty() {
        return Err(NmfError::EmptyFeatureSet {
            domain: name.to_string(),
        });
    }

    debug!(
        domain = name,
        kept = kept_features.len(),
        total = n_before,
        "feature support filter applied"
    );
    if kept_features.len() * 2 < n_before {
        warn!(
            domain = name,
            "support filter removed {} of {} features",
            n_before - kept_features.len(),
            n_before
        );
    }

    Ok(DomainMatrix {
        name: name.to_string(),
        data,
        kept_features,
    })
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use faer::mat;

    fn small_matrix() -> CompressedSparseData<f64> {
        // 4 observations, 4 features; supports are 4, 1, 0, 2
        let dense = mat![
            [1.0, 0.0, 0.0, 2.0],
            [1.0, 3.0, 0.0, 0.0],
            [2.0, 0.0, 0.0, 1.0],
            [5.0, 0.0, 0.0, 0.0],
        ];
        CompressedSparseData::from_dense_csr(dense.as_ref())
    }

    #[test]
    fn test_filter_keeps_increasing_indices() {
        let m = small_matrix();
        let (filtered, kept) = filter_features(&m, 0.5);

        assert_eq!(kept, vec![0, 3]);
        assert_eq!(filtered.shape(), (4, 2));
        assert_eq!(
            filtered.to_dense(),
            mat![[1.0, 2.0], [1.0, 0.0], [2.0, 1.0], [5.0, 0.0]]
        );
    }

    #[test]
    fn test_filter_zero_cutoff_keeps_everything() {
        let m = small_matrix();
        let (filtered, kept) = filter_features(&m, 0.0);

        assert_eq!(kept, vec![0, 1, 2, 3]);
        assert_eq!(filtered.to_dense(), m.to_dense());
    }

    #[test]
    fn test_prepare_domain_empty_feature_set() {
        let m = small_matrix();
        let res = prepare_domain("rna", &m, 1.5);
        assert_eq!(
            res.unwrap_err(),
            NmfError::EmptyFeatureSet {
                domain: "rna".to_string()
            }
        );
    }

    #[test]
    fn test_prepare_domain_accepts_csc() {
        let m = small_matrix();
        let csc = m.clone().transform();
        let domain = prepare_domain("atac", &csc, 0.25).unwrap();

        assert_eq!(domain.kept_features, vec![0, 1, 3]);
        assert_eq!(domain.n_obs(), 4);
        assert_eq!(domain.n_features(), 3);
    }

    #[test]
    fn test_prepare_domain_rejects_bad_input() {
        let negative = CompressedSparseData::from_dense_csr(mat![[1.0, -1.0]].as_ref());
        assert!(matches!(
            prepare_domain("rna", &negative, 0.0),
            Err(NmfError::InvalidInput { .. })
        ));

        let m = small_matrix();
        assert!(matches!(
            prepare_domain("rna", &m, -0.1),
            Err(NmfError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_validate_pair() {
        let m1 = small_matrix();
        let m2 = CompressedSparseData::from_dense_csr(mat![[1.0], [2.0], [3.0]].as_ref());
        assert!(matches!(
            validate_pair(&m1, &m2),
            Err(NmfError::ShapeMismatch {
                expected: 4,
                actual: 3,
                ..
            })
        ));

        let empty = CompressedSparseData::<f64>::new_csr(&[], &[], &[0], (0, 3));
        assert!(matches!(
            validate_pair(&m1, &empty),
            Err(NmfError::ShapeMismatch { actual: 0, .. })
        ));
        assert!(validate_pair(&m1, &m1).is_ok());
    }
}
