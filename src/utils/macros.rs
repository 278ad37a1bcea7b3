///////////////////
// Matrix macros //
///////////////////

/// Early return with `NmfError::ShapeMismatch` if two matrices differ in rows.
#[macro_export]
macro_rules! ensure_nrows {
    ($context:expr, $matrix1:expr, $matrix2:expr) => {
        if $matrix1.nrows() != $matrix2.nrows() {
            return Err($crate::core::error::NmfError::ShapeMismatch {
                context: $context.to_string(),
                expected: $matrix1.nrows(),
                actual: $matrix2.nrows(),
            });
        }
    };
}

/// Early return with `NmfError::ShapeMismatch` if a matrix does not have the
/// expected dimensions.
#[macro_export]
macro_rules! ensure_dims {
    ($context:expr, $matrix:expr, $nrow:expr, $ncol:expr) => {
        if $matrix.nrows() != $nrow {
            return Err($crate::core::error::NmfError::ShapeMismatch {
                context: format!("{} (rows)", $context),
                expected: $nrow,
                actual: $matrix.nrows(),
            });
        }
        if $matrix.ncols() != $ncol {
            return Err($crate::core::error::NmfError::ShapeMismatch {
                context: format!("{} (columns)", $context),
                expected: $ncol,
                actual: $matrix.ncols(),
            });
        }
    };
}

/// Early return with `NmfError::NumericalInstability` if a factor matrix
/// carries any non-finite entry.
#[macro_export]
macro_rules! ensure_finite {
    ($matrix:expr, $iteration:expr, $factor:expr) => {
        if !$crate::core::base::utils::all_finite($matrix.as_ref()) {
            return Err($crate::core::error::NmfError::NumericalInstability {
                iteration: $iteration,
                factor: $factor.to_string(),
            });
        }
    };
}
