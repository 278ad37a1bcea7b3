use faer::{Mat, MatRef};
use rayon::prelude::*;

/// Denominator floor of the multiplicative updates (machine epsilon of f64)
pub const EPS: f64 = f64::EPSILON;

///////////
// Enums //
///////////

/// Normalisation of the joint embedding
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EmbeddingNorm {
    /// Every observation (row) scaled to unit L2 norm
    L2,
    /// Every component (column) centred and scaled to unit variance
    ZScore,
}

/// Parsing the embedding normalisation
///
/// ### Params
///
/// * `s` - string defining the normalisation
///
/// ### Returns
///
/// The `EmbeddingNorm`.
pub fn parse_embedding_norm(s: &str) -> Option<EmbeddingNorm> {
    match s.to_lowercase().as_str() {
        "l2" => Some(EmbeddingNorm::L2),
        "zscore" | "z_score" => Some(EmbeddingNorm::ZScore),
        _ => None,
    }
}

////////////
// Checks //
////////////

/// Are all values in the matrix finite
pub fn all_finite(mat: MatRef<f64>) -> bool {
    (0..mat.ncols()).all(|j| (0..mat.nrows()).all(|i| mat[(i, j)].is_finite()))
}

/// Are all values in the matrix finite and non-negative
pub fn all_non_negative(mat: MatRef<f64>) -> bool {
    (0..mat.ncols()).all(|j| {
        (0..mat.nrows()).all(|i| {
            let v = mat[(i, j)];
            v.is_finite() && v >= 0.0
        })
    })
}

//////////////////////
// Dense arithmetic //
//////////////////////

/// Squared Frobenius norm of a matrix
pub fn frobenius_sq(mat: MatRef<f64>) -> f64 {
    let mut total = 0.0;
    for j in 0..mat.ncols() {
        for i in 0..mat.nrows() {
            let v = mat[(i, j)];
            total += v * v;
        }
    }
    total
}

/// Squared Frobenius norm of the residual `a - b * c`
///
/// ### Params
///
/// * `a` - The target matrix
/// * `b` - Left factor
/// * `c` - Right factor
///
/// ### Returns
///
/// `||a - bc||²`
pub fn residual_sq(a: MatRef<f64>, b: MatRef<f64>, c: MatRef<f64>) -> f64 {
    let approx = b * c;
    let diff = Mat::from_fn(a.nrows(), a.ncols(), |i, j| a[(i, j)] - approx[(i, j)]);
    frobenius_sq(diff.as_ref())
}

/// In-place multiplicative update
///
/// Applies `x <- x * numer / (denom + EPS)` element-wise.
///
/// ### Params
///
/// * `x` - The factor to update
/// * `numer` - Numerator of the update (same shape as `x`)
/// * `denom` - Denominator of the update (same shape as `x`)
pub fn multiplicative_update(x: &mut Mat<f64>, numer: MatRef<f64>, denom: MatRef<f64>) {
    for j in 0..x.ncols() {
        for i in 0..x.nrows() {
            x[(i, j)] *= numer[(i, j)] / (denom[(i, j)] + EPS);
        }
    }
}

/// L2 norms of the rows of a matrix
pub fn row_norms(mat: MatRef<f64>) -> Vec<f64> {
    (0..mat.nrows())
        .map(|i| {
            (0..mat.ncols())
                .map(|j| mat[(i, j)] * mat[(i, j)])
                .sum::<f64>()
                .sqrt()
        })
        .collect()
}

/// Select a subset of columns into a new matrix
///
/// ### Params
///
/// * `mat` - The source matrix
/// * `indices` - Column indices to select, in the order they should appear
///
/// ### Returns
///
/// Matrix of shape `mat.nrows() x indices.len()`
pub fn select_columns(mat: MatRef<f64>, indices: &[usize]) -> Mat<f64> {
    Mat::from_fn(mat.nrows(), indices.len(), |i, j| mat[(i, indices[j])])
}

/// Write the columns of `src` back into `target` at the given positions
pub fn scatter_columns(target: &mut Mat<f64>, src: MatRef<f64>, indices: &[usize]) {
    for (j, &col) in indices.iter().enumerate() {
        for i in 0..src.nrows() {
            target[(i, col)] = src[(i, j)];
        }
    }
}

/// Keep only the first `n` columns of a matrix
pub fn first_columns(mat: MatRef<f64>, n: usize) -> Mat<f64> {
    Mat::from_fn(mat.nrows(), n, |i, j| mat[(i, j)])
}

/// Keep only the first `n` rows of a matrix
pub fn first_rows(mat: MatRef<f64>, n: usize) -> Mat<f64> {
    Mat::from_fn(n, mat.ncols(), |i, j| mat[(i, j)])
}

///////////////
// Embedding //
///////////////

/// Scale a matrix column-wise
///
/// Columns with a standard deviation below `1e-10` are only centred.
///
/// ### Params
///
/// * `mat` - The matrix on which to apply column-wise scaling
/// * `scale_sd` - Shall the standard deviation be equalised across columns
///
/// ### Returns
///
/// The scaled matrix.
pub fn scale_matrix_col(mat: MatRef<f64>, scale_sd: bool) -> Mat<f64> {
    let (n_rows, n_cols) = mat.shape();

    let stats: Vec<(f64, f64)> = (0..n_cols)
        .into_par_iter()
        .map(|j| {
            let mean = (0..n_rows).map(|i| mat[(i, j)]).sum::<f64>() / n_rows as f64;
            if !scale_sd || n_rows < 2 {
                return (mean, 1.0);
            }
            let var = (0..n_rows)
                .map(|i| (mat[(i, j)] - mean).powi(2))
                .sum::<f64>()
                / (n_rows as f64 - 1.0);
            let sd = var.sqrt();
            (mean, if sd < 1e-10 { 1.0 } else { sd })
        })
        .collect();

    Mat::from_fn(n_rows, n_cols, |i, j| (mat[(i, j)] - stats[j].0) / stats[j].1)
}

/// Normalise every row to unit L2 norm
///
/// Rows with zero norm are returned unchanged.
pub fn l2_normalise_rows(mat: MatRef<f64>) -> Mat<f64> {
    let norms = row_norms(mat);
    Mat::from_fn(mat.nrows(), mat.ncols(), |i, j| {
        if norms[i] > 0.0 {
            mat[(i, j)] / norms[i]
        } else {
            mat[(i, j)]
        }
    })
}

/// Apply the requested normalisation to an embedding (observations x K)
pub fn normalise_embedding(embedding: MatRef<f64>, norm: EmbeddingNorm) -> Mat<f64> {
    match norm {
        EmbeddingNorm::L2 => l2_normalise_rows(embedding),
        EmbeddingNorm::ZScore => scale_matrix_col(embedding, true),
    }
}

///////////
// Tests //
///////////
