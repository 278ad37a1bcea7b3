use faer::{Mat, MatRef};
use rayon::prelude::*;

use crate::core::error::NmfError;

//////////////////////////////
// Sparse format conversion //
//////////////////////////////

/// Type to describe the CompressedSparseFormat
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompressedSparseFormat {
    /// CSC-formatted data
    Csc,
    /// CSR-formatted data
    Csr,
}

/// Compressed sparse matrix
///
/// ### Fields
///
/// * `data` - The non-zero values.
/// * `indices` - Column indices (CSR) or row indices (CSC) of the values.
/// * `indptr` - Row pointers (CSR) or column pointers (CSC).
/// * `cs_type` - Which of the two layouts is stored.
/// * `shape` - `(nrow, ncol)` of the matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedSparseData<T>
where
    T: Clone + Default,
{
    pub data: Vec<T>,
    pub indices: Vec<usize>,
    pub indptr: Vec<usize>,
    pub cs_type: CompressedSparseFormat,
    pub shape: (usize, usize),
}

impl<T> CompressedSparseData<T>
where
    T: Clone + Default,
{
    /// Generate a new CSC version of the matrix
    ///
    /// ### Params
    ///
    /// * `data` - The underlying data
    /// * `indices` - The index positions (in this case row indices)
    /// * `indptr` - The index pointer (in this case the column index pointers)
    /// * `shape` - `(nrow, ncol)`
    pub fn new_csc(data: &[T], indices: &[usize], indptr: &[usize], shape: (usize, usize)) -> Self {
        Self {
            data: data.to_vec(),
            indices: indices.to_vec(),
            indptr: indptr.to_vec(),
            cs_type: CompressedSparseFormat::Csc,
            shape,
        }
    }

    /// Generate a new CSR version of the matrix
    ///
    /// ### Params
    ///
    /// * `data` - The underlying data
    /// * `indices` - The index positions (in this case column indices)
    /// * `indptr` - The index pointer (in this case the row index pointers)
    /// * `shape` - `(nrow, ncol)`
    pub fn new_csr(data: &[T], indices: &[usize], indptr: &[usize], shape: (usize, usize)) -> Self {
        Self {
            data: data.to_vec(),
            indices: indices.to_vec(),
            indptr: indptr.to_vec(),
            cs_type: CompressedSparseFormat::Csr,
            shape,
        }
    }

    /// Transform from CSC to CSR or vice versa
    ///
    /// ### Returns
    ///
    /// The transformed version (same logical matrix, other layout)
    pub fn transform(self) -> Self {
        match self.cs_type {
            CompressedSparseFormat::Csc => csc_to_csr(self),
            CompressedSparseFormat::Csr => csr_to_csc(self),
        }
    }

    /// Return the data in CSR layout, converting if needed
    pub fn into_csr(self) -> Self {
        match self.cs_type {
            CompressedSparseFormat::Csr => self,
            CompressedSparseFormat::Csc => csc_to_csr(self),
        }
    }

    /// Returns the shape of the matrix
    ///
    /// ### Returns
    ///
    /// A tuple of `(nrow, ncol)`
    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    /// Number of rows
    pub fn nrows(&self) -> usize {
        self.shape.0
    }

    /// Number of columns
    pub fn ncols(&self) -> usize {
        self.shape.1
    }

    /// Returns the NNZ
    ///
    /// ### Returns
    ///
    /// The number of stored values
    pub fn get_nnz(&self) -> usize {
        self.data.len()
    }

    /// Check the structural integrity of the compressed arrays
    ///
    /// ### Returns
    ///
    /// `Ok(())` if pointers are monotone, of the right length and all indices
    /// are within bounds.
    pub fn validate(&self) -> Result<(), NmfError> {
        let (n_major, n_minor) = match self.cs_type {
            CompressedSparseFormat::Csr => (self.shape.0, self.shape.1),
            CompressedSparseFormat::Csc => (self.shape.1, self.shape.0),
        };

        if self.indptr.len() != n_major + 1 {
            return Err(NmfError::ShapeMismatch {
                context: "index pointer length".to_string(),
                expected: n_major + 1,
                actual: self.indptr.len(),
            });
        }
        if self.data.len() != self.indices.len() {
            return Err(NmfError::ShapeMismatch {
                context: "indices length".to_string(),
                expected: self.data.len(),
                actual: self.indices.len(),
            });
        }
        if self.indptr[0] != 0 || self.indptr[n_major] != self.data.len() {
            return Err(NmfError::invalid_input(
                "compressed sparse data",
                "index pointer must start at 0 and end at nnz",
            ));
        }
        if self.indptr.windows(2).any(|w| w[0] > w[1]) {
            return Err(NmfError::invalid_input(
                "compressed sparse data",
                "index pointer is not monotonically increasing",
            ));
        }
        if let Some(&bad) = self.indices.iter().find(|&&idx| idx >= n_minor) {
            return Err(NmfError::invalid_input(
                "compressed sparse data",
                format!("index {} out of bounds for dimension {}", bad, n_minor),
            ));
        }

        Ok(())
    }
}

/// Transforms a CompressedSparseData that is CSC to CSR
///
/// ### Params
///
/// * `sparse_data` - The CompressedSparseData you want to transform
pub fn csc_to_csr<T>(sparse_data: CompressedSparseData<T>) -> CompressedSparseData<T>
where
    T: Clone + Default,
{
    let (nrow, _) = sparse_data.shape();
    let nnz = sparse_data.get_nnz();
    let mut row_ptr = vec![0; nrow + 1];

    for &r in &sparse_data.indices {
        row_ptr[r + 1] += 1;
    }

    for i in 0..nrow {
        row_ptr[i + 1] += row_ptr[i];
    }

    let mut csr_data = vec![T::default(); nnz];
    let mut csr_col_ind = vec![0; nnz];
    let mut next = row_ptr[..nrow].to_vec();

    for col in 0..(sparse_data.indptr.len() - 1) {
        for idx in sparse_data.indptr[col]..sparse_data.indptr[col + 1] {
            let row = sparse_data.indices[idx];
            let pos = next[row];

            csr_data[pos] = sparse_data.data[idx].clone();
            csr_col_ind[pos] = col;

            next[row] += 1;
        }
    }

    CompressedSparseData {
        data: csr_data,
        indices: csr_col_ind,
        indptr: row_ptr,
        cs_type: CompressedSparseFormat::Csr,
        shape: sparse_data.shape(),
    }
}

/// Transform CSR stored data into CSC stored data
///
/// ### Params
///
/// * `sparse_data` - The CompressedSparseData in CSR format.
///
/// ### Returns
///
/// The same matrix in CSC format
pub fn csr_to_csc<T>(sparse_data: CompressedSparseData<T>) -> CompressedSparseData<T>
where
    T: Clone + Default,
{
    let nnz = sparse_data.get_nnz();
    let (_, ncol) = sparse_data.shape();
    let mut col_ptr = vec![0; ncol + 1];

    for &c in &sparse_data.indices {
        col_ptr[c + 1] += 1;
    }

    for i in 0..ncol {
        col_ptr[i + 1] += col_ptr[i];
    }

    let mut csc_data = vec![T::default(); nnz];
    let mut csc_row_ind = vec![0; nnz];
    let mut next = col_ptr[..ncol].to_vec();

    for row in 0..(sparse_data.indptr.len() - 1) {
        for idx in sparse_data.indptr[row]..sparse_data.indptr[row + 1] {
            let col = sparse_data.indices[idx];
            let pos = next[col];

            csc_data[pos] = sparse_data.data[idx].clone();
            csc_row_ind[pos] = row;

            next[col] += 1;
        }
    }

    CompressedSparseData {
        data: csc_data,
        indices: csc_row_ind,
        indptr: col_ptr,
        cs_type: CompressedSparseFormat::Csc,
        shape: sparse_data.shape(),
    }
}

//////////////////////
// Numerical kernels //
//////////////////////

impl CompressedSparseData<f64> {
    /// Convert a dense faer matrix into CSR format
    ///
    /// ### Params
    ///
    /// * `dense` - The dense matrix. Exact zeroes are not stored.
    pub fn from_dense_csr(dense: MatRef<f64>) -> Self {
        let (nrow, ncol) = dense.shape();

        let mut data = Vec::new();
        let mut indices = Vec::new();
        let mut indptr = Vec::with_capacity(nrow + 1);
        indptr.push(0_usize);

        for row in 0..nrow {
            for col in 0..ncol {
                let value = dense[(row, col)];
                if value != 0.0 {
                    data.push(value);
                    indices.push(col);
                }
            }
            indptr.push(data.len());
        }

        Self {
            data,
            indices,
            indptr,
            cs_type: CompressedSparseFormat::Csr,
            shape: (nrow, ncol),
        }
    }

    /// To a dense faer matrix
    pub fn to_dense(&self) -> Mat<f64> {
        let mut dense = Mat::zeros(self.shape.0, self.shape.1);

        for major in 0..(self.indptr.len() - 1) {
            for idx in self.indptr[major]..self.indptr[major + 1] {
                let minor = self.indices[idx];
                match self.cs_type {
                    CompressedSparseFormat::Csr => dense[(major, minor)] = self.data[idx],
                    CompressedSparseFormat::Csc => dense[(minor, major)] = self.data[idx],
                }
            }
        }

        dense
    }

    /// Sum of the squared stored values, i.e., the squared Frobenius norm
    pub fn frobenius_sq(&self) -> f64 {
        self.data.iter().map(|v| v * v).sum()
    }

    /// Are all stored values finite and non-negative
    pub fn is_non_negative(&self) -> bool {
        self.data.iter().all(|v| v.is_finite() && *v >= 0.0)
    }

    /// Count the non-zero entries per column of a CSR matrix
    ///
    /// Explicitly stored zeroes are not counted.
    ///
    /// ### Returns
    ///
    /// Vector of length `ncol` with the support of every column.
    pub fn column_support(&self) -> Vec<usize> {
        debug_assert_eq!(self.cs_type, CompressedSparseFormat::Csr);
        let mut counts = vec![0_usize; self.shape.1];
        for (&col, &value) in self.indices.iter().zip(self.data.iter()) {
            if value != 0.0 {
                counts[col] += 1;
            }
        }
        counts
    }

    /// Keep a subset of columns of a CSR matrix
    ///
    /// ### Params
    ///
    /// * `keep` - Strictly increasing column indices to retain.
    ///
    /// ### Returns
    ///
    /// CSR matrix with `nrow` unchanged and `keep.len()` columns. Row order is
    /// preserved and the columns are renumbered in the order of `keep`.
    pub fn select_columns(&self, keep: &[usize]) -> Self {
        debug_assert_eq!(self.cs_type, CompressedSparseFormat::Csr);
        let mut remap = vec![usize::MAX; self.shape.1];
        for (new_idx, &old_idx) in keep.iter().enumerate() {
            remap[old_idx] = new_idx;
        }

        let mut data = Vec::with_capacity(self.data.len());
        let mut indices = Vec::with_capacity(self.indices.len());
        let mut indptr = Vec::with_capacity(self.shape.0 + 1);
        indptr.push(0_usize);

        for row in 0..self.shape.0 {
            for idx in self.indptr[row]..self.indptr[row + 1] {
                let new_col = remap[self.indices[idx]];
                if new_col != usize::MAX {
                    data.push(self.data[idx]);
                    indices.push(new_col);
                }
            }
            indptr.push(data.len());
        }

        Self {
            data,
            indices,
            indptr,
            cs_type: CompressedSparseFormat::Csr,
            shape: (self.shape.0, keep.len()),
        }
    }

    /// Densify a block of rows of a CSR matrix in transposed orientation
    ///
    /// With rows being observations and columns features, this yields the
    /// `features x batch` block the joint solver works on.
    ///
    /// ### Params
    ///
    /// * `rows` - Row indices making up the block.
    ///
    /// ### Returns
    ///
    /// Dense matrix of shape `ncol x rows.len()`.
    pub fn dense_rows_transposed(&self, rows: &[usize]) -> Mat<f64> {
        debug_assert_eq!(self.cs_type, CompressedSparseFormat::Csr);
        let mut block = Mat::zeros(self.shape.1, rows.len());
        for (j, &row) in rows.iter().enumerate() {
            for idx in self.indptr[row]..self.indptr[row + 1] {
                block[(self.indices[idx], j)] = self.data[idx];
            }
        }
        block
    }

    /// Sparse-dense product `D * M` for a CSR matrix `D`
    ///
    /// ### Params
    ///
    /// * `m` - Dense matrix of shape `ncol x k`
    ///
    /// ### Returns
    ///
    /// Dense matrix of shape `nrow x k`
    pub fn matmul_dense(&self, m: MatRef<f64>) -> Mat<f64> {
        debug_assert_eq!(self.cs_type, CompressedSparseFormat::Csr);
        debug_assert_eq!(self.shape.1, m.nrows());
        let k = m.ncols();

        let rows: Vec<Vec<f64>> = (0..self.shape.0)
            .into_par_iter()
            .map(|row| {
                let mut acc = vec![0.0; k];
                for idx in self.indptr[row]..self.indptr[row + 1] {
                    let col = self.indices[idx];
                    let value = self.data[idx];
                    for (c, a) in acc.iter_mut().enumerate() {
                        *a += value * m[(col, c)];
                    }
                }
                acc
            })
            .collect();

        Mat::from_fn(self.shape.0, k, |i, j| rows[i][j])
    }

    /// Sparse-dense product `Dᵗ * M` for a CSR matrix `D`
    ///
    /// ### Params
    ///
    /// * `m` - Dense matrix of shape `nrow x k`
    ///
    /// ### Returns
    ///
    /// Dense matrix of shape `ncol x k`
    pub fn t_matmul_dense(&self, m: MatRef<f64>) -> Mat<f64> {
        debug_assert_eq!(self.cs_type, CompressedSparseFormat::Csr);
        debug_assert_eq!(self.shape.0, m.nrows());
        let k = m.ncols();

        let mut res = Mat::zeros(self.shape.1, k);
        for row in 0..self.shape.0 {
            for idx in self.indptr[row]..self.indptr[row + 1] {
                let col = self.indices[idx];
                let value = self.data[idx];
                for c in 0..k {
                    res[(col, c)] += value * m[(row, c)];
                }
            }
        }
        res
    }

    /// Mean of a set of rows of a CSR matrix
    ///
    /// ### Params
    ///
    /// * `rows` - Row indices to average over.
    ///
    /// ### Returns
    ///
    /// Vector of length `ncol` with the column means over `rows`.
    pub fn mean_of_rows(&self, rows: &[usize]) -> Vec<f64> {
        debug_assert_eq!(self.cs_type, CompressedSparseFormat::Csr);
        let mut means = vec![0.0; self.shape.1];
        if rows.is_empty() {
            return means;
        }
        for &row in rows {
            for idx in self.indptr[row]..self.indptr[row + 1] {
                means[self.indices[idx]] += self.data[idx];
            }
        }
        let n = rows.len() as f64;
        means.iter_mut().for_each(|m| *m /= n);
        means
    }
}

///////////
// Tests //
///////////
