//! Sparse matrix helpers over `faer`'s compressed-column storage.
//!
//! Every matrix here is observation-major in its rows: the incidence operator
//! is `n_obs x n_groups` with a single `1.0` per row, and the scale-model
//! derivative matrix is `n_obs x n_params`. Products are written as explicit
//! loops over `col_ptr`/`row_idx` so nothing dense is ever materialized.

use faer::sparse::{SparseColMat, Triplet};
use nalgebra::{DMatrix, DVector};

use crate::error::{ScaleError, ScaleResult};

pub type SparseMatrix = SparseColMat<usize, f64>;

/// Build a CSC matrix from `(row, col, value)` triplets. Duplicates are summed.
pub fn from_triplets(
    nrows: usize,
    ncols: usize,
    triplets: &[Triplet<usize, usize, f64>],
) -> ScaleResult<SparseMatrix> {
    SparseColMat::try_new_from_triplets(nrows, ncols, triplets).map_err(|_| {
        ScaleError::invalid(format!(
            "failed to assemble a {nrows}x{ncols} sparse matrix from {} entries",
            triplets.len()
        ))
    })
}

/// An `nrows x ncols` matrix with no stored entries.
pub fn zeros(nrows: usize, ncols: usize) -> ScaleResult<SparseMatrix> {
    from_triplets(nrows, ncols, &[])
}

/// Observation-to-group incidence operator (`n_obs x n_groups`).
pub fn incidence_matrix(group_of: &[usize], n_groups: usize) -> ScaleResult<SparseMatrix> {
    let triplets: Vec<_> = group_of
        .iter()
        .enumerate()
        .map(|(row, &group)| Triplet::new(row, group, 1.0))
        .collect();
    from_triplets(group_of.len(), n_groups, &triplets)
}

/// Stored `(row, value)` pairs of one column.
pub fn column(matrix: &SparseMatrix, col: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
    let (symbolic, values) = matrix.parts();
    let col_ptr = symbolic.col_ptr();
    let row_idx = symbolic.row_idx();
    let range = col_ptr[col]..col_ptr[col + 1];
    row_idx[range.clone()]
        .iter()
        .copied()
        .zip(values[range].iter().copied())
}

pub fn transpose(matrix: &SparseMatrix) -> ScaleResult<SparseMatrix> {
    let mut triplets = Vec::with_capacity(nnz(matrix));
    for col in 0..matrix.ncols() {
        for (row, value) in column(matrix, col) {
            triplets.push(Triplet::new(col, row, value));
        }
    }
    from_triplets(matrix.ncols(), matrix.nrows(), &triplets)
}

pub fn nnz(matrix: &SparseMatrix) -> usize {
    let (_, values) = matrix.parts();
    values.len()
}

/// `matrix * vector`.
#[cfg(test)]
pub fn mul_vec(matrix: &SparseMatrix, vector: &DVector<f64>) -> DVector<f64> {
    debug_assert_eq!(matrix.ncols(), vector.len());
    let mut out = DVector::<f64>::zeros(matrix.nrows());
    for col in 0..matrix.ncols() {
        let x = vector[col];
        if x == 0.0 {
            continue;
        }
        for (row, value) in column(matrix, col) {
            out[row] += value * x;
        }
    }
    out
}

/// `matrix^T * vector`, i.e. one dot product per column.
pub fn tr_mul_vec(matrix: &SparseMatrix, vector: &DVector<f64>) -> DVector<f64> {
    debug_assert_eq!(matrix.nrows(), vector.len());
    DVector::from_iterator(
        matrix.ncols(),
        (0..matrix.ncols()).map(|col| {
            column(matrix, col)
                .map(|(row, value)| value * vector[row])
                .sum::<f64>()
        }),
    )
}

/// Scale row `i` of `matrix` by `factors[i]`.
#[cfg(test)]
pub fn row_multiply(matrix: &SparseMatrix, factors: &DVector<f64>) -> ScaleResult<SparseMatrix> {
    if factors.len() != matrix.nrows() {
        return Err(ScaleError::invalid(format!(
            "row factors have length {}, matrix has {} rows",
            factors.len(),
            matrix.nrows()
        )));
    }
    let mut triplets = Vec::with_capacity(nnz(matrix));
    for col in 0..matrix.ncols() {
        for (row, value) in column(matrix, col) {
            triplets.push(Triplet::new(row, col, value * factors[row]));
        }
    }
    from_triplets(matrix.nrows(), matrix.ncols(), &triplets)
}

pub fn to_dense(matrix: &SparseMatrix) -> DMatrix<f64> {
    let mut dense = DMatrix::<f64>::zeros(matrix.nrows(), matrix.ncols());
    for col in 0..matrix.ncols() {
        for (row, value) in column(matrix, col) {
            dense[(row, col)] += value;
        }
    }
    dense
}
