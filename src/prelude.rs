#![allow(non_snake_case)]

use nalgebra_sparse::{coo::CooMatrix, CscMatrix};

pub use itertools::{izip, Itertools};

//------------------------------------------------------------------------------
// Types
//------------------------------------------------------------------------------

/// Matrix (DOFs x DOFs)
pub type MatrixD = nalgebra::DMatrix<f64>;

/// Matrix (DOFs x Modes)
pub type MatrixDxM = nalgebra::DMatrix<f64>;

/// Column vector (Degrees of Freedom)
pub type VectorD = nalgebra::DVector<f64>;

/// Sparse symmetric matrix (DOFs x DOFs), compressed sparse column
pub type SparseMatrix = CscMatrix<f64>;

//------------------------------------------------------------------------------
// Sparse construction
//------------------------------------------------------------------------------

/// Sparse copy of a dense matrix, dropping exact zeros.
pub fn sparse_from_dense(A: &MatrixD) -> SparseMatrix {
    let mut coo = CooMatrix::new(A.nrows(), A.ncols());
    for j in 0..A.ncols() {
        for i in 0..A.nrows() {
            let v = A[(i, j)];
            if v != 0. {
                coo.push(i, j, v);
            }
        }
    }
    SparseMatrix::from(&coo)
}

/// Sparse diagonal matrix
pub fn sparse_diagonal(d: &[f64]) -> SparseMatrix {
    let mut coo = CooMatrix::new(d.len(), d.len());
    for (i, &v) in d.iter().enumerate() {
        coo.push(i, i, v);
    }
    SparseMatrix::from(&coo)
}

/// Linear combination `sum(c_i * A_i)` of equally sized sparse matrices.
///
/// Entries of every term are kept even when a coefficient is zero, so the
/// result always carries the union pattern of the terms.
pub fn sparse_combination(terms: &[(f64, &SparseMatrix)]) -> SparseMatrix {
    let (nrows, ncols) = terms
        .first()
        .map(|(_, A)| (A.nrows(), A.ncols()))
        .unwrap_or((0, 0));
    let mut coo = CooMatrix::new(nrows, ncols);
    for &(c, A) in terms {
        for (i, j, &v) in A.triplet_iter() {
            coo.push(i, j, c * v);
        }
    }
    SparseMatrix::from(&coo)
}

//------------------------------------------------------------------------------
// Traits
//------------------------------------------------------------------------------

pub trait SparseMatrixExt {
    fn to_dense(&self) -> MatrixD;
    fn is_square(&self) -> bool;
    fn max_abs_diagonal(&self) -> f64;
}

impl SparseMatrixExt for SparseMatrix {
    fn to_dense(&self) -> MatrixD {
        let mut A = MatrixD::zeros(self.nrows(), self.ncols());
        for (i, j, &v) in self.triplet_iter() {
            A[(i, j)] += v;
        }
        A
    }
    fn is_square(&self) -> bool {
        self.nrows() == self.ncols()
    }
    fn max_abs_diagonal(&self) -> f64 {
        self.triplet_iter()
            .filter(|(i, j, _)| i == j)
            .fold(0., |m, (_, _, v)| m.max(v.abs()))
    }
}

pub trait InnerProductExt {
    /// `self^T * A * other`
    fn weighted_dot(&self, A: &SparseMatrix, other: &VectorD) -> f64;
    /// `sqrt(self^T * A * self)`
    fn weighted_norm(&self, A: &SparseMatrix) -> f64;
}

impl InnerProductExt for VectorD {
    fn weighted_dot(&self, A: &SparseMatrix, other: &VectorD) -> f64 {
        let Ao: VectorD = A * other;
        self.dot(&Ao)
    }
    fn weighted_norm(&self, A: &SparseMatrix) -> f64 {
        self.weighted_dot(A, self).max(0.).sqrt()
    }
}
