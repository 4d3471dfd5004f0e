//! Direct solvers for the sparse symmetric systems `A x = b` arising in the
//! Newton loop and in inverse iteration.
//!
//! Solvers keep their factorization between calls. The symbolic analysis is
//! reused while the sparsity pattern of `A` is unchanged and redone as soon as
//! it changes. Neither `A` nor `b` is modified.

#![allow(non_snake_case)]

use log::debug;
use nalgebra::{Dyn, LU};
use nalgebra_sparse::factorization::{CscCholesky, CscSymbolicCholesky};
use nalgebra_sparse::pattern::SparsityPattern;

use crate::error::{Result, SolverError};
use crate::prelude::*;

/// Factorization counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SolverStats {
    /// Symbolic analyses (pattern changes)
    pub analyses: usize,
    /// Numeric factorizations
    pub factorizations: usize,
}

pub trait LinearSolver {
    /// Factor `A`, reusing cached symbolic data when the pattern is unchanged.
    fn factor(&mut self, A: &SparseMatrix) -> Result<()>;

    /// Solve with the current factorization.
    fn solve(&self, b: &VectorD) -> Result<VectorD>;

    /// Drop the cached factorization and symbolic analysis.
    fn invalidate(&mut self);

    fn stats(&self) -> SolverStats;

    fn name(&self) -> &str;

    /// Factor `A` and solve `A x = b`.
    fn solve_system(&mut self, A: &SparseMatrix, b: &VectorD) -> Result<VectorD> {
        if A.nrows() != b.len() {
            return Err(SolverError::dimension("right-hand side", A.nrows(), b.len()));
        }
        self.factor(A)?;
        self.solve(b)
    }
}

fn check_square(A: &SparseMatrix) -> Result<()> {
    if A.is_square() {
        Ok(())
    } else {
        Err(SolverError::dimension("system matrix columns", A.nrows(), A.ncols()))
    }
}

/// Smallest pivot relative to the largest, as (min, max)
fn pivot_range(pivots: impl Iterator<Item = f64>) -> (f64, f64) {
    pivots.fold((f64::INFINITY, 0_f64), |(lo, hi), p| {
        let p = p.abs();
        (lo.min(p), hi.max(p))
    })
}

fn check_pivots(min: f64, max: f64, tolerance: f64) -> Result<()> {
    // NaN pivots fail both comparisons and must be rejected too
    if !(max > 0.) || !(min > tolerance * max) {
        Err(SolverError::singular(min, tolerance * max))
    } else {
        Ok(())
    }
}

//------------------------------------------------------------------------------
// Dense LU
//------------------------------------------------------------------------------

/// Dense LU with partial pivoting.
///
/// Works for indefinite matrices. The sparse matrix is expanded to dense
/// storage, so this is meant for small systems and as a fallback.
#[derive(Debug)]
pub struct DenseLuSolver {
    pivot_tolerance: f64,
    lu: Option<LU<f64, Dyn, Dyn>>,
    dim: usize,
    stats: SolverStats,
}

impl DenseLuSolver {
    pub fn new(pivot_tolerance: f64) -> Self {
        DenseLuSolver {
            pivot_tolerance,
            lu: None,
            dim: 0,
            stats: SolverStats::default(),
        }
    }
}

impl Default for DenseLuSolver {
    fn default() -> Self {
        Self::new(1e-12)
    }
}

impl LinearSolver for DenseLuSolver {
    fn factor(&mut self, A: &SparseMatrix) -> Result<()> {
        check_square(A)?;
        self.lu = None;
        self.dim = A.nrows();
        if self.dim == 0 {
            return Ok(());
        }

        let lu = A.to_dense().lu();
        self.stats.factorizations += 1;

        // Singularity from the diagonal of U
        let u = lu.u();
        let (min, max) = pivot_range(u.diagonal().iter().copied());
        check_pivots(min, max, self.pivot_tolerance)?;

        self.lu = Some(lu);
        Ok(())
    }

    fn solve(&self, b: &VectorD) -> Result<VectorD> {
        if b.len() != self.dim {
            return Err(SolverError::dimension("right-hand side", self.dim, b.len()));
        }
        if self.dim == 0 {
            return Ok(VectorD::zeros(0));
        }
        let lu = self
            .lu
            .as_ref()
            .ok_or_else(|| SolverError::singular(0., self.pivot_tolerance))?;
        lu.solve(b)
            .ok_or_else(|| SolverError::singular(0., self.pivot_tolerance))
    }

    fn invalidate(&mut self) {
        self.lu = None;
        self.dim = 0;
    }

    fn stats(&self) -> SolverStats {
        self.stats
    }

    fn name(&self) -> &str {
        "dense-lu"
    }
}

//------------------------------------------------------------------------------
// Sparse Cholesky
//------------------------------------------------------------------------------

/// Sparse Cholesky factorization for symmetric positive definite matrices.
///
/// Matrices that are not positive definite, or whose smallest pivot falls
/// below the relative tolerance, are reported as singular.
pub struct SparseCholeskySolver {
    pivot_tolerance: f64,
    symbolic: Option<(SparsityPattern, CscSymbolicCholesky)>,
    cholesky: Option<CscCholesky<f64>>,
    dim: usize,
    stats: SolverStats,
}

impl SparseCholeskySolver {
    pub fn new(pivot_tolerance: f64) -> Self {
        SparseCholeskySolver {
            pivot_tolerance,
            symbolic: None,
            cholesky: None,
            dim: 0,
            stats: SolverStats::default(),
        }
    }

    fn symbolic_for(&mut self, pattern: &SparsityPattern) -> CscSymbolicCholesky {
        match &self.symbolic {
            Some((cached, symbolic)) if cached == pattern => symbolic.clone(),
            _ => {
                debug!("sparse cholesky: analyzing new {}x{} pattern", pattern.major_dim(), pattern.minor_dim());
                let symbolic = CscSymbolicCholesky::factor(pattern.clone());
                self.symbolic = Some((pattern.clone(), symbolic.clone()));
                self.stats.analyses += 1;
                symbolic
            }
        }
    }
}

impl Default for SparseCholeskySolver {
    fn default() -> Self {
        Self::new(1e-12)
    }
}

impl LinearSolver for SparseCholeskySolver {
    fn factor(&mut self, A: &SparseMatrix) -> Result<()> {
        check_square(A)?;
        self.cholesky = None;
        self.dim = A.nrows();
        if self.dim == 0 {
            return Ok(());
        }

        let symbolic = self.symbolic_for(A.pattern());
        let cholesky = CscCholesky::factor_numerical(symbolic, A.values())
            .map_err(|_| SolverError::singular(0., self.pivot_tolerance))?;
        self.stats.factorizations += 1;

        // Pivots of A are the squared diagonal entries of L
        let L = cholesky.l();
        let (min, max) = pivot_range((0..self.dim).map(|j| {
            L.get_entry(j, j)
                .map(|e| e.into_value())
                .unwrap_or(0.)
                .powi(2)
        }));
        check_pivots(min, max, self.pivot_tolerance)?;

        self.cholesky = Some(cholesky);
        Ok(())
    }

    fn solve(&self, b: &VectorD) -> Result<VectorD> {
        if b.len() != self.dim {
            return Err(SolverError::dimension("right-hand side", self.dim, b.len()));
        }
        if self.dim == 0 {
            return Ok(VectorD::zeros(0));
        }
        let cholesky = self
            .cholesky
            .as_ref()
            .ok_or_else(|| SolverError::singular(0., self.pivot_tolerance))?;
        let B = MatrixD::from_column_slice(self.dim, 1, b.as_slice());
        let X: MatrixD = cholesky.solve(&B);
        Ok(VectorD::from_column_slice(X.as_slice()))
    }

    fn invalidate(&mut self) {
        self.symbolic = None;
        self.cholesky = None;
        self.dim = 0;
    }

    fn stats(&self) -> SolverStats {
        self.stats
    }

    fn name(&self) -> &str {
        "sparse-cholesky"
    }
}

//------------------------------------------------------------------------------
// Default direct solver
//------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Factorization {
    None,
    Cholesky,
    Lu,
}

/// Sparse Cholesky with a dense LU fallback for indefinite matrices.
pub struct DirectSolver {
    cholesky: SparseCholeskySolver,
    lu: DenseLuSolver,
    active: Factorization,
}

impl DirectSolver {
    pub fn new(pivot_tolerance: f64) -> Self {
        DirectSolver {
            cholesky: SparseCholeskySolver::new(pivot_tolerance),
            lu: DenseLuSolver::new(pivot_tolerance),
            active: Factorization::None,
        }
    }

    /// True when the last factorization fell back to LU
    pub fn used_fallback(&self) -> bool {
        self.active == Factorization::Lu
    }
}

impl Default for DirectSolver {
    fn default() -> Self {
        Self::new(1e-12)
    }
}

impl LinearSolver for DirectSolver {
    fn factor(&mut self, A: &SparseMatrix) -> Result<()> {
        self.active = Factorization::None;
        match self.cholesky.factor(A) {
            Ok(()) => {
                self.active = Factorization::Cholesky;
                Ok(())
            }
            Err(SolverError::SingularSystem { .. }) => {
                debug!("direct solver: matrix not positive definite, falling back to LU");
                self.lu.factor(A)?;
                self.active = Factorization::Lu;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn solve(&self, b: &VectorD) -> Result<VectorD> {
        match self.active {
            Factorization::Cholesky => self.cholesky.solve(b),
            Factorization::Lu => self.lu.solve(b),
            Factorization::None => Err(SolverError::singular(0., self.lu.pivot_tolerance)),
        }
    }

    fn invalidate(&mut self) {
        self.cholesky.invalidate();
        self.lu.invalidate();
        self.active = Factorization::None;
    }

    fn stats(&self) -> SolverStats {
        let c = self.cholesky.stats();
        let l = self.lu.stats();
        SolverStats {
            analyses: c.analyses,
            factorizations: c.factorizations + l.factorizations,
        }
    }

    fn name(&self) -> &str {
        match self.active {
            Factorization::Lu => "direct (dense-lu fallback)",
            _ => "direct (sparse-cholesky)",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn spd_matrix() -> SparseMatrix {
        sparse_from_dense(&MatrixD::from_row_slice(
            3,
            3,
            &[4., 1., 0., 1., 3., 1., 0., 1., 2.],
        ))
    }

    fn indefinite_matrix() -> SparseMatrix {
        sparse_from_dense(&MatrixD::from_row_slice(
            3,
            3,
            &[1., 2., 0., 2., 1., 0., 0., 0., -3.],
        ))
    }

    fn singular_matrix() -> SparseMatrix {
        sparse_from_dense(&MatrixD::from_row_slice(
            3,
            3,
            &[1., 1., 0., 1., 1., 0., 0., 0., 1.],
        ))
    }

    fn check_solution(solver: &mut dyn LinearSolver, A: &SparseMatrix) {
        let x_ref = VectorD::from_vec(vec![1., -2., 3.]);
        let b: VectorD = A * &x_ref;
        let A_before = A.clone();
        let b_before = b.clone();
        let x = solver.solve_system(A, &b).unwrap();
        assert_relative_eq!(x, x_ref, epsilon = 1e-12);

        // Inputs untouched
        assert_eq!(A, &A_before);
        assert_eq!(b, b_before);
    }

    #[test]
    fn test_dense_lu() {
        let mut solver = DenseLuSolver::default();
        check_solution(&mut solver, &spd_matrix());
        check_solution(&mut solver, &indefinite_matrix());
        assert!(matches!(
            solver.factor(&singular_matrix()),
            Err(SolverError::SingularSystem { .. })
        ));
    }

    #[test]
    fn test_sparse_cholesky() {
        let mut solver = SparseCholeskySolver::default();
        check_solution(&mut solver, &spd_matrix());
        assert!(matches!(
            solver.factor(&indefinite_matrix()),
            Err(SolverError::SingularSystem { .. })
        ));
        assert!(solver.solve(&VectorD::zeros(3)).is_err());
    }

    #[test]
    fn test_direct_solver_fallback() {
        let mut solver = DirectSolver::default();
        check_solution(&mut solver, &spd_matrix());
        assert!(!solver.used_fallback());

        check_solution(&mut solver, &indefinite_matrix());
        assert!(solver.used_fallback());

        assert!(matches!(
            solver.factor(&singular_matrix()),
            Err(SolverError::SingularSystem { .. })
        ));
    }

    #[test]
    fn test_pattern_cache() {
        let mut solver = SparseCholeskySolver::default();
        let A = spd_matrix();
        solver.factor(&A).unwrap();
        solver.factor(&(sparse_combination(&[(2., &A)]))).unwrap();
        assert_eq!(solver.stats().analyses, 1);
        assert_eq!(solver.stats().factorizations, 2);

        // New pattern triggers a new analysis
        solver.factor(&sparse_diagonal(&[1., 2., 3.])).unwrap();
        assert_eq!(solver.stats().analyses, 2);

        solver.invalidate();
        solver.factor(&sparse_diagonal(&[1., 2., 3.])).unwrap();
        assert_eq!(solver.stats().analyses, 3);
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut solver = DirectSolver::default();
        let err = solver.solve_system(&spd_matrix(), &VectorD::zeros(2));
        assert!(matches!(err, Err(SolverError::DimensionMismatch { .. })));
    }
}
