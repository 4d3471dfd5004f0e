//! Eigenmode extraction by shifted inverse iteration.
//!
//! Solves `K phi = lambda M phi` for the modes closest to a shift `sigma`.
//! The shifted matrix `K - sigma M` is factored once and reused for every
//! iteration. All requested modes are iterated together as one block, and
//! a Rayleigh-Ritz projection separates them, so a start vector that misses
//! a mode cannot skip it.

#![allow(non_snake_case)]

use std::f64::consts::PI;

use log::{debug, warn};
use nalgebra::SymmetricEigen;
use serde::{Deserialize, Serialize};

use crate::config::ModeRequest;
use crate::error::{EigenNotConverged, Result, SolverError};
use crate::prelude::*;

use super::linear::LinearSolver;

/// Converged eigenvalue and M-normalized eigenvector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Eigenpair {
    pub eigenvalue: f64,
    pub eigenvector: VectorD,
    pub iterations: usize,
    pub residual: f64, // |K phi - lambda M phi|
}

impl Eigenpair {
    /// `sqrt(lambda)` in rad/s, zero for non-positive eigenvalues
    pub fn angular_frequency(&self) -> f64 {
        if self.eigenvalue > 0. {
            self.eigenvalue.sqrt()
        } else {
            0.
        }
    }

    pub fn frequency_hz(&self) -> f64 {
        self.angular_frequency() / (2. * PI)
    }
}

/// Modes extracted for one request at one accepted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeSet {
    pub request: usize, // index into the configured mode requests
    pub time: f64,
    pub shift: f64,
    pub pairs: Vec<Eigenpair>,
    pub converged: bool, // false when only a subset converged
}

impl ModeSet {
    pub fn eigenvalues(&self) -> Vec<f64> {
        self.pairs.iter().map(|p| p.eigenvalue).collect()
    }

    pub fn frequencies_hz(&self) -> Vec<f64> {
        self.pairs.iter().map(|p| p.frequency_hz()).collect()
    }

    /// Eigenvectors as matrix columns
    pub fn shapes(&self) -> MatrixDxM {
        let n = self.pairs.first().map_or(0, |p| p.eigenvector.len());
        MatrixDxM::from_fn(n, self.pairs.len(), |i, j| self.pairs[j].eigenvector[i])
    }
}

/// Trial vectors carried beyond the requested count
const BLOCK_SIZE_SLACK: usize = 8;

/// Relative M-norm below which an orthogonalized vector counts as dependent
const DEPENDENCE_TOLERANCE: f64 = 1e-10;

/// Fresh trial vectors tried before a dependent column is dropped
const MAX_RESEEDS: usize = 4;

fn shifted_matrix(K: &SparseMatrix, M: &SparseMatrix, shift: f64) -> SparseMatrix {
    sparse_combination(&[(1., K), (-shift, M)])
}

/// Deterministic pseudo-random trial vector with entries in [-1, 1)
fn seed_vector(n: usize, seed: u64) -> VectorD {
    let mut state = seed.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    VectorD::from_fn(n, |_, _| {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        ((state >> 12) as f64) / ((1u64 << 52) as f64) * 2. - 1.
    })
}

/// M-orthonormal basis from `vectors` by Gram-Schmidt applied twice.
/// Dependent columns are replaced by fresh trial vectors, or dropped.
fn m_orthonormalize(vectors: Vec<VectorD>, M: &SparseMatrix, seed: &mut u64) -> Vec<VectorD> {
    let mut basis: Vec<VectorD> = Vec::with_capacity(vectors.len());
    for mut candidate in vectors {
        let n = candidate.len();
        for _ in 0..=MAX_RESEEDS {
            let scale = candidate.weighted_norm(M);
            for _ in 0..2 {
                for b in &basis {
                    let c = b.weighted_dot(M, &candidate);
                    candidate.axpy(-c, b, 1.);
                }
            }
            let norm = candidate.weighted_norm(M);
            if norm.is_finite() && norm > 0. && norm > DEPENDENCE_TOLERANCE * scale {
                basis.push(candidate / norm);
                break;
            }
            candidate = seed_vector(n, *seed);
            *seed += 1;
        }
    }
    basis
}

/// Ritz pairs of the pencil on the M-orthonormal basis `Y`, ordered by
/// distance of the eigenvalue from `shift`. `S` is `K - shift M`.
fn rayleigh_ritz(S: &SparseMatrix, Y: &[VectorD], shift: f64) -> Vec<(f64, VectorD)> {
    let Q = MatrixDxM::from_columns(Y);
    let SQ: MatrixDxM = S * &Q;
    let A: MatrixD = Q.transpose() * SQ;
    let A: MatrixD = (&A + A.transpose()) * 0.5;
    let eig = SymmetricEigen::new(A);

    let mut pairs = eig
        .eigenvalues
        .iter()
        .zip(eig.eigenvectors.column_iter())
        .map(|(&mu, z)| {
            let mut phi: VectorD = &Q * z;

            // Sign convention: largest component positive
            let peak = phi
                .iter()
                .fold(0., |m: f64, &p| if p.abs() > m.abs() { p } else { m });
            if peak < 0. {
                phi.neg_mut();
            }
            (shift + mu, phi)
        })
        .collect_vec();
    pairs.sort_by(|a, b| (a.0 - shift).abs().total_cmp(&(b.0 - shift).abs()));
    pairs
}

/// `(|K phi - lambda M phi|, |M phi|)`
fn residual_norms(K: &SparseMatrix, M: &SparseMatrix, lambda: f64, phi: &VectorD) -> (f64, f64) {
    let Kphi: VectorD = K * phi;
    let Mphi: VectorD = M * phi;
    ((Kphi - lambda * &Mphi).norm(), Mphi.norm())
}

/// Up to `request.count` eigenpairs of `(K, M)` closest to `request.shift`,
/// ordered by distance from the shift.
///
/// Subspace iteration: a block of `count + 8` trial vectors is repeatedly
/// multiplied by `(K - sigma M)^-1 M`, M-orthonormalized and projected
/// (Rayleigh-Ritz). A pair has converged when its eigenvalue changed by at
/// most `tolerance * max(1, |lambda|)` over the last iteration and its
/// residual is within the same relative tolerance.
///
/// Fails with [`SolverError::EigenNotConverged`] carrying the converged
/// leading pairs if the iteration budget runs out. A shifted matrix that is
/// singular (shift on an eigenvalue) is retried once with a perturbed shift.
pub fn inverse_iteration<S: LinearSolver>(
    K: &SparseMatrix,
    M: &SparseMatrix,
    request: &ModeRequest,
    solver: &mut S,
) -> Result<Vec<Eigenpair>> {
    let n = K.nrows();
    if K.ncols() != n {
        return Err(SolverError::dimension("stiffness matrix columns", n, K.ncols()));
    }
    if M.nrows() != n || M.ncols() != n {
        return Err(SolverError::dimension("mass matrix", n, M.nrows()));
    }
    let requested = request.count.min(n);
    if requested == 0 {
        return Ok(Vec::new());
    }
    let tol = request.tolerance;

    // Factor the shifted matrix once
    let mut shift = request.shift;
    let mut S = shifted_matrix(K, M, shift);
    match solver.factor(&S) {
        Ok(()) => {}
        Err(SolverError::SingularSystem { .. }) => {
            shift += 1e-8 * shift.abs().max(1.);
            debug!("inverse iteration: shift {:.6e} is singular, retrying at {:.6e}", request.shift, shift);
            S = shifted_matrix(K, M, shift);
            solver.factor(&S)?;
        }
        Err(e) => return Err(e),
    }

    // Deterministic start block
    let block_size = (requested + BLOCK_SIZE_SLACK).min(n);
    let mut seed = block_size as u64;
    let mut X = m_orthonormalize(
        (0..block_size as u64).map(|j| seed_vector(n, j)).collect(),
        M,
        &mut seed,
    );
    let count = requested.min(X.len());
    if count < requested {
        warn!(
            "inverse iteration: mass matrix has rank {} or less, extracting at most {} of {} modes",
            X.len(),
            count,
            requested
        );
    }

    let mut ritz: Vec<(f64, VectorD)> = Vec::new();
    let mut previous: Vec<f64> = Vec::new();
    let mut converged = 0;
    let mut iterations = 0;
    while count > 0 && iterations < request.max_iterations {
        iterations += 1;

        // Y = (K - sigma M)^-1 M X
        let Y = X
            .iter()
            .map(|x| {
                let Mx: VectorD = M * x;
                solver.solve(&Mx)
            })
            .collect::<Result<Vec<_>>>()?;
        let Y = m_orthonormalize(Y, M, &mut seed);
        ritz = rayleigh_ritz(&S, &Y, shift);

        // Leading pairs with a settled eigenvalue and a small residual
        converged = ritz
            .iter()
            .take(count)
            .enumerate()
            .take_while(|(j, (lambda, phi))| {
                let scale = lambda.abs().max(1.);
                previous.get(*j).map_or(false, |&prev| {
                    let (r, m) = residual_norms(K, M, *lambda, phi);
                    (lambda - prev).abs() <= tol * scale && r <= tol * scale * m
                })
            })
            .count();
        debug!(
            "inverse iteration {}: {} of {} modes converged, closest lambda = {:.6e}",
            iterations,
            converged,
            count,
            ritz.first().map_or(f64::NAN, |(lambda, _)| *lambda)
        );

        previous = ritz.iter().map(|(lambda, _)| *lambda).collect();
        X = ritz.iter().map(|(_, phi)| phi.clone()).collect();
        if converged >= count {
            break;
        }
    }

    let modes = ritz
        .into_iter()
        .take(converged.min(count))
        .map(|(lambda, phi)| {
            let (residual, _) = residual_norms(K, M, lambda, &phi);
            debug!(
                "inverse iteration: lambda = {:.6e} ({} iterations, residual {:.3e})",
                lambda, iterations, residual
            );
            Eigenpair {
                eigenvalue: lambda,
                eigenvector: phi,
                iterations,
                residual,
            }
        })
        .collect_vec();

    if modes.len() < requested {
        warn!(
            "inverse iteration: mode {} not converged after {} iterations, returning {} of {} modes",
            modes.len(),
            iterations,
            modes.len(),
            requested
        );
        return Err(EigenNotConverged {
            mode: modes.len(),
            iterations,
            requested,
            converged: modes,
        }
        .into());
    }

    Ok(modes)
}
