//! Equation system supplied by the assembly collaborator.
//!
//! The integrator sees the discretized model only through [`Assembly`]: per
//! iteration it asks for `M`, `C`, `K_t(x)`, `F_int(x, v)` and `F_ext(t)` at
//! the current trial state and treats them as opaque values of size N.

#![allow(non_snake_case)]

use crate::error::{Result, SolverError};
use crate::prelude::*;
use crate::solver::predictor::SchemeCoefficients;

/// Matrices and force vectors at one trial state.
#[derive(Debug, Clone)]
pub struct EquationSystem {
    pub mass: SparseMatrix,
    pub damping: SparseMatrix,
    pub stiffness: SparseMatrix, // tangent stiffness
    pub internal_force: VectorD,
    pub external_force: VectorD,
}

impl EquationSystem {
    pub fn num_dofs(&self) -> usize {
        self.internal_force.len()
    }

    pub fn check_dimensions(&self, n: usize) -> Result<()> {
        let matrices = [
            ("mass matrix", &self.mass),
            ("damping matrix", &self.damping),
            ("stiffness matrix", &self.stiffness),
        ];
        for (what, A) in matrices {
            if A.nrows() != n {
                return Err(SolverError::dimension(what, n, A.nrows()));
            }
            if A.ncols() != n {
                return Err(SolverError::dimension(what, n, A.ncols()));
            }
        }
        if self.internal_force.len() != n {
            return Err(SolverError::dimension("internal force", n, self.internal_force.len()));
        }
        if self.external_force.len() != n {
            return Err(SolverError::dimension("external force", n, self.external_force.len()));
        }
        Ok(())
    }

    /// Out-of-balance force `F_ext - (M a + C v + F_int)`
    pub fn residual(&self, v: &VectorD, a: &VectorD) -> VectorD {
        let Ma: VectorD = &self.mass * a;
        let Cv: VectorD = &self.damping * v;
        &self.external_force - Ma - Cv - &self.internal_force
    }

    /// Static out-of-balance force `F_ext - F_int`
    pub fn static_residual(&self) -> VectorD {
        &self.external_force - &self.internal_force
    }

    /// Effective tangent `beta' M + gamma' C + K_t`
    pub fn iteration_matrix(&self, coef: &SchemeCoefficients) -> SparseMatrix {
        sparse_combination(&[
            (coef.beta_prime, &self.mass),
            (coef.gamma_prime, &self.damping),
            (1., &self.stiffness),
        ])
    }
}

/// External collaborator producing the equation system at a trial state.
pub trait Assembly {
    fn num_dofs(&self) -> usize;

    fn assemble(&self, t: f64, x: &VectorD, v: &VectorD) -> EquationSystem;
}

type LoadFn = Box<dyn Fn(f64) -> VectorD>;

/// Linear model with constant `M`, `C`, `K` and a time dependent load.
pub struct LinearAssembly {
    mass: SparseMatrix,
    damping: SparseMatrix,
    stiffness: SparseMatrix,
    load: LoadFn,
}

impl LinearAssembly {
    /// Undamped and unloaded model
    pub fn new(mass: SparseMatrix, stiffness: SparseMatrix) -> Result<Self> {
        let n = mass.nrows();
        let system = EquationSystem {
            damping: SparseMatrix::zeros(n, n),
            internal_force: VectorD::zeros(n),
            external_force: VectorD::zeros(n),
            mass,
            stiffness,
        };
        system.check_dimensions(n)?;
        Ok(LinearAssembly {
            mass: system.mass,
            damping: system.damping,
            stiffness: system.stiffness,
            load: Box::new(move |_| VectorD::zeros(n)),
        })
    }

    pub fn with_damping(mut self, damping: SparseMatrix) -> Result<Self> {
        let n = self.mass.nrows();
        if damping.nrows() != n || damping.ncols() != n {
            return Err(SolverError::dimension("damping matrix", n, damping.nrows()));
        }
        self.damping = damping;
        Ok(self)
    }

    /// Rayleigh damping `C = alpha M + beta K`
    pub fn with_rayleigh_damping(mut self, alpha: f64, beta: f64) -> Self {
        self.damping = sparse_combination(&[(alpha, &self.mass), (beta, &self.stiffness)]);
        self
    }

    pub fn with_load(mut self, load: impl Fn(f64) -> VectorD + 'static) -> Self {
        self.set_load(load);
        self
    }

    /// Replace the load, e.g. between steps of a running simulation
    pub fn set_load(&mut self, load: impl Fn(f64) -> VectorD + 'static) {
        self.load = Box::new(load);
    }

    pub fn mass(&self) -> &SparseMatrix {
        &self.mass
    }

    pub fn damping(&self) -> &SparseMatrix {
        &self.damping
    }

    pub fn stiffness(&self) -> &SparseMatrix {
        &self.stiffness
    }
}

impl Assembly for LinearAssembly {
    fn num_dofs(&self) -> usize {
        self.mass.nrows()
    }

    fn assemble(&self, t: f64, x: &VectorD, _v: &VectorD) -> EquationSystem {
        EquationSystem {
            mass: self.mass.clone(),
            damping: self.damping.clone(),
            stiffness: self.stiffness.clone(),
            internal_force: &self.stiffness * x,
            external_force: (self.load)(t),
        }
    }
}
