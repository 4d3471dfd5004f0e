#![allow(non_snake_case)]

use log::debug;

use crate::config::IntegrationParameters;
use crate::error::{Result, SolverError};
use crate::prelude::*;
use crate::system::{Assembly, EquationSystem};

use super::corrector::{ConvergenceCriteria, ConvergenceRecord, NewtonState};
use super::linear::LinearSolver;

#[derive(Debug, Clone)]
pub struct StaticSolution {
    pub x: VectorD, // equilibrium position (last iterate if not converged)
    pub record: ConvergenceRecord,
}

/// Solve `F_int(x) = F_ext(t)` by Newton iteration on the tangent stiffness,
/// starting from `x0` with zero velocity.
///
/// Uses the same termination rules as the dynamic corrector. A failed
/// iteration is reported through the record, not as an error.
pub fn solve_static_equilibrium<A: Assembly, S: LinearSolver>(
    assembly: &A,
    t: f64,
    x0: &VectorD,
    params: &IntegrationParameters,
    solver: &mut S,
) -> Result<StaticSolution> {
    let n = assembly.num_dofs();
    if x0.len() != n {
        return Err(SolverError::dimension("initial position", n, x0.len()));
    }
    let criteria = ConvergenceCriteria::new(params);
    let v = VectorD::zeros(n);

    let mut x = x0.clone();
    let mut record = ConvergenceRecord::new(0.);
    let mut increment_norm = f64::INFINITY;

    record.status = NewtonState::Iterating;
    while !record.status.is_terminal() {
        // Get static residual
        let system: EquationSystem = assembly.assemble(t, &x, &v);
        system.check_dimensions(n)?;
        let R: VectorD = system.static_residual();

        // Check for convergence
        let residual_norm = criteria.norm(&R);
        if let Some(status) = criteria.check(&mut record, residual_norm, increment_norm) {
            record.status = status;
            break;
        }

        // Solve with the tangent stiffness as iteration matrix
        let dx: VectorD = match solver.solve_system(&system.stiffness, &R) {
            Ok(dx) => dx,
            Err(SolverError::SingularSystem { .. }) => {
                record.singular = true;
                record.status = NewtonState::Diverged;
                break;
            }
            Err(e) => return Err(e),
        };
        increment_norm = criteria.norm(&dx);
        record.increment_norms.push(increment_norm);
        record.iterations += 1;

        debug!(
            "statics t={:.6} iter {:2}: |R| = {:.3e}, |dx| = {:.3e}",
            t, record.iterations, residual_norm, increment_norm
        );

        x += dx;
    }

    Ok(StaticSolution { x, record })
}
