#![allow(non_snake_case)]

use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::{ConvergenceNorm, IntegrationParameters};
use crate::error::{Result, SolverError};
use crate::prelude::*;
use crate::system::{Assembly, EquationSystem};

use super::cancel::CancelToken;
use super::linear::LinearSolver;
use super::predictor::Predictor;
use super::state::State;

/// Newton iteration state of one step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NewtonState {
    Predicted,
    Iterating,
    Converged,
    Diverged,
    MaxIterExceeded,
}

impl NewtonState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NewtonState::Converged | NewtonState::Diverged | NewtonState::MaxIterExceeded
        )
    }
}

/// Per-step convergence history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceRecord {
    pub status: NewtonState,
    pub step_size: f64,
    pub iterations: usize,           // number of linear solves
    pub residual_norms: Vec<f64>,    // one per residual evaluation
    pub increment_norms: Vec<f64>,   // one per linear solve
    pub singular: bool,              // attempt ended on a singular solve
}

impl ConvergenceRecord {
    pub fn new(step_size: f64) -> Self {
        ConvergenceRecord {
            status: NewtonState::Predicted,
            step_size,
            iterations: 0,
            residual_norms: Vec::new(),
            increment_norms: Vec::new(),
            singular: false,
        }
    }

    pub fn accepted(&self) -> bool {
        self.status == NewtonState::Converged
    }

    pub fn final_residual(&self) -> f64 {
        self.residual_norms.last().copied().unwrap_or(f64::NAN)
    }

    pub fn final_increment(&self) -> f64 {
        self.increment_norms.last().copied().unwrap_or(f64::NAN)
    }
}

/// Candidate state of a step attempt with its convergence record. The state
/// is only meaningful when the record is converged.
#[derive(Debug, Clone)]
pub struct StepAttempt {
    pub state: State,
    pub record: ConvergenceRecord,
}

/// Termination tests shared by the dynamic and static Newton loops.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvergenceCriteria {
    pub tol_residual: f64,
    pub tol_increment: f64,
    pub norm: ConvergenceNorm,
    pub max_iterations: usize,
    pub divergence_factor: f64,
}

impl ConvergenceCriteria {
    pub fn new(params: &IntegrationParameters) -> Self {
        ConvergenceCriteria {
            tol_residual: params.tol_residual,
            tol_increment: params.tol_increment,
            norm: params.convergence_norm,
            max_iterations: params.max_iterations,
            divergence_factor: params.divergence_factor,
        }
    }

    pub fn norm(&self, v: &VectorD) -> f64 {
        self.norm.apply(v)
    }

    /// Both the residual and the last correction must be below tolerance.
    pub fn is_converged(&self, residual_norm: f64, increment_norm: f64) -> bool {
        residual_norm < self.tol_residual && increment_norm < self.tol_increment
    }

    /// Residual grew beyond the divergence factor in each of the last two iterations
    pub fn is_diverging(&self, residual_norms: &[f64]) -> bool {
        match residual_norms {
            [.., r0, r1, r2] => {
                *r1 > self.divergence_factor * r0 && *r2 > self.divergence_factor * r1
            }
            _ => false,
        }
    }

    /// Record a new residual norm and return the terminal state it leads to,
    /// if any. `increment_norm` is the norm of the last correction.
    pub fn check(
        &self,
        record: &mut ConvergenceRecord,
        residual_norm: f64,
        increment_norm: f64,
    ) -> Option<NewtonState> {
        record.residual_norms.push(residual_norm);
        if !residual_norm.is_finite() {
            Some(NewtonState::Diverged)
        } else if record.iterations > 0 && self.is_converged(residual_norm, increment_norm) {
            Some(NewtonState::Converged)
        } else if self.is_diverging(&record.residual_norms) {
            Some(NewtonState::Diverged)
        } else if record.iterations >= self.max_iterations {
            Some(NewtonState::MaxIterExceeded)
        } else {
            None
        }
    }
}

/// Newton-Raphson corrector.
///
/// Owns the linear solver and its factorization cache for the duration of
/// each step.
pub struct Corrector<S: LinearSolver> {
    solver: S,
    predictor: Predictor,
    criteria: ConvergenceCriteria,
}

impl<S: LinearSolver> Corrector<S> {
    pub fn new(params: &IntegrationParameters, solver: S) -> Self {
        Corrector {
            solver,
            predictor: Predictor::new(params),
            criteria: ConvergenceCriteria::new(params),
        }
    }

    pub fn predictor(&self) -> &Predictor {
        &self.predictor
    }

    pub fn criteria(&self) -> &ConvergenceCriteria {
        &self.criteria
    }

    pub fn solver(&self) -> &S {
        &self.solver
    }

    pub fn solver_mut(&mut self) -> &mut S {
        &mut self.solver
    }

    /// Predict and iterate one step of size `h` from `previous`.
    ///
    /// Numerical failures end the attempt as `Diverged` or `MaxIterExceeded`;
    /// only cancellation and inconsistent system dimensions are errors.
    pub fn solve_time_step<A: Assembly>(
        &mut self,
        assembly: &A,
        previous: &State,
        h: f64,
        cancel: Option<&CancelToken>,
    ) -> Result<StepAttempt> {
        let n = previous.num_dofs();
        let coef = self.predictor.coefficients(h);

        // Predict the next step
        let mut state_next = self.predictor.predict_next_state(previous, h);
        let mut record = ConvergenceRecord::new(h);
        let mut increment_norm = f64::INFINITY;

        record.status = NewtonState::Iterating;
        while !record.status.is_terminal() {
            if let Some(token) = cancel {
                if token.is_cancelled() {
                    return Err(SolverError::Cancelled { time: previous.t });
                }
            }

            // Evaluate system at the trial state
            let system: EquationSystem = assembly.assemble(state_next.t, &state_next.x, &state_next.v);
            system.check_dimensions(n)?;
            let R: VectorD = system.residual(&state_next.v, &state_next.a);

            // Check for convergence
            let residual_norm = self.criteria.norm(&R);
            if let Some(status) = self.criteria.check(&mut record, residual_norm, increment_norm) {
                record.status = status;
                break;
            }

            // Solve for the position correction
            let St: SparseMatrix = system.iteration_matrix(&coef);
            let dx: VectorD = match self.solver.solve_system(&St, &R) {
                Ok(dx) => dx,
                Err(SolverError::SingularSystem { pivot, .. }) => {
                    debug!("t={:.6}: singular iteration matrix (pivot {:.3e})", state_next.t, pivot);
                    record.singular = true;
                    record.status = NewtonState::Diverged;
                    break;
                }
                Err(e) => return Err(e),
            };
            increment_norm = self.criteria.norm(&dx);
            record.increment_norms.push(increment_norm);
            record.iterations += 1;

            debug!(
                "t={:.6} h={:.3e} iter {:2}: |R| = {:.3e}, |dx| = {:.3e}",
                state_next.t, h, record.iterations, residual_norm, increment_norm
            );

            // Update position, velocity and accelerations
            self.predictor.correct(&mut state_next, &dx, &coef);
        }

        Ok(StepAttempt {
            state: state_next,
            record,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::linear::DirectSolver;
    use crate::system::LinearAssembly;
    use approx::assert_relative_eq;

    /// One DOF with scaled stiffness, reporting `tangent` as K_t
    struct ScalarSpring {
        mass: f64,
        stiffness: f64,
        tangent: f64,
        load: f64,
    }

    impl Assembly for ScalarSpring {
        fn num_dofs(&self) -> usize {
            1
        }
        fn assemble(&self, _t: f64, x: &VectorD, _v: &VectorD) -> EquationSystem {
            EquationSystem {
                mass: sparse_diagonal(&[self.mass]),
                damping: sparse_diagonal(&[0.]),
                stiffness: sparse_diagonal(&[self.tangent]),
                internal_force: self.stiffness * x,
                external_force: VectorD::from_element(1, self.load),
            }
        }
    }

    /// Softening spring with a stiff tangent, every correction overshoots
    struct Unstable;

    impl Assembly for Unstable {
        fn num_dofs(&self) -> usize {
            1
        }
        fn assemble(&self, _t: f64, x: &VectorD, _v: &VectorD) -> EquationSystem {
            EquationSystem {
                mass: sparse_diagonal(&[0.]),
                damping: sparse_diagonal(&[0.]),
                stiffness: sparse_diagonal(&[1.]),
                internal_force: x.map(|xi| -3. * xi),
                external_force: VectorD::from_element(1, 1.),
            }
        }
    }

    fn params() -> IntegrationParameters {
        IntegrationParameters::average_acceleration()
            .with_fixed_step(0.1)
            .with_tolerances(1e-6, 1e-6)
    }

    #[test]
    fn test_linear_step_converges() {
        let model = LinearAssembly::new(sparse_diagonal(&[1.]), sparse_diagonal(&[1.])).unwrap();
        let s0 = State::new_with_initial_state(
            0.,
            &VectorD::from_element(1, 1.),
            &VectorD::zeros(1),
            &VectorD::from_element(1, -1.),
        )
        .unwrap();
        let mut corrector = Corrector::new(&params(), DirectSolver::default());
        let attempt = corrector.solve_time_step(&model, &s0, 0.1, None).unwrap();

        // Linear problems need a second solve to confirm the increment
        assert!(attempt.record.accepted());
        assert_eq!(attempt.record.iterations, 2);
        assert_eq!(attempt.record.residual_norms.len(), 3);
        assert!(attempt.record.final_residual() < 1e-6);
        assert!(attempt.record.final_increment() < 1e-6);

        // Trapezoidal rule for x'' = -x
        let h: f64 = 0.1;
        let x1 = (1. - h * h / 4.) / (1. + h * h / 4.);
        assert_relative_eq!(attempt.state.x[0], x1, epsilon = 1e-12);
        assert_relative_eq!(attempt.state.a[0], -x1, epsilon = 1e-12);
        assert_relative_eq!(attempt.state.t, 0.1);
    }

    #[test]
    fn test_residual_only_is_not_accepted() {
        // Residual starts below tolerance but the correction is large
        let model = ScalarSpring {
            mass: 0.,
            stiffness: 1e-12,
            tangent: 1e-12,
            load: 1e-10,
        };
        let s0 = State::new(1, 0.);
        let mut corrector = Corrector::new(&params().with_max_iterations(1), DirectSolver::default());
        let attempt = corrector.solve_time_step(&model, &s0, 0.1, None).unwrap();

        assert!(attempt.record.residual_norms.iter().all(|&r| r < 1e-6));
        assert!(attempt.record.final_increment() > 1e-6);
        assert_eq!(attempt.record.status, NewtonState::MaxIterExceeded);
        assert!(!attempt.record.accepted());
    }

    #[test]
    fn test_increment_only_is_not_accepted() {
        // Far too stiff tangent: tiny corrections, residual hardly reduced
        let model = ScalarSpring {
            mass: 0.,
            stiffness: 1.,
            tangent: 1e12,
            load: 1.,
        };
        let s0 = State::new(1, 0.);
        let mut corrector = Corrector::new(&params().with_max_iterations(5), DirectSolver::default());
        let attempt = corrector.solve_time_step(&model, &s0, 0.1, None).unwrap();

        assert!(attempt.record.increment_norms.iter().all(|&dx| dx < 1e-6));
        assert!(attempt.record.final_residual() > 1e-6);
        assert_eq!(attempt.record.status, NewtonState::MaxIterExceeded);
        assert_eq!(attempt.record.iterations, 5);
    }

    #[test]
    fn test_divergence_fails_fast() {
        let mut corrector = Corrector::new(&params().with_max_iterations(50), DirectSolver::default());
        let attempt = corrector
            .solve_time_step(&Unstable, &State::new(1, 0.), 0.1, None)
            .unwrap();

        assert_eq!(attempt.record.status, NewtonState::Diverged);
        assert!(attempt.record.iterations < 50);
        let r = &attempt.record.residual_norms;
        let n = r.len();
        assert!(r[n - 1] > r[n - 2] && r[n - 2] > r[n - 3]);
    }

    #[test]
    fn test_singular_solve_is_divergence() {
        let model = ScalarSpring {
            mass: 0.,
            stiffness: 1.,
            tangent: 0.,
            load: 1.,
        };
        let mut corrector = Corrector::new(&params(), DirectSolver::default());
        let attempt = corrector
            .solve_time_step(&model, &State::new(1, 0.), 0.1, None)
            .unwrap();
        assert_eq!(attempt.record.status, NewtonState::Diverged);
        assert!(attempt.record.singular);
        assert_eq!(attempt.record.iterations, 0);
    }

    #[test]
    fn test_cancel_discards_candidate() {
        let model = LinearAssembly::new(sparse_diagonal(&[1.]), sparse_diagonal(&[1.])).unwrap();
        let token = CancelToken::new();
        token.cancel();
        let mut corrector = Corrector::new(&params(), DirectSolver::default());
        let result = corrector.solve_time_step(&model, &State::new(1, 0.25), 0.1, Some(&token));
        match result {
            Err(SolverError::Cancelled { time }) => assert_relative_eq!(time, 0.25),
            other => panic!("expected cancellation, got {:?}", other.map(|a| a.record)),
        }
    }
}
