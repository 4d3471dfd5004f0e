//! Solver context for a transient run.
//!
//! [`Simulation`] owns the configuration, the assembly, the state history
//! and the corrector with its linear solver. Each call to
//! [`Simulation::solve_next`] advances one accepted step:
//!
//! ```text
//! history.current() -> predict -> Newton -> step control -+-> accept -> push -> modes
//!                          ^                               |
//!                          +------------- cut -------------+
//! ```

#![allow(non_snake_case)]

use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::{IntegrationParameters, ModeRequest};
use crate::error::{Result, SolverError};
use crate::prelude::*;
use crate::results::{ResultSink, StepSnapshot};
use crate::system::Assembly;

use super::cancel::CancelToken;
use super::corrector::{ConvergenceRecord, Corrector};
use super::linear::{DirectSolver, LinearSolver};
use super::modes::{inverse_iteration, Eigenpair, ModeSet};
use super::state::{State, StateHistory};
use super::statics::solve_static_equilibrium;
use super::step_control::StepController;

/// Single-step scheme, the history only needs the last accepted state
const HISTORY_LENGTH: usize = 1;

/// Relative slack for landing the last step on the end time
const END_TIME_SLACK: f64 = 1e-6;

/// Run statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub accepted_steps: usize,
    pub rejected_steps: usize,
    pub newton_iterations: usize, // over all attempts, accepted or not
    pub min_step_size: f64,
    pub max_step_size: f64,
    pub final_time: f64,
    pub mode_failures: usize, // extractions returning a partial or empty set
}

impl RunSummary {
    fn accept(&mut self, state: &State, record: &ConvergenceRecord) {
        let h = record.step_size;
        if self.accepted_steps == 0 {
            self.min_step_size = h;
            self.max_step_size = h;
        } else {
            self.min_step_size = self.min_step_size.min(h);
            self.max_step_size = self.max_step_size.max(h);
        }
        self.accepted_steps += 1;
        self.final_time = state.t;
    }
}

/// Consistent initial acceleration from `M a = F_ext - C v - F_int`
fn initial_acceleration<A: Assembly, S: LinearSolver>(
    assembly: &A,
    t: f64,
    x: &VectorD,
    v: &VectorD,
    solver: &mut S,
) -> Result<VectorD> {
    let n = x.len();
    let system = assembly.assemble(t, x, v);
    system.check_dimensions(n)?;
    let rhs: VectorD = system.residual(v, &VectorD::zeros(n));
    match solver.solve_system(&system.mass, &rhs) {
        Ok(a) => Ok(a),
        Err(SolverError::SingularSystem { .. }) => {
            warn!("t={:.6}: mass matrix is singular, starting from zero acceleration", t);
            Ok(VectorD::zeros(n))
        }
        Err(e) => Err(e),
    }
}

/// Eigenpairs of the system linearized at `state`
fn extract<A: Assembly, S: LinearSolver>(
    assembly: &A,
    state: &State,
    request: &ModeRequest,
    solver: &mut S,
) -> Result<Vec<Eigenpair>> {
    let system = assembly.assemble(state.t, &state.x, &state.v);
    system.check_dimensions(state.num_dofs())?;
    inverse_iteration(&system.stiffness, &system.mass, request, solver)
}

/// Transient solver context.
pub struct Simulation<A: Assembly, S: LinearSolver = DirectSolver> {
    params: IntegrationParameters,
    assembly: A,
    history: StateHistory,
    corrector: Corrector<S>,
    controller: StepController,
    cancel: CancelToken,
    step: usize,
    summary: RunSummary,
}

impl<A: Assembly> Simulation<A, DirectSolver> {
    /// Start at `params.t_start` from position `x0` and velocity `v0` with
    /// the default direct solver.
    pub fn new(params: IntegrationParameters, assembly: A, x0: &VectorD, v0: &VectorD) -> Result<Self> {
        let solver = DirectSolver::new(params.pivot_tolerance);
        Self::with_solver(params, assembly, solver, x0, v0)
    }
}

impl<A: Assembly, S: LinearSolver> Simulation<A, S> {
    /// Start from `x0`, `v0` with a consistent initial acceleration.
    pub fn with_solver(
        params: IntegrationParameters,
        assembly: A,
        mut solver: S,
        x0: &VectorD,
        v0: &VectorD,
    ) -> Result<Self> {
        params.validate()?;
        let n = assembly.num_dofs();
        if x0.len() != n {
            return Err(SolverError::dimension("initial position", n, x0.len()));
        }
        let a0 = initial_acceleration(&assembly, params.t_start, x0, v0, &mut solver)?;
        let state0 = State::new_with_initial_state(params.t_start, x0, v0, &a0)?;
        Self::with_initial_state(params, assembly, solver, state0)
    }

    /// Start from a complete initial state, including its acceleration.
    pub fn with_initial_state(
        params: IntegrationParameters,
        assembly: A,
        solver: S,
        state0: State,
    ) -> Result<Self> {
        params.validate()?;
        let n = assembly.num_dofs();
        if state0.num_dofs() != n {
            return Err(SolverError::dimension("initial state", n, state0.num_dofs()));
        }
        if state0.v.len() != n || state0.a.len() != n || state0.a_alg.len() != n {
            return Err(SolverError::dimension("initial state vectors", n, state0.v.len()));
        }

        info!(
            "simulation: {} dofs, t = [{}, {}], beta = {:.4}, gamma = {:.4}, alpha_m = {:.4}, alpha_f = {:.4}",
            n, params.t_start, params.t_end, params.beta, params.gamma, params.alpha_m, params.alpha_f
        );

        Ok(Simulation {
            corrector: Corrector::new(&params, solver),
            controller: StepController::new(&params),
            history: StateHistory::new(state0, HISTORY_LENGTH),
            cancel: CancelToken::new(),
            step: 0,
            summary: RunSummary::default(),
            params,
            assembly,
        })
    }

    pub fn params(&self) -> &IntegrationParameters {
        &self.params
    }

    pub fn assembly(&self) -> &A {
        &self.assembly
    }

    /// Model access between steps; the next step assembles the changed model
    pub fn assembly_mut(&mut self) -> &mut A {
        &mut self.assembly
    }

    pub fn history(&self) -> &StateHistory {
        &self.history
    }

    /// Last accepted state
    pub fn state(&self) -> &State {
        self.history.current()
    }

    pub fn time(&self) -> f64 {
        self.history.time()
    }

    /// Number of accepted steps
    pub fn step(&self) -> usize {
        self.step
    }

    /// Step size of the next attempt
    pub fn step_size(&self) -> f64 {
        self.controller.step_size()
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Token that stops the run between Newton iterations or steps
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Use an externally owned token, e.g. one shared with the assembly
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn is_finished(&self) -> bool {
        self.time() >= self.params.t_end
    }

    /// Snapshot of the current state as step 0, before any step is taken
    pub fn initial_snapshot(&self) -> StepSnapshot {
        StepSnapshot {
            step: 0,
            state: self.state().clone(),
            record: None,
            modes: Vec::new(),
        }
    }

    /// Replace the initial position by the static equilibrium at `t_start`
    /// and recompute the initial acceleration. Only allowed before the first
    /// step; the state is kept if the static iteration fails.
    pub fn equilibrate_initial_state(&mut self) -> Result<ConvergenceRecord> {
        if self.step > 0 {
            return Err(SolverError::configuration(
                "equilibrate_initial_state",
                "must be called before the first step",
            ));
        }
        let state0 = self.history.current().clone();
        let solution = solve_static_equilibrium(
            &self.assembly,
            state0.t,
            &state0.x,
            &self.params,
            self.corrector.solver_mut(),
        )?;
        if !solution.record.accepted() {
            warn!(
                "static equilibrium not found ({:?} after {} iterations), keeping initial state",
                solution.record.status, solution.record.iterations
            );
            return Ok(solution.record);
        }

        let a0 = initial_acceleration(
            &self.assembly,
            state0.t,
            &solution.x,
            &state0.v,
            self.corrector.solver_mut(),
        )?;
        let state = State::new_with_initial_state(state0.t, &solution.x, &state0.v, &a0)?;
        self.history = StateHistory::new(state, HISTORY_LENGTH);
        Ok(solution.record)
    }

    /// Eigenpairs of the system linearized at the last accepted state.
    pub fn extract_modes(&mut self, request: &ModeRequest) -> Result<Vec<Eigenpair>> {
        request.validate()?;
        extract(
            &self.assembly,
            self.history.current(),
            request,
            self.corrector.solver_mut(),
        )
    }

    /// Run the periodic mode requests due at the current step. Partial
    /// results are kept; the run continues regardless.
    fn scheduled_modes(&mut self) -> Result<Vec<ModeSet>> {
        let mut sets = Vec::new();
        let state = self.history.current();
        for (i, request) in self.params.modes.iter().enumerate() {
            if request.interval == 0 || self.step % request.interval != 0 {
                continue;
            }
            let (pairs, converged) =
                match extract(&self.assembly, state, request, self.corrector.solver_mut()) {
                    Ok(pairs) => (pairs, true),
                    Err(SolverError::EigenNotConverged(e)) => {
                        warn!("t={:.6}: mode request {}: {}", state.t, i, e);
                        (e.converged, false)
                    }
                    Err(e) if !e.is_fatal() => {
                        warn!("t={:.6}: mode request {}: {}", state.t, i, e);
                        (Vec::new(), false)
                    }
                    Err(e) => return Err(e),
                };
            if !converged {
                self.summary.mode_failures += 1;
            }
            sets.push(ModeSet {
                request: i,
                time: state.t,
                shift: request.shift,
                pairs,
                converged,
            });
        }
        Ok(sets)
    }

    /// Advance one accepted step.
    ///
    /// Rejected attempts are retried from the last accepted state with a
    /// smaller step. Returns `Ok(None)` once the end time is reached.
    pub fn solve_next(&mut self) -> Result<Option<StepSnapshot>> {
        if self.cancel.is_cancelled() {
            return Err(SolverError::Cancelled { time: self.time() });
        }
        if self.is_finished() {
            return Ok(None);
        }

        loop {
            // Land on the end time. A full step that would leave less than
            // h_min splits the remainder in two, or takes all of it if the
            // halves would be below h_min.
            let t = self.time();
            let remaining = self.params.t_end - t;
            let h_next = self.controller.step_size();
            let h_min = self.controller.min_step_size();
            let (h, last_step) = if remaining <= h_next * (1. + END_TIME_SLACK) {
                (remaining, true)
            } else if remaining - h_next < h_min {
                let half = 0.5 * remaining;
                if half >= h_min {
                    (half, false)
                } else {
                    (remaining, true)
                }
            } else {
                (h_next, false)
            };

            let mut attempt = self.corrector.solve_time_step(
                &self.assembly,
                self.history.current(),
                h,
                Some(&self.cancel),
            )?;
            self.summary.newton_iterations += attempt.record.iterations;

            match self.controller.update(&attempt.record) {
                Ok(decision) if decision.accepted() => {
                    if last_step {
                        attempt.state.t = self.params.t_end;
                    }
                    self.step += 1;
                    self.summary.accept(&attempt.state, &attempt.record);
                    self.history.push(attempt.state);
                    info!(
                        "step {:5}: t = {:.6}, h = {:.3e}, {} iterations, |R| = {:.3e} ({:?})",
                        self.step,
                        self.time(),
                        h,
                        attempt.record.iterations,
                        attempt.record.final_residual(),
                        decision
                    );

                    let modes = self.scheduled_modes()?;
                    return Ok(Some(StepSnapshot {
                        step: self.step,
                        state: self.history.current().clone(),
                        record: Some(attempt.record),
                        modes,
                    }));
                }
                Ok(_) => {
                    self.summary.rejected_steps += 1;
                    warn!(
                        "t = {:.6}: step h = {:.3e} rejected ({:?} after {} iterations), retrying with h = {:.3e}",
                        t,
                        h,
                        attempt.record.status,
                        attempt.record.iterations,
                        self.controller.step_size()
                    );
                }
                Err(underflow) => {
                    self.summary.rejected_steps += 1;
                    error!(
                        "t = {:.6}: step size {:.3e} below minimum {:.3e}, giving up",
                        t, underflow.step_size, underflow.min_step_size
                    );
                    return Err(SolverError::StepSizeUnderflow {
                        time: t,
                        step_size: underflow.step_size,
                        min_step_size: underflow.min_step_size,
                        last_accepted: Box::new(self.history.current().clone()),
                    });
                }
            }
        }
    }

    /// Step to the end time, feeding the initial state and every accepted
    /// step to `sink`.
    pub fn run<R: ResultSink>(&mut self, sink: &mut R) -> Result<RunSummary> {
        if self.step == 0 {
            sink.record(&self.initial_snapshot());
        }
        while let Some(snapshot) = self.solve_next()? {
            sink.record(&snapshot);
        }
        Ok(self.summary.clone())
    }

    /// End the run and return its statistics.
    pub fn finish(self) -> RunSummary {
        let s = &self.summary;
        info!(
            "simulation done at t = {:.6}: {} steps accepted, {} rejected, {} Newton iterations, h in [{:.3e}, {:.3e}], solver {}",
            s.final_time,
            s.accepted_steps,
            s.rejected_steps,
            s.newton_iterations,
            s.min_step_size,
            s.max_step_size,
            self.corrector.solver().name()
        );
        self.summary
    }
}
