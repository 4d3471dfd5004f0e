use serde::{Deserialize, Serialize};

use crate::config::IntegrationParameters;

use super::corrector::{ConvergenceRecord, NewtonState};

/// Step-size action taken after a step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepDecision {
    /// Accepted in few iterations, step size increased
    Grow,
    /// Accepted, step size unchanged
    Keep,
    /// Rejected, retry the same interval with a smaller step
    Cut,
}

impl StepDecision {
    pub fn accepted(&self) -> bool {
        !matches!(self, StepDecision::Cut)
    }
}

/// Cut step size dropped below `h_min`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepSizeUnderflow {
    pub step_size: f64,
    pub min_step_size: f64,
}

/// Accept/grow/cut policy driven by the Newton convergence record.
///
/// Only the step size is mutated here; states are owned by the history.
#[derive(Debug, Clone, PartialEq)]
pub struct StepController {
    h: f64,
    h_min: f64,
    h_max: f64,
    growth_factor: f64,
    cut_factor: f64,
    fast_iterations: usize,
}

impl StepController {
    pub fn new(params: &IntegrationParameters) -> Self {
        StepController {
            h: params.h_init,
            h_min: params.h_min,
            h_max: params.h_max,
            growth_factor: params.growth_factor,
            cut_factor: params.cut_factor,
            fast_iterations: params.fast_iterations,
        }
    }

    /// Step size for the next attempt
    pub fn step_size(&self) -> f64 {
        self.h
    }

    pub fn min_step_size(&self) -> f64 {
        self.h_min
    }

    pub fn max_step_size(&self) -> f64 {
        self.h_max
    }

    pub fn decide(&self, record: &ConvergenceRecord) -> StepDecision {
        match record.status {
            NewtonState::Converged if record.iterations <= self.fast_iterations => {
                StepDecision::Grow
            }
            NewtonState::Converged => StepDecision::Keep,
            _ => StepDecision::Cut,
        }
    }

    /// Update the step size from an attempt's record.
    ///
    /// Cuts apply to the step size actually attempted, which may have been
    /// shortened to land on the end time.
    pub fn update(&mut self, record: &ConvergenceRecord) -> Result<StepDecision, StepSizeUnderflow> {
        let decision = self.decide(record);
        match decision {
            StepDecision::Grow => {
                self.h = (self.h * self.growth_factor).min(self.h_max);
            }
            StepDecision::Keep => {}
            StepDecision::Cut => {
                let h = record.step_size * self.cut_factor;
                if h < self.h_min {
                    return Err(StepSizeUnderflow {
                        step_size: h,
                        min_step_size: self.h_min,
                    });
                }
                self.h = h;
            }
        }
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn record(status: NewtonState, iterations: usize, h: f64) -> ConvergenceRecord {
        ConvergenceRecord {
            status,
            iterations,
            ..ConvergenceRecord::new(h)
        }
    }

    #[test]
    fn test_decisions() {
        let controller = StepController::new(&IntegrationParameters::default());
        assert_eq!(controller.decide(&record(NewtonState::Converged, 1, 0.01)), StepDecision::Grow);
        assert_eq!(controller.decide(&record(NewtonState::Converged, 2, 0.01)), StepDecision::Grow);
        assert_eq!(controller.decide(&record(NewtonState::Converged, 3, 0.01)), StepDecision::Keep);
        assert_eq!(controller.decide(&record(NewtonState::Diverged, 1, 0.01)), StepDecision::Cut);
        assert_eq!(
            controller.decide(&record(NewtonState::MaxIterExceeded, 20, 0.01)),
            StepDecision::Cut
        );
        assert!(!StepDecision::Cut.accepted());
    }

    #[test]
    fn test_growth_is_capped() {
        let params = IntegrationParameters::default().with_step_sizes(0.1, 0.01, 0.15);
        let mut controller = StepController::new(&params);
        controller.update(&record(NewtonState::Converged, 1, 0.1)).unwrap();
        assert_relative_eq!(controller.step_size(), 0.15);
        controller.update(&record(NewtonState::Converged, 1, 0.15)).unwrap();
        assert_relative_eq!(controller.step_size(), 0.15);
    }

    #[test]
    fn test_cut_uses_attempted_step() {
        let params = IntegrationParameters::default().with_step_sizes(0.1, 0.001, 0.1);
        let mut controller = StepController::new(&params);
        controller.update(&record(NewtonState::Diverged, 2, 0.04)).unwrap();
        assert_relative_eq!(controller.step_size(), 0.02);
    }
}
