//! Error types for the time-integration core.
//!
//! Only configuration errors and step-size underflow are fatal to a run.
//! Singular solves are absorbed by the Newton loop and surface here only when
//! a linear solver is called directly. Eigen extraction failures carry the
//! modes that did converge.

use thiserror::Error;

use crate::solver::modes::Eigenpair;
use crate::solver::state::State;

/// Result type alias using [`SolverError`].
pub type Result<T> = std::result::Result<T, SolverError>;

/// Unified error type for all solver operations.
#[derive(Error, Debug)]
pub enum SolverError {
    // ============ Configuration Errors ============
    /// Invalid integration coefficient, step size or tolerance
    #[error("Invalid configuration parameter '{parameter}': {message}")]
    Configuration { parameter: String, message: String },

    /// Vector or matrix dimension does not match the system size
    #[error("Dimension mismatch for {what}: expected {expected}, found {found}")]
    DimensionMismatch {
        what: String,
        expected: usize,
        found: usize,
    },

    /// Error reading a configuration or reference file
    #[error("Failed to read '{path}': {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Malformed JSON input
    #[error("Failed to parse JSON input: {0}")]
    Parse(#[from] serde_json::Error),

    // ============ Numerical Errors ============
    /// Linear system is numerically singular
    #[error("Singular system (pivot {pivot:.3e} below tolerance {tolerance:.3e})")]
    SingularSystem { pivot: f64, tolerance: f64 },

    /// Step size fell below the minimum without a converged step
    #[error(
        "Step size {step_size:.3e} below minimum {min_step_size:.3e} at t={time:.6}; last accepted state at t={:.6}",
        .last_accepted.t
    )]
    StepSizeUnderflow {
        time: f64,
        step_size: f64,
        min_step_size: f64,
        last_accepted: Box<State>,
    },

    /// Inverse iteration did not converge for all requested modes
    #[error(transparent)]
    EigenNotConverged(#[from] EigenNotConverged),

    // ============ Run Control ============
    /// Run was cancelled; the state at `time` is the last accepted one
    #[error("Run cancelled, last accepted state at t={time:.6}")]
    Cancelled { time: f64 },

    /// Computed response deviates from the reference response
    #[error("Response verification failed for '{channel}' at t={time:.6}: expected {expected:.6e}, found {found:.6e}")]
    Verification {
        channel: String,
        time: f64,
        expected: f64,
        found: f64,
    },
}

impl SolverError {
    /// Create a configuration error
    pub fn configuration(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    /// Create a dimension mismatch error
    pub fn dimension(what: impl Into<String>, expected: usize, found: usize) -> Self {
        Self::DimensionMismatch {
            what: what.into(),
            expected,
            found,
        }
    }

    /// Create a singular system error
    pub fn singular(pivot: f64, tolerance: f64) -> Self {
        Self::SingularSystem { pivot, tolerance }
    }

    /// True for errors that end a run
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::SingularSystem { .. } | Self::EigenNotConverged(_)
        )
    }
}

/// Partial-success signal from the eigen extractor.
///
/// `converged` holds every mode found before `mode` failed.
#[derive(Error, Debug, Clone)]
#[error("Mode {mode} did not converge in {iterations} iterations ({} of {requested} modes converged)", .converged.len())]
pub struct EigenNotConverged {
    pub mode: usize,
    pub iterations: usize,
    pub requested: usize,
    pub converged: Vec<Eigenpair>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors() {
        // Mode extraction failures are reported and the run goes on
        assert!(!SolverError::singular(0., 1e-12).is_fatal());
        let partial = EigenNotConverged {
            mode: 0,
            iterations: 10,
            requested: 1,
            converged: Vec::new(),
        };
        assert!(!SolverError::from(partial).is_fatal());

        assert!(SolverError::Cancelled { time: 1. }.is_fatal());
        assert!(SolverError::configuration("h_min", "must be positive").is_fatal());
        assert!(SolverError::dimension("initial position", 2, 3).is_fatal());
    }
}
