//! Implicit nonlinear time integration for discretized structural dynamics.
//!
//! A [`solver::Simulation`] advances the state `(x, v, a)` of a system
//! `M a + C v + F_int(x) = F_ext(t)` with the Newmark / generalized-alpha
//! scheme, solving each step by Newton iteration with adaptive step size.
//! The system itself is supplied through the [`system::Assembly`] trait.

pub mod config;
pub mod error;
pub mod prelude;
pub mod results;
pub mod solver;
pub mod system;
pub mod verify;

pub use config::{ConvergenceNorm, IntegrationParameters, ModeRequest};
pub use error::{EigenNotConverged, Result, SolverError};
