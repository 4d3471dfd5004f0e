pub mod cancel;
pub mod corrector;
pub mod dynamic;
pub mod linear;
pub mod modes;
pub mod predictor;
pub mod state;
pub mod statics;
pub mod step_control;

pub use cancel::CancelToken;
pub use corrector::{ConvergenceCriteria, ConvergenceRecord, Corrector, NewtonState, StepAttempt};
pub use dynamic::{RunSummary, Simulation};
pub use linear::{DenseLuSolver, DirectSolver, LinearSolver, SolverStats, SparseCholeskySolver};
pub use modes::{inverse_iteration, Eigenpair, ModeSet};
pub use predictor::{Predictor, SchemeCoefficients};
pub use state::{State, StateHistory};
pub use statics::{solve_static_equilibrium, StaticSolution};
pub use step_control::{StepController, StepDecision, StepSizeUnderflow};
