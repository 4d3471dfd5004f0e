//! Run configuration for the time integrator.
//!
//! All values are validated once, before any stepping begins. Out-of-range
//! values are rejected with [`SolverError::Configuration`].

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SolverError};

/// Rounding allowance on the gamma stability range
const GAMMA_SLACK: f64 = 1e-12;

/// Norm used for the residual and increment convergence checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvergenceNorm {
    /// Euclidean norm
    #[default]
    Euclidean,
    /// Euclidean norm divided by sqrt(N)
    Rms,
    /// Largest absolute component
    Max,
}

impl ConvergenceNorm {
    pub fn apply(&self, v: &crate::prelude::VectorD) -> f64 {
        match self {
            Self::Euclidean => v.norm(),
            Self::Rms => {
                if v.is_empty() {
                    0.
                } else {
                    v.norm() / (v.len() as f64).sqrt()
                }
            }
            Self::Max => v.amax(),
        }
    }
}

/// Eigenmode extraction request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeRequest {
    /// Number of modes closest to `shift`
    pub count: usize,
    /// Inverse iteration shift
    pub shift: f64,
    /// Extract every `interval` accepted steps, 0 for on-demand only
    pub interval: usize,
    /// Iteration budget per mode
    pub max_iterations: usize,
    /// Relative tolerance on eigenvalue and eigenvector change
    pub tolerance: f64,
}

impl Default for ModeRequest {
    fn default() -> Self {
        Self {
            count: 1,
            shift: 0.,
            interval: 0,
            max_iterations: 200,
            tolerance: 1e-8,
        }
    }
}

impl ModeRequest {
    pub fn new(count: usize, shift: f64) -> Self {
        Self {
            count,
            shift,
            ..Default::default()
        }
    }

    pub fn every(mut self, interval: usize) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_convergence(mut self, max_iterations: usize, tolerance: f64) -> Self {
        self.max_iterations = max_iterations;
        self.tolerance = tolerance;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.count == 0 {
            return Err(SolverError::configuration("modes.count", "must be at least 1"));
        }
        if !self.shift.is_finite() {
            return Err(SolverError::configuration("modes.shift", "must be finite"));
        }
        if self.max_iterations == 0 {
            return Err(SolverError::configuration(
                "modes.max_iterations",
                "must be at least 1",
            ));
        }
        if !(self.tolerance > 0.) || !self.tolerance.is_finite() {
            return Err(SolverError::configuration("modes.tolerance", "must be positive"));
        }
        Ok(())
    }
}

/// Integration parameters for a run.
///
/// With `alpha_m = alpha_f = 0` the scheme is the Newmark-beta method; the
/// generalized-alpha preset sets all four coefficients from the spectral
/// radius at infinite frequency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationParameters {
    pub beta: f64,
    pub gamma: f64,
    pub alpha_m: f64,
    pub alpha_f: f64,
    pub t_start: f64,
    pub t_end: f64,
    pub h_init: f64,
    pub h_min: f64,
    pub h_max: f64,
    pub tol_residual: f64,
    pub tol_increment: f64,
    pub convergence_norm: ConvergenceNorm,
    pub max_iterations: usize,
    /// Residual growth ratio counted as a diverging iteration
    pub divergence_factor: f64,
    /// Converged steps using at most this many iterations grow the step
    pub fast_iterations: usize,
    pub growth_factor: f64,
    pub cut_factor: f64,
    /// Relative pivot threshold for singularity detection
    pub pivot_tolerance: f64,
    pub modes: Vec<ModeRequest>,
}

impl Default for IntegrationParameters {
    fn default() -> Self {
        Self {
            beta: 0.25,
            gamma: 0.5,
            alpha_m: 0.,
            alpha_f: 0.,
            t_start: 0.,
            t_end: 1.,
            h_init: 0.01,
            h_min: 1e-8,
            h_max: 0.01,
            tol_residual: 1e-8,
            tol_increment: 1e-8,
            convergence_norm: ConvergenceNorm::Euclidean,
            max_iterations: 20,
            divergence_factor: 1.,
            fast_iterations: 2,
            growth_factor: 2.,
            cut_factor: 0.5,
            pivot_tolerance: 1e-12,
            modes: Vec::new(),
        }
    }
}

impl IntegrationParameters {
    /// Newmark-beta with the given coefficients
    pub fn newmark(beta: f64, gamma: f64) -> Self {
        Self {
            beta,
            gamma,
            ..Default::default()
        }
    }

    /// Average acceleration (unconditionally stable), beta = 1/4, gamma = 1/2
    pub fn average_acceleration() -> Self {
        Self::newmark(0.25, 0.5)
    }

    /// Linear acceleration (conditionally stable), beta = 1/6, gamma = 1/2
    pub fn linear_acceleration() -> Self {
        Self::newmark(1. / 6., 0.5)
    }

    /// Fox-Goodwin, beta = 1/12, gamma = 1/2
    pub fn fox_goodwin() -> Self {
        Self::newmark(1. / 12., 0.5)
    }

    /// Generalized-alpha with spectral radius `rho_inf` in [0, 1]
    pub fn generalized_alpha(rho_inf: f64) -> Self {
        let alpha_m = (2. * rho_inf - 1.) / (rho_inf + 1.);
        let alpha_f = rho_inf / (rho_inf + 1.);
        let gamma = 0.5 + alpha_f - alpha_m;
        let beta = 0.25 * (gamma + 0.5).powi(2);
        Self {
            beta,
            gamma,
            alpha_m,
            alpha_f,
            ..Default::default()
        }
    }

    pub fn with_time_span(mut self, t_start: f64, t_end: f64) -> Self {
        self.t_start = t_start;
        self.t_end = t_end;
        self
    }

    pub fn with_step_sizes(mut self, h_init: f64, h_min: f64, h_max: f64) -> Self {
        self.h_init = h_init;
        self.h_min = h_min;
        self.h_max = h_max;
        self
    }

    /// Fixed step size, the controller can still cut down to `h / 2^10`
    pub fn with_fixed_step(self, h: f64) -> Self {
        self.with_step_sizes(h, h / 1024., h)
    }

    pub fn with_tolerances(mut self, tol_residual: f64, tol_increment: f64) -> Self {
        self.tol_residual = tol_residual;
        self.tol_increment = tol_increment;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_step_factors(mut self, growth_factor: f64, cut_factor: f64) -> Self {
        self.growth_factor = growth_factor;
        self.cut_factor = cut_factor;
        self
    }

    pub fn with_convergence_norm(mut self, norm: ConvergenceNorm) -> Self {
        self.convergence_norm = norm;
        self
    }

    pub fn with_mode_request(mut self, request: ModeRequest) -> Self {
        self.modes.push(request);
        self
    }

    /// Parse and validate parameters from a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let params: Self = serde_json::from_str(json)?;
        params.validate()?;
        Ok(params)
    }

    /// Read, parse and validate parameters from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| SolverError::FileRead {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        let finite = [
            ("beta", self.beta),
            ("gamma", self.gamma),
            ("alpha_m", self.alpha_m),
            ("alpha_f", self.alpha_f),
            ("t_start", self.t_start),
            ("t_end", self.t_end),
            ("h_init", self.h_init),
            ("h_min", self.h_min),
            ("h_max", self.h_max),
            ("tol_residual", self.tol_residual),
            ("tol_increment", self.tol_increment),
            ("divergence_factor", self.divergence_factor),
            ("growth_factor", self.growth_factor),
            ("cut_factor", self.cut_factor),
            ("pivot_tolerance", self.pivot_tolerance),
        ];
        if let Some((name, _)) = finite.iter().find(|(_, v)| !v.is_finite()) {
            return Err(SolverError::configuration(*name, "must be finite"));
        }

        // Scheme coefficients
        if self.beta <= 0. {
            return Err(SolverError::configuration("beta", "must be positive"));
        }
        // gamma is measured relative to the dissipation added by the alpha terms
        // with rounding slack, the generalized-alpha presets sit on the lower bound
        let gamma_shift = self.alpha_f - self.alpha_m;
        if !(0.5 - GAMMA_SLACK..=1. + GAMMA_SLACK).contains(&(self.gamma - gamma_shift)) {
            return Err(SolverError::configuration(
                "gamma",
                "gamma - (alpha_f - alpha_m) must lie in [0.5, 1]",
            ));
        }
        if self.alpha_m >= 1. {
            return Err(SolverError::configuration("alpha_m", "must be less than 1"));
        }
        if self.alpha_f >= 1. || self.alpha_f < 0. {
            return Err(SolverError::configuration("alpha_f", "must lie in [0, 1)"));
        }
        if self.alpha_m > self.alpha_f {
            return Err(SolverError::configuration(
                "alpha_m",
                "must not exceed alpha_f",
            ));
        }

        // Time span and step sizes
        if self.t_end < self.t_start {
            return Err(SolverError::configuration("t_end", "must not precede t_start"));
        }
        if self.h_min <= 0. {
            return Err(SolverError::configuration("h_min", "must be positive"));
        }
        if self.h_init < self.h_min {
            return Err(SolverError::configuration("h_init", "must be at least h_min"));
        }
        if self.h_max < self.h_init {
            return Err(SolverError::configuration("h_max", "must be at least h_init"));
        }

        // Convergence control
        if self.tol_residual <= 0. {
            return Err(SolverError::configuration("tol_residual", "must be positive"));
        }
        if self.tol_increment <= 0. {
            return Err(SolverError::configuration("tol_increment", "must be positive"));
        }
        if self.max_iterations == 0 {
            return Err(SolverError::configuration("max_iterations", "must be at least 1"));
        }
        if self.fast_iterations > self.max_iterations {
            return Err(SolverError::configuration(
                "fast_iterations",
                "must not exceed max_iterations",
            ));
        }
        if self.divergence_factor < 1. {
            return Err(SolverError::configuration(
                "divergence_factor",
                "must be at least 1",
            ));
        }
        if self.growth_factor < 1. {
            return Err(SolverError::configuration("growth_factor", "must be at least 1"));
        }
        if self.cut_factor <= 0. || self.cut_factor >= 1. {
            return Err(SolverError::configuration("cut_factor", "must lie in (0, 1)"));
        }
        if self.pivot_tolerance < 0. {
            return Err(SolverError::configuration(
                "pivot_tolerance",
                "must not be negative",
            ));
        }

        for request in &self.modes {
            request.validate()?;
        }
        Ok(())
    }
}
