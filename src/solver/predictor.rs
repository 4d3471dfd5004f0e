use crate::config::IntegrationParameters;
use crate::prelude::*;

use super::state::State;

/// Step-size dependent coefficients of the iteration matrix and update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchemeCoefficients {
    pub h: f64,
    pub beta_prime: f64,  // d(acceleration)/d(position)
    pub gamma_prime: f64, // d(velocity)/d(position)
    pub alg_ratio: f64,   // d(algorithm acceleration)/d(acceleration)
}

/// Newmark / generalized-alpha predictor.
///
/// The trial state holds the previous acceleration constant; position and
/// velocity follow from the integration formulas, so the trial state tends to
/// the previous state as `h` goes to zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Predictor {
    beta: f64,
    gamma: f64,
    alpha_m: f64,
    alpha_f: f64,
}

impl Predictor {
    /// Coefficients are assumed validated by [`IntegrationParameters::validate`].
    pub fn new(params: &IntegrationParameters) -> Self {
        Predictor {
            beta: params.beta,
            gamma: params.gamma,
            alpha_m: params.alpha_m,
            alpha_f: params.alpha_f,
        }
    }

    pub fn coefficients(&self, h: f64) -> SchemeCoefficients {
        SchemeCoefficients {
            h,
            beta_prime: (1. - self.alpha_m) / (h * h * self.beta * (1. - self.alpha_f)),
            gamma_prime: self.gamma / (h * self.beta),
            alg_ratio: (1. - self.alpha_f) / (1. - self.alpha_m),
        }
    }

    pub fn predict_next_state(&self, state: &State, h: f64) -> State {
        let mut state_next = state.clone();

        // Increment time
        state_next.t += h;

        // Hold acceleration constant
        state_next.a.copy_from(&state.a);

        // Calculate algorithmic acceleration
        state_next.a_alg = (self.alpha_f * &state.a - self.alpha_m * &state.a_alg)
            / (1. - self.alpha_m)
            + (1. - self.alpha_f) / (1. - self.alpha_m) * &state_next.a;

        // Calculate velocity
        state_next.v = &state.v
            + h * (1. - self.gamma) * &state.a_alg
            + self.gamma * h * &state_next.a_alg;

        // Calculate position
        state_next.x = &state.x
            + h * &state.v
            + (0.5 - self.beta) * h * h * &state.a_alg
            + self.beta * h * h * &state_next.a_alg;

        state_next
    }

    /// Apply a position correction `dx` to a trial state, keeping velocity and
    /// accelerations consistent with the integration formulas.
    pub fn correct(&self, state: &mut State, dx: &VectorD, coef: &SchemeCoefficients) {
        state.x += dx;
        state.v.axpy(coef.gamma_prime, dx, 1.);
        state.a.axpy(coef.beta_prime, dx, 1.);
        state.a_alg.axpy(coef.alg_ratio * coef.beta_prime, dx, 1.);
    }
}
