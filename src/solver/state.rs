use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SolverError};
use crate::prelude::*;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub t: f64,         // time
    pub x: VectorD,     // position
    pub v: VectorD,     // velocity
    pub a: VectorD,     // acceleration
    pub a_alg: VectorD, // algorithm acceleration
}

impl State {
    pub fn new(num_dofs: usize, t0: f64) -> Self {
        State {
            t: t0,
            x: VectorD::zeros(num_dofs),
            v: VectorD::zeros(num_dofs),
            a: VectorD::zeros(num_dofs),
            a_alg: VectorD::zeros(num_dofs),
        }
    }

    /// State with given position, velocity and acceleration. The algorithm
    /// acceleration starts equal to the acceleration.
    pub fn new_with_initial_state(t0: f64, x: &VectorD, v: &VectorD, a: &VectorD) -> Result<Self> {
        if v.len() != x.len() {
            return Err(SolverError::dimension("initial velocity", x.len(), v.len()));
        }
        if a.len() != x.len() {
            return Err(SolverError::dimension("initial acceleration", x.len(), a.len()));
        }
        Ok(State {
            t: t0,
            x: x.clone(),
            v: v.clone(),
            a: a.clone(),
            a_alg: a.clone(),
        })
    }

    pub fn num_dofs(&self) -> usize {
        self.x.len()
    }

    pub fn time(&self) -> f64 {
        self.t
    }
}

/// Rolling window of accepted states.
///
/// The window always holds at least the initial state, so `current()` never
/// fails. Pushing into a full window evicts the oldest entry.
#[derive(Debug, Clone)]
pub struct StateHistory {
    states: VecDeque<State>,
    capacity: usize,
}

impl StateHistory {
    pub fn new(initial: State, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut states = VecDeque::with_capacity(capacity);
        states.push_back(initial);
        StateHistory { states, capacity }
    }

    /// Most recently accepted state
    pub fn current(&self) -> &State {
        // Never empty: constructed with one state and push evicts only when full
        &self.states[self.states.len() - 1]
    }

    /// Accepted state `n` steps back, `previous(0)` is `current()`
    pub fn previous(&self, n: usize) -> Option<&State> {
        self.states.len().checked_sub(n + 1).map(|i| &self.states[i])
    }

    pub fn push(&mut self, state: State) {
        if self.states.len() == self.capacity {
            self.states.pop_front();
        }
        self.states.push_back(state);
    }

    pub fn time(&self) -> f64 {
        self.current().t
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &State> {
        self.states.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn state_at(t: f64) -> State {
        let mut s = State::new(2, t);
        s.x.fill(t);
        s
    }

    #[test]
    fn test_push_then_current() {
        let mut history = StateHistory::new(state_at(0.), 1);
        assert_relative_eq!(history.time(), 0.);

        let s = state_at(0.1);
        history.push(s.clone());
        assert_eq!(history.current(), &s);
        assert_relative_eq!(history.time(), 0.1);
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_push_evicts_oldest() {
        let mut history = StateHistory::new(state_at(0.), 3);
        history.push(state_at(1.));
        history.push(state_at(2.));
        assert_eq!(history.len(), 3);
        assert_relative_eq!(history.iter().next().unwrap().t, 0.);

        history.push(state_at(3.));
        assert_eq!(history.len(), 3);
        let times = history.iter().map(|s| s.t).collect_vec();
        assert_eq!(times, vec![1., 2., 3.]);
        assert_relative_eq!(history.previous(0).unwrap().t, 3.);
        assert_relative_eq!(history.previous(2).unwrap().t, 1.);
        assert!(history.previous(3).is_none());
    }

    #[test]
    fn test_initial_state_dimensions() {
        let x = VectorD::from_vec(vec![1., 2.]);
        let v = VectorD::zeros(2);
        let a = VectorD::zeros(3);
        assert!(matches!(
            State::new_with_initial_state(0., &x, &v, &a),
            Err(SolverError::DimensionMismatch { expected: 2, found: 3, .. })
        ));

        let s = State::new_with_initial_state(0.5, &x, &v, &v).unwrap();
        assert_eq!(s.num_dofs(), 2);
        assert_eq!(s.a_alg, s.a);
    }
}
