//! Accepted-step snapshots and in-memory result extraction.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SolverError};
use crate::prelude::*;
use crate::solver::corrector::ConvergenceRecord;
use crate::solver::modes::ModeSet;
use crate::solver::state::State;

/// Immutable copy of an accepted step, emitted to the result sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSnapshot {
    pub step: usize,                       // 0 for the initial state
    pub state: State,
    pub record: Option<ConvergenceRecord>, // None for the initial state
    pub modes: Vec<ModeSet>,
}

impl StepSnapshot {
    pub fn time(&self) -> f64 {
        self.state.t
    }

    pub fn iterations(&self) -> usize {
        self.record.as_ref().map_or(0, |r| r.iterations)
    }
}

/// Consumer of accepted steps.
pub trait ResultSink {
    fn record(&mut self, snapshot: &StepSnapshot);
}

impl ResultSink for Vec<StepSnapshot> {
    fn record(&mut self, snapshot: &StepSnapshot) {
        self.push(snapshot.clone());
    }
}

/// Response quantity of a degree of freedom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantity {
    Displacement,
    Velocity,
    Acceleration,
}

impl Quantity {
    pub fn of<'a>(&self, state: &'a State) -> &'a VectorD {
        match self {
            Quantity::Displacement => &state.x,
            Quantity::Velocity => &state.v,
            Quantity::Acceleration => &state.a,
        }
    }
}

/// In-memory result database ordered by time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultHistory {
    snapshots: Vec<StepSnapshot>,
}

impl ResultHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn snapshots(&self) -> &[StepSnapshot] {
        &self.snapshots
    }

    pub fn last(&self) -> Option<&StepSnapshot> {
        self.snapshots.last()
    }

    pub fn times(&self) -> Vec<f64> {
        self.snapshots.iter().map(|s| s.time()).collect()
    }

    /// Newton iterations per recorded step
    pub fn iterations(&self) -> Vec<usize> {
        self.snapshots.iter().map(|s| s.iterations()).collect()
    }

    /// State of accepted step number `step`
    pub fn state_at(&self, step: usize) -> Option<&State> {
        self.snapshots
            .iter()
            .find(|s| s.step == step)
            .map(|s| &s.state)
    }

    /// Time series of one quantity of one DOF
    pub fn dof_history(&self, dof: usize, quantity: Quantity) -> Result<Vec<f64>> {
        self.snapshots
            .iter()
            .map(|s| {
                let values = quantity.of(&s.state);
                values
                    .get(dof)
                    .copied()
                    .ok_or_else(|| SolverError::dimension("dof index", values.len(), dof))
            })
            .collect()
    }

    /// Linear interpolation of one quantity at time `t`, `None` outside the
    /// recorded time span.
    pub fn sample(&self, dof: usize, quantity: Quantity, t: f64) -> Result<Option<f64>> {
        let times = self.times();
        let values = self.dof_history(dof, quantity)?;
        let (Some(&first), Some(&last)) = (times.first(), times.last()) else {
            return Ok(None);
        };
        if t < first || t > last {
            return Ok(None);
        }
        let value = izip!(times.iter(), values.iter())
            .tuple_windows()
            .find(|&((&t0, _), (&t1, _))| t0 <= t && t <= t1)
            .map(|((&t0, &v0), (&t1, &v1))| {
                if t1 > t0 {
                    v0 + (v1 - v0) * (t - t0) / (t1 - t0)
                } else {
                    v1
                }
            })
            .or_else(|| values.last().copied());
        Ok(value)
    }

    /// All mode sets extracted during the run, in step order
    pub fn modes(&self) -> impl Iterator<Item = &ModeSet> {
        self.snapshots.iter().flat_map(|s| s.modes.iter())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl ResultSink for ResultHistory {
    fn record(&mut self, snapshot: &StepSnapshot) {
        self.snapshots.push(snapshot.clone());
    }
}
