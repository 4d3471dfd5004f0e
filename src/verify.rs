//! Regression check of a computed response against reference curves.

use std::path::Path;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SolverError};
use crate::results::{Quantity, ResultHistory};

/// Reference time series of one DOF quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceChannel {
    #[serde(default)]
    pub name: String,
    pub dof: usize,
    pub quantity: Quantity,
    pub samples: Vec<(f64, f64)>, // (time, value)
}

impl ReferenceChannel {
    pub fn label(&self) -> String {
        if self.name.is_empty() {
            format!("{:?}[{}]", self.quantity, self.dof).to_lowercase()
        } else {
            self.name.clone()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceResponse {
    pub channels: Vec<ReferenceChannel>,
}

impl ReferenceResponse {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| SolverError::FileRead {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Record channels of a computed history, e.g. to create a new reference
    pub fn from_history(history: &ResultHistory, channels: &[(usize, Quantity)]) -> Result<Self> {
        let times = history.times();
        let channels = channels
            .iter()
            .map(|&(dof, quantity)| {
                let values = history.dof_history(dof, quantity)?;
                Ok(ReferenceChannel {
                    name: String::new(),
                    dof,
                    quantity,
                    samples: times.iter().copied().zip(values).collect(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ReferenceResponse { channels })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Outcome of a successful comparison.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub channels: usize,
    pub samples: usize,
    pub max_deviation: f64, // scaled by max(1, |expected|)
}

/// Compare computed channels with the reference, interpolating the history
/// at the reference sample times.
///
/// Fails on the first sample whose deviation exceeds
/// `tolerance * max(1, |expected|)`, or that lies outside the computed time
/// span.
pub fn compare_response(
    history: &ResultHistory,
    reference: &ReferenceResponse,
    tolerance: f64,
) -> Result<VerificationReport> {
    if !(tolerance >= 0.) {
        return Err(SolverError::configuration("tolerance", "must not be negative"));
    }

    let mut report = VerificationReport::default();
    for channel in &reference.channels {
        let label = channel.label();
        for &(t, expected) in &channel.samples {
            let found = history
                .sample(channel.dof, channel.quantity, t)?
                .unwrap_or(f64::NAN);
            let scale = expected.abs().max(1.);
            let deviation = (found - expected).abs() / scale;
            if !(deviation <= tolerance) {
                debug!("verify {}: t={:.6} expected {:.6e} found {:.6e}", label, t, expected, found);
                return Err(SolverError::Verification {
                    channel: label,
                    time: t,
                    expected,
                    found,
                });
            }
            report.max_deviation = report.max_deviation.max(deviation);
            report.samples += 1;
        }
        report.channels += 1;
    }

    info!(
        "response verified: {} channels, {} samples, max deviation {:.3e}",
        report.channels, report.samples, report.max_deviation
    );
    Ok(report)
}
