//! State vector conversion between the inertial and Earth-fixed frames.

use super::{
    frames::{itrf_to_teme_state, teme_to_itrf_state},
    time::{format_timestamp, parse_timestamp},
};
use chrono::{DateTime, Utc};
use nalgebra::Vector3;
use orbiter::{ComputeError, ComputeProvider};
use orbiter_tonic_core::proto::{ReferenceFrame, StateVector, TransformConfig};

/// Validated parameters shared by every state vector of a request.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TransformParams {
    pub source: ReferenceFrame,
    pub target: ReferenceFrame,
    pub epoch: DateTime<Utc>,
}

fn frame(raw: i32, field: &str) -> Result<ReferenceFrame, ComputeError> {
    ReferenceFrame::try_from(raw)
        .map_err(|_| ComputeError::invalid_input(format!("unknown {field} {raw}")))
}

impl TryFrom<&TransformConfig> for TransformParams {
    type Error = ComputeError;

    fn try_from(config: &TransformConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            source: frame(config.source_frame, "source_frame")?,
            target: frame(config.target_frame, "target_frame")?,
            epoch: parse_timestamp(&config.epoch, "epoch")?,
        })
    }
}

impl TransformParams {
    pub fn epoch(&self) -> String {
        format_timestamp(self.epoch)
    }
}

fn split(state: &StateVector) -> Result<(Vector3<f64>, Vector3<f64>), ComputeError> {
    let components = [state.x, state.y, state.z, state.vx, state.vy, state.vz];
    if !components.iter().all(|c| c.is_finite()) {
        return Err(ComputeError::invalid_input(
            "state vector has a non-finite component",
        ));
    }
    Ok((
        Vector3::new(state.x, state.y, state.z),
        Vector3::new(state.vx, state.vy, state.vz),
    ))
}

fn join(position: Vector3<f64>, velocity: Vector3<f64>) -> StateVector {
    StateVector {
        x: position.x,
        y: position.y,
        z: position.z,
        vx: velocity.x,
        vy: velocity.y,
        vz: velocity.z,
    }
}

/// Converts one state vector from `params.source` to `params.target`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TransformationProvider;

impl ComputeProvider for TransformationProvider {
    type Input = StateVector;
    type Params = TransformParams;
    type Output = StateVector;

    fn compute(
        &self,
        input: &StateVector,
        params: &TransformParams,
    ) -> Result<StateVector, ComputeError> {
        let (position, velocity) = split(input)?;
        let (position, velocity) = match (params.source, params.target) {
            (ReferenceFrame::Teme, ReferenceFrame::Itrf) => {
                teme_to_itrf_state(&position, &velocity, params.epoch)
            }
            (ReferenceFrame::Itrf, ReferenceFrame::Teme) => {
                itrf_to_teme_state(&position, &velocity, params.epoch)
            }
            _ => (position, velocity),
        };
        Ok(join(position, velocity))
    }
}
