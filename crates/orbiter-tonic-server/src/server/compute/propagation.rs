//! Two-body propagation of TLE mean elements.

use super::{
    frames::teme_to_itrf,
    time::{TimeWindow, format_timestamp, offset_seconds},
    tle::{Tle, catalog_number},
};
use chrono::{DateTime, Utc};
use core::f64::consts::TAU;
use nalgebra::{Rotation3, Vector3};
use orbiter::{ComputeError, ComputeProvider, RequestSpan, ResultWeight};
use orbiter_tonic_core::proto::{
    PositionPoint, PropagationConfig, ReferenceFrame, TleLines, Track,
};

/// Earth's gravitational parameter in km³/s².
pub const MU_EARTH_KM3_S2: f64 = 398_600.441_8;

/// Upper bound on samples requested per TLE.
pub const MAX_POSITION_COUNT: u32 = 100_000;

/// Encoded size of one position sample and of a track's fixed part.
pub const TRACK_WEIGHT: ResultWeight = ResultWeight::new(56, 48);

const KEPLER_TOLERANCE: f64 = 1e-12;
const KEPLER_MAX_ITERATIONS: usize = 50;

/// Solves `M = E - e sin E` for the eccentric anomaly by Newton iteration.
pub fn solve_kepler(mean_anomaly: f64, eccentricity: f64) -> Option<f64> {
    let m = mean_anomaly.rem_euclid(TAU);
    let mut e_anom = if eccentricity < 0.8 { m } else { core::f64::consts::PI };

    for _ in 0..KEPLER_MAX_ITERATIONS {
        let delta = (e_anom - eccentricity * e_anom.sin() - m) / (1.0 - eccentricity * e_anom.cos());
        e_anom -= delta;
        if delta.abs() < KEPLER_TOLERANCE {
            return Some(e_anom);
        }
    }
    None
}

/// Mean elements of an orbit, ready to be evaluated at any instant.
#[derive(Clone, Debug)]
pub struct KeplerOrbit {
    tle: Tle,
    semi_major_axis_km: f64,
    mean_motion_rad_s: f64,
    orientation: Rotation3<f64>,
}

impl KeplerOrbit {
    pub fn from_tle(tle: Tle) -> Result<Self, ComputeError> {
        if !(0.0..1.0).contains(&tle.eccentricity) {
            return Err(ComputeError::invalid_input(format!(
                "eccentricity {} is not elliptical",
                tle.eccentricity
            )));
        }

        let mean_motion_rad_s = tle.mean_motion_rev_per_day * TAU / 86_400.0;
        let semi_major_axis_km = (MU_EARTH_KM3_S2 / mean_motion_rad_s.powi(2)).cbrt();
        // Perifocal to inertial: Rz(RAAN) * Rx(i) * Rz(argument of perigee).
        let orientation = Rotation3::from_axis_angle(&Vector3::z_axis(), tle.raan_deg.to_radians())
            * Rotation3::from_axis_angle(&Vector3::x_axis(), tle.inclination_deg.to_radians())
            * Rotation3::from_axis_angle(&Vector3::z_axis(), tle.arg_perigee_deg.to_radians());

        Ok(Self {
            tle,
            semi_major_axis_km,
            mean_motion_rad_s,
            orientation,
        })
    }

    pub const fn tle(&self) -> &Tle {
        &self.tle
    }

    pub const fn semi_major_axis_km(&self) -> f64 {
        self.semi_major_axis_km
    }

    /// Inertial (TEME) position in km.
    pub fn position_teme(&self, at: DateTime<Utc>) -> Result<Vector3<f64>, ComputeError> {
        let elapsed = (at - self.tle.epoch).num_microseconds().map_or_else(
            || (at - self.tle.epoch).num_seconds() as f64,
            |us| us as f64 * 1e-6,
        );
        let e = self.tle.eccentricity;
        let mean_anomaly = self.tle.mean_anomaly_deg.to_radians() + self.mean_motion_rad_s * elapsed;
        let e_anom = solve_kepler(mean_anomaly, e).ok_or_else(|| {
            ComputeError::compute(format!("Kepler's equation did not converge for {}", self.tle))
        })?;

        let true_anomaly = 2.0
            * ((1.0 + e).sqrt() * (e_anom / 2.0).sin())
                .atan2((1.0 - e).sqrt() * (e_anom / 2.0).cos());
        let radius = self.semi_major_axis_km * (1.0 - e * e_anom.cos());
        let perifocal = Vector3::new(radius * true_anomaly.cos(), radius * true_anomaly.sin(), 0.0);

        Ok(self.orientation * perifocal)
    }

    /// Position in `frame` at `at`.
    pub fn position(
        &self,
        at: DateTime<Utc>,
        frame: ReferenceFrame,
    ) -> Result<Vector3<f64>, ComputeError> {
        let teme = self.position_teme(at)?;
        Ok(match frame {
            ReferenceFrame::Teme => teme,
            ReferenceFrame::Itrf => teme_to_itrf(&teme, at),
        })
    }
}

/// Validated parameters shared by every TLE of a propagation request.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PropagationParams {
    pub window: TimeWindow,
    pub position_count: u32,
    pub frame: ReferenceFrame,
}

impl TryFrom<&PropagationConfig> for PropagationParams {
    type Error = ComputeError;

    fn try_from(config: &PropagationConfig) -> Result<Self, Self::Error> {
        let window = TimeWindow::parse(&config.start_date, &config.end_date)?;
        if config.position_count == 0 || config.position_count > MAX_POSITION_COUNT {
            return Err(ComputeError::invalid_input(format!(
                "position_count must be between 1 and {MAX_POSITION_COUNT}, got {}",
                config.position_count
            )));
        }
        let frame = ReferenceFrame::try_from(config.output_frame).map_err(|_| {
            ComputeError::invalid_input(format!("unknown output frame {}", config.output_frame))
        })?;

        Ok(Self {
            window,
            position_count: config.position_count,
            frame,
        })
    }
}

impl PropagationParams {
    /// Evenly spaced sample instants over the window; the start alone when
    /// one sample is requested.
    pub fn sample_times(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        let step = if self.position_count > 1 {
            self.window.seconds() / f64::from(self.position_count - 1)
        } else {
            0.0
        };
        (0..self.position_count).map(move |i| {
            if i + 1 == self.position_count && self.position_count > 1 {
                self.window.end
            } else {
                offset_seconds(self.window.start, step * f64::from(i))
            }
        })
    }

    pub fn span(&self) -> RequestSpan {
        RequestSpan::samples(self.window.duration(), self.position_count)
    }
}

/// Propagates one TLE into a track of `position_count` positions.
#[derive(Clone, Copy, Debug, Default)]
pub struct PropagationProvider;

impl ComputeProvider for PropagationProvider {
    type Input = TleLines;
    type Params = PropagationParams;
    type Output = Track;

    fn compute(&self, input: &TleLines, params: &PropagationParams) -> Result<Track, ComputeError> {
        let orbit = KeplerOrbit::from_tle(Tle::parse(&input.line1, &input.line2)?)?;

        let positions = params
            .sample_times()
            .map(|at| {
                let p = orbit.position(at, params.frame)?;
                Ok(PositionPoint {
                    x: p.x,
                    y: p.y,
                    z: p.z,
                    timestamp: format_timestamp(at),
                })
            })
            .collect::<Result<Vec<_>, ComputeError>>()?;

        Ok(Track {
            positions,
            frame: params.frame.into(),
        })
    }

    fn external_id(&self, input: &TleLines) -> Option<u64> {
        catalog_number(&input.line1).map(u64::from)
    }
}
