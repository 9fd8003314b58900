//! Access windows between a satellite and a ground station.
//!
//! Elevation is sampled every [`COARSE_STEP_SECONDS`] over the request
//! window. Every rise and set found by the scan is refined by bisection to
//! [`REFINE_TOLERANCE_SECONDS`].

use super::{
    frames::{elevation_deg, geodetic_to_ecef, local_up, teme_to_itrf},
    propagation::KeplerOrbit,
    time::{TimeWindow, format_timestamp, offset_seconds},
    tle::{Tle, catalog_number},
};
use chrono::{DateTime, Utc};
use nalgebra::Vector3;
use orbiter::{ComputeError, ComputeProvider, RequestSpan, ResultWeight};
use orbiter_tonic_core::proto::{AccessInterval, AccessIntervals, TleLines, VisibilityConfig};

pub const COARSE_STEP_SECONDS: f64 = 30.0;
pub const REFINE_TOLERANCE_SECONDS: f64 = 1.0;

/// Encoded size of one access interval and of the per-satellite fixed part.
pub const ACCESS_WEIGHT: ResultWeight = ResultWeight::new(80, 64);

#[derive(Clone, Debug, PartialEq)]
pub struct GroundSite {
    pub name: String,
    ecef: Vector3<f64>,
    up: Vector3<f64>,
}

impl GroundSite {
    pub fn new(
        name: impl Into<String>,
        latitude_deg: f64,
        longitude_deg: f64,
        altitude_m: f64,
    ) -> Result<Self, ComputeError> {
        if !(-90.0..=90.0).contains(&latitude_deg) {
            return Err(ComputeError::invalid_input(format!(
                "latitude {latitude_deg} is outside [-90, 90]"
            )));
        }
        if !(-180.0..=360.0).contains(&longitude_deg) {
            return Err(ComputeError::invalid_input(format!(
                "longitude {longitude_deg} is outside [-180, 360]"
            )));
        }
        if !altitude_m.is_finite() {
            return Err(ComputeError::invalid_input("altitude must be finite"));
        }

        Ok(Self {
            name: name.into(),
            ecef: geodetic_to_ecef(latitude_deg, longitude_deg, altitude_m),
            up: local_up(latitude_deg, longitude_deg),
        })
    }

    /// Elevation in degrees of an Earth-fixed position (km).
    pub fn elevation_deg(&self, target_ecef: &Vector3<f64>) -> f64 {
        elevation_deg(&self.ecef, &self.up, target_ecef)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct VisibilityParams {
    pub site: GroundSite,
    pub window: TimeWindow,
    pub min_elevation_deg: f64,
}

impl TryFrom<&VisibilityConfig> for VisibilityParams {
    type Error = ComputeError;

    fn try_from(config: &VisibilityConfig) -> Result<Self, Self::Error> {
        let station = config
            .ground_station
            .as_ref()
            .ok_or_else(|| ComputeError::invalid_input("ground_station is required"))?;
        let site = GroundSite::new(
            station.name.clone(),
            station.latitude_degrees,
            station.longitude_degrees,
            station.altitude_meters,
        )?;
        let window = TimeWindow::parse(&config.start_date, &config.end_date)?;
        if !(-90.0..=90.0).contains(&config.min_elevation_degrees) {
            return Err(ComputeError::invalid_input(format!(
                "min_elevation_degrees {} is outside [-90, 90]",
                config.min_elevation_degrees
            )));
        }

        Ok(Self {
            site,
            window,
            min_elevation_deg: config.min_elevation_degrees,
        })
    }
}

impl VisibilityParams {
    pub fn span(&self) -> RequestSpan {
        RequestSpan::visibility(self.window.duration(), self.min_elevation_deg)
    }
}

/// One pass, in seconds from the start of the search window.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AccessWindow {
    pub rise: f64,
    pub set: f64,
    pub max_elevation_deg: f64,
}

/// Scans `[0, duration]` seconds for stretches where `elevation` is at or
/// above `min_elevation_deg`.
///
/// A window already open at the start begins at 0; one still open at the end
/// closes at `duration`.
pub fn find_access_windows<F>(
    duration: f64,
    min_elevation_deg: f64,
    elevation: F,
) -> Result<Vec<AccessWindow>, ComputeError>
where
    F: Fn(f64) -> Result<f64, ComputeError>,
{
    let visible = |t: f64| elevation(t).map(|el| (el >= min_elevation_deg, el));

    // Last visible instant is `lo` when setting, first visible is `hi` when rising.
    let refine = |mut lo: f64, mut hi: f64, lo_visible: bool| -> Result<f64, ComputeError> {
        while hi - lo > REFINE_TOLERANCE_SECONDS {
            let mid = 0.5 * (lo + hi);
            if visible(mid)?.0 == lo_visible {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        Ok(if lo_visible { lo } else { hi })
    };

    let mut windows = Vec::new();
    let (mut above, first) = visible(0.0)?;
    let mut rise = 0.0;
    let mut peak = first;
    let mut t = 0.0;

    while t < duration {
        let next = (t + COARSE_STEP_SECONDS).min(duration);
        let (next_above, el) = visible(next)?;

        match (above, next_above) {
            (false, true) => {
                rise = refine(t, next, false)?;
                peak = el;
            }
            (true, false) => {
                let set = refine(t, next, true)?;
                windows.push(AccessWindow {
                    rise,
                    set,
                    max_elevation_deg: peak,
                });
            }
            (true, true) => peak = peak.max(el),
            (false, false) => {}
        }

        above = next_above;
        t = next;
    }

    if above {
        windows.push(AccessWindow {
            rise,
            set: duration,
            max_elevation_deg: peak,
        });
    }
    Ok(windows)
}

fn interval(start: DateTime<Utc>, window: AccessWindow) -> AccessInterval {
    AccessInterval {
        start: format_timestamp(offset_seconds(start, window.rise)),
        end: format_timestamp(offset_seconds(start, window.set)),
        duration_seconds: window.set - window.rise,
        max_elevation_degrees: window.max_elevation_deg,
    }
}

/// Computes the access windows of one TLE over a ground station.
#[derive(Clone, Copy, Debug, Default)]
pub struct VisibilityProvider;

impl ComputeProvider for VisibilityProvider {
    type Input = TleLines;
    type Params = VisibilityParams;
    type Output = AccessIntervals;

    fn compute(
        &self,
        input: &TleLines,
        params: &VisibilityParams,
    ) -> Result<AccessIntervals, ComputeError> {
        let orbit = KeplerOrbit::from_tle(Tle::parse(&input.line1, &input.line2)?)?;
        let start = params.window.start;

        let windows = find_access_windows(
            params.window.seconds(),
            params.min_elevation_deg,
            |t| {
                let at = offset_seconds(start, t);
                let ecef = teme_to_itrf(&orbit.position_teme(at)?, at);
                Ok(params.site.elevation_deg(&ecef))
            },
        )?;

        Ok(AccessIntervals {
            ground_station: params.site.name.clone(),
            intervals: windows.into_iter().map(|w| interval(start, w)).collect(),
        })
    }

    fn external_id(&self, input: &TleLines) -> Option<u64> {
        catalog_number(&input.line1).map(u64::from)
    }
}
