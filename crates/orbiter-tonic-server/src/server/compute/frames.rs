//! Earth rotation and ground-station geometry.

use chrono::{DateTime, Utc};
use core::f64::consts::TAU;
use nalgebra::{Rotation3, Vector3};

const UNIX_EPOCH_JD: f64 = 2_440_587.5;
const J2000_JD: f64 = 2_451_545.0;
const SECONDS_PER_DAY: f64 = 86_400.0;

/// WGS-84 equatorial radius in km.
pub const WGS84_A_KM: f64 = 6_378.137;
/// WGS-84 flattening.
pub const WGS84_F: f64 = 1.0 / 298.257_223_563;

pub fn julian_date(at: DateTime<Utc>) -> f64 {
    let seconds = at.timestamp() as f64 + f64::from(at.timestamp_subsec_nanos()) * 1e-9;
    UNIX_EPOCH_JD + seconds / SECONDS_PER_DAY
}

/// Greenwich mean sidereal time in radians, normalized to `[0, 2π)`.
///
/// IAU 1982 polynomial in Julian centuries of UT1 since J2000, with UTC
/// standing in for UT1.
pub fn gmst(at: DateTime<Utc>) -> f64 {
    const C0: f64 = 67_310.548_41;
    const C1: f64 = 876_600.0 * 3_600.0 + 8_640_184.812_866;
    const C2: f64 = 0.093_104;
    const C3: f64 = -6.2e-6;

    let t = (julian_date(at) - J2000_JD) / 36_525.0;
    let seconds = ((C3 * t + C2) * t + C1) * t + C0;
    (seconds.rem_euclid(SECONDS_PER_DAY) * TAU / SECONDS_PER_DAY).rem_euclid(TAU)
}

/// Rotates an inertial (TEME) vector into the Earth-fixed frame.
///
/// Polar motion is ignored, so the result is the pseudo Earth-fixed frame,
/// which is what ITRF means on the wire.
pub fn teme_to_itrf(teme: &Vector3<f64>, at: DateTime<Utc>) -> Vector3<f64> {
    Rotation3::from_axis_angle(&Vector3::z_axis(), -gmst(at)) * teme
}

/// Earth rotation rate in rad/s.
pub const EARTH_ROTATION_RAD_S: f64 = 7.292_115_146_706_979e-5;

/// Rotates an inertial (TEME) state into the Earth-fixed frame. Velocity
/// picks up the transport term of the rotating frame.
pub fn teme_to_itrf_state(
    position: &Vector3<f64>,
    velocity: &Vector3<f64>,
    at: DateTime<Utc>,
) -> (Vector3<f64>, Vector3<f64>) {
    let rotation = Rotation3::from_axis_angle(&Vector3::z_axis(), -gmst(at));
    let omega = Vector3::new(0.0, 0.0, EARTH_ROTATION_RAD_S);
    let fixed = rotation * position;
    (fixed, rotation * velocity - omega.cross(&fixed))
}

/// Inverse of [`teme_to_itrf_state`].
pub fn itrf_to_teme_state(
    position: &Vector3<f64>,
    velocity: &Vector3<f64>,
    at: DateTime<Utc>,
) -> (Vector3<f64>, Vector3<f64>) {
    let rotation = Rotation3::from_axis_angle(&Vector3::z_axis(), gmst(at));
    let omega = Vector3::new(0.0, 0.0, EARTH_ROTATION_RAD_S);
    (
        rotation * position,
        rotation * (velocity + omega.cross(position)),
    )
}

/// Geodetic latitude/longitude (degrees) and altitude (m) to Earth-fixed
/// coordinates in km.
pub fn geodetic_to_ecef(latitude_deg: f64, longitude_deg: f64, altitude_m: f64) -> Vector3<f64> {
    let (lat, lon) = (latitude_deg.to_radians(), longitude_deg.to_radians());
    let e2 = WGS84_F * (2.0 - WGS84_F);
    let n = WGS84_A_KM / (1.0 - e2 * lat.sin().powi(2)).sqrt();
    let h = altitude_m / 1_000.0;

    Vector3::new(
        (n + h) * lat.cos() * lon.cos(),
        (n + h) * lat.cos() * lon.sin(),
        (n * (1.0 - e2) + h) * lat.sin(),
    )
}

/// Unit normal to the ellipsoid at a geodetic position.
pub fn local_up(latitude_deg: f64, longitude_deg: f64) -> Vector3<f64> {
    let (lat, lon) = (latitude_deg.to_radians(), longitude_deg.to_radians());
    Vector3::new(lat.cos() * lon.cos(), lat.cos() * lon.sin(), lat.sin())
}

/// Elevation in degrees of `target` seen from `site` with local vertical `up`.
pub fn elevation_deg(site: &Vector3<f64>, up: &Vector3<f64>, target: &Vector3<f64>) -> f64 {
    let line_of_sight = target - site;
    let range = line_of_sight.norm();
    if range == 0.0 {
        return 90.0;
    }
    (line_of_sight.dot(up) / range).clamp(-1.0, 1.0).asin().to_degrees()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn gmst_at_j2000_noon() {
        let at = Utc.with_ymd_and_hms(2000, 1, 1, 12, 0, 0).unwrap();
        assert!((julian_date(at) - J2000_JD).abs() < 1e-9);
        // 18h 41m 50.548s
        assert!((gmst(at).to_degrees() - 280.460_618).abs() < 1e-4);
    }

    #[test]
    fn earth_rotation_preserves_norm_and_axis() {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 3, 4, 5).unwrap();
        let teme = Vector3::new(4_000.0, -3_000.0, 4_500.0);
        let itrf = teme_to_itrf(&teme, at);
        assert!((itrf.norm() - teme.norm()).abs() < 1e-9);
        assert!((itrf.z - teme.z).abs() < 1e-12);
    }

    #[test]
    fn state_round_trip_and_ground_fixed_velocity() {
        let at = Utc.with_ymd_and_hms(2024, 3, 20, 18, 30, 0).unwrap();

        // A point resting on the equator moves with the Earth in TEME.
        let site = Vector3::new(WGS84_A_KM, 0.0, 0.0);
        let (r, v) = itrf_to_teme_state(&site, &Vector3::zeros(), at);
        assert!((v.norm() - EARTH_ROTATION_RAD_S * WGS84_A_KM).abs() < 1e-9);
        assert!(r.dot(&v).abs() < 1e-6);

        let (back_r, back_v) = teme_to_itrf_state(&r, &v, at);
        assert!((back_r - site).norm() < 1e-9);
        assert!(back_v.norm() < 1e-12);
        assert!((back_r - teme_to_itrf(&r, at)).norm() < 1e-12);
    }

    #[test]
    fn ecef_of_reference_points() {
        let equator = geodetic_to_ecef(0.0, 0.0, 0.0);
        assert!((equator.x - WGS84_A_KM).abs() < 1e-9);
        let pole = geodetic_to_ecef(90.0, 0.0, 0.0);
        assert!((pole.z - 6_356.752_314).abs() < 1e-3);
    }

    #[test]
    fn zenith_and_horizon() {
        let site = geodetic_to_ecef(0.0, 0.0, 0.0);
        let up = local_up(0.0, 0.0);
        let overhead = site + up * 500.0;
        assert!((elevation_deg(&site, &up, &overhead) - 90.0).abs() < 1e-9);
        let sideways = site + Vector3::new(0.0, 500.0, 0.0);
        assert!(elevation_deg(&site, &up, &sideways).abs() < 1e-9);
    }
}
