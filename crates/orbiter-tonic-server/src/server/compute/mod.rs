//! Reference compute providers served by the gRPC handlers.
//!
//! - [`propagation`]: two-body Keplerian propagation of a TLE into a track of
//!   positions ([`PropagationProvider`](propagation::PropagationProvider)).
//! - [`visibility`]: access windows between a TLE and a ground station
//!   ([`VisibilityProvider`](visibility::VisibilityProvider)).
//! - [`transformation`]: state vectors between TEME and ITRF
//!   ([`TransformationProvider`](transformation::TransformationProvider)).
//!
//! All of them are plain synchronous calculations; the orbiter engine runs
//! them on the worker pool.

pub mod frames;
pub mod propagation;
pub mod time;
pub mod tle;
pub mod transformation;
pub mod visibility;

#[cfg(test)]
pub(crate) mod fixtures {
    use orbiter_tonic_core::proto::TleLines;

    pub const ISS_LINE1: &str =
        "1 25544U 98067A   08264.51782528 -.00002182  00000-0 -11606-4 0  2927";
    pub const ISS_LINE2: &str =
        "2 25544  51.6416 247.4627 0006703 130.5360 325.0288 15.72125391563537";

    pub fn iss() -> TleLines {
        TleLines {
            line1: ISS_LINE1.to_owned(),
            line2: ISS_LINE2.to_owned(),
        }
    }

    /// The ISS lines with a broken line 1 checksum.
    pub fn corrupted() -> TleLines {
        TleLines {
            line1: ISS_LINE1.replace("2927", "2920"),
            line2: ISS_LINE2.to_owned(),
        }
    }
}
