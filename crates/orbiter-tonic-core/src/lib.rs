#![doc = include_str!("../README.md")]

mod common;
pub use common::*;
// Public re-export so downstream crates can reach the engine via
// `orbiter_tonic_core::orbiter`
pub use orbiter;
