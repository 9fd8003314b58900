//! gRPC service implementations.
//!
//! - [`handler`]: state shared by every service: the worker pool, limits,
//!   stream accounting and graceful shutdown.
//! - [`propagation`]: the `Propagation` service (`PropagationService`).
//! - [`visibility`]: the `Visibility` service (`VisibilityService`).
//! - [`transformation`]: the `Transformation` service
//!   (`TransformationService`).

pub mod handler;
pub mod propagation;
pub mod transformation;
pub mod visibility;
