//! Error type for the orbiter gRPC services.
//!
//! Wraps the engine's call-level [`orbiter::Error`], adds request validation,
//! and carries item errors for the unary single-item endpoints (where there
//! is no batch to report a failure entry in). `From<Error>` for
//! [`tonic::Status`] picks the status code:
//!
//! | Error | Status |
//! |---|---|
//! | protocol violation | `FAILED_PRECONDITION` |
//! | invalid request | `INVALID_ARGUMENT` |
//! | resource exhaustion | `RESOURCE_EXHAUSTED` |
//! | cancelled | `CANCELLED` |
//! | shutting down | `UNAVAILABLE` |
//! | channel failure | `INTERNAL` |

use orbiter::{ComputeError, FailureKind};
use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Clone, thiserror::Error, Debug, PartialEq)]
pub enum Error {
    /// A call-level failure raised by the engine.
    #[error(transparent)]
    Pipeline(#[from] orbiter::Error),

    /// The client request was invalid or exceeded constraints.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The single item of a unary call could not be computed.
    #[error("Compute error: {0}")]
    Compute(#[from] ComputeError),
}

impl Error {
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::Pipeline(e) => match e {
                orbiter::Error::Protocol { reason } => Status::failed_precondition(reason),
                orbiter::Error::ResourceExhausted { context } => {
                    Status::resource_exhausted(context)
                }
                orbiter::Error::Cancelled => Status::cancelled("Request was cancelled"),
                orbiter::Error::ServiceShutdown => Status::unavailable("Service is shutting down"),
                orbiter::Error::Channel { context } => {
                    Status::internal(format!("Channel error: {context}"))
                }
                orbiter::Error::Transport { reason } => {
                    Status::aborted(format!("Inbound stream failed: {reason}"))
                }
                other => Status::internal(other.to_string()),
            },
            Error::InvalidRequest { reason } => Status::invalid_argument(reason),
            Error::Compute(e) => match e.kind {
                FailureKind::InvalidInput => Status::invalid_argument(e.message),
                FailureKind::Timeout => Status::deadline_exceeded(e.message),
                FailureKind::Compute | FailureKind::Panicked | FailureKind::Internal => {
                    Status::internal(format!("Compute error: {}", e.message))
                }
            },
        }
    }
}
