//! Call-level errors for the orchestration engine.
//!
//! These are the errors that terminate a whole call. Per-item failures never
//! show up here: they are carried as data inside
//! [`ComputeOutcome::Failure`](crate::ComputeOutcome::Failure).

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Reason attached to a data message that arrives before the session config.
pub const CONFIG_MUST_PRECEDE_DATA: &str = "config must precede data";

/// Reason attached to a session whose inbound stream ended without a config.
pub const STREAM_ENDED_BEFORE_CONFIG: &str = "stream ended before a config was received";

/// Errors that abort a call (never a single item).
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The caller broke the streaming handshake, or sent a malformed or
    /// missing config.
    #[error("Protocol violation: {reason}")]
    Protocol { reason: String },

    /// The worker pool or the ingestion buffer stayed saturated for longer
    /// than the configured tolerance.
    #[error("Resource exhausted: {context}")]
    ResourceExhausted { context: String },

    /// The job was cancelled (caller disconnect or explicit cancel).
    #[error("Job cancelled")]
    Cancelled,

    /// The worker pool is shutting down and refuses new work.
    #[error("Service is shutting down")]
    ServiceShutdown,

    /// Internal channel failure between pipeline stages.
    #[error("Channel error: {context}")]
    Channel { context: String },

    /// The inbound stream of a streaming session failed.
    #[error("Inbound stream failed: {reason}")]
    Transport { reason: String },
}

impl Error {
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    pub fn resource_exhausted(context: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            context: context.into(),
        }
    }

    pub fn channel(context: impl Into<String>) -> Self {
        Self::Channel {
            context: context.into(),
        }
    }

    /// Returns `true` for errors that come from the caller breaking the
    /// streaming protocol.
    pub const fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol { .. })
    }
}
