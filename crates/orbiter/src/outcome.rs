use crate::CorrelationKey;
use core::{fmt, time::Duration};

/// Classifies why a single item failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The input could not be parsed or validated.
    InvalidInput,
    /// The provider rejected a well-formed input.
    Compute,
    /// The item exceeded its soft timeout.
    Timeout,
    /// The provider panicked while computing the item.
    Panicked,
    /// The worker lost track of the item.
    Internal,
}

impl FailureKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::Compute => "compute",
            Self::Timeout => "timeout",
            Self::Panicked => "panicked",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A per-item error. Never aborts the call it belongs to.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ComputeError {
    pub kind: FailureKind,
    pub message: String,
}

impl ComputeError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidInput, message)
    }

    pub fn compute(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Compute, message)
    }

    pub fn timeout(limit: Duration) -> Self {
        Self::new(
            FailureKind::Timeout,
            format!("exceeded item timeout of {}ms", limit.as_millis()),
        )
    }

    pub fn panicked(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Panicked, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Internal, message)
    }
}

/// The result of computing one admitted item.
///
/// Every admitted item yields exactly one outcome, success or failure, keyed
/// by the [`CorrelationKey`] of its input.
#[derive(Clone, Debug, PartialEq)]
pub enum ComputeOutcome<O> {
    Success { key: CorrelationKey, output: O },
    Failure { key: CorrelationKey, error: ComputeError },
}

impl<O> ComputeOutcome<O> {
    pub fn from_result(key: CorrelationKey, result: Result<O, ComputeError>) -> Self {
        match result {
            Ok(output) => Self::Success { key, output },
            Err(error) => Self::Failure { key, error },
        }
    }

    pub const fn key(&self) -> &CorrelationKey {
        match self {
            Self::Success { key, .. } | Self::Failure { key, .. } => key,
        }
    }

    pub const fn index(&self) -> u64 {
        self.key().index
    }

    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub const fn output(&self) -> Option<&O> {
        match self {
            Self::Success { output, .. } => Some(output),
            Self::Failure { .. } => None,
        }
    }

    pub const fn error(&self) -> Option<&ComputeError> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { error, .. } => Some(error),
        }
    }

    /// Maps the success payload, leaving failures untouched.
    pub fn map<U>(self, f: impl FnOnce(O) -> U) -> ComputeOutcome<U> {
        match self {
            Self::Success { key, output } => ComputeOutcome::Success {
                key,
                output: f(output),
            },
            Self::Failure { key, error } => ComputeOutcome::Failure { key, error },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_result_keeps_the_key_on_both_arms() {
        let key = CorrelationKey::new(4, Some(25544));

        let ok = ComputeOutcome::from_result(key, Ok::<_, ComputeError>(1.5));
        assert!(ok.is_success());
        assert_eq!(ok.output(), Some(&1.5));
        assert_eq!(ok.key(), &key);

        let err = ComputeOutcome::<f64>::from_result(key, Err(ComputeError::compute("diverged")));
        assert!(!err.is_success());
        assert_eq!(err.index(), 4);
        assert_eq!(err.error().map(|e| e.kind), Some(FailureKind::Compute));
    }

    #[test]
    fn timeout_message_names_the_limit() {
        let err = ComputeError::timeout(Duration::from_millis(250));
        assert_eq!(err.kind, FailureKind::Timeout);
        assert_eq!(err.to_string(), "timeout: exceeded item timeout of 250ms");
    }
}
