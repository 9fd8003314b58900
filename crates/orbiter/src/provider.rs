use crate::{ComputeError, CorrelationKey, WorkItem};

/// A synchronous, CPU-bound, per-item calculation.
///
/// Implementations are called from worker pool threads, never from the async
/// runtime, so `compute` is free to block for as long as the calculation
/// takes. It must not depend on the order in which items are computed.
///
/// A panic inside `compute` is caught by the worker and reported as
/// [`FailureKind::Panicked`](crate::FailureKind::Panicked) for that item only.
pub trait ComputeProvider: Send + Sync + 'static {
    /// One unit of input (a TLE, for instance).
    type Input: Send + Sync + 'static;
    /// Parameters shared by every item of a job.
    type Params: Send + Sync + 'static;
    /// The per-item result.
    type Output: Send + 'static;

    /// Computes a single item.
    ///
    /// # Errors
    ///
    /// Returns a [`ComputeError`] when the input is malformed or the
    /// calculation cannot produce a result. The error is delivered to the
    /// caller as a failure entry and never aborts the job.
    fn compute(&self, input: &Self::Input, params: &Self::Params)
    -> Result<Self::Output, ComputeError>;

    /// Best-effort identifier carried in the input itself.
    fn external_id(&self, _input: &Self::Input) -> Option<u64> {
        None
    }

    fn correlation_key(&self, item: &WorkItem<Self::Input>) -> CorrelationKey {
        CorrelationKey::new(item.index(), self.external_id(item.input()))
    }
}
