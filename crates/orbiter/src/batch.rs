//! Grouping of outcomes into delivery batches.

use crate::{
    BatchSizingPolicy, ComputeError, ComputeOutcome, CorrelationKey, RequestSpan, Result,
    ResultWeight,
};
use core::{
    mem,
    num::NonZeroUsize,
    pin::Pin,
    task::{Context, Poll, ready},
};
use futures::Stream;
use pin_project_lite::pin_project;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// A group of outcomes delivered together.
///
/// Batches are never empty. `sequence` counts batches in the order they were
/// emitted for one call, starting at zero.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch<O> {
    sequence: u64,
    outcomes: Vec<ComputeOutcome<O>>,
}

impl<O> Batch<O> {
    pub(crate) const fn new(sequence: u64, outcomes: Vec<ComputeOutcome<O>>) -> Self {
        Self { sequence, outcomes }
    }

    /// Builds a batch outside the batcher, e.g. to replay recorded outcomes.
    /// Returns `None` for an empty `outcomes`.
    pub fn from_outcomes(sequence: u64, outcomes: Vec<ComputeOutcome<O>>) -> Option<Self> {
        (!outcomes.is_empty()).then(|| Self::new(sequence, outcomes))
    }

    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn outcomes(&self) -> &[ComputeOutcome<O>] {
        &self.outcomes
    }

    pub fn into_outcomes(self) -> Vec<ComputeOutcome<O>> {
        self.outcomes
    }

    pub fn successes(&self) -> impl Iterator<Item = (&CorrelationKey, &O)> {
        self.outcomes.iter().filter_map(|outcome| match outcome {
            ComputeOutcome::Success { key, output } => Some((key, output)),
            ComputeOutcome::Failure { .. } => None,
        })
    }

    pub fn failures(&self) -> impl Iterator<Item = (&CorrelationKey, &ComputeError)> {
        self.outcomes.iter().filter_map(|outcome| match outcome {
            ComputeOutcome::Failure { key, error } => Some((key, error)),
            ComputeOutcome::Success { .. } => None,
        })
    }
}

/// Adapts an outcome stream into a stream of batches of a fixed size `B`.
///
/// `B` is computed once per call from the sizing policy, so every batch of
/// the call except the last holds exactly `B` outcomes.
#[derive(Clone, Copy, Debug)]
pub struct ResultBatcher {
    size: NonZeroUsize,
}

impl ResultBatcher {
    pub fn new(policy: &dyn BatchSizingPolicy, span: &RequestSpan, weight: ResultWeight) -> Self {
        Self {
            size: policy.batch_size(span, weight),
        }
    }

    pub const fn fixed(size: NonZeroUsize) -> Self {
        Self { size }
    }

    pub const fn size(&self) -> NonZeroUsize {
        self.size
    }

    /// Groups `outcomes` into batches.
    ///
    /// The final partial batch is emitted only when the source ends normally.
    /// An upstream `Err` is forwarded and ends the stream; once `cancel`
    /// fires no further batch is emitted. In both cases the partially filled
    /// buffer is dropped.
    pub fn batch<S, O>(&self, outcomes: S, cancel: CancellationToken) -> Batches<S, O>
    where
        S: Stream<Item = Result<ComputeOutcome<O>>>,
    {
        let size = self.size.get();
        Batches {
            source: outcomes,
            cancelled: cancel.cancelled_owned(),
            buffer: Vec::with_capacity(size),
            size,
            sequence: 0,
            done: false,
        }
    }
}

pin_project! {
    /// Stream returned by [`ResultBatcher::batch`].
    #[must_use = "streams do nothing unless polled"]
    pub struct Batches<S, O> {
        #[pin]
        source: S,
        #[pin]
        cancelled: WaitForCancellationFutureOwned,
        buffer: Vec<ComputeOutcome<O>>,
        size: usize,
        sequence: u64,
        done: bool,
    }
}

impl<S, O> Stream for Batches<S, O>
where
    S: Stream<Item = Result<ComputeOutcome<O>>>,
{
    type Item = Result<Batch<O>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        if *this.done {
            return Poll::Ready(None);
        }

        loop {
            if this.cancelled.as_mut().poll(cx).is_ready() {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    "Batcher cancelled, discarding {} buffered outcomes",
                    this.buffer.len()
                );
                *this.done = true;
                this.buffer.clear();
                return Poll::Ready(None);
            }

            // A full buffer is only released right after the cancellation
            // check, never in the poll that observed the token firing.
            if this.buffer.len() >= *this.size {
                let outcomes = mem::replace(this.buffer, Vec::with_capacity(*this.size));
                return Poll::Ready(Some(Ok(next_batch(this.sequence, outcomes))));
            }

            match ready!(this.source.as_mut().poll_next(cx)) {
                Some(Ok(outcome)) => this.buffer.push(outcome),
                Some(Err(e)) => {
                    *this.done = true;
                    this.buffer.clear();
                    return Poll::Ready(Some(Err(e)));
                }
                None => {
                    *this.done = true;
                    // The source may have ended because of the cancellation.
                    if this.cancelled.as_mut().poll(cx).is_ready() || this.buffer.is_empty() {
                        this.buffer.clear();
                        return Poll::Ready(None);
                    }
                    let outcomes = mem::take(this.buffer);
                    return Poll::Ready(Some(Ok(next_batch(this.sequence, outcomes))));
                }
            }
        }
    }
}

fn next_batch<O>(sequence: &mut u64, outcomes: Vec<ComputeOutcome<O>>) -> Batch<O> {
    let batch = Batch::new(*sequence, outcomes);
    *sequence += 1;
    batch
}
