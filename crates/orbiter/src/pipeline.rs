//! Facade that wires admission, dispatch and batching for one provider.
//!
//! Each method corresponds to one call shape:
//!
//! | Method | Shape |
//! |---|---|
//! | [`Pipeline::compute_one`] | unary, single item |
//! | [`Pipeline::run_bulk`] | unary, all outcomes in one response |
//! | [`Pipeline::stream_bulk`] | server streaming, grouped after dispatch |
//! | [`Pipeline::stream_bulk_chunked`] | server streaming, grouped before dispatch |
//! | [`Pipeline::stream_session`] | bidirectional, from an [`IngestionHandle`] |

use crate::{
    ComputeError, ComputeOutcome, ComputeProvider, DispatchOptions, Dispatcher, Error,
    IngestionHandle, Result, ResultBatcher, WorkerPool, admit_all,
    dispatch::{BatchStream, run_unit},
};
use core::num::NonZeroUsize;
use futures::{StreamExt, future, stream};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a unary bulk call produced, ordered by admission index.
#[derive(Clone, Debug, PartialEq)]
pub struct BulkReport<O> {
    pub outcomes: Vec<ComputeOutcome<O>>,
    pub succeeded: usize,
    pub failed: usize,
}

pub struct Pipeline<P> {
    dispatcher: Dispatcher<P>,
}

impl<P> Clone for Pipeline<P> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: self.dispatcher.clone(),
        }
    }
}

impl<P: ComputeProvider> Pipeline<P> {
    pub const fn new(provider: Arc<P>, pool: Arc<WorkerPool>, options: DispatchOptions) -> Self {
        Self {
            dispatcher: Dispatcher::new(provider, pool, options),
        }
    }

    /// Same provider and pool, different dispatch options.
    pub fn with_options(&self, options: DispatchOptions) -> Self {
        Self::new(
            Arc::clone(self.dispatcher.provider()),
            Arc::clone(self.dispatcher.pool()),
            options,
        )
    }

    pub const fn dispatcher(&self) -> &Dispatcher<P> {
        &self.dispatcher
    }

    /// Computes a single item with one pool submission.
    ///
    /// The outer `Result` carries call-level failures (pool saturated or
    /// shutting down); the inner one is the item's own result, with panics
    /// and soft timeouts folded into [`ComputeError`]. Like every dispatched
    /// unit, the timeout only covers time spent on a worker.
    pub async fn compute_one(
        &self,
        input: P::Input,
        params: P::Params,
    ) -> Result<Result<P::Output, ComputeError>> {
        let provider = Arc::clone(self.dispatcher.provider());
        run_unit(
            self.dispatcher.pool(),
            self.dispatcher.options().item_timeout,
            move || provider.compute(&input, &params),
        )
        .await
    }

    /// Computes every input and returns all outcomes at once, sorted by
    /// admission index.
    ///
    /// # Errors
    ///
    /// Returns the first fatal dispatch error, or [`Error::Cancelled`] if
    /// `cancel` fired before every outcome was collected.
    pub async fn run_bulk(
        &self,
        inputs: Vec<P::Input>,
        params: P::Params,
        cancel: CancellationToken,
    ) -> Result<BulkReport<P::Output>> {
        let expected = inputs.len();
        let items = stream::iter(admit_all(inputs, Arc::new(params)));
        let mut results = self.dispatcher.dispatch(items, cancel.clone());

        let mut outcomes = Vec::with_capacity(expected);
        while let Some(outcome) = results.next().await {
            outcomes.push(outcome?);
        }
        if outcomes.len() < expected && cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        outcomes.sort_by_key(ComputeOutcome::index);
        let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
        Ok(BulkReport {
            failed: outcomes.len() - succeeded,
            succeeded,
            outcomes,
        })
    }

    /// Server-streaming bulk: dispatch every input, then group outcomes into
    /// batches of the batcher's size.
    pub fn stream_bulk(
        &self,
        inputs: Vec<P::Input>,
        params: P::Params,
        batcher: ResultBatcher,
        cancel: CancellationToken,
    ) -> BatchStream<P::Output> {
        let items = stream::iter(admit_all(inputs, Arc::new(params)));
        let outcomes = self.dispatcher.dispatch(items, cancel.clone());
        batcher.batch(outcomes, cancel).boxed()
    }

    /// Server-streaming bulk: group inputs into chunks first, then compute
    /// one chunk per pool job.
    pub fn stream_bulk_chunked(
        &self,
        inputs: Vec<P::Input>,
        params: P::Params,
        chunk_size: NonZeroUsize,
        cancel: CancellationToken,
    ) -> BatchStream<P::Output> {
        let items = stream::iter(admit_all(inputs, Arc::new(params)));
        self.dispatcher.dispatch_chunks(items, chunk_size, cancel)
    }

    /// Bidirectional streaming: dispatch whatever the session admits and
    /// batch the outcomes.
    ///
    /// If the session fails after its handshake (protocol violation,
    /// transport error, stalled buffer), the stream ends with that error
    /// instead of completing normally. Cancellation ends it quietly.
    pub fn stream_session(
        &self,
        handle: IngestionHandle<P::Input, P::Params>,
        batcher: ResultBatcher,
        cancel: CancellationToken,
    ) -> BatchStream<P::Output> {
        let (_config, items, completion) = handle.into_parts();
        let outcomes = self.dispatcher.dispatch(items, cancel.clone());
        let batches = batcher.batch(outcomes, cancel);

        let tail = stream::once(completion).filter_map(|summary| {
            future::ready(match summary {
                Ok(_) | Err(Error::Cancelled) => None,
                Err(e) => Some(Err(e)),
            })
        });

        batches
            .chain(tail)
            .scan(false, |failed, result| {
                if *failed {
                    return future::ready(None);
                }
                *failed = result.is_err();
                future::ready(Some(result))
            })
            .boxed()
    }
}
