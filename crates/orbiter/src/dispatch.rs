//! Bounded fan-out of admitted items over the worker pool.
//!
//! A [`Dispatcher`] turns a stream of admitted items into a stream of
//! outcomes while keeping at most `max_concurrency` compute calls in flight
//! for that one call. The window slides: as soon as one call finishes, the
//! next item is admitted. Outcomes are yielded in completion order.

use crate::{
    Admitted, Batch, ComputeError, ComputeOutcome, ComputeProvider, CorrelationKey, Error, Result,
    pool::{SubmitError, WorkerPool, panic_message},
};
use core::{num::NonZeroUsize, panic::AssertUnwindSafe, time::Duration};
use futures::{Stream, StreamExt, future, stream::BoxStream};
use std::{panic, sync::Arc};
use tokio::{
    sync::{Semaphore, oneshot},
    time::timeout,
};
use tokio_util::sync::CancellationToken;

/// Outcomes of one dispatch call. An `Err` is always the last item.
pub type OutcomeStream<O> = BoxStream<'static, Result<ComputeOutcome<O>>>;

/// Batches of one call. An `Err` is always the last item.
pub type BatchStream<O> = BoxStream<'static, Result<Batch<O>>>;

pub const DEFAULT_MAX_CONCURRENCY: NonZeroUsize = NonZeroUsize::new(64).unwrap();

#[derive(Clone, Copy, Debug)]
pub struct DispatchOptions {
    /// Upper bound on compute calls running at once for a single call.
    pub max_concurrency: NonZeroUsize,
    /// Soft per-unit timeout, counted from the moment a worker starts the
    /// unit. An expired unit is reported as
    /// [`FailureKind::Timeout`](crate::FailureKind::Timeout) while its
    /// compute call is left to finish on the pool.
    pub item_timeout: Option<Duration>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            item_timeout: None,
        }
    }
}

impl DispatchOptions {
    pub const fn with_max_concurrency(mut self, max_concurrency: NonZeroUsize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub const fn with_item_timeout(mut self, item_timeout: Option<Duration>) -> Self {
        self.item_timeout = item_timeout;
        self
    }
}

/// Sliding-window dispatcher for one provider.
pub struct Dispatcher<P> {
    provider: Arc<P>,
    pool: Arc<WorkerPool>,
    options: DispatchOptions,
}

impl<P> Clone for Dispatcher<P> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            pool: Arc::clone(&self.pool),
            options: self.options,
        }
    }
}

impl<P: ComputeProvider> Dispatcher<P> {
    pub const fn new(provider: Arc<P>, pool: Arc<WorkerPool>, options: DispatchOptions) -> Self {
        Self {
            provider,
            pool,
            options,
        }
    }

    pub const fn options(&self) -> &DispatchOptions {
        &self.options
    }

    pub const fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub const fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    /// Computes every admitted item, one pool job per item.
    ///
    /// Per-item errors of any kind come back as
    /// [`ComputeOutcome::Failure`]. The stream ends early only when `cancel`
    /// fires or the pool rejects work, in which case the rejection is yielded
    /// once as `Err`.
    pub fn dispatch<S>(&self, items: S, cancel: CancellationToken) -> OutcomeStream<P::Output>
    where
        S: Stream<Item = Admitted<P::Input, P::Params>> + Send + 'static,
    {
        let provider = Arc::clone(&self.provider);
        let window = Window::new(Arc::clone(&self.pool), self.options);

        let units = items.map(move |Admitted { item, params }| {
            let provider = Arc::clone(&provider);
            let window = window.clone();
            async move {
                let key = provider.correlation_key(&item);
                let result = window
                    .run(move || provider.compute(item.input(), &params))
                    .await?;
                Ok(ComputeOutcome::from_result(key, result))
            }
        });

        windowed(units, self.options.max_concurrency, cancel)
    }

    /// Groups items into chunks of `chunk_size` first, then computes each
    /// chunk as a single pool job.
    ///
    /// Items inside a chunk are isolated from each other: a failing or
    /// panicking item only fails itself. If the whole chunk times out or is
    /// lost, every item of the chunk gets its own failure entry. Each chunk
    /// becomes one [`Batch`], numbered in emission order.
    pub fn dispatch_chunks<S>(
        &self,
        items: S,
        chunk_size: NonZeroUsize,
        cancel: CancellationToken,
    ) -> BatchStream<P::Output>
    where
        S: Stream<Item = Admitted<P::Input, P::Params>> + Send + 'static,
    {
        let provider = Arc::clone(&self.provider);
        let window = Window::new(Arc::clone(&self.pool), self.options);

        let units = items.chunks(chunk_size.get()).map(move |chunk| {
            let provider = Arc::clone(&provider);
            let window = window.clone();
            async move {
                let keys: Vec<CorrelationKey> = chunk
                    .iter()
                    .map(|admitted| provider.correlation_key(&admitted.item))
                    .collect();
                match window.run(move || Ok(compute_chunk(&*provider, chunk))).await? {
                    Ok(outcomes) => Ok(outcomes),
                    Err(error) => Ok(keys
                        .into_iter()
                        .map(|key| ComputeOutcome::Failure {
                            key,
                            error: error.clone(),
                        })
                        .collect()),
                }
            }
        });

        let mut sequence = 0_u64;
        windowed(units, self.options.max_concurrency, cancel)
            .map(move |result| {
                result.map(|outcomes| {
                    let batch = Batch::new(sequence, outcomes);
                    sequence += 1;
                    batch
                })
            })
            .boxed()
    }
}

fn compute_chunk<P: ComputeProvider>(
    provider: &P,
    chunk: Vec<Admitted<P::Input, P::Params>>,
) -> Vec<ComputeOutcome<P::Output>> {
    chunk
        .into_iter()
        .map(|Admitted { item, params }| {
            let key = provider.correlation_key(&item);
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                provider.compute(item.input(), &params)
            }))
            .unwrap_or_else(|payload| Err(ComputeError::panicked(panic_message(payload.as_ref()))));
            ComputeOutcome::from_result(key, result)
        })
        .collect()
}

/// Per-call concurrency window in front of the shared pool.
///
/// The permit travels into the pool job, so a slot stays taken until the
/// compute call really returns, even after its soft timeout fired.
#[derive(Clone)]
struct Window {
    pool: Arc<WorkerPool>,
    permits: Arc<Semaphore>,
    item_timeout: Option<Duration>,
}

impl Window {
    fn new(pool: Arc<WorkerPool>, options: DispatchOptions) -> Self {
        Self {
            pool,
            permits: Arc::new(Semaphore::new(options.max_concurrency.get())),
            item_timeout: options.item_timeout,
        }
    }

    /// Runs one unit. The outer `Result` is fatal for the call, the inner
    /// one belongs to the unit.
    async fn run<F, R>(&self, f: F) -> Result<Result<R, ComputeError>>
    where
        F: FnOnce() -> Result<R, ComputeError> + Send + 'static,
        R: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::channel("dispatch window closed"))?;

        run_unit(&self.pool, self.item_timeout, move || {
            let _permit = permit;
            f()
        })
        .await
    }
}

/// Submits one unit to the pool and folds job failures into its result.
///
/// The soft timeout starts when a worker picks the unit up, so time spent
/// queued behind other calls never counts against it. If the caller stops
/// waiting before that, the unit is skipped instead of computed.
pub(crate) async fn run_unit<F, R>(
    pool: &WorkerPool,
    item_timeout: Option<Duration>,
    f: F,
) -> Result<Result<R, ComputeError>>
where
    F: FnOnce() -> Result<R, ComputeError> + Send + 'static,
    R: Send + 'static,
{
    let abandoned = CancellationToken::new();
    let _abandon_on_drop = abandoned.clone().drop_guard();
    let (started_tx, mut started_rx) = oneshot::channel::<()>();

    let submitted = pool.submit(move || {
        let _ = started_tx.send(());
        if abandoned.is_cancelled() {
            return Err(ComputeError::internal("unit abandoned before it started"));
        }
        f()
    });
    tokio::pin!(submitted);

    let result = match item_timeout {
        Some(limit) => tokio::select! {
            result = &mut submitted => result,
            _ = &mut started_rx => match timeout(limit, &mut submitted).await {
                Ok(result) => result,
                Err(_) => return Ok(Err(ComputeError::timeout(limit))),
            },
        },
        None => submitted.await,
    };

    match result {
        Ok(result) => Ok(result),
        Err(SubmitError::Panicked(message)) => Ok(Err(ComputeError::panicked(message))),
        Err(SubmitError::Lost) => Ok(Err(ComputeError::internal(
            "worker dropped the item before completing it",
        ))),
        Err(SubmitError::Rejected(e)) => Err(e),
    }
}

/// Drives unit futures with at most `width` in flight and stops on
/// cancellation or after the first fatal error.
fn windowed<S, F, T>(
    units: S,
    width: NonZeroUsize,
    cancel: CancellationToken,
) -> BoxStream<'static, Result<T>>
where
    S: Stream<Item = F> + Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    units
        .take_until(cancel.clone().cancelled_owned())
        .buffer_unordered(width.get())
        .take_until(cancel.cancelled_owned())
        .scan(false, |failed, result| {
            if *failed {
                return future::ready(None);
            }
            if let Err(_e) = &result {
                #[cfg(feature = "tracing")]
                tracing::warn!("Dispatch aborted: {_e}");
                *failed = true;
            }
            future::ready(Some(result))
        })
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        FailureKind, admit_all,
        test_support::{TestParams, TestProvider, pool},
    };
    use futures::stream;

    fn dispatcher(provider: &Arc<TestProvider>, width: usize) -> Dispatcher<TestProvider> {
        Dispatcher::new(
            Arc::clone(provider),
            pool(8),
            DispatchOptions::default().with_max_concurrency(NonZeroUsize::new(width).unwrap()),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn every_item_yields_exactly_one_outcome() {
        let provider = Arc::new(TestProvider::default());
        let items = admit_all(0..500_u64, Arc::new(TestParams::default()));

        let mut indices: Vec<u64> = dispatcher(&provider, 16)
            .dispatch(stream::iter(items), CancellationToken::new())
            .map(|outcome| outcome.unwrap().index())
            .collect()
            .await;
        indices.sort_unstable();

        assert_eq!(indices, (0..500).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrency_never_exceeds_the_window() {
        let provider = Arc::new(TestProvider::default().with_delay(Duration::from_millis(2)));
        let items = admit_all(0..200_u64, Arc::new(TestParams::default()));

        let outcomes: Vec<_> = dispatcher(&provider, 4)
            .dispatch(stream::iter(items), CancellationToken::new())
            .collect()
            .await;

        assert_eq!(outcomes.len(), 200);
        assert!(provider.peak() <= 4, "peak {}", provider.peak());
        assert!(provider.peak() >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn failures_panics_and_timeouts_stay_per_item() {
        let provider = Arc::new(
            TestProvider::default()
                .fail_on(1)
                .panic_on(2)
                .slow_on(3, Duration::from_millis(300)),
        );
        let dispatcher = Dispatcher::new(
            Arc::clone(&provider),
            pool(4),
            DispatchOptions::default().with_item_timeout(Some(Duration::from_millis(50))),
        );
        let items = admit_all(0..5_u64, Arc::new(TestParams::default()));

        let mut outcomes: Vec<_> = dispatcher
            .dispatch(stream::iter(items), CancellationToken::new())
            .map(Result::unwrap)
            .collect()
            .await;
        outcomes.sort_by_key(ComputeOutcome::index);

        let kinds: Vec<_> = outcomes.iter().map(|o| o.error().map(|e| e.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                None,
                Some(FailureKind::Compute),
                Some(FailureKind::Panicked),
                Some(FailureKind::Timeout),
                None,
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn time_queued_on_a_busy_pool_does_not_count_as_timeout() {
        // One thread, four units in flight: three of them queue for up to
        // 90ms, yet each computes in 30ms.
        let provider = Arc::new(TestProvider::default().with_delay(Duration::from_millis(30)));
        let dispatcher = Dispatcher::new(
            Arc::clone(&provider),
            pool(1),
            DispatchOptions::default()
                .with_max_concurrency(NonZeroUsize::new(4).unwrap())
                .with_item_timeout(Some(Duration::from_millis(50))),
        );
        let items = admit_all(0..4_u64, Arc::new(TestParams::default()));

        let outcomes: Vec<_> = dispatcher
            .dispatch(stream::iter(items), CancellationToken::new())
            .map(Result::unwrap)
            .collect()
            .await;

        assert_eq!(outcomes.len(), 4);
        let timeouts = outcomes
            .iter()
            .filter(|o| o.error().is_some_and(|e| e.kind == FailureKind::Timeout))
            .count();
        assert_eq!(timeouts, 0);
        assert!(outcomes.iter().all(ComputeOutcome::is_success));
        assert_eq!(provider.calls(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn queued_units_of_a_cancelled_call_are_never_computed() {
        let provider = Arc::new(TestProvider::default().with_delay(Duration::from_millis(50)));
        let dispatcher = Dispatcher::new(
            Arc::clone(&provider),
            pool(1),
            DispatchOptions::default().with_max_concurrency(NonZeroUsize::new(8).unwrap()),
        );
        let cancel = CancellationToken::new();
        let items = admit_all(0..8_u64, Arc::new(TestParams::default()));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(75)).await;
            trigger.cancel();
        });
        let _: Vec<_> = dispatcher
            .dispatch(stream::iter(items), cancel)
            .collect()
            .await;

        // Let the worker reach whatever was still queued.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(provider.calls() <= 3, "{}", provider.calls());
        assert_eq!(dispatcher.pool().in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn chunked_dispatch_isolates_items_within_a_chunk() {
        let provider = Arc::new(TestProvider::default().fail_on(7).panic_on(12));
        let items = admit_all(0..1000_u64, Arc::new(TestParams::default()));

        let batches: Vec<_> = dispatcher(&provider, 8)
            .dispatch_chunks(
                stream::iter(items),
                NonZeroUsize::new(200).unwrap(),
                CancellationToken::new(),
            )
            .map(Result::unwrap)
            .collect()
            .await;

        assert_eq!(batches.len(), 5);
        assert!(batches.iter().all(|b| b.len() == 200));

        let mut sequences: Vec<_> = batches.iter().map(Batch::sequence).collect();
        sequences.sort_unstable();
        assert_eq!(sequences, vec![0, 1, 2, 3, 4]);

        let failed: Vec<_> = batches
            .iter()
            .flat_map(Batch::failures)
            .map(|(key, error)| (key.index, error.kind))
            .collect();
        assert_eq!(failed.len(), 2);
        assert!(failed.contains(&(7, FailureKind::Compute)));
        assert!(failed.contains(&(12, FailureKind::Panicked)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn chunk_timeout_fails_every_item_of_the_chunk() {
        let provider = Arc::new(TestProvider::default().slow_on(0, Duration::from_millis(300)));
        let dispatcher = Dispatcher::new(
            Arc::clone(&provider),
            pool(4),
            DispatchOptions::default().with_item_timeout(Some(Duration::from_millis(50))),
        );
        let items = admit_all(0..6_u64, Arc::new(TestParams::default()));

        let mut batches: Vec<_> = dispatcher
            .dispatch_chunks(
                stream::iter(items),
                NonZeroUsize::new(3).unwrap(),
                CancellationToken::new(),
            )
            .map(Result::unwrap)
            .collect()
            .await;
        batches.sort_by_key(|b| b.outcomes()[0].index());

        assert_eq!(batches[0].failures().count(), 3);
        assert!(
            batches[0]
                .failures()
                .all(|(_, e)| e.kind == FailureKind::Timeout)
        );
        assert_eq!(batches[1].successes().count(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn pool_shutdown_is_fatal_and_yielded_once() {
        let provider = Arc::new(TestProvider::default());
        let pool = pool(2);
        pool.shutdown().await.unwrap();
        let dispatcher = Dispatcher::new(provider, pool, DispatchOptions::default());
        let items = admit_all(0..100_u64, Arc::new(TestParams::default()));

        let results: Vec<_> = dispatcher
            .dispatch(stream::iter(items), CancellationToken::new())
            .collect()
            .await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap_err(), &Error::ServiceShutdown);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn cancelled_dispatch_stops_early() {
        let provider = Arc::new(TestProvider::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let items = admit_all(0..100_u64, Arc::new(TestParams::default()));

        let results: Vec<_> = dispatcher(&provider, 8)
            .dispatch(stream::iter(items), cancel)
            .collect()
            .await;

        assert!(results.is_empty());
        assert_eq!(provider.calls(), 0);
    }
}
