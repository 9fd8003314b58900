//! State and plumbing shared by the propagation and visibility services.
//!
//! One [`ServiceCore`] is built per process. It owns the [`WorkerPool`] every
//! call computes on, enforces request limits, turns engine batch streams into
//! gRPC response streams, and coordinates graceful shutdown.

use crate::server::{
    config::ServerConfig,
    streaming::coordinator::feed_batches,
    telemetry::{Metric, record},
};
use futures::TryStreamExt;
use orbiter::{BatchStream, RequestSpan, ResultBatcher, ResultWeight, WorkerPool};
use orbiter_tonic_core::{
    Error,
    wire::{WireBatch, WireOutcome},
};
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};
use std::{sync::Arc, time::Instant};
use tokio::{sync::mpsc, time::sleep};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Status;

/// A server-streaming response body.
pub type ResponseStream<B> = futures::stream::BoxStream<'static, Result<B, Status>>;

/// Open response streams and the shutdown flag.
#[derive(Debug, Default)]
struct StreamTracker {
    inflight: AtomicUsize,
    shutting_down: AtomicBool,
}

/// Counts one open response stream for as long as it lives.
struct StreamGuard(Arc<StreamTracker>);

impl StreamGuard {
    fn enter(tracker: &Arc<StreamTracker>) -> Self {
        tracker.inflight.fetch_add(1, Ordering::AcqRel);
        record(Metric::StreamOpened);
        Self(Arc::clone(tracker))
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.inflight.fetch_sub(1, Ordering::AcqRel);
        record(Metric::StreamClosed);
    }
}

#[derive(Clone)]
pub struct ServiceCore {
    config: Arc<ServerConfig>,
    pool: Arc<WorkerPool>,
    streams: Arc<StreamTracker>,
}

impl ServiceCore {
    /// Builds the shared worker pool from `config.pool`.
    pub fn new(config: ServerConfig) -> orbiter::Result<Self> {
        let pool = WorkerPool::new(config.pool.clone())?;
        Ok(Self {
            config: Arc::new(config),
            pool: Arc::new(pool),
            streams: Arc::default(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub const fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn streams_inflight(&self) -> usize {
        self.streams.inflight.load(Ordering::Acquire)
    }

    /// A cancellation token for one call. It fires when the pool shuts down
    /// and is fired by the call itself when the client goes away.
    pub fn call_token(&self) -> CancellationToken {
        self.pool.job_token()
    }

    /// Counts the request and refuses it once shutdown has begun.
    pub fn admit(&self, method: &'static str) -> Result<(), Status> {
        if self.streams.shutting_down.load(Ordering::Acquire) {
            record(Metric::StreamError);
            return Err(Error::from(orbiter::Error::ServiceShutdown).into());
        }
        record(Metric::Request { method });
        Ok(())
    }

    /// Rejects empty bulk requests and requests above the configured limit.
    pub fn check_bulk_size(&self, items: usize) -> Result<(), Error> {
        if items == 0 {
            return Err(Error::invalid_request("Request must contain at least one item"));
        }
        if items > self.config.max_items_per_request {
            return Err(Error::invalid_request(format!(
                "Request contains {} items, more than the maximum allowed ({})",
                items, self.config.max_items_per_request
            )));
        }
        record(Metric::RequestSize { items });
        Ok(())
    }

    /// Batch size for a request, from the configured dynamic policy.
    pub fn batcher(&self, span: &RequestSpan, weight: ResultWeight) -> ResultBatcher {
        ResultBatcher::new(&self.config.batch_sizing, span, weight)
    }

    /// Spawns the task that drives `batches` and returns the client-facing
    /// response stream.
    pub fn respond<B>(
        &self,
        batches: BatchStream<<B::Outcome as WireOutcome>::Output>,
        cancel: CancellationToken,
    ) -> ResponseStream<B>
    where
        B: WireBatch + Send + 'static,
        <B::Outcome as WireOutcome>::Output: Send,
    {
        let start = Instant::now();
        let guard = StreamGuard::enter(&self.streams);
        let (resp_tx, resp_rx) = mpsc::channel::<Result<B, Status>>(self.config.stream_buffer_size);

        let fut = async move {
            let _guard = guard;
            match feed_batches(batches, resp_tx, cancel).await {
                Ok(()) => record(Metric::StreamFinished {
                    elapsed: start.elapsed(),
                }),
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Stream ended early: {}", _e);
                }
            }
        };
        #[cfg(feature = "tracing")]
        let fut = {
            use tracing::Instrument;
            fut.instrument(tracing::info_span!("streaming"))
        };

        tokio::spawn(fut);

        Box::pin(ReceiverStream::new(resp_rx).inspect_err(|_e| record(Metric::StreamError)))
    }

    /// Graceful shutdown.
    ///
    /// 1. New calls are refused with `UNAVAILABLE`.
    /// 2. Open streams get up to the shutdown timeout to finish.
    /// 3. The pool shuts down, cancelling whatever is still running.
    pub async fn shutdown(&self) -> orbiter::Result<()> {
        self.streams.shutting_down.store(true, Ordering::Release);

        #[cfg(feature = "tracing")]
        tracing::info!(
            "Waiting up to {:?} for {} open streams",
            self.config.shutdown_timeout,
            self.streams_inflight()
        );

        let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
            while self.streams_inflight() > 0 {
                sleep(core::time::Duration::from_millis(50)).await;
            }
        })
        .await;

        if drained.is_err() {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                "{} streams still open after the shutdown timeout",
                self.streams_inflight()
            );
        }

        self.pool.shutdown().await
    }
}
