//! The shared worker pool.
//!
//! [`WorkerPool::submit`] hands a closure to a pool thread and awaits its
//! result. The closure is wrapped so that its panic is caught on the worker
//! and reported back instead of tearing down the thread.
//!
//! Shutdown is cooperative and happens in phases: refuse new submissions,
//! drain in-flight jobs (bounded by `shutdown_timeout`), cancel the pool
//! token, and finally stop the fixed worker threads.

use super::{
    PoolConfig, PoolKind, panic_message,
    request::{Job, WorkRequest},
    worker::worker_loop,
};
use crate::{Error, Result};
use core::{
    panic::AssertUnwindSafe,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};
use parking_lot::Mutex;
use std::{panic, sync::Arc, thread};
use tokio::{
    sync::{Semaphore, mpsc, oneshot},
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;

/// Why a submitted job produced no value.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The pool refused the job. This is a call-level failure.
    #[error(transparent)]
    Rejected(#[from] Error),
    /// The job panicked on its worker thread.
    #[error("job panicked: {0}")]
    Panicked(String),
    /// The job was dropped before it could report a result.
    #[error("worker dropped the job before completing it")]
    Lost,
}

enum Backend {
    Fixed {
        queue: mpsc::Sender<WorkRequest>,
        workers: usize,
    },
    Elastic {
        permits: Arc<Semaphore>,
    },
    Cached,
}

/// Process-wide pool of compute threads.
///
/// Construct it once, wrap it in an `Arc`, and inject it wherever work is
/// dispatched.
pub struct WorkerPool {
    kind: PoolKind,
    backend: Backend,
    admission_timeout: Option<Duration>,
    shutdown_timeout: Duration,
    accepting: AtomicBool,
    in_flight: Arc<AtomicUsize>,
    shutdown_token: CancellationToken,
}

impl WorkerPool {
    /// Builds a pool and, for [`PoolKind::Fixed`], starts its threads.
    ///
    /// Elastic and cached pools run on the tokio blocking pool, so they must
    /// be used from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhausted`] if a worker thread cannot be
    /// spawned.
    pub fn new(config: PoolConfig) -> Result<Self> {
        let backend = match config.kind {
            PoolKind::Fixed => {
                let (tx, rx) = mpsc::channel(config.queue_capacity.get());
                let queue = Arc::new(Mutex::new(rx));
                let workers = config.max_threads.get();
                for worker_id in 0..workers {
                    let queue = Arc::clone(&queue);
                    thread::Builder::new()
                        .name(format!("orbiter-worker-{worker_id}"))
                        .spawn(move || worker_loop(worker_id, queue))
                        .map_err(|e| {
                            Error::resource_exhausted(format!(
                                "failed to spawn worker thread {worker_id}: {e}"
                            ))
                        })?;
                }
                Backend::Fixed { queue: tx, workers }
            }
            PoolKind::Elastic => Backend::Elastic {
                permits: Arc::new(Semaphore::new(config.max_threads.get())),
            },
            PoolKind::Cached => Backend::Cached,
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "Worker pool ready: kind={:?} max_threads={}",
            config.kind,
            config.max_threads
        );

        Ok(Self {
            kind: config.kind,
            backend,
            admission_timeout: config.admission_timeout,
            shutdown_timeout: config.shutdown_timeout,
            accepting: AtomicBool::new(true),
            in_flight: Arc::new(AtomicUsize::new(0)),
            shutdown_token: CancellationToken::new(),
        })
    }

    pub const fn kind(&self) -> PoolKind {
        self.kind
    }

    /// Number of jobs accepted and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire) && !self.shutdown_token.is_cancelled()
    }

    /// A fresh cancellation token for one job. It is cancelled when the job
    /// is cancelled by its caller or when the pool shuts down.
    pub fn job_token(&self) -> CancellationToken {
        self.shutdown_token.child_token()
    }

    /// Runs `f` on a pool thread and returns its result.
    ///
    /// # Errors
    ///
    /// - [`SubmitError::Rejected`] with [`Error::ServiceShutdown`] once
    ///   shutdown started, or [`Error::ResourceExhausted`] if no slot frees
    ///   up within the admission timeout.
    /// - [`SubmitError::Panicked`] if `f` panicked.
    /// - [`SubmitError::Lost`] if the job vanished without a result.
    pub async fn submit<F, R>(&self, f: F) -> Result<R, SubmitError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if !self.is_accepting() {
            return Err(Error::ServiceShutdown.into());
        }

        let (tx, rx) = oneshot::channel();
        let guard = InFlightGuard::enter(&self.in_flight);
        let job: Job = Box::new(move || {
            let _guard = guard;
            let result = panic::catch_unwind(AssertUnwindSafe(f));
            // The caller may have stopped waiting (timeout or cancellation).
            let _ = tx.send(result);
        });

        match &self.backend {
            Backend::Fixed { queue, .. } => {
                self.admit("queue slot", queue.send(WorkRequest::Run { job }))
                    .await?
                    .map_err(|_| Error::channel("worker queue closed"))?;
            }
            Backend::Elastic { permits } => {
                let permit = self
                    .admit("worker thread", Arc::clone(permits).acquire_owned())
                    .await?
                    .map_err(|_| Error::ServiceShutdown)?;
                tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    job();
                });
            }
            Backend::Cached => {
                tokio::task::spawn_blocking(job);
            }
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => Err(SubmitError::Panicked(panic_message(payload.as_ref()))),
            Err(_) => Err(SubmitError::Lost),
        }
    }

    async fn admit<T>(&self, what: &str, fut: impl Future<Output = T>) -> Result<T> {
        match self.admission_timeout {
            Some(limit) => timeout(limit, fut).await.map_err(|_| {
                #[cfg(feature = "tracing")]
                tracing::warn!("Worker pool saturated: no {what} within {limit:?}");
                Error::resource_exhausted(format!(
                    "worker pool saturated: no {what} available within {}ms",
                    limit.as_millis()
                ))
            }),
            None => Ok(fut.await),
        }
    }

    /// Gracefully shuts the pool down.
    ///
    /// Jobs already running are allowed to finish for up to
    /// `shutdown_timeout`; anything still running afterwards keeps its
    /// thread until it returns, but its result is dropped.
    pub async fn shutdown(&self) -> Result<()> {
        // === Phase 0: Stop accepting new jobs ===
        #[cfg(feature = "tracing")]
        tracing::info!("Worker pool refusing new jobs");
        self.accepting.store(false, Ordering::Release);

        // === Phase 1: Wait for in-flight jobs to drain ===
        #[cfg(feature = "tracing")]
        tracing::info!("Draining in-flight jobs ({} active)", self.in_flight());
        let drain_result = timeout(self.shutdown_timeout, async {
            while self.in_flight() > 0 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;

        match drain_result {
            Ok(()) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("All in-flight jobs drained");
            }
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    "Job drain timed out ({} jobs still running)",
                    self.in_flight()
                );
            }
        }

        // === Phase 2: Cancel any remaining work ===
        #[cfg(feature = "tracing")]
        tracing::debug!("Cancelling remaining work via shutdown token");
        self.shutdown_token.cancel();

        // === Phase 3: Stop the workers ===
        match &self.backend {
            Backend::Fixed { queue, workers } => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Notifying {workers} workers to shut down");

                let acks = (0..*workers).map(|_i| async move {
                    let (tx, rx) = oneshot::channel();
                    let stop = async {
                        queue
                            .send(WorkRequest::Shutdown { response: tx })
                            .await
                            .map_err(|_| ())?;
                        rx.await.map_err(|_| ())
                    };
                    match timeout(Duration::from_secs(3), stop).await {
                        Ok(Ok(())) => {
                            #[cfg(feature = "tracing")]
                            tracing::trace!("Worker shutdown {_i} acknowledged");
                        }
                        Ok(Err(())) => {
                            #[cfg(feature = "tracing")]
                            tracing::error!("Worker shutdown {_i} was not delivered");
                        }
                        Err(_) => {
                            #[cfg(feature = "tracing")]
                            tracing::warn!("Worker shutdown {_i} timed out");
                        }
                    }
                });
                futures::future::join_all(acks).await;
            }
            Backend::Elastic { permits } => permits.close(),
            Backend::Cached => {}
        }

        #[cfg(feature = "tracing")]
        tracing::info!("Worker pool shutdown complete");

        Ok(())
    }
}

struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::num::NonZeroUsize;
    use std::sync::mpsc as std_mpsc;

    fn config(kind: PoolKind, threads: usize) -> PoolConfig {
        PoolConfig {
            kind,
            max_threads: NonZeroUsize::new(threads).unwrap(),
            ..PoolConfig::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn fixed_pool_runs_jobs_on_named_threads() {
        let pool = WorkerPool::new(config(PoolKind::Fixed, 2)).unwrap();
        let name = pool
            .submit(|| thread::current().name().map(String::from))
            .await
            .unwrap()
            .unwrap();
        assert!(name.starts_with("orbiter-worker-"), "{name}");
        pool.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn panics_are_reported_and_the_worker_survives() {
        let pool = WorkerPool::new(config(PoolKind::Fixed, 1)).unwrap();

        let err = pool.submit(|| -> u32 { panic!("boom") }).await.unwrap_err();
        assert!(matches!(err, SubmitError::Panicked(ref m) if m == "boom"), "{err:?}");

        assert_eq!(pool.submit(|| 21 * 2).await.unwrap(), 42);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn submit_after_shutdown_is_rejected() {
        for kind in [PoolKind::Fixed, PoolKind::Elastic, PoolKind::Cached] {
            let pool = WorkerPool::new(config(kind, 2)).unwrap();
            pool.shutdown().await.unwrap();
            assert!(!pool.is_accepting());

            let err = pool.submit(|| ()).await.unwrap_err();
            assert!(
                matches!(err, SubmitError::Rejected(Error::ServiceShutdown)),
                "{kind:?}: {err:?}"
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn elastic_pool_caps_concurrent_jobs() {
        let pool = Arc::new(WorkerPool::new(config(PoolKind::Elastic, 2)).unwrap());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let jobs = (0..8).map(|_| {
            let pool = Arc::clone(&pool);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            async move {
                pool.submit(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            }
        });

        for result in futures::future::join_all(jobs).await {
            result.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn saturated_queue_reports_resource_exhaustion() {
        let pool = Arc::new(
            WorkerPool::new(PoolConfig {
                kind: PoolKind::Fixed,
                max_threads: NonZeroUsize::new(1).unwrap(),
                queue_capacity: NonZeroUsize::new(1).unwrap(),
                admission_timeout: Some(Duration::from_millis(50)),
                shutdown_timeout: Duration::from_secs(1),
            })
            .unwrap(),
        );

        // Occupy the only thread, then the only queue slot.
        let (release_tx, release_rx) = std_mpsc::channel::<()>();
        let busy = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.submit(move || release_rx.recv().is_ok()).await }
        });
        sleep(Duration::from_millis(50)).await;
        let queued = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.submit(|| 7).await }
        });
        sleep(Duration::from_millis(50)).await;

        let err = pool.submit(|| 0).await.unwrap_err();
        assert!(
            matches!(err, SubmitError::Rejected(Error::ResourceExhausted { .. })),
            "{err:?}"
        );

        release_tx.send(()).unwrap();
        assert!(busy.await.unwrap().unwrap());
        assert_eq!(queued.await.unwrap().unwrap(), 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn job_tokens_are_cancelled_by_shutdown() {
        let pool = WorkerPool::new(config(PoolKind::Cached, 1)).unwrap();
        let token = pool.job_token();
        assert!(!token.is_cancelled());
        pool.shutdown().await.unwrap();
        assert!(token.is_cancelled());
    }
}
