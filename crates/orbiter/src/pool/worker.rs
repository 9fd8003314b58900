use super::request::WorkRequest;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Body of a fixed worker thread.
///
/// All workers share one bounded queue. Whichever worker holds the lock waits
/// for the next request, releases the lock, then runs the job, so jobs are
/// picked up by the first idle thread.
///
/// The loop ends on [`WorkRequest::Shutdown`] or when every sender has been
/// dropped. Jobs catch their own panics, so a failing job never takes the
/// thread down with it.
pub fn worker_loop(worker_id: usize, queue: Arc<Mutex<mpsc::Receiver<WorkRequest>>>) {
    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {worker_id} started");

    loop {
        let request = queue.lock().blocking_recv();
        match request {
            Some(WorkRequest::Run { job }) => job(),
            Some(WorkRequest::Shutdown { response }) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Worker {worker_id} received shutdown signal");

                if response.send(()).is_err() {
                    #[cfg(feature = "tracing")]
                    tracing::error!("Worker {worker_id} failed to acknowledge shutdown");
                }
                break;
            }
            None => break,
        }
    }

    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {worker_id} stopped");
    #[cfg(not(feature = "tracing"))]
    let _ = worker_id;
}
