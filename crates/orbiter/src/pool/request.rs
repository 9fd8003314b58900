use tokio::sync::oneshot;

/// A type-erased unit of work. The closure owns its own result channel.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Messages delivered to fixed worker threads through the shared queue.
pub enum WorkRequest {
    /// Run a job on the receiving worker thread.
    Run { job: Job },
    /// Stop the receiving worker after acknowledging.
    Shutdown { response: oneshot::Sender<()> },
}
