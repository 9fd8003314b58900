//! Worker pool for CPU-bound compute calls.
//!
//! A [`WorkerPool`] is built once per process from a [`PoolConfig`] and shared
//! as `Arc<WorkerPool>` by every dispatcher. Three execution strategies are
//! available through [`PoolKind`]:
//!
//! - [`PoolKind::Fixed`]: `max_threads` dedicated OS threads pulling from one
//!   bounded queue.
//! - [`PoolKind::Elastic`]: the tokio blocking pool, capped at `max_threads`
//!   concurrent jobs.
//! - [`PoolKind::Cached`]: the tokio blocking pool with no pool-level cap.

mod manager;
mod request;
mod worker;

pub use manager::{SubmitError, WorkerPool};

use core::{num::NonZeroUsize, str::FromStr, time::Duration};
use std::any::Any;

pub const DEFAULT_MAX_THREADS: NonZeroUsize = NonZeroUsize::new(16).unwrap();
pub const DEFAULT_QUEUE_CAPACITY: NonZeroUsize = NonZeroUsize::new(1024).unwrap();

/// How pool threads are provisioned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PoolKind {
    #[default]
    Fixed,
    Elastic,
    Cached,
}

impl FromStr for PoolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "elastic" | "forkjoin" => Ok(Self::Elastic),
            "cached" => Ok(Self::Cached),
            other => Err(format!(
                "unknown executor type '{other}' (expected fixed, elastic or cached)"
            )),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub kind: PoolKind,
    /// Thread count for [`PoolKind::Fixed`], concurrency cap for
    /// [`PoolKind::Elastic`]. Ignored by [`PoolKind::Cached`].
    pub max_threads: NonZeroUsize,
    /// Capacity of the shared job queue ([`PoolKind::Fixed`] only).
    pub queue_capacity: NonZeroUsize,
    /// How long a submission may wait for a free slot before the pool is
    /// reported as exhausted. `None` waits forever.
    pub admission_timeout: Option<Duration>,
    /// How long [`WorkerPool::shutdown`] waits for in-flight jobs.
    pub shutdown_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            kind: PoolKind::Fixed,
            max_threads: DEFAULT_MAX_THREADS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            admission_timeout: Some(Duration::from_secs(10)),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Extracts a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("compute panicked")
    }
}
