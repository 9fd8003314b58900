#![doc = include_str!("../README.md")]

mod batch;
mod dispatch;
mod error;
mod ingest;
mod item;
mod outcome;
mod pipeline;
mod pool;
mod provider;
mod session;
mod sizing;

#[cfg(test)]
mod test_support;

pub use crate::batch::*;
pub use crate::dispatch::*;
pub use crate::error::*;
pub use crate::ingest::*;
pub use crate::item::*;
pub use crate::outcome::*;
pub use crate::pipeline::*;
pub use crate::pool::{
    DEFAULT_MAX_THREADS, DEFAULT_QUEUE_CAPACITY, PoolConfig, PoolKind, SubmitError, WorkerPool,
};
pub use crate::provider::*;
pub use crate::session::*;
pub use crate::sizing::*;
