//! Instrumented provider shared by the unit tests.

use crate::{ComputeError, ComputeProvider, PoolConfig, PoolKind, WorkerPool};
use core::{
    num::NonZeroUsize,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};
use std::{collections::HashMap, sync::Arc, thread};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TestParams {
    pub scale: u64,
}

impl Default for TestParams {
    fn default() -> Self {
        Self { scale: 1 }
    }
}

#[derive(Clone, Copy, Debug)]
enum Fault {
    Fail,
    Panic,
    Slow(Duration),
}

/// Multiplies its input by `params.scale`, with injectable faults keyed by
/// input value. Tracks call count and peak concurrency.
#[derive(Default)]
pub struct TestProvider {
    faults: HashMap<u64, Fault>,
    delay: Option<Duration>,
    running: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl TestProvider {
    pub fn fail_on(mut self, input: u64) -> Self {
        self.faults.insert(input, Fault::Fail);
        self
    }

    pub fn panic_on(mut self, input: u64) -> Self {
        self.faults.insert(input, Fault::Panic);
        self
    }

    pub fn slow_on(mut self, input: u64, delay: Duration) -> Self {
        self.faults.insert(input, Fault::Slow(delay));
        self
    }

    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ComputeProvider for TestProvider {
    type Input = u64;
    type Params = TestParams;
    type Output = u64;

    fn compute(&self, input: &u64, params: &TestParams) -> Result<u64, ComputeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        let fault = self.faults.get(input).copied();
        if let Some(Fault::Slow(delay)) = fault {
            thread::sleep(delay);
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        match fault {
            Some(Fault::Fail) => Err(ComputeError::compute(format!("input {input} rejected"))),
            Some(Fault::Panic) => panic!("input {input} exploded"),
            _ => Ok(input * params.scale),
        }
    }

    fn external_id(&self, input: &u64) -> Option<u64> {
        Some(1000 + input)
    }
}

/// A fixed pool that never reports saturation.
pub fn pool(threads: usize) -> Arc<WorkerPool> {
    Arc::new(
        WorkerPool::new(PoolConfig {
            kind: PoolKind::Fixed,
            max_threads: NonZeroUsize::new(threads).unwrap(),
            admission_timeout: None,
            ..PoolConfig::default()
        })
        .unwrap(),
    )
}
