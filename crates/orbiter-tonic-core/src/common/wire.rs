//! Encoding of engine outcomes into protobuf messages.
//!
//! This is the only place where [`ComputeOutcome`]s and [`Batch`]es turn into
//! wire messages. Every endpoint encodes through [`encode_outcome`] and
//! [`encode_batch`], so each outcome on the wire carries its admission index,
//! its satellite id (where the message has one) and either a result or an
//! [`ItemFailure`].

use crate::proto::{
    self, AccessBatch, AccessIntervals, AccessOutcome, ItemFailure, StateVector, TleBatch,
    TleBatchResponse, TleOutcome, Track, TransformBatch, TransformOutcome, access_outcome,
    tle_outcome, transform_outcome,
};
use orbiter::{Batch, BulkReport, ComputeError, ComputeOutcome, CorrelationKey, FailureKind};

/// A protobuf outcome message.
pub trait WireOutcome: Sized {
    /// The success payload the message carries.
    type Output;

    fn success(index: u64, satellite_id: u32, output: Self::Output) -> Self;
    fn failure(index: u64, satellite_id: u32, failure: ItemFailure) -> Self;
}

/// A protobuf batch message.
pub trait WireBatch: Sized {
    type Outcome: WireOutcome;

    fn from_parts(sequence: u64, outcomes: Vec<Self::Outcome>) -> Self;
}

impl From<FailureKind> for proto::FailureKind {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::InvalidInput => Self::InvalidInput,
            FailureKind::Compute => Self::Compute,
            FailureKind::Timeout => Self::Timeout,
            FailureKind::Panicked => Self::Panicked,
            FailureKind::Internal => Self::Internal,
        }
    }
}

impl From<&ComputeError> for ItemFailure {
    fn from(error: &ComputeError) -> Self {
        Self {
            kind: proto::FailureKind::from(error.kind).into(),
            message: error.message.clone(),
        }
    }
}

/// Satellite id reported on the wire: the catalog number when it fits in
/// `u32`, otherwise 0.
pub fn satellite_id(key: &CorrelationKey) -> u32 {
    key.external_id
        .and_then(|id| u32::try_from(id).ok())
        .unwrap_or(0)
}

pub fn encode_outcome<W: WireOutcome>(outcome: ComputeOutcome<W::Output>) -> W {
    match outcome {
        ComputeOutcome::Success { key, output } => W::success(key.index, satellite_id(&key), output),
        ComputeOutcome::Failure { key, error } => {
            W::failure(key.index, satellite_id(&key), ItemFailure::from(&error))
        }
    }
}

pub fn encode_batch<B: WireBatch>(batch: Batch<<B::Outcome as WireOutcome>::Output>) -> B {
    let sequence = batch.sequence();
    let outcomes = batch.into_outcomes().into_iter().map(encode_outcome).collect();
    B::from_parts(sequence, outcomes)
}

/// Encodes the result of a unary bulk propagation.
pub fn encode_report(report: BulkReport<Track>) -> TleBatchResponse {
    TleBatchResponse {
        succeeded: u32::try_from(report.succeeded).unwrap_or(u32::MAX),
        failed: u32::try_from(report.failed).unwrap_or(u32::MAX),
        outcomes: report.outcomes.into_iter().map(encode_outcome).collect(),
    }
}

impl WireOutcome for TleOutcome {
    type Output = Track;

    fn success(index: u64, satellite_id: u32, output: Track) -> Self {
        Self {
            index,
            satellite_id,
            outcome: Some(tle_outcome::Outcome::Track(output)),
        }
    }

    fn failure(index: u64, satellite_id: u32, failure: ItemFailure) -> Self {
        Self {
            index,
            satellite_id,
            outcome: Some(tle_outcome::Outcome::Failure(failure)),
        }
    }
}

impl WireBatch for TleBatch {
    type Outcome = TleOutcome;

    fn from_parts(sequence: u64, outcomes: Vec<TleOutcome>) -> Self {
        Self { sequence, outcomes }
    }
}

impl WireOutcome for AccessOutcome {
    type Output = AccessIntervals;

    fn success(index: u64, satellite_id: u32, output: AccessIntervals) -> Self {
        Self {
            index,
            satellite_id,
            outcome: Some(access_outcome::Outcome::Access(output)),
        }
    }

    fn failure(index: u64, satellite_id: u32, failure: ItemFailure) -> Self {
        Self {
            index,
            satellite_id,
            outcome: Some(access_outcome::Outcome::Failure(failure)),
        }
    }
}

impl WireBatch for AccessBatch {
    type Outcome = AccessOutcome;

    fn from_parts(sequence: u64, outcomes: Vec<AccessOutcome>) -> Self {
        Self { sequence, outcomes }
    }
}

// State vectors carry no catalog number.
impl WireOutcome for TransformOutcome {
    type Output = StateVector;

    fn success(index: u64, _satellite_id: u32, output: StateVector) -> Self {
        Self {
            index,
            outcome: Some(transform_outcome::Outcome::State(output)),
        }
    }

    fn failure(index: u64, _satellite_id: u32, failure: ItemFailure) -> Self {
        Self {
            index,
            outcome: Some(transform_outcome::Outcome::Failure(failure)),
        }
    }
}

impl WireBatch for TransformBatch {
    type Outcome = TransformOutcome;

    fn from_parts(sequence: u64, outcomes: Vec<TransformOutcome>) -> Self {
        Self { sequence, outcomes }
    }
}
