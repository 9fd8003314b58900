//! Batch-size selection.
//!
//! A policy turns what is known about a request up front (time span, samples
//! per item, elevation threshold) into a batch size `B`. Policies are pure:
//! the same inputs always give the same `B`.

use core::{fmt, num::NonZeroUsize, time::Duration};

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Expected passes per day over a horizon-level mask for a low orbit.
const BASE_PASSES_PER_DAY: f64 = 6.0;
const MIN_PASSES_PER_DAY: f64 = 0.25;

/// What the request asks for, as far as result size is concerned.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RequestSpan {
    pub duration: Duration,
    /// Samples produced per item, when the request fixes it.
    pub samples_per_item: Option<u32>,
    /// Elevation mask in degrees, for visibility-style requests.
    pub min_elevation_deg: Option<f64>,
}

impl RequestSpan {
    pub const fn samples(duration: Duration, samples_per_item: u32) -> Self {
        Self {
            duration,
            samples_per_item: Some(samples_per_item),
            min_elevation_deg: None,
        }
    }

    pub const fn visibility(duration: Duration, min_elevation_deg: f64) -> Self {
        Self {
            duration,
            samples_per_item: None,
            min_elevation_deg: Some(min_elevation_deg),
        }
    }

    /// Estimated number of result units one item produces.
    pub fn units_per_item(&self) -> f64 {
        if let Some(samples) = self.samples_per_item {
            return f64::from(samples.max(1));
        }

        let days = self.duration.as_secs_f64() / SECONDS_PER_DAY;
        let elevation = self
            .min_elevation_deg
            .filter(|e| e.is_finite())
            .unwrap_or(0.0)
            .clamp(0.0, 90.0);
        let passes_per_day =
            (BASE_PASSES_PER_DAY * (1.0 - elevation / 90.0)).max(MIN_PASSES_PER_DAY);

        (days * passes_per_day).max(1.0)
    }
}

/// Encoded size of one result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResultWeight {
    /// Bytes per sample or per window.
    pub bytes_per_unit: usize,
    /// Fixed bytes per result (ids, framing).
    pub overhead_bytes: usize,
}

impl Default for ResultWeight {
    fn default() -> Self {
        Self {
            bytes_per_unit: 32,
            overhead_bytes: 64,
        }
    }
}

impl ResultWeight {
    pub const fn new(bytes_per_unit: usize, overhead_bytes: usize) -> Self {
        Self {
            bytes_per_unit,
            overhead_bytes,
        }
    }

    /// Estimated encoded bytes of one result for `span`.
    pub fn estimate(&self, span: &RequestSpan) -> f64 {
        self.overhead_bytes as f64 + span.units_per_item() * self.bytes_per_unit as f64
    }
}

pub trait BatchSizingPolicy: Send + Sync + fmt::Debug {
    fn batch_size(&self, span: &RequestSpan, weight: ResultWeight) -> NonZeroUsize;
}

/// Always the same size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedBatchSize(NonZeroUsize);

impl FixedBatchSize {
    pub const fn new(size: NonZeroUsize) -> Self {
        Self(size)
    }
}

impl BatchSizingPolicy for FixedBatchSize {
    fn batch_size(&self, _span: &RequestSpan, _weight: ResultWeight) -> NonZeroUsize {
        self.0
    }
}

/// Aims for batches of roughly `target_bytes`, clamped to `[min, max]`.
///
/// Heavier results, longer spans and lower elevation masks all lead to
/// smaller batches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DynamicBatchSize {
    target_bytes: usize,
    min: NonZeroUsize,
    max: NonZeroUsize,
}

impl Default for DynamicBatchSize {
    fn default() -> Self {
        Self::new(
            1024 * 1024,
            NonZeroUsize::MIN,
            NonZeroUsize::new(500).unwrap_or(NonZeroUsize::MIN),
        )
    }
}

impl DynamicBatchSize {
    /// `max` is raised to `min` if it is smaller.
    pub fn new(target_bytes: usize, min: NonZeroUsize, max: NonZeroUsize) -> Self {
        Self {
            target_bytes,
            min,
            max: max.max(min),
        }
    }

    pub const fn target_bytes(&self) -> usize {
        self.target_bytes
    }

    pub const fn min(&self) -> NonZeroUsize {
        self.min
    }

    pub const fn max(&self) -> NonZeroUsize {
        self.max
    }
}

impl BatchSizingPolicy for DynamicBatchSize {
    fn batch_size(&self, span: &RequestSpan, weight: ResultWeight) -> NonZeroUsize {
        let estimate = weight.estimate(span).max(1.0);
        let fitted = (self.target_bytes as f64 / estimate).floor();
        let size = if fitted.is_finite() {
            (fitted as usize).clamp(self.min.get(), self.max.get())
        } else {
            self.max.get()
        };
        NonZeroUsize::new(size).unwrap_or(self.min)
    }
}
