//! Centered clipping with bucketing (Karimireddy et al., 2021).
//!
//! Consecutive contributions are first reduced in buckets of `bucket_size`,
//! which dilutes any single attacker among honest peers. Each bucket estimate
//! is then clipped to radius `tau` around a reference point before the
//! second aggregation stage.

use tracing::debug;

use crate::aggregation::{bucketize, BaseAggregator};
use crate::contribution::{AuxiliaryInfo, Contribution, Payload, PayloadLayout};
use crate::error::DefenseError;
use crate::math::{clip_factor, coordinate_median, payload, payload_l2_norm};
use crate::settings::DefenseSettings;

use super::{required, DefenseStrategy, DefenseType};

/// Bucketed centered clipping.
#[derive(Clone, Debug)]
pub struct CClip {
    tau: f32,
    bucket_size: usize,
}

impl CClip {
    /// Create the defense with clipping radius `tau` and `bucket_size`
    /// contributions per bucket.
    pub fn new(tau: f32, bucket_size: usize) -> Result<Self, DefenseError> {
        if bucket_size < 1 {
            return Err(DefenseError::config("`bucket_size` must be at least 1"));
        }
        if !(tau.is_finite() && tau > 0.0) {
            return Err(DefenseError::config(format!(
                "`tau` must be positive, got {}",
                tau
            )));
        }
        Ok(Self { tau, bucket_size })
    }

    /// Build from the `tau` and `bucket_size` settings.
    pub fn from_settings(settings: &DefenseSettings) -> Result<Self, DefenseError> {
        Self::new(
            required(settings.tau, "tau", DefenseType::CClip)?,
            required(settings.bucket_size, "bucket_size", DefenseType::CClip)?,
        )
    }

    /// Number of buckets a batch of `n` contributions is split into.
    pub fn bucket_count(&self, n: usize) -> usize {
        (n + self.bucket_size - 1) / self.bucket_size
    }

    /// Fails when a batch of `n` would fit in a single bucket, which leaves
    /// nothing to clip against.
    pub fn check_batch_size(&self, n: usize) -> Result<(), DefenseError> {
        if self.bucket_count(n) < 2 {
            return Err(DefenseError::config(format!(
                "`bucket_size` {} leaves fewer than two buckets for {} contributions",
                self.bucket_size, n
            )));
        }
        Ok(())
    }

    fn reference(
        &self,
        layout: &PayloadLayout,
        buckets: &[Contribution],
        aux: &AuxiliaryInfo<'_>,
    ) -> Result<Payload, DefenseError> {
        if let Some(global) = aux.global_model() {
            layout.check(global)?;
            return Ok(global.clone());
        }
        let points = buckets
            .iter()
            .map(|b| layout.flatten(&b.payload))
            .collect::<Result<Vec<_>, _>>()?;
        layout.unflatten(&coordinate_median(&points))
    }
}

impl DefenseStrategy for CClip {
    fn defense_type(&self) -> DefenseType {
        DefenseType::CClip
    }

    fn run(
        &self,
        batch: &[Contribution],
        base: &dyn BaseAggregator,
        aux: &AuxiliaryInfo<'_>,
    ) -> Result<Payload, DefenseError> {
        let layout = PayloadLayout::of_batch(batch)?;
        self.check_batch_size(batch.len())?;
        let buckets = bucketize(batch, self.bucket_size, base)?;
        let reference = self.reference(&layout, &buckets, aux)?;

        let mut clipped_buckets = 0usize;
        let clipped = buckets
            .iter()
            .map(|bucket| {
                let diff = payload::sub(&bucket.payload, &reference)?;
                let factor = clip_factor(payload_l2_norm(&diff), self.tau);
                if factor < 1.0 {
                    clipped_buckets += 1;
                }
                Ok(bucket.with_payload(payload::scale(&diff, factor)))
            })
            .collect::<Result<Vec<_>, DefenseError>>()?;

        debug!(
            n_clients = batch.len(),
            n_buckets = buckets.len(),
            clipped_buckets,
            "centered clipping applied"
        );
        let correction = base.aggregate(&clipped)?;
        payload::add(&reference, &correction)
    }
}
