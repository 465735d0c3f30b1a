//! FedAvg baseline aggregation (no Byzantine tolerance)
//!
//! Standard federated averaging as described by McMahan et al. (2017).
//! Vulnerable to even a single Byzantine client. This is the combiner the
//! defenses wrap, filter for, or replace.

use crate::contribution::{Contribution, Payload, PayloadLayout};
use crate::error::DefenseError;

use super::BaseAggregator;

/// Weighted arithmetic mean of the payloads, weighted by [`Contribution::weight`].
#[derive(Clone, Copy, Debug, Default)]
pub struct WeightedMean;

impl BaseAggregator for WeightedMean {
    fn aggregate(&self, batch: &[Contribution]) -> Result<Payload, DefenseError> {
        weighted_mean(batch)
    }
}

/// Standard FedAvg aggregation (no Byzantine defense).
///
/// Each contribution is scaled by `weight / total_weight` before summing, so a
/// batch of identical payloads averages back to that payload.
pub fn weighted_mean(batch: &[Contribution]) -> Result<Payload, DefenseError> {
    PayloadLayout::of_batch(batch)?;

    let weight_sum: f32 = batch.iter().map(|c| c.weight).sum();
    if weight_sum <= 0.0 {
        return Err(DefenseError::ZeroTotalWeight);
    }

    let mut acc: Payload = batch[0]
        .payload
        .iter()
        .map(|(name, t)| (name.clone(), t.mapv(|_| 0.0)))
        .collect();
    for contribution in batch {
        let share = contribution.weight / weight_sum;
        for (name, tensor) in &contribution.payload {
            if let Some(sum) = acc.get_mut(name) {
                sum.scaled_add(share, tensor);
            }
        }
    }
    Ok(acc)
}
