//! Bucketing of consecutive contributions.
//!
//! Used by CClip and by the grouped geometric median: each bucket of
//! consecutive contributions is reduced by the base aggregator into one
//! contribution carrying the bucket's summed weight.

use std::ops::Range;

use crate::contribution::Contribution;
use crate::error::DefenseError;

use super::BaseAggregator;

/// Split `n` items into consecutive ranges of `bucket_size`.
///
/// The last range is partial when `n` is not a multiple of `bucket_size`.
/// Returns no ranges for `bucket_size == 0`.
pub fn partition(n: usize, bucket_size: usize) -> Vec<Range<usize>> {
    if bucket_size == 0 {
        return Vec::new();
    }
    (0..n)
        .step_by(bucket_size)
        .map(|start| start..(start + bucket_size).min(n))
        .collect()
}

/// Reduce every bucket of `batch` with `base`.
///
/// Buckets whose members all have zero weight carry no influence and are
/// dropped without being reduced. Fails with
/// [`DefenseError::ZeroTotalWeight`] when no bucket remains.
pub fn bucketize(
    batch: &[Contribution],
    bucket_size: usize,
    base: &dyn BaseAggregator,
) -> Result<Vec<Contribution>, DefenseError> {
    let buckets = partition(batch.len(), bucket_size)
        .into_iter()
        .filter_map(|range| {
            let members = &batch[range];
            let weight: f32 = members.iter().map(|c| c.weight).sum();
            if weight <= 0.0 {
                return None;
            }
            Some(base.aggregate(members).map(|p| Contribution::new(weight, p)))
        })
        .collect::<Result<Vec<_>, DefenseError>>()?;
    if buckets.is_empty() && !batch.is_empty() {
        return Err(DefenseError::ZeroTotalWeight);
    }
    Ok(buckets)
}
