//! The naive aggregation primitive that defenses wrap.
//!
//! A [`BaseAggregator`] is supplied by the caller; the defenses feed it the
//! whole batch, a filtered subset, or reweighted copies. Any closure of the
//! shape `Fn(&[Contribution]) -> Result<Payload, DefenseError>` qualifies,
//! and [`WeightedMean`] provides the usual FedAvg combiner.

pub mod bucket;
pub mod weighted_mean;

pub use bucket::{bucketize, partition};
pub use weighted_mean::{weighted_mean, WeightedMean};

use crate::contribution::{Contribution, Payload};
use crate::error::DefenseError;

/// Combines a batch of contributions into one update.
///
/// Implementations are expected to be deterministic for identical input.
pub trait BaseAggregator {
    /// Aggregate `batch` into a single payload.
    fn aggregate(&self, batch: &[Contribution]) -> Result<Payload, DefenseError>;
}

impl<F> BaseAggregator for F
where
    F: Fn(&[Contribution]) -> Result<Payload, DefenseError>,
{
    fn aggregate(&self, batch: &[Contribution]) -> Result<Payload, DefenseError> {
        self(batch)
    }
}
