//! Geometric median aggregation (Pillutla et al., RFA).
//!
//! The geometric median has a breakdown point of 50%: fewer than half of the
//! points cannot drag it arbitrarily far, unlike the arithmetic mean. It is
//! computed with smoothed Weiszfeld iterations over the flattened payloads.

use ndarray::Array1;
use tracing::{debug, warn};

use crate::aggregation::{bucketize, BaseAggregator};
use crate::contribution::{AuxiliaryInfo, Contribution, Payload, PayloadLayout};
use crate::error::DefenseError;
use crate::math::distance;
use crate::settings::DefenseSettings;

use super::{DefenseStrategy, DefenseType};

/// Default Weiszfeld iteration cap.
pub const DEFAULT_MAX_ITERATIONS: usize = 100;

/// Default movement tolerance.
pub const DEFAULT_TOLERANCE: f32 = 1e-5;

/// Distance floor; a point closer than this to the estimate dominates the
/// next step instead of causing a division by zero.
const DISTANCE_FLOOR: f64 = 1e-8;

/// Result of a Weiszfeld run.
#[derive(Clone, Debug)]
pub struct MedianEstimate {
    /// The estimated geometric median
    pub point: Array1<f32>,
    /// Number of update steps performed
    pub iterations: usize,
    /// Whether the last step moved less than the tolerance
    pub converged: bool,
}

/// Weighted geometric median of `points` by smoothed Weiszfeld iteration.
///
/// `alphas` are non-negative weights summing to a positive value. Starts at
/// the weighted mean and stops when an update moves the estimate by at most
/// `tolerance`, or after `max_iterations` updates.
pub fn weiszfeld(
    points: &[Array1<f32>],
    alphas: &[f64],
    max_iterations: usize,
    tolerance: f32,
) -> Result<MedianEstimate, DefenseError> {
    let dim = points.first().ok_or(DefenseError::EmptyBatch)?.len();
    let total: f64 = alphas.iter().sum();
    if total <= 0.0 {
        return Err(DefenseError::ZeroTotalWeight);
    }

    // Scratch owned by this call only.
    let mut estimate = weighted_average(points, alphas, total, dim);
    let mut betas = vec![0.0f64; points.len()];

    for iteration in 1..=max_iterations {
        for ((beta, point), &alpha) in betas.iter_mut().zip(points).zip(alphas) {
            *beta = alpha / distance(&estimate, point).max(DISTANCE_FLOOR);
        }
        let beta_total: f64 = betas.iter().sum();
        let next = weighted_average(points, &betas, beta_total, dim);
        let movement = distance(&next, &estimate);
        estimate = next;
        if movement <= f64::from(tolerance) {
            return Ok(MedianEstimate {
                point: estimate,
                iterations: iteration,
                converged: true,
            });
        }
    }

    Ok(MedianEstimate {
        point: estimate,
        iterations: max_iterations,
        converged: false,
    })
}

fn weighted_average(points: &[Array1<f32>], weights: &[f64], total: f64, dim: usize) -> Array1<f32> {
    let mut acc = Array1::<f64>::zeros(dim);
    for (point, &w) in points.iter().zip(weights) {
        let share = w / total;
        acc.zip_mut_with(point, |a, &x| *a += share * f64::from(x));
    }
    acc.mapv(|x| x as f32)
}

/// Geometric median of all contributions, optionally over grouped means.
#[derive(Clone, Debug)]
pub struct GeometricMedian {
    max_iterations: usize,
    tolerance: f32,
    batch_num: Option<usize>,
}

impl GeometricMedian {
    /// Create the defense.
    ///
    /// `batch_num`, when set, first groups the batch into that many buckets
    /// of consecutive contributions reduced by the base aggregator.
    pub fn new(
        max_iterations: usize,
        tolerance: f32,
        batch_num: Option<usize>,
    ) -> Result<Self, DefenseError> {
        if max_iterations < 1 {
            return Err(DefenseError::config("`max_iterations` must be at least 1"));
        }
        if !(tolerance.is_finite() && tolerance > 0.0) {
            return Err(DefenseError::config(format!(
                "`tolerance` must be positive, got {}",
                tolerance
            )));
        }
        if batch_num == Some(0) {
            return Err(DefenseError::config("`batch_num` must be at least 1"));
        }
        Ok(Self {
            max_iterations,
            tolerance,
            batch_num,
        })
    }

    /// Build from the optional `max_iterations`, `tolerance` and `batch_num`.
    pub fn from_settings(settings: &DefenseSettings) -> Result<Self, DefenseError> {
        Self::new(
            settings.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS),
            settings.tolerance.unwrap_or(DEFAULT_TOLERANCE),
            settings.batch_num,
        )
    }
}

impl DefenseStrategy for GeometricMedian {
    fn defense_type(&self) -> DefenseType {
        DefenseType::GeometricMedian
    }

    fn run(
        &self,
        batch: &[Contribution],
        base: &dyn BaseAggregator,
        _aux: &AuxiliaryInfo<'_>,
    ) -> Result<Payload, DefenseError> {
        let layout = PayloadLayout::of_batch(batch)?;

        let grouped;
        let members: &[Contribution] = match self.batch_num {
            Some(groups) if groups < batch.len() => {
                let bucket_size = (batch.len() + groups - 1) / groups;
                grouped = bucketize(batch, bucket_size, base)?;
                &grouped
            }
            _ => batch,
        };

        let points = members
            .iter()
            .map(|c| layout.flatten(&c.payload))
            .collect::<Result<Vec<_>, _>>()?;
        let alphas: Vec<f64> = members.iter().map(|c| f64::from(c.weight)).collect();

        let estimate = weiszfeld(&points, &alphas, self.max_iterations, self.tolerance)?;
        if estimate.converged {
            debug!(
                n_points = points.len(),
                iterations = estimate.iterations,
                "geometric median converged"
            );
        } else {
            warn!(
                n_points = points.len(),
                max_iterations = self.max_iterations,
                "geometric median hit the iteration cap before converging"
            );
        }
        layout.unflatten(&estimate.point)
    }
}
