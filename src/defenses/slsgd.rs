//! SLSGD: trimmed-mean aggregation with optional model blending
//! (Xie et al., "SLSGD: Secure and Efficient Distributed On-device Machine
//! Learning").
//!
//! Drops the `trim_fraction` most extreme contributions from each end before
//! averaging, then optionally moves only part of the way from the previous
//! global model towards that average.

use tracing::debug;

use crate::aggregation::BaseAggregator;
use crate::contribution::{AuxiliaryInfo, Contribution, Payload, PayloadLayout};
use crate::error::DefenseError;
use crate::math::{coordinate_trimmed_mean, payload};
use crate::settings::{DefenseSettings, TrimPolicy};

use super::{required, DefenseStrategy, DefenseType};

/// Trimmed-mean defense.
#[derive(Clone, Debug)]
pub struct Slsgd {
    trim_fraction: f32,
    policy: TrimPolicy,
    alpha: f32,
}

impl Slsgd {
    /// Create the defense.
    ///
    /// `trim_fraction` must lie in `[0, 0.5)` and `alpha` in `[0, 1]`.
    pub fn new(trim_fraction: f32, policy: TrimPolicy, alpha: f32) -> Result<Self, DefenseError> {
        if !(0.0..0.5).contains(&trim_fraction) {
            return Err(DefenseError::config(format!(
                "Invalid trim fraction: {} (must be in [0.0, 0.5))",
                trim_fraction
            )));
        }
        if !(0.0..=1.0).contains(&alpha) {
            return Err(DefenseError::config(format!(
                "`alpha` must be in [0, 1], got {}",
                alpha
            )));
        }
        Ok(Self {
            trim_fraction,
            policy,
            alpha,
        })
    }

    /// Build from `trim_fraction` and the optional `trim_policy` and `alpha`.
    pub fn from_settings(settings: &DefenseSettings) -> Result<Self, DefenseError> {
        Self::new(
            required(settings.trim_fraction, "trim_fraction", DefenseType::Slsgd)?,
            settings.trim_policy.unwrap_or(TrimPolicy::Coordinate),
            settings.alpha.unwrap_or(1.0),
        )
    }

    /// Number of contributions dropped from each end of a batch of `n`.
    ///
    /// Fails when no contribution would survive.
    pub fn trim_count(&self, n: usize) -> Result<usize, DefenseError> {
        let n_trim = (n as f32 * self.trim_fraction).ceil() as usize;
        if n <= 2 * n_trim {
            return Err(DefenseError::config(format!(
                "trim fraction {} removes all {} contributions",
                self.trim_fraction, n
            )));
        }
        Ok(n_trim)
    }
}

/// Keep the positive-weight contributions whose coordinate sums are not
/// among the `n_trim` smallest or largest; ties keep batch order.
fn trim_by_vector_sum(
    candidates: &[&Contribution],
    layout: &PayloadLayout,
    n_trim: usize,
) -> Result<Vec<Contribution>, DefenseError> {
    let sums = candidates
        .iter()
        .map(|c| Ok(layout.flatten(&c.payload)?.iter().map(|&x| f64::from(x)).sum()))
        .collect::<Result<Vec<f64>, DefenseError>>()?;

    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|&a, &b| sums[a].total_cmp(&sums[b]).then(a.cmp(&b)));
    let mut kept = order[n_trim..candidates.len() - n_trim].to_vec();
    kept.sort_unstable();
    Ok(kept.into_iter().map(|i| candidates[i].clone()).collect())
}

impl DefenseStrategy for Slsgd {
    fn defense_type(&self) -> DefenseType {
        DefenseType::Slsgd
    }

    fn run(
        &self,
        batch: &[Contribution],
        base: &dyn BaseAggregator,
        aux: &AuxiliaryInfo<'_>,
    ) -> Result<Payload, DefenseError> {
        let layout = PayloadLayout::of_batch(batch)?;
        let mut n_trim = self.trim_count(batch.len())?;
        let global = if self.alpha < 1.0 {
            let global = aux.require_global_model(DefenseType::Slsgd.as_str())?;
            layout.check(global)?;
            Some(global)
        } else {
            None
        };

        let averaged = match self.policy {
            TrimPolicy::VectorSum => {
                // Zero-weight contributions cannot move a weighted average
                let candidates: Vec<&Contribution> =
                    batch.iter().filter(|c| c.weight > 0.0).collect();
                if candidates.is_empty() {
                    return Err(DefenseError::ZeroTotalWeight);
                }
                n_trim = self.trim_count(candidates.len())?;
                let kept = trim_by_vector_sum(&candidates, &layout, n_trim)?;
                base.aggregate(&kept)?
            }
            TrimPolicy::Coordinate => {
                let points = batch
                    .iter()
                    .map(|c| layout.flatten(&c.payload))
                    .collect::<Result<Vec<_>, _>>()?;
                layout.unflatten(&coordinate_trimmed_mean(&points, n_trim))?
            }
        };
        debug!(
            n_clients = batch.len(),
            n_trim,
            policy = ?self.policy,
            "trimmed mean computed"
        );

        match global {
            Some(global) => payload::lerp(global, &averaged, self.alpha),
            None => Ok(averaged),
        }
    }
}
